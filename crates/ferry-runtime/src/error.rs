/// Failures raised while setting up or talking to an execution context.
///
/// Only construction failures reach callers; steady-state problems are
/// logged or broadcast instead.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("invalid source url {url:?}: {reason}")]
    InvalidSource { url: String, reason: String },

    #[error("unknown bootstrap url: {0}")]
    UnknownBootstrap(String),

    #[error("malformed bootstrap payload: {0}")]
    MalformedBootstrap(String),

    #[error("no context module registered for {0}")]
    ModuleNotFound(String),

    #[error("context terminated")]
    Terminated,

    #[error("context channel closed")]
    ChannelClosed,
}
