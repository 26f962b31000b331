use serde::{Deserialize, Serialize};

/// Failure reported by the host call-dispatch interface.
///
/// These never escape to callers of the post queue; they surface as `error`
/// broadcasts or as the `err` half of a relayed call result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "code", content = "message", rename_all = "snake_case")]
pub enum DispatchError {
    #[error("method not found: {0}")]
    MethodNotFound(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("host error: {0}")]
    Host(String),
    #[error("host channel closed")]
    ChannelClosed,
}

impl DispatchError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::MethodNotFound(_) => "method_not_found",
            Self::InvalidParams(_) => "invalid_params",
            Self::Host(_) => "host",
            Self::ChannelClosed => "channel_closed",
        }
    }

    /// JSON detail carried by `error` broadcasts.
    pub fn to_detail(&self) -> serde_json::Value {
        serde_json::json!({
            "code": self.error_kind(),
            "message": self.to_string(),
        })
    }
}

/// Failure to parse an inter-process call string.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("call string does not start with {expected}")]
    MissingScheme { expected: &'static str },
    #[error("call string has an empty name")]
    EmptyName,
    #[error("call name contains invalid character {0:?}")]
    InvalidName(char),
}
