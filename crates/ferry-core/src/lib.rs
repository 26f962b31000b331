pub mod dispatch;
pub mod envelope;
pub mod errors;
pub mod events;
pub mod ids;
pub mod messages;

mod b64;

pub use dispatch::{DispatchOptions, HostDispatch, Params, Payload, ResponseType};
pub use envelope::CallEnvelope;
pub use errors::{DispatchError, EnvelopeError};
pub use events::{BroadcastEvent, EventDetail, EventKind};
pub use messages::{CallOutcome, CallRequest, ContextMessage, ForwardedEvent};
