pub mod bridge;
pub mod bus;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod gate;
pub mod host;
pub mod runtime;
pub mod throttle;

pub use bridge::{BridgeDeps, BridgeState, ContextBridge};
pub use bus::{BroadcastBus, Subscription};
pub use config::RuntimeConfig;
pub use context::{BlobStore, Bootstrap, ContextLauncher, ContextModule, ContextPort, TaskLauncher};
pub use dispatcher::{PostQueue, PostRequest};
pub use error::BridgeError;
pub use gate::{AdmissionGate, GateStats};
pub use host::{CachingDispatch, MethodRouter};
pub use runtime::Runtime;
pub use throttle::{RequestMode, RequestThrottle};
