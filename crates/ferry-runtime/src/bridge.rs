//! Host-side bridge to one background execution context.
//!
//! The bridge owns two tasks. The forwarder copies `data` broadcasts into
//! the context in receipt order. The listener answers argument requests,
//! relays `ipc://` call requests to the host and hands everything else to
//! the user's message handler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use ferry_core::ids::ContextId;
use ferry_core::{
    CallEnvelope, CallOutcome, ContextMessage, DispatchError, DispatchOptions, EventKind,
    ForwardedEvent, HostDispatch,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn, Instrument};
use url::Url;

use crate::bus::{BroadcastBus, Subscription};
use crate::context::{BlobStore, Bootstrap, ContextHandle, ContextLauncher, LaunchedContext};
use crate::error::BridgeError;

/// Callback for messages the bridge does not handle itself.
pub type MessageHandler = Arc<dyn Fn(ContextMessage) + Send + Sync>;

/// Lifecycle of a bridge. Construction enters `Active` directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BridgeState {
    Active,
    Terminated,
}

/// Services a bridge is wired to.
#[derive(Clone)]
pub struct BridgeDeps {
    pub bus: BroadcastBus,
    pub host: Arc<dyn HostDispatch>,
    pub launcher: Arc<dyn ContextLauncher>,
    pub blobs: Arc<BlobStore>,
    /// Startup arguments returned to `__argsRequested`.
    pub args: Arc<[String]>,
    pub base_url: Url,
}

pub struct ContextBridge {
    bootstrap: Bootstrap,
    handle: Arc<dyn ContextHandle>,
    blobs: Arc<BlobStore>,
    on_message: Arc<RwLock<Option<MessageHandler>>>,
    shutdown: CancellationToken,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    terminated: AtomicBool,
}

impl ContextBridge {
    /// Launch a context for `source` and start bridging it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(source: &str, deps: &BridgeDeps) -> Result<Self, BridgeError> {
        let bootstrap = Bootstrap::publish(source, &deps.base_url, &deps.blobs)?;
        let LaunchedContext { handle, outbound } = match deps.launcher.launch(&bootstrap) {
            Ok(launched) => launched,
            Err(err) => {
                deps.blobs.revoke(&bootstrap.url);
                return Err(err);
            }
        };

        let shutdown = CancellationToken::new();
        let on_message: Arc<RwLock<Option<MessageHandler>>> = Arc::new(RwLock::new(None));
        let span = tracing::debug_span!("bridge", context_id = %handle.id());

        // Subscribe before returning so no broadcast after construction is missed.
        let subscription = deps.bus.subscribe(EventKind::Data);
        let forwarder = tokio::spawn(
            forward_events(subscription, Arc::clone(&handle), shutdown.clone())
                .instrument(span.clone()),
        );
        let listener = tokio::spawn(
            Listener {
                handle: Arc::clone(&handle),
                host: Arc::clone(&deps.host),
                args: Arc::clone(&deps.args),
                on_message: Arc::clone(&on_message),
            }
            .run(outbound, shutdown.clone())
            .instrument(span),
        );

        debug!(context_id = %handle.id(), source = %bootstrap.source, "bridge active");
        Ok(Self {
            bootstrap,
            handle,
            blobs: Arc::clone(&deps.blobs),
            on_message,
            shutdown,
            forwarder: Mutex::new(Some(forwarder)),
            listener: Mutex::new(Some(listener)),
            terminated: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &ContextId {
        self.handle.id()
    }

    pub fn source(&self) -> &Url {
        &self.bootstrap.source
    }

    pub fn bootstrap(&self) -> &Bootstrap {
        &self.bootstrap
    }

    pub fn state(&self) -> BridgeState {
        if self.terminated.load(Ordering::Acquire) {
            BridgeState::Terminated
        } else {
            BridgeState::Active
        }
    }

    /// Send a message from the host into the context.
    pub fn post_message(&self, message: ContextMessage) -> Result<(), BridgeError> {
        if self.state() == BridgeState::Terminated {
            return Err(BridgeError::Terminated);
        }
        self.handle.post_message(message)
    }

    pub fn set_on_message<F>(&self, handler: F)
    where
        F: Fn(ContextMessage) + Send + Sync + 'static,
    {
        *self.on_message.write() = Some(Arc::new(handler));
    }

    pub fn clear_on_message(&self) {
        *self.on_message.write() = None;
    }

    /// Stop forwarding, then stop the context. Idempotent.
    pub async fn terminate(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();

        // The subscription lives in the forwarder; it is gone once the task is.
        let forwarder = self.forwarder.lock().take();
        if let Some(forwarder) = forwarder {
            let _ = forwarder.await;
        }

        self.handle.terminate();
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        self.blobs.revoke(&self.bootstrap.url);
        debug!(context_id = %self.handle.id(), "bridge terminated");
    }
}

impl Drop for ContextBridge {
    fn drop(&mut self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        if let Some(forwarder) = self.forwarder.get_mut().take() {
            forwarder.abort();
        }
        if let Some(listener) = self.listener.get_mut().take() {
            listener.abort();
        }
        self.handle.terminate();
        self.blobs.revoke(&self.bootstrap.url);
    }
}

async fn forward_events(
    mut subscription: Subscription,
    handle: Arc<dyn ContextHandle>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            event = subscription.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let message = ContextMessage::Event(ForwardedEvent::from_broadcast(&event));
        if let Err(err) = handle.post_message(message) {
            debug!(error = %err, "forwarding stopped");
            break;
        }
    }
    subscription.unsubscribe();
}

struct Listener {
    handle: Arc<dyn ContextHandle>,
    host: Arc<dyn HostDispatch>,
    args: Arc<[String]>,
    on_message: Arc<RwLock<Option<MessageHandler>>>,
}

impl Listener {
    async fn run(
        self,
        mut outbound: mpsc::UnboundedReceiver<serde_json::Value>,
        shutdown: CancellationToken,
    ) {
        loop {
            let message = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                value = outbound.recv() => match value {
                    Some(value) => ContextMessage::from_value(value),
                    None => break,
                },
            };
            self.handle_message(message);
        }
    }

    fn handle_message(&self, message: ContextMessage) {
        match message {
            ContextMessage::ArgsRequested => {
                let reply = ContextMessage::ArgsReply(self.args.to_vec());
                if let Err(err) = self.handle.post_message(reply) {
                    debug!(error = %err, "args reply not delivered");
                }
            }
            ContextMessage::CallRequest(request) => {
                let Some(message) = request.relayable() else {
                    trace!("call request without ipc scheme dropped");
                    return;
                };
                tokio::spawn(
                    relay(
                        message.to_string(),
                        request.bytes,
                        Arc::clone(&self.host),
                        Arc::clone(&self.handle),
                    )
                    .in_current_span(),
                );
            }
            other => {
                let handler = self.on_message.read().clone();
                match handler {
                    Some(handler) => handler(other),
                    None => trace!(kind = other.kind(), "unhandled context message dropped"),
                }
            }
        }
    }
}

/// Parse, dispatch and answer one call request.
///
/// Errors reported by the host travel back in the result. A call that cannot
/// be parsed or whose dispatcher is gone is logged and dropped.
async fn relay(
    message: String,
    bytes: Option<Bytes>,
    host: Arc<dyn HostDispatch>,
    handle: Arc<dyn ContextHandle>,
) {
    let envelope = match CallEnvelope::parse(&message, bytes) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(error = %err, "relay: malformed call");
            return;
        }
    };

    let options = DispatchOptions::default().with_bytes(envelope.bytes.clone());
    let result = host
        .dispatch(&envelope.name, envelope.params.clone(), options)
        .await;
    if let Err(DispatchError::ChannelClosed) = result {
        warn!(name = %envelope.name, "relay: host dispatcher unavailable");
        return;
    }

    let result = CallOutcome::from_result(envelope.name.clone(), result);
    let reply = ContextMessage::CallResult {
        message: envelope,
        result,
    };
    if let Err(err) = handle.post_message(reply) {
        debug!(error = %err, "call result not delivered");
    }
}
