//! Background execution contexts.
//!
//! A context is launched from a one-line bootstrap module that imports the
//! caller's source through the `ferry:internal/worker` virtual module. The
//! bootstrap text is published in a [`BlobStore`] under a content-addressed
//! `blob:` URL and the launcher resolves it from there.
//!
//! [`TaskLauncher`] runs each context as its own tokio task. The host and the
//! context share nothing: they talk through a pair of unbounded channels that
//! carry the JSON wire form of each [`ContextMessage`].

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use ferry_core::ids::ContextId;
use ferry_core::{CallEnvelope, CallRequest, ContextMessage};
use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::{form_urlencoded, Url};

use crate::error::BridgeError;

/// Virtual module every bootstrap imports.
pub const WORKER_MODULE: &str = "ferry:internal/worker";

const BLOB_PREFIX: &str = "blob:ferry/";

/// Transient, content-addressed storage for bootstrap payloads.
#[derive(Default)]
pub struct BlobStore {
    blobs: DashMap<String, Arc<str>>,
}

impl BlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `payload` and return its `blob:` URL. Equal payloads share a URL.
    pub fn create_object_url(&self, payload: &str) -> String {
        let digest = Sha256::digest(payload.as_bytes());
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        let url = format!("{BLOB_PREFIX}{hex}");
        self.blobs
            .entry(url.clone())
            .or_insert_with(|| Arc::from(payload));
        url
    }

    pub fn resolve(&self, url: &str) -> Option<Arc<str>> {
        self.blobs.get(url).map(|b| Arc::clone(b.value()))
    }

    pub fn revoke(&self, url: &str) -> bool {
        self.blobs.remove(url).is_some()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

/// Everything needed to start one context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bootstrap {
    /// Absolute URL of the caller's source.
    pub source: Url,
    /// The one-line loader module.
    pub payload: String,
    /// `blob:` URL the payload is published under.
    pub url: String,
}

impl Bootstrap {
    /// Resolve `source` against `base` and publish the loader in `blobs`.
    pub fn publish(source: &str, base: &Url, blobs: &BlobStore) -> Result<Self, BridgeError> {
        let source = base.join(source).map_err(|e| BridgeError::InvalidSource {
            url: source.to_string(),
            reason: e.to_string(),
        })?;
        let payload = loader_payload(&source);
        let url = blobs.create_object_url(&payload);
        Ok(Self {
            source,
            payload,
            url,
        })
    }
}

fn loader_payload(source: &Url) -> String {
    let encoded: String = form_urlencoded::byte_serialize(source.as_str().as_bytes()).collect();
    format!("import '{WORKER_MODULE}?source={encoded}'")
}

/// Extract the source URL from a loader payload.
pub fn parse_loader(payload: &str) -> Result<Url, BridgeError> {
    let malformed = || BridgeError::MalformedBootstrap(payload.to_string());
    let prefix = format!("import '{WORKER_MODULE}?");
    let query = payload
        .trim()
        .strip_prefix(prefix.as_str())
        .and_then(|rest| rest.strip_suffix('\''))
        .ok_or_else(malformed)?;
    let source = form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == "source")
        .map(|(_, v)| v.into_owned())
        .ok_or_else(malformed)?;
    Url::parse(&source).map_err(|e| BridgeError::InvalidSource {
        url: source,
        reason: e.to_string(),
    })
}

/// The host's view of a running context.
pub trait ContextHandle: Send + Sync {
    fn id(&self) -> &ContextId;

    /// Move a message into the context.
    fn post_message(&self, message: ContextMessage) -> Result<(), BridgeError>;

    /// Stop the context. Idempotent.
    fn terminate(&self);

    fn is_terminated(&self) -> bool;
}

/// A freshly launched context: its handle and the wire values it sends out.
pub struct LaunchedContext {
    pub handle: Arc<dyn ContextHandle>,
    pub outbound: mpsc::UnboundedReceiver<Value>,
}

/// Creates contexts from bootstrap payloads.
pub trait ContextLauncher: Send + Sync {
    fn launch(&self, bootstrap: &Bootstrap) -> Result<LaunchedContext, BridgeError>;
}

/// The context's end of the channel pair.
pub struct ContextPort {
    id: ContextId,
    inbox: mpsc::UnboundedReceiver<Value>,
    outbox: mpsc::UnboundedSender<Value>,
    shutdown: CancellationToken,
}

impl ContextPort {
    pub fn id(&self) -> &ContextId {
        &self.id
    }

    /// Next message from the host. `None` after termination.
    pub async fn recv(&mut self) -> Option<ContextMessage> {
        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => None,
            msg = self.inbox.recv() => msg.map(ContextMessage::from_value),
        }
    }

    /// Send a message to the host.
    pub fn post(&self, message: ContextMessage) -> bool {
        self.outbox.send(message.to_value()).is_ok()
    }

    pub fn request_args(&self) -> bool {
        self.post(ContextMessage::ArgsRequested)
    }

    /// Raise an inter-process call; the result arrives as a `CallResult`.
    pub fn call(&self, message: impl Into<String>, bytes: Option<bytes::Bytes>) -> bool {
        self.post(ContextMessage::CallRequest(CallRequest::new(message, bytes)))
    }

    /// Raise `envelope` as an `ipc://` call.
    pub fn invoke(&self, envelope: &CallEnvelope) -> bool {
        self.call(envelope.to_uri(), envelope.bytes.clone())
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Code that runs inside a context.
#[async_trait]
pub trait ContextModule: Send + Sync {
    async fn run(&self, port: ContextPort);
}

struct FnModule<F>(F);

#[async_trait]
impl<F, Fut> ContextModule for FnModule<F>
where
    F: Fn(ContextPort) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = ()> + Send,
{
    async fn run(&self, port: ContextPort) {
        (self.0)(port).await;
    }
}

struct TaskContext {
    id: ContextId,
    inbox: mpsc::UnboundedSender<Value>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ContextHandle for TaskContext {
    fn id(&self) -> &ContextId {
        &self.id
    }

    fn post_message(&self, message: ContextMessage) -> Result<(), BridgeError> {
        if self.shutdown.is_cancelled() {
            return Err(BridgeError::Terminated);
        }
        self.inbox
            .send(message.to_value())
            .map_err(|_| BridgeError::ChannelClosed)
    }

    fn terminate(&self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.lock().take() {
            task.abort();
            tracing::debug!(context_id = %self.id, "context terminated");
        }
    }

    fn is_terminated(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Runs registered modules as isolated tokio tasks.
pub struct TaskLauncher {
    blobs: Arc<BlobStore>,
    modules: DashMap<String, Arc<dyn ContextModule>>,
}

impl TaskLauncher {
    pub fn new(blobs: Arc<BlobStore>) -> Self {
        Self {
            blobs,
            modules: DashMap::new(),
        }
    }

    /// Make `module` loadable under the absolute `source` URL.
    pub fn register(&self, source: &Url, module: Arc<dyn ContextModule>) {
        self.modules.insert(source.as_str().to_string(), module);
    }

    pub fn register_fn<F, Fut>(&self, source: &Url, f: F)
    where
        F: Fn(ContextPort) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.register(source, Arc::new(FnModule(f)));
    }

    pub fn is_registered(&self, source: &Url) -> bool {
        self.modules.contains_key(source.as_str())
    }
}

impl ContextLauncher for TaskLauncher {
    fn launch(&self, bootstrap: &Bootstrap) -> Result<LaunchedContext, BridgeError> {
        let payload = self
            .blobs
            .resolve(&bootstrap.url)
            .ok_or_else(|| BridgeError::UnknownBootstrap(bootstrap.url.clone()))?;
        let source = parse_loader(&payload)?;
        let module = self
            .modules
            .get(source.as_str())
            .map(|m| Arc::clone(m.value()))
            .ok_or_else(|| BridgeError::ModuleNotFound(source.to_string()))?;

        let id = ContextId::new();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let port = ContextPort {
            id: id.clone(),
            inbox: inbox_rx,
            outbox: outbox_tx,
            shutdown: shutdown.clone(),
        };
        let span = tracing::debug_span!("context", context_id = %id, source = %source);
        let task = tokio::spawn(tracing::Instrument::instrument(
            async move { module.run(port).await },
            span,
        ));
        tracing::debug!(context_id = %id, source = %source, "context launched");

        Ok(LaunchedContext {
            handle: Arc::new(TaskContext {
                id,
                inbox: inbox_tx,
                shutdown,
                task: Mutex::new(Some(task)),
            }),
            outbound: outbox_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn base() -> Url {
        Url::parse("ferry://app/").unwrap()
    }

    #[test]
    fn blob_urls_are_content_addressed() {
        let blobs = BlobStore::new();
        let a = blobs.create_object_url("import 'x'");
        let b = blobs.create_object_url("import 'x'");
        let c = blobs.create_object_url("import 'y'");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("blob:ferry/"));
        assert_eq!(a.len(), "blob:ferry/".len() + 64);
        assert_eq!(blobs.len(), 2);

        assert_eq!(blobs.resolve(&a).as_deref(), Some("import 'x'"));
        assert!(blobs.revoke(&a));
        assert!(blobs.resolve(&a).is_none());
    }

    #[test]
    fn bootstrap_resolves_relative_source() {
        let blobs = BlobStore::new();
        let boot = Bootstrap::publish("workers/sum.js", &base(), &blobs).unwrap();
        assert_eq!(boot.source.as_str(), "ferry://app/workers/sum.js");
        assert!(boot.payload.starts_with("import 'ferry:internal/worker?source="));
        assert!(!boot.payload.contains('\n'));
        assert_eq!(parse_loader(&boot.payload).unwrap(), boot.source);
    }

    #[test]
    fn malformed_loader_is_rejected() {
        assert!(matches!(
            parse_loader("console.log(1)"),
            Err(BridgeError::MalformedBootstrap(_))
        ));
        assert!(matches!(
            parse_loader("import 'ferry:internal/worker?other=1'"),
            Err(BridgeError::MalformedBootstrap(_))
        ));
    }

    #[tokio::test]
    async fn unregistered_module_fails_launch() {
        let blobs = Arc::new(BlobStore::new());
        let launcher = TaskLauncher::new(Arc::clone(&blobs));
        let boot = Bootstrap::publish("missing.js", &base(), &blobs).unwrap();
        assert!(matches!(
            launcher.launch(&boot),
            Err(BridgeError::ModuleNotFound(_))
        ));
    }

    #[tokio::test]
    async fn revoked_bootstrap_fails_launch() {
        let blobs = Arc::new(BlobStore::new());
        let launcher = TaskLauncher::new(Arc::clone(&blobs));
        let boot = Bootstrap::publish("a.js", &base(), &blobs).unwrap();
        blobs.revoke(&boot.url);
        assert!(matches!(
            launcher.launch(&boot),
            Err(BridgeError::UnknownBootstrap(_))
        ));
    }

    #[tokio::test]
    async fn echo_module_round_trip() {
        let blobs = Arc::new(BlobStore::new());
        let launcher = TaskLauncher::new(Arc::clone(&blobs));
        let source = base().join("echo.js").unwrap();
        launcher.register_fn(&source, |mut port: ContextPort| async move {
            while let Some(msg) = port.recv().await {
                port.post(msg);
            }
        });
        assert!(launcher.is_registered(&source));

        let boot = Bootstrap::publish("echo.js", &base(), &blobs).unwrap();
        let LaunchedContext {
            handle,
            mut outbound,
        } = launcher.launch(&boot).unwrap();

        let ping = ContextMessage::Passthrough(serde_json::json!({"ping": 1}));
        handle.post_message(ping.clone()).unwrap();
        assert_eq!(
            outbound.recv().await.map(ContextMessage::from_value),
            Some(ping)
        );

        handle.terminate();
        handle.terminate();
        assert!(handle.is_terminated());
        assert!(matches!(
            handle.post_message(ContextMessage::ArgsRequested),
            Err(BridgeError::Terminated)
        ));
        // The module's outbox is dropped with the aborted task.
        let closed = tokio::time::timeout(Duration::from_secs(1), outbound.recv()).await;
        assert_eq!(closed.unwrap(), None);
    }

    #[tokio::test]
    async fn port_messages_cross_as_wire_values() {
        let blobs = Arc::new(BlobStore::new());
        let launcher = TaskLauncher::new(Arc::clone(&blobs));
        let source = base().join("caller.js").unwrap();
        launcher.register_fn(&source, |port: ContextPort| async move {
            port.request_args();
            port.invoke(
                &CallEnvelope::new("fs.read")
                    .with_param("path", "/a b")
                    .with_bytes(Some(bytes::Bytes::from_static(b"\x00\x01"))),
            );
        });

        let boot = Bootstrap::publish("caller.js", &base(), &blobs).unwrap();
        let LaunchedContext { mut outbound, .. } = launcher.launch(&boot).unwrap();

        assert_eq!(
            outbound.recv().await,
            Some(serde_json::json!({"__argsRequested": true}))
        );
        let call = outbound.recv().await.unwrap();
        assert_eq!(call["__callRequest"]["message"], "ipc://fs.read?path=%2Fa+b");
        match ContextMessage::from_value(call) {
            ContextMessage::CallRequest(request) => {
                let envelope = CallEnvelope::parse(
                    request.relayable().unwrap(),
                    request.bytes.clone(),
                )
                .unwrap();
                assert_eq!(envelope.name, "fs.read");
                assert_eq!(envelope.params["path"], "/a b");
                assert_eq!(envelope.bytes.as_deref(), Some(&b"\x00\x01"[..]));
            }
            other => panic!("expected call request, got {other:?}"),
        }
    }
}
