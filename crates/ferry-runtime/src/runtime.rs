use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ferry_core::{BroadcastEvent, DispatchOptions, HostDispatch, Params, Payload};
use tracing::{debug, info, warn};
use url::Url;

use crate::bridge::{BridgeDeps, ContextBridge};
use crate::bus::BroadcastBus;
use crate::config::RuntimeConfig;
use crate::context::{BlobStore, TaskLauncher};
use crate::dispatcher::{PostQueue, PostRequest};
use crate::error::BridgeError;
use crate::gate::AdmissionGate;
use crate::host::CachingDispatch;
use crate::throttle::RequestThrottle;

/// Operation precached by [`Runtime::ready`].
pub const FS_CONSTANTS: &str = "fs.constants";

/// Owns the shared services and hands them out explicitly.
pub struct Runtime {
    config: RuntimeConfig,
    base_url: Url,
    host: Arc<CachingDispatch>,
    bus: BroadcastBus,
    posts: PostQueue,
    throttle: RequestThrottle,
    blobs: Arc<BlobStore>,
    launcher: Arc<TaskLauncher>,
    loaded: AtomicBool,
}

impl Runtime {
    /// Wire up the runtime around `host`. Fails only on a bad base URL.
    pub fn new(config: RuntimeConfig, host: Arc<dyn HostDispatch>) -> Result<Self, BridgeError> {
        let base_url = config.base_url()?;
        let host = Arc::new(CachingDispatch::new(host));
        let bus = BroadcastBus::new(config.bus_capacity);
        let posts = PostQueue::new(
            config.concurrency,
            config.post_timer(),
            Arc::clone(&host) as Arc<dyn HostDispatch>,
            bus.clone(),
        );
        let throttle = RequestThrottle::new(
            AdmissionGate::new(config.concurrency).with_timer(config.gate_timer()),
        );
        let blobs = Arc::new(BlobStore::new());
        let launcher = Arc::new(TaskLauncher::new(Arc::clone(&blobs)));

        debug!(
            concurrency = posts.limit(),
            base_url = %base_url,
            is_worker = config.is_worker,
            "runtime created"
        );
        Ok(Self {
            config,
            base_url,
            host,
            bus,
            posts,
            throttle,
            blobs,
            launcher,
            loaded: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn bus(&self) -> &BroadcastBus {
        &self.bus
    }

    /// Dispatcher wrapped with the reply cache.
    pub fn host(&self) -> Arc<dyn HostDispatch> {
        Arc::clone(&self.host) as Arc<dyn HostDispatch>
    }

    pub fn post_queue(&self) -> &PostQueue {
        &self.posts
    }

    pub fn throttle(&self) -> &RequestThrottle {
        &self.throttle
    }

    /// Launcher that context modules are registered with.
    pub fn launcher(&self) -> &TaskLauncher {
        &self.launcher
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub async fn post(&self, request: PostRequest) {
        self.posts.dispatch(request).await;
    }

    /// Launch a context for `source`, resolved against the base URL.
    pub fn spawn_context(&self, source: &str) -> Result<ContextBridge, BridgeError> {
        let deps = BridgeDeps {
            bus: self.bus.clone(),
            host: self.host(),
            launcher: Arc::clone(&self.launcher) as _,
            blobs: Arc::clone(&self.blobs),
            args: Arc::from(self.config.args.as_slice()),
            base_url: self.base_url.clone(),
        };
        ContextBridge::spawn(source, &deps)
    }

    /// Announce startup with a single `init` broadcast. Later calls do nothing.
    pub fn load(&self) -> bool {
        if self.loaded.swap(true, Ordering::AcqRel) {
            return false;
        }
        let receivers = self.bus.publish(BroadcastEvent::init());
        info!(receivers, "runtime loaded");
        true
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Warm the reply cache. Skipped inside a background context.
    pub async fn ready(&self) -> Option<Payload> {
        if self.config.is_worker {
            return None;
        }
        match self
            .host
            .dispatch(FS_CONSTANTS, Params::new(), DispatchOptions::default().cached())
            .await
        {
            Ok(payload) => Some(payload),
            Err(err) => {
                warn!(error = %err, operation = FS_CONSTANTS, "precache failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextPort;
    use crate::host::MethodRouter;
    use ferry_core::ids::CallId;
    use ferry_core::{ContextMessage, DispatchError, EventKind};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn router(constants_calls: Arc<AtomicUsize>) -> MethodRouter {
        let mut router = MethodRouter::new();
        router.register(FS_CONSTANTS, move |_p, _o| {
            constants_calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(Payload::Json(serde_json::json!({"O_RDONLY": 0}))) }
        });
        router.register("post", |_p, _o| async { Ok(Payload::Empty) });
        router
    }

    #[tokio::test]
    async fn load_publishes_init_once() {
        let rt = Runtime::new(RuntimeConfig::default(), Arc::new(MethodRouter::new())).unwrap();
        let mut sub = rt.bus().subscribe(EventKind::Init);

        assert!(rt.load());
        assert!(!rt.load());
        assert!(rt.is_loaded());

        assert_eq!(sub.recv().await.unwrap().kind, EventKind::Init);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn ready_precaches_constants() {
        let calls = Arc::new(AtomicUsize::new(0));
        let rt = Runtime::new(RuntimeConfig::default(), Arc::new(router(Arc::clone(&calls)))).unwrap();

        assert!(rt.ready().await.is_some());
        let again = rt
            .host()
            .dispatch(FS_CONSTANTS, Params::new(), DispatchOptions::default().cached())
            .await
            .unwrap();
        assert_eq!(again, Payload::Json(serde_json::json!({"O_RDONLY": 0})));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ready_is_skipped_in_a_worker() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = RuntimeConfig {
            is_worker: true,
            ..RuntimeConfig::default()
        };
        let rt = Runtime::new(config, Arc::new(router(Arc::clone(&calls)))).unwrap();
        assert!(rt.ready().await.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ready_swallows_host_failure() {
        let mut router = MethodRouter::new();
        router.register(FS_CONSTANTS, |_p, _o| async {
            Err(DispatchError::Host("unavailable".into()))
        });
        let rt = Runtime::new(RuntimeConfig::default(), Arc::new(router)).unwrap();
        assert!(rt.ready().await.is_none());
    }

    #[test]
    fn bad_base_url_fails_construction() {
        let config = RuntimeConfig {
            base_url: "::".into(),
            ..RuntimeConfig::default()
        };
        assert!(Runtime::new(config, Arc::new(MethodRouter::new())).is_err());
    }

    #[tokio::test]
    async fn post_and_context_share_the_bus() {
        let config = RuntimeConfig {
            concurrency: Some(2),
            args: vec!["--demo".into()],
            ..RuntimeConfig::default()
        };
        let rt = Runtime::new(config, Arc::new(router(Arc::new(AtomicUsize::new(0))))).unwrap();
        assert_eq!(rt.post_queue().limit(), 2);
        assert_eq!(rt.throttle().limit(), 2);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let source = rt.base_url().join("listen.js").unwrap();
        rt.launcher().register_fn(&source, move |mut port: ContextPort| {
            let tx = tx.clone();
            async move {
                port.request_args();
                while let Some(msg) = port.recv().await {
                    let _ = tx.send(msg);
                }
            }
        });

        let bridge = rt.spawn_context("listen.js").unwrap();
        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(first, Some(ContextMessage::ArgsReply(vec!["--demo".into()])));

        rt.post(PostRequest::new(CallId::from_raw("p1"), 0)).await;
        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap() {
            Some(ContextMessage::Event(event)) => assert_eq!(event.detail["id"], "p1"),
            other => panic!("expected forwarded data event, got {other:?}"),
        }
        bridge.terminate().await;
        assert_eq!(rt.bus().subscriber_count(), 0);
    }
}
