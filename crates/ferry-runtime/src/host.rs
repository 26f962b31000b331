//! Host-side implementations of [`HostDispatch`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use ferry_core::{DispatchError, DispatchOptions, HostDispatch, Params, Payload};
use futures::future::BoxFuture;
use futures::FutureExt;

type Handler =
    Arc<dyn Fn(Params, DispatchOptions) -> BoxFuture<'static, Result<Payload, DispatchError>> + Send + Sync>;

/// Table of host operations keyed by name.
pub struct MethodRouter {
    handlers: HashMap<String, Handler>,
}

impl MethodRouter {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler, replacing any previous one with the same name.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(Params, DispatchOptions) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, DispatchError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |params, options| handler(params, options).boxed());
        self.handlers.insert(name.into(), handler);
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.handlers.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// All operation names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn count(&self) -> usize {
        self.handlers.len()
    }
}

impl Default for MethodRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostDispatch for MethodRouter {
    async fn dispatch(
        &self,
        name: &str,
        params: Params,
        options: DispatchOptions,
    ) -> Result<Payload, DispatchError> {
        let Some(handler) = self.handlers.get(name).cloned() else {
            return Err(DispatchError::MethodNotFound(name.to_string()));
        };
        handler(params, options).await
    }
}

/// Memoises successful replies for calls that ask for `cache`.
pub struct CachingDispatch {
    inner: Arc<dyn HostDispatch>,
    cache: DashMap<String, Payload>,
    hits: AtomicU64,
}

impl CachingDispatch {
    pub fn new(inner: Arc<dyn HostDispatch>) -> Self {
        Self {
            inner,
            cache: DashMap::new(),
            hits: AtomicU64::new(0),
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    pub fn clear(&self) {
        self.cache.clear();
    }

    fn key(name: &str, params: &Params) -> String {
        // serde_json maps keep keys sorted, so equal params give equal keys.
        format!("{name}?{}", serde_json::Value::Object(params.clone()))
    }
}

#[async_trait]
impl HostDispatch for CachingDispatch {
    async fn dispatch(
        &self,
        name: &str,
        params: Params,
        options: DispatchOptions,
    ) -> Result<Payload, DispatchError> {
        if !options.cache {
            return self.inner.dispatch(name, params, options).await;
        }

        let key = Self::key(name, &params);
        if let Some(hit) = self.cache.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(name, "host call served from cache");
            return Ok(hit.clone());
        }

        let payload = self.inner.dispatch(name, params, options).await?;
        self.cache.insert(key, payload.clone());
        Ok(payload)
    }
}
