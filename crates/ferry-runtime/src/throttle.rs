use std::future::Future;

use tokio::sync::oneshot;

use crate::gate::{AdmissionGate, GateStats};

/// Whether a request may be throttled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RequestMode {
    #[default]
    Async,
    /// Runs immediately; never queued.
    Sync,
}

/// Shared throttle for outgoing requests.
///
/// Async requests take a gate slot that is released when the request
/// completes or is dropped. Sync requests bypass the gate.
#[derive(Clone)]
pub struct RequestThrottle {
    gate: AdmissionGate,
}

impl RequestThrottle {
    pub fn new(gate: AdmissionGate) -> Self {
        Self { gate }
    }

    pub fn limit(&self) -> usize {
        self.gate.limit()
    }

    pub fn stats(&self) -> GateStats {
        self.gate.stats()
    }

    pub async fn send<F>(&self, mode: RequestMode, request: F) -> F::Output
    where
        F: Future + Send,
    {
        if mode == RequestMode::Sync {
            return request.await;
        }

        // Dropping `done` also settles the slot.
        let (done, settled) = oneshot::channel::<()>();
        self.gate
            .push(async move {
                let _ = settled.await;
            })
            .await;

        let output = request.await;
        let _ = done.send(());
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn sync_requests_skip_the_gate() {
        let throttle = RequestThrottle::new(AdmissionGate::new(Some(1)));
        let out = throttle.send(RequestMode::Sync, async { 42 }).await;
        assert_eq!(out, 42);
        assert_eq!(throttle.stats().admitted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn async_requests_are_bounded() {
        let throttle = RequestThrottle::new(AdmissionGate::new(Some(2)));
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let throttle = throttle.clone();
            let (live, peak) = (Arc::clone(&live), Arc::clone(&peak));
            tasks.push(tokio::spawn(async move {
                throttle
                    .send(RequestMode::Async, async {
                        let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        live.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(throttle.stats().admitted, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_request_frees_its_slot() {
        let throttle = RequestThrottle::new(AdmissionGate::new(Some(1)));

        let hung = throttle.clone();
        let handle = tokio::spawn(async move {
            hung.send(RequestMode::Async, std::future::pending::<()>())
                .await;
        });
        tokio::task::yield_now().await;
        handle.abort();
        let _ = handle.await;

        let start = Instant::now();
        throttle.send(RequestMode::Async, async {}).await;
        assert!(start.elapsed() < Duration::from_millis(5));
    }
}
