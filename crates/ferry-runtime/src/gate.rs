//! Bounded-concurrency admission with forced timeout eviction.
//!
//! The gate tracks at most `limit` outstanding tasks. A push beyond that
//! waits for the **head** of the queue (the oldest tracked entry) to leave,
//! not for any slot to free up. Every entry races its task against an
//! eviction timer; whichever finishes first removes the entry. Eviction only
//! stops tracking: the task itself keeps running and may finish later with
//! nobody watching.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Eviction timer used when a push does not name one.
pub const DEFAULT_TIMER: Duration = Duration::from_millis(256);

const FALLBACK_CONCURRENCY: usize = 4;

/// Host parallelism hint, or 4 when the host cannot say.
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(FALLBACK_CONCURRENCY)
}

/// One tracked task.
struct PendingEntry {
    seq: u64,
    /// Tombstone; set by the first removal.
    removed: AtomicBool,
    /// Cancelled once the entry has left the queue.
    departed: CancellationToken,
}

struct GateState {
    pending: VecDeque<Arc<PendingEntry>>,
    next_seq: u64,
}

#[derive(Default)]
struct GateCounters {
    admitted: AtomicU64,
    settled: AtomicU64,
    evicted: AtomicU64,
}

/// Point-in-time copy of a gate's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GateStats {
    pub admitted: u64,
    pub settled: u64,
    pub evicted: u64,
    pub pending: usize,
}

struct GateShared {
    state: Mutex<GateState>,
    /// Serialises admission so waiters are admitted in push order.
    turn: tokio::sync::Mutex<()>,
    counters: GateCounters,
}

/// Cheaply cloneable handle to a shared admission queue.
#[derive(Clone)]
pub struct AdmissionGate {
    limit: usize,
    timer: Duration,
    shared: Arc<GateShared>,
}

impl AdmissionGate {
    /// A limit of `None` or `Some(0)` falls back to [`default_concurrency`].
    pub fn new(limit: Option<usize>) -> Self {
        let limit = limit.filter(|n| *n > 0).unwrap_or_else(default_concurrency);
        Self {
            limit,
            timer: DEFAULT_TIMER,
            shared: Arc::new(GateShared {
                state: Mutex::new(GateState {
                    pending: VecDeque::new(),
                    next_seq: 0,
                }),
                turn: tokio::sync::Mutex::new(()),
                counters: GateCounters::default(),
            }),
        }
    }

    /// Replace the default eviction timer. Zero keeps the current one.
    pub fn with_timer(mut self, timer: Duration) -> Self {
        if !timer.is_zero() {
            self.timer = timer;
        }
        self
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn timer(&self) -> Duration {
        self.timer
    }

    /// Number of tracked entries.
    pub fn len(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> GateStats {
        let c = &self.shared.counters;
        GateStats {
            admitted: c.admitted.load(Ordering::Relaxed),
            settled: c.settled.load(Ordering::Relaxed),
            evicted: c.evicted.load(Ordering::Relaxed),
            pending: self.len(),
        }
    }

    /// Suspend while the queue is full, waking each time the head leaves.
    pub async fn wait(&self) {
        while let Some(head) = self.full_head() {
            head.cancelled().await;
        }
    }

    /// Admit `task` with the gate's default eviction timer.
    pub async fn push<F>(&self, task: F)
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.push_with_timer(task, self.timer).await;
    }

    /// Admit `task`, tracking it until it settles or `timer` elapses.
    ///
    /// Returns once the task has been admitted. A zero timer means the
    /// gate's default.
    pub async fn push_with_timer<F>(&self, task: F, timer: Duration)
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let timer = if timer.is_zero() { self.timer } else { timer };
        let entry = self.admit().await;
        let gate = self.clone();

        // The task runs on its own; dropping the handle on eviction detaches it.
        let mut running = tokio::spawn(task);
        tokio::spawn(async move {
            let evicted = tokio::select! {
                biased;
                _ = &mut running => false,
                () = tokio::time::sleep(timer) => true,
            };
            // Leave the entry in place until the waker that observed it has run.
            tokio::task::yield_now().await;
            gate.finish(&entry, evicted, timer);
        });
    }

    async fn admit(&self) -> Arc<PendingEntry> {
        let _turn = self.shared.turn.lock().await;
        loop {
            let head = {
                let mut state = self.shared.state.lock();
                if state.pending.len() < self.limit {
                    let entry = Arc::new(PendingEntry {
                        seq: state.next_seq,
                        removed: AtomicBool::new(false),
                        departed: CancellationToken::new(),
                    });
                    state.next_seq += 1;
                    state.pending.push_back(Arc::clone(&entry));
                    self.shared.counters.admitted.fetch_add(1, Ordering::Relaxed);
                    trace!(seq = entry.seq, pending = state.pending.len(), "admitted");
                    return entry;
                }
                state.pending.front().map(|e| e.departed.clone())
            };
            if let Some(head) = head {
                head.cancelled().await;
            }
        }
    }

    fn full_head(&self) -> Option<CancellationToken> {
        let state = self.shared.state.lock();
        if state.pending.len() < self.limit {
            return None;
        }
        state.pending.front().map(|e| e.departed.clone())
    }

    fn finish(&self, entry: &Arc<PendingEntry>, evicted: bool, timer: Duration) {
        if !self.remove(entry) {
            return;
        }
        let counters = &self.shared.counters;
        if evicted {
            counters.evicted.fetch_add(1, Ordering::Relaxed);
            debug!(
                seq = entry.seq,
                timer_ms = timer.as_millis() as u64,
                "evicted stuck entry"
            );
        } else {
            counters.settled.fetch_add(1, Ordering::Relaxed);
            trace!(seq = entry.seq, "settled");
        }
    }

    /// Remove an entry. Returns false if it was already removed.
    fn remove(&self, entry: &Arc<PendingEntry>) -> bool {
        if entry.removed.swap(true, Ordering::AcqRel) {
            return false;
        }
        {
            let mut state = self.shared.state.lock();
            if let Some(pos) = state.pending.iter().position(|e| Arc::ptr_eq(e, entry)) {
                state.pending.remove(pos);
            }
        }
        entry.departed.cancel();
        true
    }
}

impl Default for AdmissionGate {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for AdmissionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionGate")
            .field("limit", &self.limit)
            .field("timer", &self.timer)
            .field("pending", &self.len())
            .finish()
    }
}
