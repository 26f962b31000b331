use ferry_core::events::{BroadcastEvent, EventKind};
use tokio::sync::broadcast;

/// Default number of events a slow subscriber may fall behind by.
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Process-wide publish/subscribe channel for runtime events.
///
/// Components receive the bus explicitly and hold [`Subscription`] handles;
/// dropping or calling [`Subscription::unsubscribe`] detaches the listener.
#[derive(Clone, Debug)]
pub struct BroadcastBus {
    tx: broadcast::Sender<BroadcastEvent>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Returns how many subscribers were live.
    pub fn publish(&self, event: BroadcastEvent) -> usize {
        let kind = event.kind;
        match self.tx.send(event) {
            Ok(n) => {
                tracing::trace!(kind = %kind, receivers = n, "broadcast");
                n
            }
            Err(_) => 0,
        }
    }

    /// Subscribe to every event kind.
    pub fn subscribe_all(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            kind: None,
        }
    }

    /// Subscribe to one event kind.
    pub fn subscribe(&self, kind: EventKind) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            kind: Some(kind),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

/// A live subscription to the bus.
pub struct Subscription {
    rx: broadcast::Receiver<BroadcastEvent>,
    kind: Option<EventKind>,
}

impl Subscription {
    /// Next matching event, in publish order. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<BroadcastEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.kind.map_or(true, |k| k == event.kind) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "bus subscriber lagged, dropped events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event if one is already queued.
    pub fn try_recv(&mut self) -> Option<BroadcastEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    if self.kind.map_or(true, |k| k == event.kind) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "bus subscriber lagged, dropped events");
                }
                Err(_) => return None,
            }
        }
    }

    pub fn kind(&self) -> Option<EventKind> {
        self.kind
    }

    /// Detach from the bus.
    pub fn unsubscribe(self) {}
}
