use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::Execution;

/// Events carried on the process-wide bus.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum DaemonEvent {
    /// Full snapshot of an execution, published after every store
    /// mutation. Per-id delivery order equals commit order.
    ExecutionUpdated { execution: Execution },
    /// The process is shutting down; components holding OS resources
    /// (database connection, open log tails) release them on receipt.
    Shutdown,
}

/// In-process publish/subscribe hub.
///
/// A cheaply cloneable handle around a broadcast channel, injected into
/// every component that publishes or observes events. Subscribing and
/// dropping receivers are safe while a publish is in progress, and a
/// slow or failing subscriber cannot corrupt delivery to the others.
/// Only receivers subscribed before a publish see that event.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DaemonEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Fan the event out to all current subscribers. Having no
    /// subscribers is not an error.
    pub fn publish(&self, event: DaemonEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Event published with no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.tx.subscribe()
    }
}
