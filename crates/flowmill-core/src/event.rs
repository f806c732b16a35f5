use tokio::sync::broadcast;
use tracing::trace;

use crate::types::EngineEvent;

/// Broadcast of engine lifecycle events. Every subscriber sees every event
/// published after it subscribed; slow subscribers lag and lose the oldest.
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns how many subscribers received the event.
    pub fn publish(&self, event: EngineEvent) -> usize {
        let name = event.name();
        let delivered = self.tx.send(event).unwrap_or(0);
        trace!(event = name, delivered, "Event published");
        delivered
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
