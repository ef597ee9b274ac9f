//! Process-wide broadcast of committed events.

use std::sync::Arc;

use omnicron_core::aggregate::Publish;
use omnicron_core::event::Event;
use tokio::sync::broadcast;
use tracing::debug;

/// Multicasts committed events to every open connection.
///
/// There is no persistence and no replay: a receiver only sees events
/// published after it subscribed. A receiver that falls more than the
/// channel capacity behind loses the oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<Event>>,
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per receiver.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes `events` in order. Returns how many receivers were
    /// listening.
    pub fn publish(&self, events: impl IntoIterator<Item = Event>) -> usize {
        let mut receivers = 0;
        for event in events {
            debug!(stream = %event.stream_id, seq = event.seq, event_type = %event.event_type, "broadcast");
            // No receivers is not an error: nobody is connected.
            receivers = self.sender.send(Arc::new(event)).unwrap_or(0);
        }
        receivers
    }

    /// Opens a receiver for events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Event>> {
        self.sender.subscribe()
    }

    /// Number of open receivers.
    #[must_use]
    pub fn listeners(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Publish for EventBus {
    fn publish(&self, events: &[Event]) {
        EventBus::publish(self, events.iter().cloned());
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
