//! Outbound event bus.
//!
//! Event-producing components hold a cheap clone of the bus; IPC
//! broadcasters and the CLI subscribe. Lagging or absent subscribers never
//! block producers.

use tokio::sync::broadcast;
use tracing::debug;

use vigil_core::VigilEvent;

const DEFAULT_CAPACITY: usize = 1024;

/// Broadcast channel for [`VigilEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<VigilEvent>,
}

impl EventBus {
    /// Creates a bus with the default buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a bus buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribes to all future events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<VigilEvent> {
        self.tx.subscribe()
    }

    /// Emits an event. A bus with no subscribers drops it silently.
    pub fn emit(&self, event: VigilEvent) {
        debug!(event = event.name(), "emitting");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(VigilEvent::ScanError {
            path: "/x".into(),
            kind: "io".into(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "scan_error");
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.emit(VigilEvent::ScanError {
            path: "/x".into(),
            kind: "io".into(),
        });
    }
}
