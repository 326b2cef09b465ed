//! In-process notification bus.
//!
//! Server pushes and connection lifecycle changes fan out to whichever
//! components care (the UDS server, embedders, the status logger in the
//! daemon) without coupling them to the connection supervisor.

use tokio::sync::broadcast;

use crate::connection::ConnectionState;

/// An event published on the agent's internal bus.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// Core rotated a secret; the cache entry has already been invalidated
    /// by the time this event is observable.
    SecretRotated { path: String, new_version: u64 },
    /// Core pushed a policy update; the local policy store has already been
    /// refreshed.
    PolicyUpdated,
    /// The core session changed state.
    ConnectionStateChanged { state: ConnectionState },
}

/// Broadcast bus for [`AgentEvent`]s. Slow subscribers lag and drop, they
/// never block publishers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AgentEvent>,
}

impl EventBus {
    /// Create a bus retaining up to `capacity` undelivered events per
    /// subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all future events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. A bus with no subscribers drops it silently.
    pub fn emit(&self, event: AgentEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(AgentEvent::SecretRotated {
            path: "prod.db.password".to_owned(),
            new_version: 8,
        });
        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event,
            AgentEvent::SecretRotated { new_version: 8, .. }
        ));
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        let bus = EventBus::new(8);
        bus.emit(AgentEvent::PolicyUpdated);
    }
}
