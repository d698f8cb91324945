//! Backend health events.
//!
//! The service manager publishes a [`HealthEvent`] on every registry change
//! and every health transition.  Subscribers receive [`Arc<HealthEvent>`]s
//! over a [`tokio::sync::broadcast`] channel; slow subscribers see
//! `RecvError::Lagged` rather than blocking the health loop.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use evox_kernel::BackendKind;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::breaker::CircuitState;

/// What happened to a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum HealthChange {
    Registered,
    Deregistered,
    /// A probe succeeded after a failure.
    Recovered,
    /// A probe failed (or timed out) after a success.
    Failed { error: String },
    /// The backend's circuit breaker changed state.
    Circuit { state: CircuitState },
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthEvent {
    pub backend: String,
    pub kind: BackendKind,
    #[serde(flatten)]
    pub change: HealthChange,
    /// Registry epoch after this change.
    pub epoch: u64,
    pub timestamp: DateTime<Utc>,
}

/// Broadcast channel for [`HealthEvent`]s.  Cheaply cloneable.
#[derive(Clone)]
pub struct HealthBus {
    sender: broadcast::Sender<Arc<HealthEvent>>,
}

impl HealthBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to current subscribers; returns how many will see it.
    /// Having no subscribers is normal.
    pub fn publish(&self, event: HealthEvent) -> usize {
        self.sender.send(Arc::new(event)).unwrap_or(0)
    }

    /// Events published before this call are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<HealthEvent>> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for HealthBus {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(change: HealthChange) -> HealthEvent {
        HealthEvent {
            backend: "primary".into(),
            kind: BackendKind::Sql,
            change,
            epoch: 1,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = HealthBus::new(4);
        assert_eq!(bus.publish(event(HealthChange::Registered)), 0);
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = HealthBus::new(4);
        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(event(HealthChange::Failed {
            error: "refused".into(),
        }));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.backend, "primary");
        assert!(matches!(received.change, HealthChange::Failed { .. }));
    }

    #[test]
    fn serializes_flat() {
        let json = serde_json::to_value(event(HealthChange::Recovered)).unwrap();
        assert_eq!(json["change"], "recovered");
        assert_eq!(json["kind"], "sql");

        let json = serde_json::to_value(event(HealthChange::Circuit {
            state: CircuitState::HalfOpen,
        }))
        .unwrap();
        assert_eq!(json["change"], "circuit");
        assert_eq!(json["state"], "half_open");
    }
}
