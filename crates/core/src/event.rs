//! Engine lifecycle events.
//!
//! Events are published when a resistance pass completes or fails, and when
//! the memory monitor observes pressure. Subscribers receive every event and
//! filter for what they care about.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// All lifecycle events emitted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EngineEvent {
    /// A resistance pass completed.
    Resistance {
        strategy: String,
        preservation_rate: f64,
        duration_ms: u64,
        size_before: usize,
        size_after: usize,
        timestamp: DateTime<Utc>,
    },

    /// A resistance pass failed.
    ResistanceError {
        error_message: String,
        emergency_applied: bool,
        timestamp: DateTime<Utc>,
    },

    /// Advisory: process memory crossed the pressure threshold.
    MemoryPressure {
        used_bytes: u64,
        budget_bytes: u64,
        ratio: f64,
        timestamp: DateTime<Utc>,
    },
}

impl EngineEvent {
    /// Wire name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::Resistance { .. } => "resistance",
            EngineEvent::ResistanceError { .. } => "resistance-error",
            EngineEvent::MemoryPressure { .. } => "memory-pressure",
        }
    }
}

/// A broadcast-based event bus for engine events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub. Cloning the bus
/// yields another handle onto the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<EngineEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: EngineEvent) {
        tracing::trace!(kind = event.kind(), "publishing engine event");
        // No subscribers is fine.
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<EngineEvent>> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
