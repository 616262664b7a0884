//! Outbound event bus towards the supervising process.
//!
//! The engine manager emits status changes and the heartbeat emits liveness
//! via [`EventBus::emit`]; the bridge subscribes via [`EventBus::subscribe`]
//! and forwards them. Built on [`tokio::sync::broadcast`], so emitting never
//! blocks and an absent listener simply means the event is dropped.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::status::{Heartbeat, ProgressReport};

/// Events that flow to the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Event {
    /// Lifecycle transition or runtime progress tick.
    Status(ProgressReport),
    /// Periodic liveness announcement.
    Heartbeat(Heartbeat),
}

/// A broadcast channel that any component can emit to or subscribe from.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event to all current subscribers.
    /// Returns the number of receivers that will see it; zero is not an error.
    pub fn emit(&self, event: Event) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribe to events. Returns a receiver that yields all
    /// future events (does not replay past ones).
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(128)
    }
}
