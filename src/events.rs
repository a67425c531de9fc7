//! Typed lifecycle event bus for host observers
//!
//! The core pushes node and task lifecycle events onto a broadcast channel
//! and never blocks on (or fails because of) its observers. A host process
//! renders these however it likes; the core treats the bus purely as a
//! sink.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::nodes::{NodeInfo, ServerStatus};
use crate::tasks::{Task, TaskProgress};

/// Channel capacity; lagging observers lose old events rather than stalling
/// the core
const BUS_CAPACITY: usize = 256;

/// Lifecycle events pushed to host observers
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum FleetEvent {
    /// Server status transition, emitted on every change
    ServerStatusChanged { status: ServerStatus },
    /// A peer announced its identity
    NodeConnected { node: NodeInfo },
    /// A peer (or our own coordinator link) went away; identity may never
    /// have been announced
    NodeDisconnected { node: Option<NodeInfo> },
    TaskCreated { task: Task },
    TaskStarted { task: Task },
    TaskProgress { progress: TaskProgress },
    TaskCompleted { task: Task },
    TaskFailed { task: Task },
    TaskCancelled { task: Task },
}

/// Broadcast bus carrying [`FleetEvent`]s to any number of observers
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FleetEvent>,
}

impl EventBus {
    /// Create a bus with no subscribers yet
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event, best-effort
    ///
    /// A bus with no subscribers swallows the event.
    pub fn publish(&self, event: FleetEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to all events published after this call
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
