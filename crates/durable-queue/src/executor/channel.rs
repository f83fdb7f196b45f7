//! What an execution unit sees of its pool

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Handle to the pool bus, scoped to one unit
///
/// Anything broadcast here reaches every unit of the pool, the sender
/// included, and every `Executor::listen` handler.
#[derive(Debug, Clone)]
pub struct WorkerChannel {
    name: String,
    bus: broadcast::Sender<serde_json::Value>,
}

impl WorkerChannel {
    pub(crate) fn new(name: impl Into<String>, bus: broadcast::Sender<serde_json::Value>) -> Self {
        Self {
            name: name.into(),
            bus,
        }
    }

    /// Name of the unit this channel belongs to
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send a message to every subscriber, returning how many received it
    pub fn broadcast(&self, message: serde_json::Value) -> usize {
        match self.bus.send(message) {
            Ok(receivers) => receivers,
            Err(_) => {
                trace!(worker = %self.name, "Broadcast with no subscribers");
                0
            }
        }
    }

    /// Receive every message broadcast from now on
    pub fn subscribe(&self) -> broadcast::Receiver<serde_json::Value> {
        self.bus.subscribe()
    }
}

/// Everything handed to a unit when it is spawned
pub struct WorkerContext {
    /// Stable name, `<pool>-<index>`
    pub name: String,

    /// Messages dispatched to this unit by `Executor::post_message`
    pub inbox: mpsc::Receiver<serde_json::Value>,

    /// Pool bus
    pub channel: WorkerChannel,

    /// Cancelled when the executor terminates this unit
    pub shutdown: CancellationToken,
}
