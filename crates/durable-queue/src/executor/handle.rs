//! Execution unit handle

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::channel::{WorkerChannel, WorkerContext};

/// Lifecycle of one execution unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Task created, not yet polled
    Spawned,
    /// Unit body is running
    Active,
    /// Unit returned or was terminated
    Terminated,
}

/// Body of an execution unit
pub type UnitFn =
    Arc<dyn Fn(WorkerContext) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Executor-owned reference to one running unit
pub struct WorkerHandle {
    name: String,
    index: usize,
    /// Spawn order, used to pick the most recently added unit
    seq: u64,
    inbox: mpsc::Sender<serde_json::Value>,
    state: Arc<RwLock<WorkerState>>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub(crate) fn spawn(
        pool: &str,
        index: usize,
        seq: u64,
        inbox_capacity: usize,
        bus: broadcast::Sender<serde_json::Value>,
        unit: &UnitFn,
    ) -> Self {
        let name = format!("{}-{}", pool, index);
        let (inbox_tx, inbox_rx) = mpsc::channel(inbox_capacity.max(1));
        let state = Arc::new(RwLock::new(WorkerState::Spawned));
        let shutdown = CancellationToken::new();

        let ctx = WorkerContext {
            name: name.clone(),
            inbox: inbox_rx,
            channel: WorkerChannel::new(name.clone(), bus),
            shutdown: shutdown.clone(),
        };

        let body = unit(ctx);
        let task_state = Arc::clone(&state);
        let task_name = name.clone();
        let task = tokio::spawn(async move {
            *task_state.write() = WorkerState::Active;
            debug!(worker = %task_name, "Worker started");
            body.await;
            *task_state.write() = WorkerState::Terminated;
            debug!(worker = %task_name, "Worker finished");
        });

        Self {
            name,
            index,
            seq,
            inbox: inbox_tx,
            state,
            shutdown,
            task: Some(task),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    pub fn state(&self) -> WorkerState {
        *self.state.read()
    }

    pub(crate) fn inbox(&self) -> mpsc::Sender<serde_json::Value> {
        self.inbox.clone()
    }

    /// Signal shutdown and wait up to `grace` for the unit to return
    ///
    /// Units still running after `grace` are aborted. Terminating a
    /// terminated unit is a no-op.
    pub(crate) async fn terminate(&mut self, grace: Duration) {
        let Some(mut task) = self.task.take() else {
            return;
        };

        self.shutdown.cancel();
        tokio::select! {
            _ = &mut task => {}
            _ = tokio::time::sleep(grace) => {
                warn!(worker = %self.name, grace_ms = grace.as_millis() as u64, "Worker did not stop in time, aborting");
                task.abort();
            }
        }

        *self.state.write() = WorkerState::Terminated;
        debug!(worker = %self.name, "Worker terminated");
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            self.shutdown.cancel();
            task.abort();
        }
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle_unit() -> UnitFn {
        Arc::new(|ctx: WorkerContext| {
            Box::pin(async move {
                ctx.shutdown.cancelled().await;
            })
        })
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let (bus, _) = broadcast::channel(8);
        let mut handle = WorkerHandle::spawn("pool", 0, 1, 4, bus, &idle_unit());
        assert_eq!(handle.name(), "pool-0");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handle.state(), WorkerState::Active);

        handle.terminate(Duration::from_secs(1)).await;
        assert_eq!(handle.state(), WorkerState::Terminated);

        // Second terminate is a no-op
        handle.terminate(Duration::from_secs(1)).await;
        assert_eq!(handle.state(), WorkerState::Terminated);
    }

    #[tokio::test]
    async fn test_stubborn_unit_is_aborted() {
        let (bus, _) = broadcast::channel(8);
        let unit: UnitFn = Arc::new(|_ctx: WorkerContext| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
        });
        let mut handle = WorkerHandle::spawn("pool", 3, 1, 4, bus, &unit);

        handle.terminate(Duration::from_millis(20)).await;
        assert_eq!(handle.state(), WorkerState::Terminated);
    }
}
