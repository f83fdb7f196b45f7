//! Per-item timeout enforcement
//!
//! The callback runs in its own task and is raced against a timer. Whichever
//! side loses is dropped: a timed-out callback task is aborted, so one item
//! never has more than one live invocation. Error hooks live outside the task
//! and still observe the timeout.

use std::time::Duration;

use tokio::task::{JoinError, JoinHandle};
use uuid::Uuid;

use crate::queue::ProcessError;

/// Outcome of one raced invocation
pub type Outcome = Result<serde_json::Value, ProcessError>;

/// Await a spawned callback, bounded by `timeout_ms` when non-zero
pub async fn race(
    uuid: Uuid,
    timeout_ms: u64,
    handle: JoinHandle<Outcome>,
) -> Outcome {
    if timeout_ms == 0 {
        return handle.await.unwrap_or_else(|e| Err(from_join_error(e)));
    }

    let mut handle = handle;
    tokio::select! {
        joined = &mut handle => joined.unwrap_or_else(|e| Err(from_join_error(e))),
        _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
            handle.abort();
            Err(ProcessError::Timeout { uuid, timeout_ms })
        }
    }
}

fn from_join_error(e: JoinError) -> ProcessError {
    if e.is_panic() {
        let panic = e.into_panic();
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "callback panicked".to_string());
        ProcessError::Panicked(message)
    } else {
        ProcessError::Failed("callback task was cancelled".to_string())
    }
}
