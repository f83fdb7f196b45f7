//! Queue controller errors

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::persistence::StoreError;

/// Why one callback invocation failed
///
/// Serialized into the fail record's `error_data`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ProcessError {
    /// Callback did not settle within the item's timeout
    #[error("item {uuid} timed out after {timeout_ms}ms")]
    Timeout { uuid: Uuid, timeout_ms: u64 },

    /// Callback returned an error
    #[error("processing failed: {0}")]
    Failed(String),

    /// Callback task panicked
    #[error("callback panicked: {0}")]
    Panicked(String),

    /// Callback succeeded but its result could not be committed
    #[error("commit failed: {0}")]
    Commit(String),
}

/// Coarse classification used for retry accounting and hooks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Processing,
}

impl ProcessError {
    /// Build a processing failure from any displayable error
    pub fn failed(message: impl std::fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Failed(_) | Self::Panicked(_) | Self::Commit(_) => ErrorKind::Processing,
        }
    }

    /// Value stored as `error_data` of the fail record
    pub fn to_error_data(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.to_string())
    }
}

/// Queue controller errors
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// A callback is already registered on this controller
    #[error("queue is already listening")]
    AlreadyListening,

    /// The controller was closed; it cannot listen again
    #[error("queue is closed")]
    Closed,

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind() {
        let timeout = ProcessError::Timeout {
            uuid: Uuid::now_v7(),
            timeout_ms: 100,
        };
        assert_eq!(timeout.kind(), ErrorKind::Timeout);
        assert_eq!(ProcessError::failed("boom").kind(), ErrorKind::Processing);
        assert_eq!(
            ProcessError::Panicked("boom".into()).kind(),
            ErrorKind::Processing
        );
    }

    #[test]
    fn test_error_data_is_tagged_json() {
        let err = ProcessError::failed("smtp unreachable");
        let data = err.to_error_data();

        let json: serde_json::Value = serde_json::from_str(&data).unwrap();
        assert_eq!(json["kind"], "failed");
        assert_eq!(json["detail"], "smtp unreachable");

        let parsed: ProcessError = serde_json::from_str(&data).unwrap();
        assert_eq!(parsed, err);
    }
}
