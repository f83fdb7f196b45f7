//! QueueStorage trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::stats::StatsInterval;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An operation was invoked before `initialize()` completed
    #[error("queue storage is not initialized")]
    NotInitialized,

    /// Queue name cannot be used as a table prefix
    #[error("invalid queue name: {0:?}")]
    InvalidName(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// A message as submitted by a producer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Routing key used to pick the callback branch
    #[serde(rename = "type")]
    pub item_type: String,

    /// Opaque payload
    pub payload: serde_json::Value,

    /// Per-item processing timeout, 0 disables it
    #[serde(default)]
    pub timeout_ms: u64,
}

impl QueueMessage {
    /// Create a message without a timeout
    pub fn new(item_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            item_type: item_type.into(),
            payload,
            timeout_ms: 0,
        }
    }

    /// Set the processing timeout in milliseconds
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// A unit of work held by the pending table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Store-assigned sequence, claim order follows it
    pub id: i64,
    pub uuid: Uuid,
    #[serde(rename = "type")]
    pub item_type: String,
    pub payload: serde_json::Value,
    /// Set once the callback succeeded
    pub result: serde_json::Value,
    /// Claim flag
    pub pending: bool,
    pub timeout_ms: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueItem {
    /// Attach the callback result ahead of `commit`
    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = result;
        self
    }
}

/// Failure record, one per failed uuid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailQueueItem {
    pub id: i64,
    pub uuid: Uuid,
    #[serde(rename = "type")]
    pub item_type: String,
    pub payload: serde_json::Value,
    /// Detail of the most recent failure
    pub error_data: String,
    /// Only ever increases
    pub error_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Aggregated counts for one statistics bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStorageStats {
    pub queued: i64,
    pub done: i64,
    pub fail: i64,
    /// Sum of attempts of failures in the window
    pub retry: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Where a previously enqueued item currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemStatus {
    /// Waiting to be claimed
    Queued,
    /// Claimed by a consumer, not settled yet
    Claimed,
    /// Has a failure record
    Failed { attempts: u32 },
    /// Archived after successful processing
    Done,
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Claimed => write!(f, "claimed"),
            Self::Failed { attempts } => write!(f, "failed ({} attempts)", attempts),
            Self::Done => write!(f, "done"),
        }
    }
}

/// Durable storage for one named queue
///
/// Implementations must be safe for arbitrary concurrent callers without an
/// in-process lock shared between consumers: claiming relies on the backing
/// store's lock-and-skip primitive.
#[async_trait]
pub trait QueueStorage: Send + Sync + 'static {
    /// Queue name used as table prefix
    fn name(&self) -> &str;

    /// Whether `initialize()` has completed in this process
    fn is_initialized(&self) -> bool;

    /// Create backing structures on first call; later calls are no-ops
    async fn initialize(&self) -> Result<(), StoreError>;

    // =========================================================================
    // Item lifecycle
    // =========================================================================

    /// Insert messages as unclaimed items, returning their uuids in order
    async fn push(&self, messages: Vec<QueueMessage>) -> Result<Vec<Uuid>, StoreError>;

    /// Claim up to `limit` of the oldest unclaimed items
    ///
    /// Rows locked by a concurrent claimer are skipped, never waited on.
    async fn select(&self, limit: usize) -> Result<Vec<QueueItem>, StoreError>;

    /// Archive items with their results, dropping pending and fail rows
    ///
    /// All-or-nothing for the whole batch.
    async fn commit(&self, items: &[QueueItem]) -> Result<(), StoreError>;

    /// Record a failure, returning the updated record
    async fn fail(&self, item: &QueueItem, error_data: &str)
        -> Result<FailQueueItem, StoreError>;

    /// Release up to `batch_size` failed items with attempts left
    ///
    /// Returns how many items became claimable again.
    async fn retry(&self, max_attempts: u32, batch_size: usize) -> Result<usize, StoreError>;

    // =========================================================================
    // Queries
    // =========================================================================

    /// Buckets of one ladder rung inside the current `period`
    async fn stats(
        &self,
        interval: StatsInterval,
        period: StatsInterval,
    ) -> Result<Vec<QueueStorageStats>, StoreError>;

    /// Snapshot of the last minute
    async fn now_stats(&self) -> Result<QueueStorageStats, StoreError>;

    /// Status of an item by uuid, `None` if the uuid is unknown
    async fn status_of(&self, uuid: Uuid) -> Result<Option<ItemStatus>, StoreError>;

    // =========================================================================
    // Dead letters
    // =========================================================================

    /// Failure records whose attempts reached `max_attempts`, oldest first
    async fn dead_letters(
        &self,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<FailQueueItem>, StoreError>;

    /// Reset the attempt budget of a dead-lettered item and make it
    /// claimable again
    ///
    /// Refused (`false`) while the item still has attempts left, since it
    /// may be claimed and in flight.
    async fn requeue_dead_letter(&self, uuid: Uuid, max_attempts: u32)
        -> Result<bool, StoreError>;

    /// Delete items and their failure records
    async fn remove(&self, uuids: &[Uuid]) -> Result<usize, StoreError>;

    /// Drop every structure created by `initialize()`
    async fn drop_tables(&self) -> Result<(), StoreError>;
}

/// Check that a queue name is usable as an SQL identifier prefix
pub fn validate_queue_name(name: &str) -> Result<(), StoreError> {
    let mut chars = name.chars();
    let valid_head = chars
        .next()
        .map(|c| c.is_ascii_lowercase() || c == '_')
        .unwrap_or(false);
    let valid_tail = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if valid_head && valid_tail && name.len() <= 40 {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_queue_name() {
        assert!(validate_queue_name("jobs").is_ok());
        assert!(validate_queue_name("_mail_2").is_ok());
        assert!(validate_queue_name("").is_err());
        assert!(validate_queue_name("2jobs").is_err());
        assert!(validate_queue_name("Jobs").is_err());
        assert!(validate_queue_name("jobs; drop table x").is_err());
        assert!(validate_queue_name(&"a".repeat(41)).is_err());
    }

    #[test]
    fn test_message_serialization_uses_type_key() {
        let msg = QueueMessage::new("email", serde_json::json!({"to": "a@b.c"})).with_timeout_ms(100);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "email");
        assert_eq!(json["timeout_ms"], 100);

        let parsed: QueueMessage =
            serde_json::from_value(serde_json::json!({"type": "email", "payload": 1})).unwrap();
        assert_eq!(parsed.timeout_ms, 0);
    }

    #[test]
    fn test_item_status_display() {
        assert_eq!(ItemStatus::Queued.to_string(), "queued");
        assert_eq!(ItemStatus::Failed { attempts: 3 }.to_string(), "failed (3 attempts)");
    }
}
