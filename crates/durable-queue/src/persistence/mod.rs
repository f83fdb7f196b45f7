//! Persistence layer for the job queue
//!
//! This module provides:
//! - [`QueueStorage`] trait for claim-and-commit persistence
//! - [`PostgresQueueStorage`] for production
//! - [`InMemoryQueueStorage`] for testing
//! - [`StatsInterval`] ladder of statistics buckets

mod memory;
mod postgres;
mod stats;
mod store;

pub use memory::InMemoryQueueStorage;
pub use postgres::PostgresQueueStorage;
pub use stats::{StatsInterval, RETENTION_MONTHS};
pub use store::{
    validate_queue_name, FailQueueItem, ItemStatus, QueueItem, QueueMessage, QueueStorage,
    QueueStorageStats, StoreError,
};
