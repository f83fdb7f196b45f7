//! In-memory implementation of QueueStorage for testing

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::stats::{retention_horizon, StatsInterval};
use super::store::*;

/// Archived item
#[derive(Debug, Clone)]
struct DoneRecord {
    uuid: Uuid,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct Tables {
    next_id: i64,
    next_fail_id: i64,
    /// Keyed by id so iteration follows claim order
    pending: BTreeMap<i64, QueueItem>,
    fail: HashMap<Uuid, FailQueueItem>,
    done: Vec<DoneRecord>,
    stats: HashMap<StatsInterval, BTreeMap<DateTime<Utc>, QueueStorageStats>>,
}

impl Tables {
    /// Same recomputation the PostgreSQL triggers run after every insert
    fn refresh_stats(&mut self, now: DateTime<Utc>) {
        let horizon = retention_horizon(now);
        for interval in StatsInterval::ALL {
            let bucket = interval.bucket_start(now);
            let done = self.done.iter().filter(|d| d.created_at >= bucket).count() as i64;
            let failed: Vec<&FailQueueItem> = self
                .fail
                .values()
                .filter(|f| f.created_at >= bucket)
                .collect();
            let row = QueueStorageStats {
                queued: self.pending.len() as i64,
                done,
                fail: failed.len() as i64,
                retry: failed.iter().map(|f| f.error_attempts as i64).sum(),
                created_at: bucket,
                updated_at: now,
            };

            let rows = self.stats.entry(interval).or_default();
            rows.insert(bucket, row);
            rows.retain(|created_at, _| *created_at >= horizon);
        }
    }
}

/// In-memory implementation of QueueStorage
///
/// Provides the same semantics as the PostgreSQL implementation; a single
/// mutex stands in for row locks, so claimers never observe each other's
/// rows.
///
/// # Example
///
/// ```
/// use durable_queue::InMemoryQueueStorage;
///
/// let storage = InMemoryQueueStorage::new("emails");
/// ```
pub struct InMemoryQueueStorage {
    name: String,
    initialized: AtomicBool,
    tables: Mutex<Tables>,
}

impl InMemoryQueueStorage {
    /// Create a new in-memory store
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            initialized: AtomicBool::new(false),
            tables: Mutex::new(Tables::default()),
        }
    }

    /// Number of rows in the pending table, claimed or not
    pub fn pending_count(&self) -> usize {
        self.tables.lock().pending.len()
    }

    /// Number of failure records
    pub fn fail_count(&self) -> usize {
        self.tables.lock().fail.len()
    }

    /// Number of archived items
    pub fn done_count(&self) -> usize {
        self.tables.lock().done.len()
    }

    /// Failure record of one item
    pub fn fail_record(&self, uuid: Uuid) -> Option<FailQueueItem> {
        self.tables.lock().fail.get(&uuid).cloned()
    }

    fn guard_initialized(&self) -> Result<(), StoreError> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::NotInitialized)
        }
    }
}

#[async_trait]
impl QueueStorage for InMemoryQueueStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    async fn initialize(&self) -> Result<(), StoreError> {
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    async fn push(&self, messages: Vec<QueueMessage>) -> Result<Vec<Uuid>, StoreError> {
        self.guard_initialized()?;
        if messages.is_empty() {
            return Ok(vec![]);
        }

        let now = Utc::now();
        let mut tables = self.tables.lock();
        let mut uuids = Vec::with_capacity(messages.len());

        for message in messages {
            tables.next_id += 1;
            let id = tables.next_id;
            let uuid = Uuid::now_v7();
            tables.pending.insert(
                id,
                QueueItem {
                    id,
                    uuid,
                    item_type: message.item_type,
                    payload: message.payload,
                    result: serde_json::Value::Null,
                    pending: false,
                    timeout_ms: message.timeout_ms,
                    created_at: now,
                    updated_at: now,
                },
            );
            uuids.push(uuid);
        }

        tables.refresh_stats(now);
        Ok(uuids)
    }

    async fn select(&self, limit: usize) -> Result<Vec<QueueItem>, StoreError> {
        self.guard_initialized()?;

        let now = Utc::now();
        let mut tables = self.tables.lock();
        let claimed = tables
            .pending
            .values_mut()
            .filter(|item| !item.pending)
            .take(limit)
            .map(|item| {
                item.pending = true;
                item.updated_at = now;
                item.clone()
            })
            .collect();

        Ok(claimed)
    }

    async fn commit(&self, items: &[QueueItem]) -> Result<(), StoreError> {
        self.guard_initialized()?;
        if items.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let mut tables = self.tables.lock();
        for item in items {
            tables.done.push(DoneRecord {
                uuid: item.uuid,
                created_at: now,
            });
            tables.pending.remove(&item.id);
            tables.fail.remove(&item.uuid);
        }

        tables.refresh_stats(now);
        Ok(())
    }

    async fn fail(
        &self,
        item: &QueueItem,
        error_data: &str,
    ) -> Result<FailQueueItem, StoreError> {
        self.guard_initialized()?;

        let now = Utc::now();
        let mut tables = self.tables.lock();
        tables.next_fail_id += 1;
        let next_id = tables.next_fail_id;

        let record = tables
            .fail
            .entry(item.uuid)
            .and_modify(|f| {
                f.error_attempts += 1;
                f.error_data = error_data.to_string();
                f.updated_at = now;
            })
            .or_insert_with(|| FailQueueItem {
                id: next_id,
                uuid: item.uuid,
                item_type: item.item_type.clone(),
                payload: item.payload.clone(),
                error_data: error_data.to_string(),
                error_attempts: 1,
                created_at: now,
                updated_at: now,
            })
            .clone();

        tables.refresh_stats(now);
        Ok(record)
    }

    async fn retry(&self, max_attempts: u32, batch_size: usize) -> Result<usize, StoreError> {
        self.guard_initialized()?;

        let now = Utc::now();
        let mut tables = self.tables.lock();

        let mut candidates: Vec<(i64, Uuid)> = tables
            .fail
            .values()
            .filter(|f| f.error_attempts < max_attempts)
            .map(|f| (f.id, f.uuid))
            .collect();
        candidates.sort_by_key(|(id, _)| *id);

        let mut released = 0;
        for (_, uuid) in candidates {
            if released == batch_size {
                break;
            }
            let failed_at = match tables.fail.get(&uuid) {
                Some(f) => f.updated_at,
                None => continue,
            };
            let item = tables
                .pending
                .values_mut()
                .find(|item| item.uuid == uuid && item.pending && failed_at >= item.updated_at);
            if let Some(item) = item {
                item.pending = false;
                item.updated_at = now;
                released += 1;
            }
        }

        Ok(released)
    }

    async fn stats(
        &self,
        interval: StatsInterval,
        period: StatsInterval,
    ) -> Result<Vec<QueueStorageStats>, StoreError> {
        self.guard_initialized()?;

        let since = period.bucket_start(Utc::now());
        let tables = self.tables.lock();
        Ok(tables
            .stats
            .get(&interval)
            .map(|rows| rows.range(since..).map(|(_, row)| row.clone()).collect())
            .unwrap_or_default())
    }

    async fn now_stats(&self) -> Result<QueueStorageStats, StoreError> {
        self.guard_initialized()?;

        let now = Utc::now();
        let since = now - Duration::minutes(1);
        let tables = self.tables.lock();
        let recent: Vec<&FailQueueItem> =
            tables.fail.values().filter(|f| f.created_at > since).collect();

        Ok(QueueStorageStats {
            queued: tables.pending.values().filter(|i| i.pending).count() as i64,
            done: tables.done.iter().filter(|d| d.created_at > since).count() as i64,
            fail: recent.len() as i64,
            retry: recent.iter().map(|f| f.error_attempts as i64).sum(),
            created_at: now,
            updated_at: now,
        })
    }

    async fn status_of(&self, uuid: Uuid) -> Result<Option<ItemStatus>, StoreError> {
        self.guard_initialized()?;

        let tables = self.tables.lock();
        let attempts = tables.fail.get(&uuid).map(|f| f.error_attempts);
        let pending = tables
            .pending
            .values()
            .find(|item| item.uuid == uuid)
            .map(|item| item.pending);
        let done = tables.done.iter().any(|d| d.uuid == uuid);

        Ok(super::postgres::resolve_status(attempts, pending, done))
    }

    async fn dead_letters(
        &self,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<FailQueueItem>, StoreError> {
        self.guard_initialized()?;

        let tables = self.tables.lock();
        let mut dead: Vec<FailQueueItem> = tables
            .fail
            .values()
            .filter(|f| f.error_attempts >= max_attempts)
            .filter(|f| tables.pending.values().any(|item| item.uuid == f.uuid))
            .cloned()
            .collect();
        dead.sort_by_key(|f| f.id);
        dead.truncate(limit);
        Ok(dead)
    }

    async fn requeue_dead_letter(
        &self,
        uuid: Uuid,
        max_attempts: u32,
    ) -> Result<bool, StoreError> {
        self.guard_initialized()?;

        let now = Utc::now();
        let mut tables = self.tables.lock();
        match tables.fail.get(&uuid) {
            Some(record) if record.error_attempts >= max_attempts => {}
            _ => return Ok(false),
        }
        let Some(item) = tables.pending.values_mut().find(|item| item.uuid == uuid) else {
            return Ok(false);
        };

        item.pending = false;
        item.updated_at = now;
        tables.fail.remove(&uuid);
        Ok(true)
    }

    async fn remove(&self, uuids: &[Uuid]) -> Result<usize, StoreError> {
        self.guard_initialized()?;

        let mut tables = self.tables.lock();
        let before = tables.pending.len();
        tables.pending.retain(|_, item| !uuids.contains(&item.uuid));
        for uuid in uuids {
            tables.fail.remove(uuid);
        }
        Ok(before - tables.pending.len())
    }

    async fn drop_tables(&self) -> Result<(), StoreError> {
        *self.tables.lock() = Tables::default();
        self.initialized.store(false, Ordering::Release);
        Ok(())
    }
}
