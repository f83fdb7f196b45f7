//! PostgreSQL implementation of QueueStorage
//!
//! Production persistence with:
//! - Concurrent claiming with `FOR UPDATE SKIP LOCKED`
//! - Transactional archival of settled items
//! - Trigger-maintained statistics buckets

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Executor, PgPool, Row};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::stats::{StatsInterval, RETENTION_MONTHS};
use super::store::*;

const FAIL_COLUMNS: &str =
    "id, uuid, type, payload, error_data, error_attempts, created_at, updated_at";

/// PostgreSQL implementation of QueueStorage
///
/// One instance serves one queue name. Any number of instances, in this
/// process or others, may share the same tables.
///
/// # Example
///
/// ```ignore
/// use durable_queue::PostgresQueueStorage;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let storage = PostgresQueueStorage::new("emails", pool)?;
/// storage.initialize().await?;
/// ```
pub struct PostgresQueueStorage {
    name: String,
    pool: PgPool,
    initialized: AtomicBool,
    init_lock: Mutex<()>,
}

impl PostgresQueueStorage {
    /// Create a store for `name` over an existing pool
    pub fn new(name: impl Into<String>, pool: PgPool) -> Result<Self, StoreError> {
        let name = name.into();
        validate_queue_name(&name)?;
        Ok(Self {
            name,
            pool,
            initialized: AtomicBool::new(false),
            init_lock: Mutex::new(()),
        })
    }

    /// Connect a new pool and create a store over it
    pub async fn connect(
        name: impl Into<String>,
        database_url: &str,
        max_connections: u32,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| {
                error!("Failed to connect to database: {}", e);
                StoreError::Database(e.to_string())
            })?;
        Self::new(name, pool)
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn pending_table(&self) -> String {
        format!("{}_q", self.name)
    }

    fn fail_table(&self) -> String {
        format!("{}_f", self.name)
    }

    fn done_table(&self) -> String {
        format!("{}_d", self.name)
    }

    fn state_table(&self) -> String {
        format!("{}_state", self.name)
    }

    fn stats_table(&self, interval: StatsInterval) -> String {
        format!("{}_s_{}", self.name, interval.table_suffix())
    }

    fn guard_initialized(&self) -> Result<(), StoreError> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::NotInitialized)
        }
    }

    /// Pending, fail, done and state tables
    fn core_ddl(&self) -> String {
        let q = self.pending_table();
        let f = self.fail_table();
        let d = self.done_table();
        let state = self.state_table();

        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {state} (
                id INT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                is_paused BOOLEAN NOT NULL DEFAULT false,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            CREATE TABLE IF NOT EXISTS {q} (
                id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                uuid UUID NOT NULL,
                type VARCHAR(255) NOT NULL,
                payload JSONB NOT NULL,
                pending BOOLEAN NOT NULL DEFAULT false,
                timeout_ms BIGINT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {f} (
                id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                uuid UUID NOT NULL,
                type VARCHAR(255) NOT NULL,
                payload JSONB NOT NULL,
                error_data TEXT NOT NULL DEFAULT '',
                error_attempts INTEGER NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {d} (
                id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                uuid UUID NOT NULL,
                type VARCHAR(255) NOT NULL,
                payload JSONB NOT NULL,
                result JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS {q}_uuid_idx ON {q} (uuid);
            CREATE INDEX IF NOT EXISTS {q}_claim_idx ON {q} (id) WHERE pending = false;
            CREATE UNIQUE INDEX IF NOT EXISTS {f}_uuid_idx ON {f} (uuid);
            CREATE INDEX IF NOT EXISTS {d}_uuid_idx ON {d} (uuid);

            INSERT INTO {state} (is_paused)
            SELECT false
            WHERE NOT EXISTS (SELECT 1 FROM {state});
            "#
        )
    }

    /// One bucket table, its maintenance function and the insert triggers
    fn stats_ddl(&self, interval: StatsInterval) -> String {
        let q = self.pending_table();
        let f = self.fail_table();
        let d = self.done_table();
        let s = self.stats_table(interval);
        let iv = interval.as_pg_interval();
        let trigger = format!("s_{}_t", interval.table_suffix());

        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {s} (
                id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                done BIGINT NOT NULL DEFAULT 0,
                fail BIGINT NOT NULL DEFAULT 0,
                queued BIGINT NOT NULL DEFAULT 0,
                retry BIGINT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS {s}_created_at_idx ON {s} (created_at);

            CREATE OR REPLACE FUNCTION {s}_update() RETURNS TRIGGER AS $$
            DECLARE
                bucket TIMESTAMPTZ := date_bin('{iv}', NOW(), TIMESTAMPTZ '2001-01-01 00:00:00+00');
            BEGIN
                INSERT INTO {s} AS s (done, fail, queued, retry, created_at, updated_at)
                VALUES (
                    (SELECT COUNT(*) FROM {d} WHERE created_at >= bucket),
                    (SELECT COUNT(*) FROM {f} WHERE created_at >= bucket),
                    (SELECT COUNT(*) FROM {q}),
                    (SELECT COALESCE(SUM(error_attempts), 0) FROM {f} WHERE created_at >= bucket),
                    bucket,
                    NOW()
                )
                ON CONFLICT (created_at) DO UPDATE SET
                    done = EXCLUDED.done,
                    fail = EXCLUDED.fail,
                    queued = EXCLUDED.queued,
                    retry = EXCLUDED.retry,
                    updated_at = EXCLUDED.updated_at;
                DELETE FROM {s} WHERE created_at < NOW() - INTERVAL '{RETENTION_MONTHS} months';
                RETURN NULL;
            END;
            $$ LANGUAGE plpgsql;

            CREATE OR REPLACE TRIGGER {trigger} AFTER INSERT ON {q}
                FOR EACH STATEMENT EXECUTE FUNCTION {s}_update();
            CREATE OR REPLACE TRIGGER {trigger} AFTER INSERT ON {f}
                FOR EACH STATEMENT EXECUTE FUNCTION {s}_update();
            CREATE OR REPLACE TRIGGER {trigger} AFTER INSERT ON {d}
                FOR EACH STATEMENT EXECUTE FUNCTION {s}_update();
            "#
        )
    }

    /// Create everything under a transaction-scoped advisory lock so that
    /// concurrent processes do not race on the catalog
    async fn create_tables(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&self.name)
            .execute(&mut *tx)
            .await?;
        (&mut *tx).execute(sqlx::raw_sql(&self.core_ddl())).await?;
        tx.commit().await?;

        // Bucket statistics are best-effort
        if let Err(e) = self.create_stats_tables().await {
            warn!(queue = %self.name, "Failed to create statistics tables: {}", e);
        }

        Ok(())
    }

    async fn create_stats_tables(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&self.name)
            .execute(&mut *tx)
            .await?;
        for interval in StatsInterval::ALL {
            (&mut *tx)
                .execute(sqlx::raw_sql(&self.stats_ddl(interval)))
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl QueueStorage for PostgresQueueStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    #[instrument(skip(self), fields(queue = %self.name))]
    async fn initialize(&self) -> Result<(), StoreError> {
        if self.is_initialized() {
            return Ok(());
        }

        let _guard = self.init_lock.lock().await;
        if self.is_initialized() {
            return Ok(());
        }

        self.create_tables().await.map_err(|e| {
            error!("Failed to initialize queue storage: {}", e);
            e
        })?;
        self.initialized.store(true, Ordering::Release);

        info!(queue = %self.name, "initialized queue storage");
        Ok(())
    }

    #[instrument(skip(self, messages), fields(queue = %self.name, count = messages.len()))]
    async fn push(&self, messages: Vec<QueueMessage>) -> Result<Vec<Uuid>, StoreError> {
        self.guard_initialized()?;
        if messages.is_empty() {
            return Ok(vec![]);
        }

        let uuids: Vec<Uuid> = messages.iter().map(|_| Uuid::now_v7()).collect();
        let types: Vec<String> = messages.iter().map(|m| m.item_type.clone()).collect();
        let timeouts: Vec<i64> = messages.iter().map(|m| m.timeout_ms as i64).collect();
        let payloads: Vec<serde_json::Value> = messages.into_iter().map(|m| m.payload).collect();

        sqlx::query(&format!(
            r#"
            INSERT INTO {} (uuid, type, payload, pending, timeout_ms, created_at, updated_at)
            SELECT u, t, p, false, tm, $5, $5
            FROM UNNEST($1::uuid[], $2::text[], $3::jsonb[], $4::bigint[])
                WITH ORDINALITY AS x(u, t, p, tm, ord)
            ORDER BY ord
            "#,
            self.pending_table()
        ))
        .bind(&uuids)
        .bind(&types)
        .bind(&payloads)
        .bind(&timeouts)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to push items: {}", e);
            StoreError::Database(e.to_string())
        })?;

        debug!(count = uuids.len(), "pushed items");
        Ok(uuids)
    }

    #[instrument(skip(self), fields(queue = %self.name))]
    async fn select(&self, limit: usize) -> Result<Vec<QueueItem>, StoreError> {
        self.guard_initialized()?;
        if limit == 0 {
            return Ok(vec![]);
        }

        // Rows another transaction is claiming are skipped, not waited on
        let q = self.pending_table();
        let rows = sqlx::query(&format!(
            r#"
            WITH claimable AS (
                SELECT id
                FROM {q}
                WHERE pending = false
                ORDER BY id ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE {q} t
            SET pending = true,
                updated_at = NOW()
            FROM claimable c
            WHERE t.id = c.id
            RETURNING t.id, t.uuid, t.type, t.payload, t.pending, t.timeout_ms,
                      t.created_at, t.updated_at
            "#
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to claim items: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let mut items = rows
            .iter()
            .map(item_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        items.sort_by_key(|item| item.id);

        if !items.is_empty() {
            debug!(count = items.len(), "claimed items");
        }
        Ok(items)
    }

    #[instrument(skip(self, items), fields(queue = %self.name, count = items.len()))]
    async fn commit(&self, items: &[QueueItem]) -> Result<(), StoreError> {
        self.guard_initialized()?;
        if items.is_empty() {
            return Ok(());
        }

        let ids: Vec<i64> = items.iter().map(|i| i.id).collect();
        let uuids: Vec<Uuid> = items.iter().map(|i| i.uuid).collect();
        let types: Vec<String> = items.iter().map(|i| i.item_type.clone()).collect();
        let payloads: Vec<serde_json::Value> = items.iter().map(|i| i.payload.clone()).collect();
        let results: Vec<serde_json::Value> = items.iter().map(|i| i.result.clone()).collect();

        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            r#"
            INSERT INTO {} (uuid, type, payload, result, created_at)
            SELECT u, t, p, r, $5
            FROM UNNEST($1::uuid[], $2::text[], $3::jsonb[], $4::jsonb[]) AS x(u, t, p, r)
            "#,
            self.done_table()
        ))
        .bind(&uuids)
        .bind(&types)
        .bind(&payloads)
        .bind(&results)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!("DELETE FROM {} WHERE id = ANY($1)", self.pending_table()))
            .bind(&ids)
            .execute(&mut *tx)
            .await?;

        sqlx::query(&format!("DELETE FROM {} WHERE uuid = ANY($1)", self.fail_table()))
            .bind(&uuids)
            .execute(&mut *tx)
            .await?;

        tx.commit().await.map_err(|e| {
            error!("Failed to commit items: {}", e);
            StoreError::Database(e.to_string())
        })?;

        debug!(count = items.len(), "committed items");
        Ok(())
    }

    #[instrument(skip(self, item, error_data), fields(queue = %self.name, uuid = %item.uuid))]
    async fn fail(
        &self,
        item: &QueueItem,
        error_data: &str,
    ) -> Result<FailQueueItem, StoreError> {
        self.guard_initialized()?;

        let f = self.fail_table();
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO {f} AS f (uuid, type, payload, error_data, error_attempts, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 1, NOW(), NOW())
            ON CONFLICT (uuid) DO UPDATE SET
                error_attempts = f.error_attempts + 1,
                error_data = EXCLUDED.error_data,
                updated_at = NOW()
            RETURNING {FAIL_COLUMNS}
            "#
        ))
        .bind(item.uuid)
        .bind(&item.item_type)
        .bind(&item.payload)
        .bind(error_data)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to record failure: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let failed = fail_item_from_row(&row)?;
        debug!(attempts = failed.error_attempts, "recorded failure");
        Ok(failed)
    }

    #[instrument(skip(self), fields(queue = %self.name))]
    async fn retry(&self, max_attempts: u32, batch_size: usize) -> Result<usize, StoreError> {
        self.guard_initialized()?;

        // Only items that failed after their latest claim are released, so an
        // item being reprocessed right now is never handed out twice
        let q = self.pending_table();
        let f = self.fail_table();
        let rows = sqlx::query(&format!(
            r#"
            WITH retryable AS (
                SELECT q.id
                FROM {q} q
                JOIN {f} f ON f.uuid = q.uuid
                WHERE q.pending = true
                  AND f.error_attempts < $1
                  AND f.updated_at >= q.updated_at
                ORDER BY f.id ASC
                LIMIT $2
                FOR UPDATE OF q SKIP LOCKED
            )
            UPDATE {q} t
            SET pending = false,
                updated_at = NOW()
            FROM retryable r
            WHERE t.id = r.id
            RETURNING t.id
            "#
        ))
        .bind(max_attempts as i32)
        .bind(batch_size as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to retry items: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if !rows.is_empty() {
            debug!(count = rows.len(), "released failed items for retry");
        }
        Ok(rows.len())
    }

    #[instrument(skip(self), fields(queue = %self.name))]
    async fn stats(
        &self,
        interval: StatsInterval,
        period: StatsInterval,
    ) -> Result<Vec<QueueStorageStats>, StoreError> {
        self.guard_initialized()?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT queued, done, fail, retry, created_at, updated_at
            FROM {}
            WHERE created_at >= date_bin($1::interval, NOW(), TIMESTAMPTZ '2001-01-01 00:00:00+00')
            ORDER BY created_at ASC
            "#,
            self.stats_table(interval)
        ))
        .bind(period.as_pg_interval())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to load stats: {}", e);
            StoreError::Database(e.to_string())
        })?;

        rows.iter().map(stats_from_row).collect()
    }

    #[instrument(skip(self), fields(queue = %self.name))]
    async fn now_stats(&self) -> Result<QueueStorageStats, StoreError> {
        self.guard_initialized()?;

        let q = self.pending_table();
        let f = self.fail_table();
        let d = self.done_table();
        let row = sqlx::query(&format!(
            r#"
            SELECT
                (SELECT COUNT(*) FROM {d} WHERE created_at > NOW() - INTERVAL '1 minute') AS done,
                (SELECT COUNT(*) FROM {f} WHERE created_at > NOW() - INTERVAL '1 minute') AS fail,
                (SELECT COUNT(*) FROM {q} WHERE pending = true) AS queued,
                (SELECT COALESCE(SUM(error_attempts), 0) FROM {f}
                    WHERE created_at > NOW() - INTERVAL '1 minute')::BIGINT AS retry,
                NOW() AS created_at,
                NOW() AS updated_at
            "#
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to load current stats: {}", e);
            StoreError::Database(e.to_string())
        })?;

        stats_from_row(&row)
    }

    #[instrument(skip(self), fields(queue = %self.name))]
    async fn status_of(&self, uuid: Uuid) -> Result<Option<ItemStatus>, StoreError> {
        self.guard_initialized()?;

        let row = sqlx::query(&format!(
            r#"
            SELECT
                (SELECT error_attempts FROM {f} WHERE uuid = $1) AS attempts,
                (SELECT pending FROM {q} WHERE uuid = $1) AS pending,
                EXISTS (SELECT 1 FROM {d} WHERE uuid = $1) AS done
            "#,
            f = self.fail_table(),
            q = self.pending_table(),
            d = self.done_table(),
        ))
        .bind(uuid)
        .fetch_one(&self.pool)
        .await?;

        let attempts: Option<i32> = row.try_get("attempts")?;
        let pending: Option<bool> = row.try_get("pending")?;
        let done: bool = row.try_get("done")?;

        Ok(resolve_status(attempts.map(|a| a as u32), pending, done))
    }

    #[instrument(skip(self), fields(queue = %self.name))]
    async fn dead_letters(
        &self,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<FailQueueItem>, StoreError> {
        self.guard_initialized()?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT f.id, f.uuid, f.type, f.payload, f.error_data, f.error_attempts,
                   f.created_at, f.updated_at
            FROM {f} f
            JOIN {q} q ON q.uuid = f.uuid
            WHERE f.error_attempts >= $1
            ORDER BY f.id ASC
            LIMIT $2
            "#,
            f = self.fail_table(),
            q = self.pending_table(),
        ))
        .bind(max_attempts as i32)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list dead letters: {}", e);
            StoreError::Database(e.to_string())
        })?;

        rows.iter().map(fail_item_from_row).collect()
    }

    #[instrument(skip(self), fields(queue = %self.name))]
    async fn requeue_dead_letter(
        &self,
        uuid: Uuid,
        max_attempts: u32,
    ) -> Result<bool, StoreError> {
        self.guard_initialized()?;

        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query(&format!(
            "DELETE FROM {} WHERE uuid = $1 AND error_attempts >= $2",
            self.fail_table()
        ))
        .bind(uuid)
        .bind(max_attempts as i32)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let released = sqlx::query(&format!(
            "UPDATE {} SET pending = false, updated_at = NOW() WHERE uuid = $1",
            self.pending_table()
        ))
        .bind(uuid)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if deleted == 0 || released == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        tx.commit().await?;
        info!(%uuid, "requeued dead letter");
        Ok(true)
    }

    #[instrument(skip(self, uuids), fields(queue = %self.name, count = uuids.len()))]
    async fn remove(&self, uuids: &[Uuid]) -> Result<usize, StoreError> {
        self.guard_initialized()?;
        if uuids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query(&format!("DELETE FROM {} WHERE uuid = ANY($1)", self.pending_table()))
            .bind(uuids)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        sqlx::query(&format!("DELETE FROM {} WHERE uuid = ANY($1)", self.fail_table()))
            .bind(uuids)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(removed, "removed items");
        Ok(removed as usize)
    }

    #[instrument(skip(self), fields(queue = %self.name))]
    async fn drop_tables(&self) -> Result<(), StoreError> {
        let _guard = self.init_lock.lock().await;

        // CASCADE takes the statistics triggers with the tables
        let mut ddl = format!(
            "DROP TABLE IF EXISTS {}, {}, {}, {} CASCADE;\n",
            self.pending_table(),
            self.fail_table(),
            self.done_table(),
            self.state_table()
        );
        for interval in StatsInterval::ALL {
            let s = self.stats_table(interval);
            ddl.push_str(&format!("DROP FUNCTION IF EXISTS {s}_update() CASCADE;\n"));
            ddl.push_str(&format!("DROP TABLE IF EXISTS {s};\n"));
        }

        sqlx::raw_sql(&ddl).execute(&self.pool).await.map_err(|e| {
            error!("Failed to drop tables: {}", e);
            StoreError::Database(e.to_string())
        })?;

        self.initialized.store(false, Ordering::Release);
        debug!("dropped queue tables");
        Ok(())
    }
}

// Helper functions

fn item_from_row(row: &PgRow) -> Result<QueueItem, StoreError> {
    Ok(QueueItem {
        id: row.try_get("id")?,
        uuid: row.try_get("uuid")?,
        item_type: row.try_get("type")?,
        payload: row.try_get("payload")?,
        result: serde_json::Value::Null,
        pending: row.try_get("pending")?,
        timeout_ms: row.try_get::<i64, _>("timeout_ms")?.max(0) as u64,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn fail_item_from_row(row: &PgRow) -> Result<FailQueueItem, StoreError> {
    Ok(FailQueueItem {
        id: row.try_get("id")?,
        uuid: row.try_get("uuid")?,
        item_type: row.try_get("type")?,
        payload: row.try_get("payload")?,
        error_data: row.try_get("error_data")?,
        error_attempts: row.try_get::<i32, _>("error_attempts")?.max(0) as u32,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn stats_from_row(row: &PgRow) -> Result<QueueStorageStats, StoreError> {
    Ok(QueueStorageStats {
        queued: row.try_get("queued")?,
        done: row.try_get("done")?,
        fail: row.try_get("fail")?,
        retry: row.try_get("retry")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

/// Fold the three table lookups into one status
pub(crate) fn resolve_status(
    attempts: Option<u32>,
    pending: Option<bool>,
    done: bool,
) -> Option<ItemStatus> {
    match (attempts, pending) {
        (Some(attempts), _) => Some(ItemStatus::Failed { attempts }),
        (None, Some(true)) => Some(ItemStatus::Claimed),
        (None, Some(false)) => Some(ItemStatus::Queued),
        (None, None) if done => Some(ItemStatus::Done),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    // Integration tests require a PostgreSQL database
    // Run with: DATABASE_URL=... cargo test -p durable-queue --test postgres_integration_test

    use super::*;

    #[test]
    fn test_resolve_status() {
        assert_eq!(resolve_status(None, Some(false), false), Some(ItemStatus::Queued));
        assert_eq!(resolve_status(None, Some(true), false), Some(ItemStatus::Claimed));
        assert_eq!(
            resolve_status(Some(2), Some(true), false),
            Some(ItemStatus::Failed { attempts: 2 })
        );
        assert_eq!(resolve_status(None, None, true), Some(ItemStatus::Done));
        assert_eq!(resolve_status(None, None, false), None);
    }

    #[tokio::test]
    async fn test_rejects_invalid_name() {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap();
        assert!(matches!(
            PostgresQueueStorage::new("bad-name", pool),
            Err(StoreError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn test_guard_before_initialize() {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap();
        let storage = PostgresQueueStorage::new("jobs", pool).unwrap();

        assert!(!storage.is_initialized());
        let result = storage.select(1).await;
        assert!(matches!(result, Err(StoreError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_table_names() {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap();
        let storage = PostgresQueueStorage::new("jobs", pool).unwrap();

        assert_eq!(storage.pending_table(), "jobs_q");
        assert_eq!(storage.fail_table(), "jobs_f");
        assert_eq!(storage.done_table(), "jobs_d");
        assert_eq!(storage.stats_table(StatsInterval::OneWeek), "jobs_s_1_week");
        assert!(storage.stats_ddl(StatsInterval::OneMinute).contains("date_bin('1 minute'"));
    }
}
