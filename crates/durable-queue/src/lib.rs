//! # Durable Queue
//!
//! A PostgreSQL-backed, multi-consumer job queue.
//!
//! ## Features
//!
//! - **Safe concurrent claiming**: consumers claim items with `FOR UPDATE SKIP LOCKED`, no coordinator needed
//! - **Bounded retries**: failed items are released again until they reach `max_attempts`, then dead-lettered
//! - **Per-item timeouts**: each callback is raced against its item's timeout
//! - **Statistics ladder**: trigger-maintained counts from 1 minute up to 180 days
//! - **Worker pool**: scalable execution units with round-robin dispatch and a control bus
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Executor                             │
//! │  (spawns units, round-robin dispatch, relays pool bus)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Queue (per unit)                        │
//! │  (claim → callback → commit/fail, retry sweep, pause/close) │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       QueueStorage                           │
//! │  (PostgreSQL: <name>_q, <name>_f, <name>_d, <name>_s_*)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use durable_queue::prelude::*;
//!
//! let executor = Executor::new(ExecutorConfig::new("mailer"), move |ctx: WorkerContext| {
//!     let storage = storage.clone();
//!     async move {
//!         let queue = Queue::new(storage, QueueConfig::new("emails")).with_channel(ctx.channel);
//!         queue
//!             .listen(|item, _hook| async move {
//!                 deliver(&item.payload).await.map_err(ProcessError::failed)?;
//!                 Ok(json!({"delivered": true}))
//!             })
//!             .await
//!             .ok();
//!
//!         ctx.shutdown.cancelled().await;
//!         queue.stop();
//!         queue.join().await;
//!     }
//! });
//! ```

mod duration_millis;
pub mod executor;
pub mod persistence;
pub mod queue;
pub mod reliability;

/// Prelude for common imports
pub mod prelude {
    pub use crate::executor::{Executor, ExecutorConfig, ExecutorError, WorkerChannel, WorkerContext};
    pub use crate::persistence::{
        InMemoryQueueStorage, ItemStatus, PostgresQueueStorage, QueueItem, QueueMessage,
        QueueStorage, StatsInterval, StoreError,
    };
    pub use crate::queue::{
        ErrorHook, ErrorKind, ProcessError, Queue, QueueConfig, QueueError, QueueState,
    };
}

// Re-export key types at crate root
pub use executor::{Executor, ExecutorConfig, ExecutorError, WorkerChannel, WorkerContext, WorkerState};
pub use persistence::{
    FailQueueItem, InMemoryQueueStorage, ItemStatus, PostgresQueueStorage, QueueItem,
    QueueMessage, QueueStorage, QueueStorageStats, StatsInterval, StoreError,
};
pub use queue::{
    ControlMessage, ErrorHook, ErrorKind, ProcessError, Queue, QueueConfig, QueueError,
    QueueState,
};
