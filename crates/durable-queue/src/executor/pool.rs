//! Pool of execution units
//!
//! Spawns and scales units within a hard limit, dispatches messages to them
//! round-robin and owns the bus that relays broadcasts between siblings.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::channel::WorkerContext;
use super::handle::{UnitFn, WorkerHandle, WorkerState};

/// Executor configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Pool name, prefix of every unit name
    pub name: String,

    /// Units spawned by `Executor::new`
    pub initial_size: usize,

    /// Hard cap on the number of units
    pub limit: usize,

    /// Capacity of each unit's inbox
    pub inbox_capacity: usize,

    /// Capacity of the pool bus
    pub bus_capacity: usize,

    /// How long a terminating unit may take to return before it is aborted
    #[serde(with = "crate::duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            initial_size: 2,
            limit: 4,
            inbox_capacity: 64,
            bus_capacity: 256,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl ExecutorConfig {
    /// Create a configuration for the named pool
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Load from `EXECUTOR_*` environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let name = std::env::var("EXECUTOR_NAME").unwrap_or(defaults.name.clone());
        let initial_size = std::env::var("EXECUTOR_WORKER_NUMBER")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.initial_size);
        let limit = std::env::var("EXECUTOR_WORKER_LIMIT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.limit);

        Self {
            name,
            ..defaults
        }
        .with_limit(limit)
        .with_initial_size(initial_size)
    }

    pub fn with_initial_size(mut self, size: usize) -> Self {
        self.initial_size = size.min(self.limit);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self.initial_size = self.initial_size.min(limit);
        self
    }

    pub fn with_inbox_capacity(mut self, capacity: usize) -> Self {
        self.inbox_capacity = capacity.max(1);
        self
    }

    pub fn with_bus_capacity(mut self, capacity: usize) -> Self {
        self.bus_capacity = capacity.max(1);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Executor errors
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The pool has no units
    #[error("no workers available")]
    NoWorkersAvailable,

    /// The unit's inbox is closed
    #[error("worker {0} is not accepting messages")]
    WorkerUnavailable(String),
}

#[derive(Default)]
struct Units {
    /// Rotation order, least recently used first
    rotation: VecDeque<WorkerHandle>,
    next_seq: u64,
}

impl Units {
    fn free_index(&self) -> usize {
        (0..)
            .find(|i| self.rotation.iter().all(|h| h.index() != *i))
            .unwrap_or(self.rotation.len())
    }
}

/// Pool of isolated execution units
///
/// # Example
///
/// ```ignore
/// use durable_queue::executor::{Executor, ExecutorConfig, WorkerContext};
///
/// let executor = Executor::new(ExecutorConfig::new("mailer"), |mut ctx: WorkerContext| async move {
///     while let Some(message) = ctx.inbox.recv().await {
///         println!("{} got {}", ctx.name, message);
///     }
/// });
///
/// executor.post_message(json!({"hello": "world"})).await?;
/// executor.terminate().await;
/// ```
pub struct Executor {
    config: ExecutorConfig,
    unit: UnitFn,
    bus: broadcast::Sender<serde_json::Value>,
    units: Mutex<Units>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl Executor {
    /// Create the pool and spawn `initial_size` units
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<F, Fut>(config: ExecutorConfig, unit: F) -> Self
    where
        F: Fn(WorkerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let unit: UnitFn = Arc::new(move |ctx| Box::pin(unit(ctx)));
        let (bus, _) = broadcast::channel(config.bus_capacity.max(1));

        let executor = Self {
            config,
            unit,
            bus,
            units: Mutex::new(Units::default()),
            listeners: Mutex::new(Vec::new()),
        };

        for _ in 0..executor.config.initial_size {
            executor.increase();
        }

        info!(
            pool = %executor.config.name,
            size = executor.size(),
            limit = executor.config.limit,
            "Executor started"
        );

        executor
    }

    /// Spawn one more unit, returns false when the pool is at its limit
    #[instrument(skip(self), fields(pool = %self.config.name))]
    pub fn increase(&self) -> bool {
        let mut units = self.units.lock();
        if units.rotation.len() >= self.config.limit {
            warn!(
                limit = self.config.limit,
                "Worker limit reached, not spawning another worker"
            );
            return false;
        }

        let index = units.free_index();
        units.next_seq += 1;
        let handle = WorkerHandle::spawn(
            &self.config.name,
            index,
            units.next_seq,
            self.config.inbox_capacity,
            self.bus.clone(),
            &self.unit,
        );
        debug!(worker = %handle.name(), "Spawned worker");
        units.rotation.push_back(handle);
        true
    }

    /// Terminate and remove the most recently added unit
    #[instrument(skip(self), fields(pool = %self.config.name))]
    pub async fn decrease(&self) {
        let handle = {
            let mut units = self.units.lock();
            let newest = units
                .rotation
                .iter()
                .enumerate()
                .max_by_key(|(_, h)| h.seq())
                .map(|(pos, _)| pos);
            newest.and_then(|pos| units.rotation.remove(pos))
        };

        if let Some(mut handle) = handle {
            handle.terminate(self.config.shutdown_timeout).await;
            debug!(worker = %handle.name(), "Removed worker");
        }
    }

    /// Terminate every unit; the pool is empty afterwards
    #[instrument(skip(self), fields(pool = %self.config.name))]
    pub async fn terminate(&self) {
        let handles: Vec<WorkerHandle> = self.units.lock().rotation.drain(..).collect();
        let count = handles.len();

        futures::future::join_all(handles.into_iter().map(|mut handle| async move {
            handle.terminate(self.config.shutdown_timeout).await;
        }))
        .await;

        for listener in self.listeners.lock().drain(..) {
            listener.abort();
        }

        info!(terminated = count, "Executor terminated");
    }

    /// Deliver a message to the least recently used unit
    ///
    /// Resolves once the unit's inbox accepted the message.
    pub async fn post_message(&self, message: serde_json::Value) -> Result<(), ExecutorError> {
        let (name, inbox) = {
            let mut units = self.units.lock();
            let handle = units
                .rotation
                .pop_front()
                .ok_or(ExecutorError::NoWorkersAvailable)?;
            let target = (handle.name().to_string(), handle.inbox());
            units.rotation.push_back(handle);
            target
        };

        inbox
            .send(message)
            .await
            .map_err(|_| ExecutorError::WorkerUnavailable(name))
    }

    /// Run `handler` for every message any unit broadcasts
    pub fn listen<F, Fut>(&self, handler: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut rx = self.bus.subscribe();
        let pool = self.config.name.clone();

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => handler(message).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(pool = %pool, skipped, "Listener lagged behind the bus");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        self.listeners.lock().push(task);
    }

    /// Receive every message broadcast on the pool bus from now on
    pub fn subscribe(&self) -> broadcast::Receiver<serde_json::Value> {
        self.bus.subscribe()
    }

    pub fn size(&self) -> usize {
        self.units.lock().rotation.len()
    }

    pub fn limit(&self) -> usize {
        self.config.limit
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Unit names in spawn order
    pub fn worker_names(&self) -> Vec<String> {
        let units = self.units.lock();
        let mut handles: Vec<&WorkerHandle> = units.rotation.iter().collect();
        handles.sort_by_key(|h| h.seq());
        handles.iter().map(|h| h.name().to_string()).collect()
    }

    /// State of a unit by name, `None` if the pool has no such unit
    pub fn worker_state(&self, name: &str) -> Option<WorkerState> {
        self.units
            .lock()
            .rotation
            .iter()
            .find(|h| h.name() == name)
            .map(|h| h.state())
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        for listener in self.listeners.get_mut().drain(..) {
            listener.abort();
        }
    }
}
