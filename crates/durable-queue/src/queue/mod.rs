//! Queue controller
//!
//! Drives a claim → invoke → settle loop for one named queue:
//!
//! 1. claim up to `batch_size` items from the storage
//! 2. run the retry sweep when `retry_interval` has elapsed
//! 3. run the callback for each claimed item in turn, racing its timeout
//! 4. commit on success, record a failure otherwise
//! 5. wait `throttle` (or `poll_interval` when nothing was claimed)
//!
//! `pause()` and `close()` apply locally and, once the controller is
//! attached to a [`WorkerChannel`], are relayed to every sibling controller
//! on the pool bus.

mod config;
mod control;
mod error;

pub use config::QueueConfig;
pub use control::ControlMessage;
pub use error::{ErrorKind, ProcessError, QueueError};

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::executor::WorkerChannel;
use crate::persistence::{
    FailQueueItem, ItemStatus, QueueItem, QueueMessage, QueueStorage, StoreError,
};
use crate::reliability::{race, Outcome, RetrySweep};

/// Controller lifecycle as seen from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    /// No callback registered yet
    Idle,
    Running,
    Paused,
    /// Terminal
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Control {
    paused: bool,
    closed: bool,
}

/// Boxed item callback
pub type ProcessFn = Arc<dyn Fn(QueueItem, ErrorHook) -> BoxFuture<'static, Outcome> + Send + Sync>;

type HookFn = Box<dyn FnOnce(ProcessError) + Send>;

/// Lets a callback ask to be told about its own failure
///
/// The registered function runs at most once, after the failure has been
/// recorded. It receives the same error that was stored, including the
/// timeout error when the callback lost its race.
#[derive(Clone, Default)]
pub struct ErrorHook {
    slot: Arc<Mutex<Option<HookFn>>>,
}

impl ErrorHook {
    /// Register the notification, replacing any earlier one
    pub fn register<F>(&self, hook: F)
    where
        F: FnOnce(ProcessError) + Send + 'static,
    {
        *self.slot.lock() = Some(Box::new(hook));
    }

    pub fn is_registered(&self) -> bool {
        self.slot.lock().is_some()
    }

    fn fire(&self, error: ProcessError) {
        let hook = self.slot.lock().take();
        if let Some(hook) = hook {
            hook(error);
        }
    }
}

impl std::fmt::Debug for ErrorHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorHook")
            .field("registered", &self.is_registered())
            .finish()
    }
}

/// Controller for one named queue
///
/// Cheap to clone; clones share the same controller.
///
/// # Example
///
/// ```ignore
/// use durable_queue::prelude::*;
///
/// let storage = Arc::new(PostgresQueueStorage::new("emails", pool)?);
/// let queue = Queue::new(storage, QueueConfig::new("emails"));
///
/// queue.enqueue(vec![QueueMessage::new("welcome", json!({"to": "a@b.c"}))]).await?;
///
/// queue
///     .listen(|item, hook| async move {
///         hook.register(|err| tracing::warn!("welcome mail failed: {}", err));
///         send_mail(&item.payload).await.map_err(ProcessError::failed)?;
///         Ok(json!({"sent": true}))
///     })
///     .await?;
/// ```
#[derive(Clone)]
pub struct Queue {
    inner: Arc<Inner>,
}

struct Inner {
    identity: String,
    config: QueueConfig,
    storage: Arc<dyn QueueStorage>,
    control: watch::Sender<Control>,
    listening: AtomicBool,
    channel: OnceLock<WorkerChannel>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Queue {
    /// Create an idle controller over `storage`
    ///
    /// The storage decides the queue name; `config.name` is aligned to it.
    pub fn new(storage: Arc<dyn QueueStorage>, mut config: QueueConfig) -> Self {
        if config.name != storage.name() {
            warn!(
                configured = %config.name,
                queue = %storage.name(),
                "Queue config name differs from its storage; using the storage name"
            );
            config.name = storage.name().to_string();
        }
        let identity = format!("{}:{}", storage.name(), Uuid::now_v7());
        let (control, _) = watch::channel(Control::default());

        Self {
            inner: Arc::new(Inner {
                identity,
                config,
                storage,
                control,
                listening: AtomicBool::new(false),
                channel: OnceLock::new(),
                driver: Mutex::new(None),
            }),
        }
    }

    /// Attach to a pool bus so pause and close reach sibling controllers
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_channel(self, channel: WorkerChannel) -> Self {
        let rx = channel.subscribe();
        if self.inner.channel.set(channel).is_err() {
            warn!(queue = %self.inner.name(), "Queue is already attached to a channel");
            return self;
        }

        tokio::spawn(Inner::sync(Arc::downgrade(&self.inner), rx));
        self
    }

    /// Register the callback and start processing
    ///
    /// Initializes the storage first. A controller accepts one callback
    /// only.
    pub async fn listen<F, Fut>(&self, callback: F) -> Result<(), QueueError>
    where
        F: Fn(QueueItem, ErrorHook) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, ProcessError>> + Send + 'static,
    {
        if self.inner.control.borrow().closed {
            return Err(QueueError::Closed);
        }
        if self.inner.listening.swap(true, Ordering::AcqRel) {
            return Err(QueueError::AlreadyListening);
        }
        if let Err(e) = self.inner.ensure_initialized().await {
            self.inner.listening.store(false, Ordering::Release);
            return Err(e.into());
        }

        let callback: ProcessFn = Arc::new(move |item, hook| Box::pin(callback(item, hook)));
        let driver = tokio::spawn(Arc::clone(&self.inner).drive(callback));
        *self.inner.driver.lock() = Some(driver);

        info!(
            queue = %self.inner.name(),
            identity = %self.inner.identity,
            batch_size = self.inner.config.batch_size,
            max_attempts = self.inner.config.max_attempts,
            "Queue listening"
        );
        Ok(())
    }

    /// Push messages, returning the uuids of the new items in order
    ///
    /// A payload that is a string holding JSON text is stored as the
    /// structured value it encodes.
    #[instrument(skip(self, messages), fields(queue = %self.inner.name(), count = messages.len()))]
    pub async fn enqueue(&self, messages: Vec<QueueMessage>) -> Result<Vec<Uuid>, QueueError> {
        let messages = messages
            .into_iter()
            .map(|mut message| {
                message.payload = normalize_payload(message.payload);
                message
            })
            .collect();

        self.inner.ensure_initialized().await?;
        let uuids = self.inner.storage.push(messages).await?;
        debug!(pushed = uuids.len(), "Enqueued items");
        Ok(uuids)
    }

    /// Pause (`true`) or resume (`false`) this controller and its siblings
    pub fn pause(&self, paused: bool) {
        if self.inner.control.borrow().closed {
            return;
        }
        if self.inner.set_paused(paused) {
            info!(queue = %self.inner.name(), paused, "Queue pause state changed");
        }
        self.inner.broadcast(ControlMessage::Pause {
            origin: self.inner.identity.clone(),
            payload: paused,
        });
    }

    /// Close this controller and its siblings
    ///
    /// Irreversible. An item being processed completes normally.
    pub fn close(&self) {
        if self.inner.set_closed() {
            info!(queue = %self.inner.name(), "Queue closed");
            self.inner.broadcast(ControlMessage::Close {
                origin: self.inner.identity.clone(),
            });
        }
    }

    /// Close this controller only, leaving siblings running
    pub fn stop(&self) {
        if self.inner.set_closed() {
            info!(queue = %self.inner.name(), "Queue stopped");
        }
    }

    /// Wait until the processing loop has exited
    pub async fn join(&self) {
        let driver = self.inner.driver.lock().take();
        if let Some(driver) = driver {
            if let Err(e) = driver.await {
                error!(queue = %self.inner.name(), error = %e, "Queue driver task failed");
            }
        }
    }

    pub async fn status_of(&self, uuid: Uuid) -> Result<Option<ItemStatus>, QueueError> {
        self.inner.ensure_initialized().await?;
        Ok(self.inner.storage.status_of(uuid).await?)
    }

    /// Items whose attempts reached `max_attempts`, oldest first
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<FailQueueItem>, QueueError> {
        self.inner.ensure_initialized().await?;
        Ok(self
            .inner
            .storage
            .dead_letters(self.inner.config.max_attempts, limit)
            .await?)
    }

    /// Give a dead-lettered item a fresh attempt budget
    ///
    /// Returns false for unknown items and for items with attempts left.
    pub async fn requeue_dead_letter(&self, uuid: Uuid) -> Result<bool, QueueError> {
        self.inner.ensure_initialized().await?;
        Ok(self
            .inner
            .storage
            .requeue_dead_letter(uuid, self.inner.config.max_attempts)
            .await?)
    }

    pub fn state(&self) -> QueueState {
        let control = *self.inner.control.borrow();
        if control.closed {
            QueueState::Closed
        } else if control.paused {
            QueueState::Paused
        } else if self.inner.listening.load(Ordering::Acquire) {
            QueueState::Running
        } else {
            QueueState::Idle
        }
    }

    pub fn storage(&self) -> Arc<dyn QueueStorage> {
        Arc::clone(&self.inner.storage)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Origin carried by control messages this controller broadcasts
    pub fn identity(&self) -> &str {
        &self.inner.identity
    }
}

impl Inner {
    fn name(&self) -> &str {
        self.storage.name()
    }

    async fn ensure_initialized(&self) -> Result<(), StoreError> {
        if !self.storage.is_initialized() {
            self.storage.initialize().await?;
        }
        Ok(())
    }

    /// Returns true if the state changed
    fn set_paused(&self, paused: bool) -> bool {
        self.control.send_if_modified(|c| {
            if c.closed || c.paused == paused {
                false
            } else {
                c.paused = paused;
                true
            }
        })
    }

    /// Returns true on the first close
    fn set_closed(&self) -> bool {
        self.control.send_if_modified(|c| {
            if c.closed {
                false
            } else {
                c.closed = true;
                true
            }
        })
    }

    fn broadcast(&self, message: ControlMessage) {
        if let Some(channel) = self.channel.get() {
            let receivers = channel.broadcast(message.to_value());
            debug!(queue = %self.name(), ?message, receivers, "Broadcast control message");
        }
    }

    /// Apply a signal raised by a sibling, never re-broadcasting it
    fn apply_remote(&self, message: ControlMessage) {
        if message.origin() == self.identity {
            return;
        }

        match message {
            ControlMessage::Close { origin } => {
                if self.set_closed() {
                    info!(queue = %self.name(), %origin, "Queue closed by sibling");
                }
            }
            ControlMessage::Pause { origin, payload } => {
                if self.set_paused(payload) {
                    info!(queue = %self.name(), %origin, paused = payload, "Queue pause state changed by sibling");
                }
            }
        }
    }

    /// Relay loop between the pool bus and this controller
    async fn sync(weak: Weak<Inner>, mut rx: broadcast::Receiver<serde_json::Value>) {
        loop {
            let message = match rx.recv().await {
                Ok(message) => message,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Control sync lagged behind the bus");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            let Some(inner) = weak.upgrade() else {
                break;
            };
            if let Some(signal) = ControlMessage::from_value(&message) {
                inner.apply_remote(signal);
            }
            if inner.control.borrow().closed {
                break;
            }
        }
    }

    async fn drive(self: Arc<Self>, callback: ProcessFn) {
        let mut control = self.control.subscribe();
        let mut sweep = RetrySweep::new(self.config.retry_interval);

        loop {
            let state = *control.borrow_and_update();
            if state.closed {
                break;
            }

            let mut claimed = 0;
            if !state.paused {
                claimed = match self.tick(&callback, &mut sweep).await {
                    Ok(claimed) => claimed,
                    Err(e) => {
                        error!(queue = %self.name(), error = %e, "Queue tick failed");
                        0
                    }
                };
            }

            if !self.wait_next_tick(&mut control, claimed == 0).await {
                break;
            }
        }

        info!(queue = %self.name(), "Queue processing loop exited");
    }

    async fn tick(&self, callback: &ProcessFn, sweep: &mut RetrySweep) -> Result<usize, StoreError> {
        self.ensure_initialized().await?;
        if self.control.borrow().closed {
            return Ok(0);
        }

        let items = self.storage.select(self.config.batch_size).await?;

        if sweep.due() {
            match self
                .storage
                .retry(self.config.max_attempts, self.config.retry_batch_size)
                .await
            {
                Ok(0) => {}
                Ok(released) => debug!(queue = %self.name(), released, "Released failed items"),
                Err(e) => error!(queue = %self.name(), error = %e, "Retry sweep failed"),
            }
        }

        let claimed = items.len();
        for item in items {
            self.process(item, callback).await;
        }
        Ok(claimed)
    }

    async fn process(&self, item: QueueItem, callback: &ProcessFn) {
        let hook = ErrorHook::default();
        let uuid = item.uuid;
        let handle = tokio::spawn(callback(item.clone(), hook.clone()));

        let err = match race(uuid, item.timeout_ms, handle).await {
            Ok(result) => match self.storage.commit(&[item.clone().with_result(result)]).await {
                Ok(()) => {
                    debug!(queue = %self.name(), %uuid, "Item done");
                    return;
                }
                // The item stays claimed; a fail record lets the retry sweep release it
                Err(e) => {
                    error!(queue = %self.name(), %uuid, error = %e, "Failed to commit item");
                    ProcessError::Commit(e.to_string())
                }
            },
            Err(err) => err,
        };

        match self.storage.fail(&item, &err.to_error_data()).await {
            Ok(record) if record.error_attempts >= self.config.max_attempts => {
                error!(
                    queue = %self.name(),
                    %uuid,
                    item_type = %item.item_type,
                    attempts = record.error_attempts,
                    error = %err,
                    "Item exhausted its attempts and is dead-lettered"
                );
            }
            Ok(record) => {
                warn!(
                    queue = %self.name(),
                    %uuid,
                    attempts = record.error_attempts,
                    error = %err,
                    "Item failed"
                );
            }
            Err(e) => {
                error!(queue = %self.name(), %uuid, error = %e, "Failed to record item failure");
            }
        }
        hook.fire(err);
    }

    /// Wait before the next tick; returns false once closed
    async fn wait_next_tick(&self, control: &mut watch::Receiver<Control>, idle: bool) -> bool {
        let delay = if idle {
            self.config.throttle.max(self.config.poll_interval)
        } else {
            self.config.throttle
        };

        loop {
            let state = *control.borrow_and_update();
            if state.closed {
                return false;
            }
            if state.paused {
                if control.changed().await.is_err() {
                    return false;
                }
                continue;
            }
            if delay.is_zero() {
                tokio::task::yield_now().await;
                return true;
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => return true,
                changed = control.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }
}

fn normalize_payload(payload: serde_json::Value) -> serde_json::Value {
    match payload {
        serde_json::Value::String(text) => match serde_json::from_str(&text) {
            Ok(parsed @ (serde_json::Value::Object(_) | serde_json::Value::Array(_))) => parsed,
            _ => serde_json::Value::String(text),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;

    use async_trait::async_trait;

    use super::*;
    use crate::persistence::{InMemoryQueueStorage, QueueStorageStats, StatsInterval};

    fn test_config() -> QueueConfig {
        QueueConfig::new("test_queue")
            .with_poll_interval(Duration::from_millis(5))
            .with_retry_interval(Duration::from_millis(20))
    }

    fn create_test_queue(config: QueueConfig) -> (Queue, Arc<InMemoryQueueStorage>) {
        let storage = Arc::new(InMemoryQueueStorage::new("test_queue"));
        let queue = Queue::new(storage.clone(), config);
        (queue, storage)
    }

    fn messages(count: usize) -> Vec<QueueMessage> {
        (0..count)
            .map(|i| QueueMessage::new("test", json!({ "number": i })))
            .collect()
    }

    async fn eventually(cond: impl Fn() -> bool) -> bool {
        for _ in 0..300 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_listen_processes_all_items() {
        let (queue, storage) = create_test_queue(test_config());
        let uuids = queue.enqueue(messages(5)).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_callback = Arc::clone(&seen);
        queue
            .listen(move |item, _hook| {
                let seen = Arc::clone(&seen_by_callback);
                async move {
                    seen.lock().push(item.uuid);
                    Ok(json!({"doubled": item.payload["number"].as_i64().unwrap_or(0) * 2}))
                }
            })
            .await
            .unwrap();

        assert!(eventually(|| storage.done_count() == 5).await);
        assert_eq!(*seen.lock(), uuids);
        assert_eq!(storage.pending_count(), 0);
        assert_eq!(queue.state(), QueueState::Running);

        queue.close();
        queue.join().await;
    }

    #[tokio::test]
    async fn test_timeout_reaches_error_hook() {
        let (queue, storage) = create_test_queue(
            test_config().with_retry_interval(Duration::from_secs(60)),
        );
        let uuids = queue
            .enqueue(vec![QueueMessage::new("slow", json!({})).with_timeout_ms(100)])
            .await
            .unwrap();

        let (hook_tx, mut hook_rx) = mpsc::unbounded_channel();
        queue
            .listen(move |_item, hook| {
                let hook_tx = hook_tx.clone();
                async move {
                    hook.register(move |err| {
                        let _ = hook_tx.send(err);
                    });
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Ok(json!("too late"))
                }
            })
            .await
            .unwrap();

        let err = tokio::time::timeout(Duration::from_secs(2), hook_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(matches!(err, ProcessError::Timeout { timeout_ms: 100, .. }));

        let record = storage.fail_record(uuids[0]).unwrap();
        assert_eq!(record.error_attempts, 1);
        assert_eq!(
            serde_json::from_str::<ProcessError>(&record.error_data).unwrap(),
            err
        );
        assert_eq!(
            queue.status_of(uuids[0]).await.unwrap(),
            Some(ItemStatus::Failed { attempts: 1 })
        );

        queue.close();
        queue.join().await;
    }

    #[tokio::test]
    async fn test_always_failing_item_is_bounded() {
        let (queue, storage) = create_test_queue(test_config().with_max_attempts(3));
        let uuids = queue.enqueue(messages(1)).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_by_callback = Arc::clone(&calls);
        queue
            .listen(move |_item, _hook| {
                let calls = Arc::clone(&calls_by_callback);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ProcessError::failed("always broken"))
                }
            })
            .await
            .unwrap();

        assert!(eventually(|| {
            storage
                .fail_record(uuids[0])
                .map(|r| r.error_attempts == 3)
                .unwrap_or(false)
        })
        .await);

        // Several retry intervals later it is still never claimed again
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(storage.fail_record(uuids[0]).unwrap().error_attempts, 3);

        let dead = queue.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].uuid, uuids[0]);

        queue.close();
        queue.join().await;
    }

    #[tokio::test]
    async fn test_success_after_failure_clears_fail_record() {
        let (queue, storage) = create_test_queue(test_config());
        let uuids = queue.enqueue(messages(1)).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_by_callback = Arc::clone(&calls);
        queue
            .listen(move |_item, _hook| {
                let calls = Arc::clone(&calls_by_callback);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(ProcessError::failed("flaky"))
                    } else {
                        Ok(json!("ok"))
                    }
                }
            })
            .await
            .unwrap();

        assert!(eventually(|| storage.done_count() == 1).await);
        assert_eq!(storage.fail_count(), 0);
        assert_eq!(storage.pending_count(), 0);
        assert_eq!(queue.status_of(uuids[0]).await.unwrap(), Some(ItemStatus::Done));

        queue.close();
        queue.join().await;
    }

    #[tokio::test]
    async fn test_panicking_callback_is_recorded() {
        let (queue, storage) = create_test_queue(test_config());
        let uuids = queue.enqueue(messages(1)).await.unwrap();

        let (hook_tx, mut hook_rx) = mpsc::unbounded_channel();
        queue
            .listen(move |item, hook| {
                let hook_tx = hook_tx.clone();
                async move {
                    hook.register(move |err| {
                        let _ = hook_tx.send(err);
                    });
                    if item.item_type == "test" {
                        panic!("callback blew up");
                    }
                    Ok(json!(null))
                }
            })
            .await
            .unwrap();

        let err = tokio::time::timeout(Duration::from_secs(2), hook_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Processing);
        assert!(matches!(err, ProcessError::Panicked(_)));
        assert!(storage.fail_record(uuids[0]).is_some());

        queue.close();
        queue.join().await;
    }

    #[tokio::test]
    async fn test_second_listen_is_rejected() {
        let (queue, _storage) = create_test_queue(test_config());

        queue.listen(|_item, _hook| async { Ok(json!(null)) }).await.unwrap();
        let second = queue.listen(|_item, _hook| async { Ok(json!(null)) }).await;
        assert!(matches!(second, Err(QueueError::AlreadyListening)));

        queue.close();
        queue.join().await;
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let (queue, storage) = create_test_queue(test_config());
        queue.listen(|_item, _hook| async { Ok(json!(null)) }).await.unwrap();

        queue.pause(true);
        assert_eq!(queue.state(), QueueState::Paused);
        // Let a tick that was already running finish
        tokio::time::sleep(Duration::from_millis(20)).await;

        queue.enqueue(messages(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(storage.done_count(), 0);
        assert_eq!(storage.pending_count(), 2);

        queue.pause(false);
        assert_eq!(queue.state(), QueueState::Running);
        assert!(eventually(|| storage.done_count() == 2).await);

        queue.close();
        queue.join().await;
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let (queue, storage) = create_test_queue(test_config());
        queue.listen(|_item, _hook| async { Ok(json!(null)) }).await.unwrap();

        queue.close();
        queue.join().await;
        assert_eq!(queue.state(), QueueState::Closed);

        queue.enqueue(messages(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(storage.pending_count(), 1);

        // Pause after close is ignored
        queue.pause(false);
        assert_eq!(queue.state(), QueueState::Closed);

        let again = queue.listen(|_item, _hook| async { Ok(json!(null)) }).await;
        assert!(matches!(again, Err(QueueError::Closed)));
    }

    #[tokio::test]
    async fn test_close_relays_to_sibling_without_echo() {
        let (bus, _) = broadcast::channel(16);
        let mut observer = bus.subscribe();
        let storage = Arc::new(InMemoryQueueStorage::new("test_queue"));

        let first = Queue::new(storage.clone(), test_config())
            .with_channel(WorkerChannel::new("pool-0", bus.clone()));
        let second = Queue::new(storage.clone(), test_config())
            .with_channel(WorkerChannel::new("pool-1", bus.clone()));
        assert_ne!(first.identity(), second.identity());

        first.close();
        assert_eq!(first.state(), QueueState::Closed);
        assert!(eventually(|| second.state() == QueueState::Closed).await);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut closes = 0;
        while let Ok(message) = observer.try_recv() {
            if let Some(ControlMessage::Close { origin }) = ControlMessage::from_value(&message) {
                assert_eq!(origin, first.identity());
                closes += 1;
            }
        }
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn test_pause_relays_to_sibling() {
        let (bus, _) = broadcast::channel(16);
        let storage = Arc::new(InMemoryQueueStorage::new("test_queue"));

        let first = Queue::new(storage.clone(), test_config())
            .with_channel(WorkerChannel::new("pool-0", bus.clone()));
        let second = Queue::new(storage.clone(), test_config())
            .with_channel(WorkerChannel::new("pool-1", bus.clone()));

        first.pause(true);
        assert!(eventually(|| second.state() == QueueState::Paused).await);

        second.pause(false);
        assert!(eventually(|| first.state() == QueueState::Idle).await);
        assert_eq!(second.state(), QueueState::Idle);
    }

    /// In-memory storage whose first commit fails
    struct FlakyCommitStorage {
        inner: Arc<InMemoryQueueStorage>,
        fail_next_commit: AtomicBool,
    }

    #[async_trait]
    impl QueueStorage for FlakyCommitStorage {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn is_initialized(&self) -> bool {
            self.inner.is_initialized()
        }

        async fn initialize(&self) -> Result<(), StoreError> {
            self.inner.initialize().await
        }

        async fn push(&self, messages: Vec<QueueMessage>) -> Result<Vec<Uuid>, StoreError> {
            self.inner.push(messages).await
        }

        async fn select(&self, limit: usize) -> Result<Vec<QueueItem>, StoreError> {
            self.inner.select(limit).await
        }

        async fn commit(&self, items: &[QueueItem]) -> Result<(), StoreError> {
            if self.fail_next_commit.swap(false, Ordering::SeqCst) {
                return Err(StoreError::Database("connection reset".to_string()));
            }
            self.inner.commit(items).await
        }

        async fn fail(
            &self,
            item: &QueueItem,
            error_data: &str,
        ) -> Result<FailQueueItem, StoreError> {
            self.inner.fail(item, error_data).await
        }

        async fn retry(&self, max_attempts: u32, batch_size: usize) -> Result<usize, StoreError> {
            self.inner.retry(max_attempts, batch_size).await
        }

        async fn stats(
            &self,
            interval: StatsInterval,
            period: StatsInterval,
        ) -> Result<Vec<QueueStorageStats>, StoreError> {
            self.inner.stats(interval, period).await
        }

        async fn now_stats(&self) -> Result<QueueStorageStats, StoreError> {
            self.inner.now_stats().await
        }

        async fn status_of(&self, uuid: Uuid) -> Result<Option<ItemStatus>, StoreError> {
            self.inner.status_of(uuid).await
        }

        async fn dead_letters(
            &self,
            max_attempts: u32,
            limit: usize,
        ) -> Result<Vec<FailQueueItem>, StoreError> {
            self.inner.dead_letters(max_attempts, limit).await
        }

        async fn requeue_dead_letter(
            &self,
            uuid: Uuid,
            max_attempts: u32,
        ) -> Result<bool, StoreError> {
            self.inner.requeue_dead_letter(uuid, max_attempts).await
        }

        async fn remove(&self, uuids: &[Uuid]) -> Result<usize, StoreError> {
            self.inner.remove(uuids).await
        }

        async fn drop_tables(&self) -> Result<(), StoreError> {
            self.inner.drop_tables().await
        }
    }

    #[tokio::test]
    async fn test_failed_commit_is_retried() {
        let memory = Arc::new(InMemoryQueueStorage::new("test_queue"));
        let storage = Arc::new(FlakyCommitStorage {
            inner: Arc::clone(&memory),
            fail_next_commit: AtomicBool::new(true),
        });
        let queue = Queue::new(storage, test_config());
        let uuids = queue.enqueue(messages(1)).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_by_callback = Arc::clone(&calls);
        let (hook_tx, mut hook_rx) = mpsc::unbounded_channel();
        queue
            .listen(move |_item, hook| {
                let calls = Arc::clone(&calls_by_callback);
                let hook_tx = hook_tx.clone();
                async move {
                    hook.register(move |err| {
                        let _ = hook_tx.send(err);
                    });
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("ok"))
                }
            })
            .await
            .unwrap();

        let err = tokio::time::timeout(Duration::from_secs(2), hook_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(err, ProcessError::Commit(_)));
        assert_eq!(err.kind(), ErrorKind::Processing);

        assert!(eventually(|| memory.done_count() == 1).await);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(memory.fail_count(), 0);
        assert_eq!(memory.pending_count(), 0);
        assert_eq!(queue.status_of(uuids[0]).await.unwrap(), Some(ItemStatus::Done));

        queue.close();
        queue.join().await;
    }

    #[tokio::test]
    async fn test_timed_out_attempts_never_overlap() {
        let (queue, storage) = create_test_queue(test_config().with_max_attempts(3));
        let uuids = queue
            .enqueue(vec![QueueMessage::new("slow", json!({})).with_timeout_ms(50)])
            .await
            .unwrap();

        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let (started_by_callback, finished_by_callback) =
            (Arc::clone(&started), Arc::clone(&finished));
        queue
            .listen(move |_item, _hook| {
                let started = Arc::clone(&started_by_callback);
                let finished = Arc::clone(&finished_by_callback);
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("too late"))
                }
            })
            .await
            .unwrap();

        assert!(eventually(|| {
            storage
                .fail_record(uuids[0])
                .map(|r| r.error_attempts == 3)
                .unwrap_or(false)
        })
        .await);

        // Long enough for any surviving invocation to finish its sleep
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(started.load(Ordering::SeqCst), 3);
        assert_eq!(finished.load(Ordering::SeqCst), 0);

        queue.close();
        queue.join().await;
    }

    #[tokio::test]
    async fn test_requeue_dead_letter_uses_attempt_budget() {
        let (queue, storage) = create_test_queue(test_config().with_max_attempts(2));
        let uuids = queue.enqueue(messages(1)).await.unwrap();

        let item = storage.select(1).await.unwrap().remove(0);
        storage.fail(&item, "boom").await.unwrap();
        assert!(!queue.requeue_dead_letter(uuids[0]).await.unwrap());

        storage.retry(2, 10).await.unwrap();
        let item = storage.select(1).await.unwrap().remove(0);
        storage.fail(&item, "boom").await.unwrap();
        assert!(queue.requeue_dead_letter(uuids[0]).await.unwrap());
        assert_eq!(queue.status_of(uuids[0]).await.unwrap(), Some(ItemStatus::Queued));
        assert!(queue.dead_letters(10).await.unwrap().is_empty());
    }

    #[test]
    fn test_config_name_follows_storage() {
        let storage = Arc::new(InMemoryQueueStorage::new("test_queue"));
        let queue = Queue::new(storage, QueueConfig::new("elsewhere"));
        assert_eq!(queue.config().name, "test_queue");
        assert!(queue.identity().starts_with("test_queue:"));
    }

    #[tokio::test]
    async fn test_enqueue_parses_json_text_payload() {
        let (queue, storage) = create_test_queue(test_config());

        queue
            .enqueue(vec![
                QueueMessage::new("t", json!("{\"to\": \"a@b.c\"}")),
                QueueMessage::new("t", json!("plain text")),
                QueueMessage::new("t", json!("42")),
            ])
            .await
            .unwrap();

        let items = storage.select(3).await.unwrap();
        assert_eq!(items[0].payload, json!({"to": "a@b.c"}));
        assert_eq!(items[1].payload, json!("plain text"));
        assert_eq!(items[2].payload, json!("42"));
    }

    #[test]
    fn test_error_hook_fires_once() {
        let hook = ErrorHook::default();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        hook.register(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(hook.is_registered());

        hook.fire(ProcessError::failed("a"));
        hook.fire(ProcessError::failed("b"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!hook.is_registered());
    }
}
