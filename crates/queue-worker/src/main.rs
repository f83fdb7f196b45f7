mod config;
mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use durable_queue::prelude::*;
use durable_queue::ControlMessage;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use crate::config::WorkerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Configure via RUST_LOG or LOG_LEVEL (default: info)
    telemetry::init_logging();

    info!("queue-worker starting...");

    let config = WorkerConfig::from_env();
    info!(
        queue = %config.queue.name,
        pool = %config.executor.name,
        workers = config.executor.initial_size,
        limit = config.executor.limit,
        "Starting queue worker"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;

    // Surface schema problems at startup rather than inside every unit
    let storage = PostgresQueueStorage::new(config.queue.name.clone(), pool.clone())
        .context("Invalid QUEUE_NAME")?;
    storage
        .initialize()
        .await
        .context("Failed to initialize queue storage")?;

    let queue_config = config.queue.clone();
    let executor = Arc::new(Executor::new(config.executor.clone(), move |ctx| {
        run_unit(ctx, pool.clone(), queue_config.clone())
    }));

    executor.listen(|message| async move {
        if let Some(signal) = ControlMessage::from_value(&message) {
            info!(?signal, "Control message on pool bus");
        }
    });

    if config.enqueue_stdin {
        tokio::spawn(feed_stdin(Arc::clone(&executor)));
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    executor.terminate().await;

    info!("Worker shutdown complete");
    Ok(())
}

/// Body of one execution unit: a queue controller plus an inbox of messages
/// to enqueue
async fn run_unit(mut ctx: WorkerContext, pool: PgPool, config: QueueConfig) {
    let storage = match PostgresQueueStorage::new(config.name.clone(), pool) {
        Ok(storage) => Arc::new(storage),
        Err(e) => {
            error!(worker = %ctx.name, error = %e, "Failed to create queue storage");
            return;
        }
    };

    let queue = Queue::new(storage, config).with_channel(ctx.channel.clone());
    let worker = ctx.name.clone();
    let listening = queue
        .listen(move |item, hook| {
            let worker = worker.clone();
            async move { process_item(worker, item, hook).await }
        })
        .await;
    if let Err(e) = listening {
        error!(worker = %ctx.name, error = %e, "Failed to start queue");
        return;
    }

    loop {
        tokio::select! {
            message = ctx.inbox.recv() => match message {
                Some(message) => enqueue_message(&queue, &ctx.name, message).await,
                None => break,
            },
            _ = ctx.shutdown.cancelled() => break,
        }
    }

    // Siblings keep running when one unit is scaled down
    queue.stop();
    queue.join().await;
}

/// Route an item by its type
async fn process_item(
    worker: String,
    item: QueueItem,
    hook: ErrorHook,
) -> Result<serde_json::Value, ProcessError> {
    info!(worker = %worker, uuid = %item.uuid, item_type = %item.item_type, "Processing item");

    let uuid = item.uuid;
    hook.register(move |err| match err.kind() {
        ErrorKind::Timeout => warn!(%uuid, "Item timed out"),
        ErrorKind::Processing => warn!(%uuid, error = %err, "Item failed"),
    });

    match item.item_type.as_str() {
        "echo" => Ok(json!({ "worker": worker, "echo": item.payload })),
        "sleep" => {
            let ms = item.payload["ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!({ "worker": worker, "slept_ms": ms }))
        }
        other => Err(ProcessError::failed(format!("no handler for item type {:?}", other))),
    }
}

async fn enqueue_message(queue: &Queue, worker: &str, message: serde_json::Value) {
    let message: QueueMessage = match serde_json::from_value(message) {
        Ok(message) => message,
        Err(e) => {
            warn!(worker = %worker, error = %e, "Ignoring message that is not a queue message");
            return;
        }
    };

    match queue.enqueue(vec![message]).await {
        Ok(uuids) => info!(worker = %worker, uuid = ?uuids.first(), "Enqueued item"),
        Err(e) => error!(worker = %worker, error = %e, "Failed to enqueue item"),
    }
}

/// Dispatch newline-delimited JSON messages from stdin round-robin
async fn feed_stdin(executor: Arc<Executor>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "Failed to read stdin");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<serde_json::Value>(&line) {
            Ok(message) => {
                if let Err(e) = executor.post_message(message).await {
                    warn!(error = %e, "Failed to dispatch message");
                }
            }
            Err(e) => warn!(error = %e, "Ignoring malformed line"),
        }
    }
}
