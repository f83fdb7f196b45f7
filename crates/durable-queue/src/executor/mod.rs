//! Worker-pool executor
//!
//! This module provides:
//! - [`Executor`] - Scalable pool of execution units with round-robin dispatch
//! - [`WorkerChannel`] - A unit's handle to the pool bus
//! - [`WorkerContext`] - What a unit receives when spawned

mod channel;
mod handle;
mod pool;

pub use channel::{WorkerChannel, WorkerContext};
pub use handle::{UnitFn, WorkerHandle, WorkerState};
pub use pool::{Executor, ExecutorConfig, ExecutorError};
