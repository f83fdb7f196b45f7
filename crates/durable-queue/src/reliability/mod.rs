//! Reliability patterns for queue processing
//!
//! This module provides:
//! - [`race`] - Per-item timeout racing of a spawned callback
//! - [`RetrySweep`] - Cadence of the retry sweep

mod retry;
mod timeout;

pub use retry::RetrySweep;
pub use timeout::{race, Outcome};
