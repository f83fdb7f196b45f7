//! Retry sweep cadence

use std::time::Duration;

use tokio::time::Instant;

/// Decides when the controller loop should release failed items again
///
/// The sweep is piggybacked on the processing loop instead of running on
/// its own timer, so a paused or closed controller never sweeps.
#[derive(Debug)]
pub struct RetrySweep {
    interval: Duration,
    last: Instant,
}

impl RetrySweep {
    /// Create a tracker whose first sweep is due one `interval` from now
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Instant::now(),
        }
    }

    /// Returns true and restarts the interval if a sweep is due
    pub fn due(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last) >= self.interval {
            self.last = now;
            true
        } else {
            false
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sweep_not_due_immediately() {
        let mut sweep = RetrySweep::new(Duration::from_secs(5));
        assert!(!sweep.due());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_due_after_interval() {
        let mut sweep = RetrySweep::new(Duration::from_millis(100));

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(sweep.due());
        // Restarted
        assert!(!sweep.due());

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(sweep.due());
    }

    #[test]
    fn test_zero_interval_always_due() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            let mut sweep = RetrySweep::new(Duration::ZERO);
            assert!(sweep.due());
            assert!(sweep.due());
            assert_eq!(sweep.interval(), Duration::ZERO);
        });
    }
}
