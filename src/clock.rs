// =============================================================================
// Clock/Scheduler — single-writer tick authority
// =============================================================================
//
// Fires one Tick every `tick_interval`. Guarantees at most one tick in
// flight: if a tick overruns the interval, `tokio::time::interval`'s default
// `MissedTickBehavior::Burst` would fire a burst of catch-up ticks, which is
// exactly what we must not do, so it is switched to `Delay` (skip rather than
// queue). On shutdown the in-progress tick is allowed to finish before the
// loop exits.
// =============================================================================

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Runs the tick loop until `shutdown` fires, invoking `tick_fn` once per
/// period. `tick_fn` must be idempotent-safe to skip (a skipped tick is
/// simply never invoked, not queued for later).
pub struct Scheduler {
    interval: Duration,
    tick_count: AtomicU64,
}

impl Scheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            tick_count: AtomicU64::new(0),
        }
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count.load(Ordering::Relaxed)
    }

    /// Run the scheduler loop. `tick_fn` is invoked once per tick; its future
    /// is awaited to completion before the next tick is considered. If the
    /// future takes longer than `interval`, the next firing is skipped
    /// (single-flight — never queued).
    pub async fn run<F, Fut>(&self, mut shutdown: watch::Receiver<bool>, mut tick_fn: F)
    where
        F: FnMut(u64) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(interval_ms = self.interval.as_millis(), "scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let n = self.tick_count.fetch_add(1, Ordering::SeqCst) + 1;
                    debug!(tick = n, "tick fired");
                    tick_fn(n).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        warn!("scheduler draining in-flight tick and stopping");
                        break;
                    }
                }
            }
        }

        info!(total_ticks = self.tick_count(), "scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn scheduler_fires_at_configured_cadence() {
        let scheduler = Scheduler::new(Duration::from_millis(10));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = count.clone();

        let handle = tokio::spawn(async move {
            scheduler
                .run(shutdown_rx, |_n| {
                    let count = count_clone.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .await;
        });

        tokio::time::advance(Duration::from_millis(35)).await;
        tokio::task::yield_now().await;

        shutdown_tx.send(true).unwrap();
        let _ = handle.await;

        assert!(count.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn tick_count_starts_at_zero() {
        let scheduler = Scheduler::new(Duration::from_secs(3));
        assert_eq!(scheduler.tick_count(), 0);
    }
}
