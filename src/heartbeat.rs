//! Periodic background tasks.
//!
//! Every maintenance loop of the master (persistence scheduler, persistence
//! checker, TTL checker) is a [`HeartbeatExecutor`] driven by the same
//! [`spawn`] primitive: a ticker that runs one heartbeat at a time and stops
//! when the [`ShutdownCoordinator`] fires.

use crate::error::Result;
use crate::shutdown::ShutdownCoordinator;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// One periodic task.
#[async_trait]
pub trait HeartbeatExecutor: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Run one round.
    async fn heartbeat(&self) -> Result<()>;
}

/// Run statistics of a heartbeat.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatStats {
    pub runs: u64,
    pub failures: u64,
    pub last_error: Option<String>,
    pub last_duration: Duration,
}

#[derive(Default)]
struct StatsCell {
    runs: AtomicU64,
    failures: AtomicU64,
    last: Mutex<(Option<String>, Duration)>,
}

impl StatsCell {
    fn record(&self, result: &Result<()>, elapsed: Duration) {
        self.runs.fetch_add(1, Ordering::Relaxed);
        let mut last = self.last.lock();
        last.1 = elapsed;
        if let Err(e) = result {
            self.failures.fetch_add(1, Ordering::Relaxed);
            last.0 = Some(e.to_string());
        }
    }
}

/// Handle of a running heartbeat.
pub struct HeartbeatHandle {
    name: String,
    stats: Arc<StatsCell>,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> HeartbeatStats {
        let last = self.stats.last.lock();
        HeartbeatStats {
            runs: self.stats.runs.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
            last_error: last.0.clone(),
            last_duration: last.1,
        }
    }

    /// Wait for the task to stop, aborting it after `timeout`.
    pub async fn join(self, timeout: Duration) {
        let abort = self.task.abort_handle();
        if tokio::time::timeout(timeout, self.task).await.is_err() {
            warn!(heartbeat = %self.name, "Heartbeat did not stop in time, aborting");
            abort.abort();
        }
    }
}

/// Run `executor` every `interval` until shutdown.
///
/// A failed round is logged and counted; the next round runs on schedule.
pub fn spawn(executor: Arc<dyn HeartbeatExecutor>, interval: Duration, shutdown: ShutdownCoordinator) -> HeartbeatHandle {
    let name = executor.name().to_string();
    let stats = Arc::new(StatsCell::default());
    let task = {
        let name = name.clone();
        let stats = Arc::clone(&stats);
        tokio::spawn(async move {
            info!(heartbeat = %name, interval_ms = interval.as_millis() as u64, "Heartbeat started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let start = Instant::now();
                        let result = executor.heartbeat().await;
                        let elapsed = start.elapsed();
                        match &result {
                            Ok(()) => debug!(heartbeat = %name, elapsed_ms = elapsed.as_millis() as u64, "Heartbeat completed"),
                            Err(e) => warn!(heartbeat = %name, error = %e, "Heartbeat failed"),
                        }
                        stats.record(&result, elapsed);
                    }
                    _ = shutdown.wait_for_shutdown() => {
                        info!(heartbeat = %name, "Heartbeat stopping");
                        break;
                    }
                }
            }
        })
    };
    HeartbeatHandle { name, stats, task }
}
