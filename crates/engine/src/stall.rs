//! Periodic recovery of jobs whose lock expired without a report.

use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use reportsmith_core::{Clock, QueueName, SystemClock};
use reportsmith_store::{JobStore, ReclaimOutcome, StoreError};

#[derive(Debug, Clone)]
pub struct StallMonitorConfig {
    /// How often to sweep for expired locks. Keep this below the lock
    /// duration so stalled jobs are noticed within one lock lifetime.
    pub sweep_interval: Duration,
    /// Reclaims allowed before a job is failed as repeatedly stalled.
    pub stall_cap: u32,
}

impl Default for StallMonitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(15),
            stall_cap: 3,
        }
    }
}

impl StallMonitorConfig {
    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    pub fn with_stall_cap(mut self, stall_cap: u32) -> Self {
        self.stall_cap = stall_cap;
        self
    }
}

/// Result of one sweep over one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub requeued: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Background sweeper for one queue.
pub struct StallMonitor;

pub struct StallMonitorHandle {
    shutdown_tx: mpsc::Sender<()>,
    join: thread::JoinHandle<()>,
}

impl StallMonitorHandle {
    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.join();
    }
}

impl StallMonitor {
    pub fn spawn(
        store: Arc<dyn JobStore>,
        queue: QueueName,
        config: StallMonitorConfig,
    ) -> StallMonitorHandle {
        Self::spawn_with_clock(store, queue, config, Arc::new(SystemClock))
    }

    pub fn spawn_with_clock(
        store: Arc<dyn JobStore>,
        queue: QueueName,
        config: StallMonitorConfig,
        clock: Arc<dyn Clock>,
    ) -> StallMonitorHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let join = thread::Builder::new()
            .name(format!("stall-monitor-{queue}"))
            .spawn(move || {
                info!(queue = %queue, sweep_interval_ms = config.sweep_interval.as_millis() as u64, "stall monitor started");
                loop {
                    match shutdown_rx.recv_timeout(config.sweep_interval) {
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                    }
                    match sweep_once(&*store, queue, &config, &*clock) {
                        Ok(report) if report.requeued > 0 || report.failed > 0 => {
                            info!(
                                queue = %queue,
                                requeued = report.requeued,
                                failed = report.failed,
                                skipped = report.skipped,
                                "stalled jobs reclaimed"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(queue = %queue, error = %e, "stall sweep failed"),
                    }
                }
                debug!(queue = %queue, "stall monitor stopped");
            })
            .expect("failed to spawn stall monitor thread");

        StallMonitorHandle { shutdown_tx, join }
    }
}

/// One pass: list jobs with expired locks and reclaim each. Safe to run
/// concurrently from several monitors; jobs picked up elsewhere in the
/// meantime come back as `Skipped`.
pub fn sweep_once(
    store: &dyn JobStore,
    queue: QueueName,
    config: &StallMonitorConfig,
    clock: &dyn Clock,
) -> Result<SweepReport, StoreError> {
    let now = clock.now();
    let mut report = SweepReport::default();

    for job in store.list_stalled(queue, now)? {
        let job_id = job.id;
        match store.reclaim(job_id, config.stall_cap) {
            Ok(ReclaimOutcome::Requeued) => {
                warn!(job_id = %job_id, queue = %queue, "stalled job requeued");
                report.requeued += 1;
            }
            Ok(ReclaimOutcome::Failed) => {
                warn!(job_id = %job_id, queue = %queue, stall_cap = config.stall_cap, "job stalled too many times; failed");
                report.failed += 1;
            }
            Ok(ReclaimOutcome::Skipped) => report.skipped += 1,
            Err(StoreError::NotFound(_)) => report.skipped += 1,
            Err(e) => return Err(e),
        }
    }

    Ok(report)
}
