//! Periodic overdue sweep.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::billing_service::BillingService;

/// Scheduler runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    pub runs: u64,
    pub invoices_updated: u64,
    pub failed_runs: u64,
}

/// Handle to control a running scheduler.
#[derive(Debug)]
pub struct OverdueSweepHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<SweepStats>>,
}

impl OverdueSweepHandle {
    /// Request shutdown and wait for the current run to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }

    pub fn stats(&self) -> SweepStats {
        self.stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

/// Runs [`BillingService::run_overdue_sweep`] on a fixed interval.
///
/// The first run happens immediately. A run that overlaps a manual status
/// change is safe: the per-invoice compare-and-set makes the losing side a
/// skipped candidate.
#[derive(Debug)]
pub struct OverdueSweepScheduler {
    service: BillingService,
    interval: Duration,
}

impl OverdueSweepScheduler {
    pub fn new(service: BillingService, interval: Duration) -> Self {
        Self { service, interval }
    }

    /// Spawn on the current tokio runtime.
    pub fn spawn(self) -> OverdueSweepHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(SweepStats::default()));
        let join = tokio::spawn(sweep_loop(self, shutdown_rx, stats.clone()));

        OverdueSweepHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }
}

async fn sweep_loop(
    scheduler: OverdueSweepScheduler,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<SweepStats>>,
) {
    info!(interval_secs = scheduler.interval.as_secs(), "overdue sweep scheduler started");

    let mut ticker = tokio::time::interval(scheduler.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let result = scheduler.service.run_overdue_sweep().await;
                if let Ok(mut s) = stats.lock() {
                    s.runs += 1;
                    match &result {
                        Ok(report) => s.invoices_updated += report.updated_count as u64,
                        Err(_) => s.failed_runs += 1,
                    }
                }
                if let Err(e) = result {
                    error!(error = %e, "overdue sweep failed");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("overdue sweep scheduler stopped");
}
