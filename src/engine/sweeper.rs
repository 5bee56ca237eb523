//! Background repair loop: lease-expiry sweep plus orphan reconciliation.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use super::orchestrator::{Orchestrator, SweepReport};
use crate::error::Result;

/// Runs [`Orchestrator::sweep_expired_leases`] and
/// [`Orchestrator::reconcile_orphans`] every `sweep_interval`.
#[derive(Clone)]
pub struct Sweeper {
    orchestrator: Orchestrator,
    shutdown: Arc<Notify>,
}

impl Sweeper {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Signal the loop to stop after the current tick.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Loop until [`Sweeper::shutdown`]. Tick errors are logged, never fatal.
    pub async fn run(&self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.orchestrator.config().sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_ms = self.orchestrator.config().sweep_interval.as_millis() as u64,
            "sweeper started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    info!("sweeper shutting down");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    /// One pass. Returns what the lease sweep did, or `None` if it failed.
    pub async fn tick(&self) -> Option<SweepReport> {
        let now = Utc::now();
        let report = match self.orchestrator.sweep_expired_leases(now).await {
            Ok(report) => Some(report),
            Err(e) => {
                error!(transient = e.is_transient(), "lease sweep failed: {e}");
                None
            }
        };
        if let Err(e) = self.orchestrator.reconcile_orphans(now).await {
            error!(transient = e.is_transient(), "orphan reconciliation failed: {e}");
        }
        report
    }
}
