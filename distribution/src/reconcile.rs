//! Claim reconciliation
//!
//! Finishes claims whose share was assigned but whose fund transfer never
//! committed (crash or store error between the two claim phases).

use crate::{
    engine::DistributionEngine,
    notify::{Notice, Pusher},
    Result,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Transfers committed by this pass
    pub settled: usize,
    /// Markers found already settled
    pub already_settled: usize,
    /// Transfers that failed again
    pub failed: usize,
}

/// Settles pending claims
#[derive(Debug)]
pub struct Reconciler {
    engine: Arc<DistributionEngine>,
    pusher: Option<Pusher>,
    interval: Duration,
}

impl Reconciler {
    /// Create reconciler; claimants of repaired claims are notified through `pusher`
    pub fn new(engine: Arc<DistributionEngine>, interval: Duration, pusher: Option<Pusher>) -> Self {
        Self {
            engine,
            pusher,
            interval,
        }
    }

    /// Settle every pending claim once
    pub fn run_once(&self) -> Result<ReconcileReport> {
        let pending = self.engine.pending_settlements()?;
        let mut report = ReconcileReport::default();

        for item in pending {
            match self.engine.settle_claim(item.distribution_id, item.share_index) {
                Ok(Some(settled)) => {
                    report.settled += 1;
                    info!(
                        distribution_id = settled.distribution_id,
                        share_index = settled.share_index,
                        claimant = %settled.claimant,
                        amount = %settled.amount,
                        "Pending claim settled"
                    );
                    if let Some(pusher) = &self.pusher {
                        pusher.push(
                            settled.claimant,
                            Notice::ClaimSettled {
                                distribution_id: settled.distribution_id,
                                claimant_name: settled.claimant_name,
                                asset: settled.asset,
                                amount: settled.amount,
                            },
                        );
                    }
                }
                Ok(None) => report.already_settled += 1,
                Err(e) => {
                    report.failed += 1;
                    error!(
                        distribution_id = item.distribution_id,
                        share_index = item.share_index,
                        internal = e.is_internal(),
                        error = %e,
                        "Pending claim still cannot be settled"
                    );
                }
            }
        }

        if report.settled + report.failed > 0 {
            warn!(
                settled = report.settled,
                failed = report.failed,
                "Reconciliation pass repaired claims"
            );
        }
        Ok(report)
    }

    /// Reconcile every `interval` until `shutdown` flips to `true`
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let this = Arc::clone(&self);
                    match tokio::task::spawn_blocking(move || this.run_once()).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => error!(error = %e, "Reconciliation pass failed"),
                        Err(e) => error!(error = %e, "Reconciliation task failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Reconciler stopped");
    }
}
