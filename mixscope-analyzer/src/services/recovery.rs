//! Periodic orphan recovery sweep

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::orchestrator::Orchestrator;

/// Run [`Orchestrator::recover_orphans`] every `interval` until `shutdown` fires
pub fn spawn_recovery_sweep(
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_s = interval.as_secs(), "Orphan recovery sweep started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match orchestrator.recover_orphans().await {
                Ok(report) if report.recovered.is_empty() && report.quarantined.is_empty() => {
                    debug!("Orphan sweep: nothing to recover");
                }
                Ok(report) => info!(
                    recovered = report.recovered.len(),
                    quarantined = report.quarantined.len(),
                    "Orphan sweep finished"
                ),
                Err(e) => warn!(error = %e, "Orphan sweep failed"),
            }
        }

        debug!("Orphan recovery sweep stopped");
    })
}
