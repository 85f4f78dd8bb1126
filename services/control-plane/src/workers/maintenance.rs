use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::error::CoreResult;
use crate::state::ControlPlane;

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub interval: Duration,
    pub node_stale_after: Duration,
    pub reservation_ttl: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            node_stale_after: Duration::from_secs(90),
            reservation_ttl: Duration::from_secs(300),
        }
    }
}

/// What one sweep changed or found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub nodes_marked_offline: u64,
    pub reservations_released: u64,
    pub binding_mismatches: usize,
}

pub struct MaintenanceWorker {
    plane: ControlPlane,
    config: MaintenanceConfig,
}

impl MaintenanceWorker {
    pub fn new(plane: ControlPlane, config: MaintenanceConfig) -> Self {
        Self { plane, config }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            node_stale_secs = self.config.node_stale_after.as_secs(),
            reservation_ttl_secs = self.config.reservation_ttl.as_secs(),
            "Starting maintenance worker"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_sweep().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Maintenance worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn run_sweep(&self) {
        let mut report = SweepReport::default();

        match self.mark_stale_nodes().await {
            Ok(count) => {
                if count > 0 {
                    warn!(nodes = count, "Marked nodes with stale health checks offline");
                }
                report.nodes_marked_offline = count;
            }
            Err(e) => error!(error = %e, "Failed to mark stale nodes offline"),
        }

        match self.release_stale_reservations().await {
            Ok(count) => report.reservations_released = count,
            Err(e) => warn!(error = %e, "Failed to release stale reservations"),
        }

        match self.plane.allocations().audit_bindings().await {
            Ok(mismatches) => {
                for mismatch in &mismatches {
                    warn!(?mismatch, "Allocation binding mismatch");
                }
                report.binding_mismatches = mismatches.len();
            }
            Err(e) => warn!(error = %e, "Failed to audit allocation bindings"),
        }

        if report != SweepReport::default() {
            info!(
                nodes_marked_offline = report.nodes_marked_offline,
                reservations_released = report.reservations_released,
                binding_mismatches = report.binding_mismatches,
                "Maintenance sweep complete"
            );
        }
    }

    /// Nodes not heard from within `node_stale_after` go offline.
    pub async fn mark_stale_nodes(&self) -> CoreResult<u64> {
        let threshold = cutoff(self.config.node_stale_after);
        self.plane.nodes().mark_stale_offline(threshold).await
    }

    /// Reservations older than `reservation_ttl` that never got a server go back
    /// to the pool.
    pub async fn release_stale_reservations(&self) -> CoreResult<u64> {
        let before = cutoff(self.config.reservation_ttl);
        self.plane.allocations().release_stale_reservations(before).await
    }
}

/// The instant `age` ago, clamped to the earliest representable time.
fn cutoff(age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = MaintenanceConfig::default();
        assert_eq!(config.interval.as_secs(), 30);
        assert!(config.reservation_ttl > config.node_stale_after);
    }

    #[test]
    fn test_cutoff_clamps() {
        assert_eq!(cutoff(Duration::MAX), DateTime::<Utc>::MIN_UTC);
        let recent = cutoff(Duration::from_secs(90));
        let age = Utc::now() - recent;
        assert!(age.num_seconds() >= 90 && age.num_seconds() < 100);
    }
}
