//! warden control plane
//!
//! Runs the allocation and lifecycle core as a long-lived process. Signals
//! from the health checker and the deployment executor arrive as
//! newline-delimited JSON envelopes on stdin.

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use warden_control_plane::{
    config,
    db::Database,
    workers::{MaintenanceConfig, MaintenanceWorker, SignalWorker},
    ControlPlane,
};
use warden_events::SignalEnvelope;

const SIGNAL_BUFFER: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to WARDEN_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting warden control plane");

    let db = match Database::connect(&config.database).await {
        Ok(db) => {
            info!("Database connection established");
            db
        }
        Err(e) => {
            error!(error = %e, "Failed to connect to database");
            return Err(e.into());
        }
    };

    if config.dev_mode {
        info!("Applying schema (dev mode)");
        if let Err(e) = db.apply_schema().await {
            error!(error = %e, "Failed to apply schema");
            return Err(e.into());
        }
    }

    let plane = ControlPlane::new(db);

    // A failed table upgrade is fatal: nothing may read half-understood units.
    match plane.evolution().ensure_all().await {
        Ok(reports) => {
            for report in reports {
                info!(
                    table = report.table,
                    added_columns = report.added_columns.len(),
                    backfilled_rows = report.backfilled_rows,
                    "Schema evolution checked"
                );
            }
        }
        Err(e) => {
            error!(error = %e, "Schema evolution failed");
            return Err(e.into());
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_BUFFER);

    let signal_worker = SignalWorker::new(plane.clone());
    let signal_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            signal_worker.run(signal_rx, shutdown_rx).await;
        }
    });

    let maintenance_worker = MaintenanceWorker::new(
        plane.clone(),
        MaintenanceConfig {
            interval: config.sweep_interval,
            node_stale_after: config.node_stale_after,
            reservation_ttl: config.reservation_ttl,
        },
    );
    let maintenance_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            maintenance_worker.run(shutdown_rx).await;
        }
    });

    // Stdin reader: one envelope per line
    let reader_handle = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match SignalEnvelope::decode(&line) {
                    Ok(signal) => {
                        if signal_tx.send(signal).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Dropping undecodable signal"),
                },
                Ok(None) => {
                    info!("Signal input closed");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read signal input");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = reader_handle => {
            if let Err(e) = result {
                error!(error = %e, "Signal reader task panicked");
            }
            // Keep sweeping until told to stop.
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, signal_handle).await {
        warn!(error = %e, "Signal worker did not shut down in time");
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, maintenance_handle).await {
        warn!(error = %e, "Maintenance worker did not shut down in time");
    }

    info!("Control plane shutdown complete");
    Ok(())
}
