//! Applies node health and deployment signals as they arrive.

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};
use warden_events::Signal;

use crate::error::{Conflict, CoreError, CoreResult};
use crate::state::ControlPlane;

/// Result of handling one signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    Applied,
    /// Out of order, redelivered or otherwise not applicable. Not an error.
    Ignored,
}

pub struct SignalWorker {
    plane: ControlPlane,
}

impl SignalWorker {
    pub fn new(plane: ControlPlane) -> Self {
        Self { plane }
    }

    /// Consume signals until the channel closes or shutdown is signaled.
    #[instrument(skip_all)]
    pub async fn run(&self, mut signals: mpsc::Receiver<Signal>, mut shutdown: watch::Receiver<bool>) {
        info!("Starting signal worker");

        loop {
            tokio::select! {
                received = signals.recv() => {
                    let Some(signal) = received else {
                        info!("Signal channel closed");
                        break;
                    };
                    let event_type = signal.event_type();
                    if let Err(e) = self.handle(signal).await {
                        warn!(event_type, error = %e, retryable = e.is_retryable(), "Failed to apply signal");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Signal worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Apply one signal.
    pub async fn handle(&self, signal: Signal) -> CoreResult<SignalOutcome> {
        match signal {
            Signal::NodeHealth {
                node_id,
                online,
                checked_at,
            } => {
                let applied = self
                    .plane
                    .nodes()
                    .record_health(node_id, online, checked_at)
                    .await?;
                Ok(if applied {
                    SignalOutcome::Applied
                } else {
                    SignalOutcome::Ignored
                })
            }
            Signal::Deployment { server_id, event } => {
                match self.plane.transition_server(server_id, event).await {
                    Ok(_) => Ok(SignalOutcome::Applied),
                    Err(CoreError::Conflict(Conflict::InvalidTransition(e))) => {
                        debug!(server_id = %server_id, error = %e, "Ignoring inapplicable deployment event");
                        Ok(SignalOutcome::Ignored)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }
}
