//! Versioned envelope for signals delivered by external collaborators.
//!
//! ```json
//! { "version": 1, "signal": { "kind": "node_health", "node_id": "node_…", "online": true, "checked_at": "…" } }
//! ```
//!
//! The version is checked before the payload is decoded so a producer that
//! moved ahead of this build is rejected explicitly instead of being
//! half-understood.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use warden_id::{NodeId, ServerId};

use crate::{event_types, LifecycleEvent, SignalError};

/// The only envelope version this build understands.
pub const SIGNAL_ENVELOPE_VERSION: u64 = 1;

/// A signal from the health-check source or the deployment executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Signal {
    NodeHealth {
        node_id: NodeId,
        online: bool,
        checked_at: DateTime<Utc>,
    },
    Deployment {
        server_id: ServerId,
        event: LifecycleEvent,
    },
}

impl Signal {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::NodeHealth { .. } => event_types::NODE_HEALTH,
            Self::Deployment { event, .. } => event.event_type(),
        }
    }
}

/// Wire wrapper around a [`Signal`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub version: u64,
    pub signal: Signal,
}

impl SignalEnvelope {
    pub fn new(signal: Signal) -> Self {
        Self {
            version: SIGNAL_ENVELOPE_VERSION,
            signal,
        }
    }

    /// Decode one JSON envelope.
    pub fn decode(raw: &str) -> Result<Signal, SignalError> {
        let value: serde_json::Value = serde_json::from_str(raw)?;

        let version = value
            .get("version")
            .and_then(serde_json::Value::as_u64)
            .ok_or(SignalError::MissingVersion)?;

        match version {
            SIGNAL_ENVELOPE_VERSION => {
                let envelope: SignalEnvelope = serde_json::from_value(value)?;
                Ok(envelope.signal)
            }
            other => Err(SignalError::UnsupportedVersion(other)),
        }
    }

    pub fn encode(&self) -> Result<String, SignalError> {
        Ok(serde_json::to_string(self)?)
    }
}
