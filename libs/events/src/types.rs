//! Server lifecycle states and the events that move servers between them.

use serde::{Deserialize, Serialize};

use crate::TransitionError;

// =============================================================================
// Event Type Constants
// =============================================================================

/// All signal and lifecycle event names as constants.
pub mod event_types {
    // Node
    pub const NODE_HEALTH: &str = "node.health";

    // Server
    pub const SERVER_INSTALL_STARTED: &str = "server.install_started";
    pub const SERVER_INSTALL_SUCCEEDED: &str = "server.install_succeeded";
    pub const SERVER_INSTALL_FAILED: &str = "server.install_failed";
    pub const SERVER_STARTED: &str = "server.started";
    pub const SERVER_STOPPED: &str = "server.stopped";
    pub const SERVER_CRASHED: &str = "server.crashed";
    pub const SERVER_REINSTALL_REQUESTED: &str = "server.reinstall_requested";
    pub const SERVER_REMOVAL_REQUESTED: &str = "server.removal_requested";
    pub const SERVER_REMOVED: &str = "server.removed";
}

// =============================================================================
// Server State
// =============================================================================

/// Lifecycle state of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Pending,
    Installing,
    Running,
    Stopped,
    Removing,
    Deleted,
    Error,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Installing => "installing",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Removing => "removing",
            Self::Deleted => "deleted",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "installing" => Some(Self::Installing),
            "running" => Some(Self::Running),
            "stopped" => Some(Self::Stopped),
            "removing" => Some(Self::Removing),
            "deleted" => Some(Self::Deleted),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Apply an externally reported event.
    ///
    /// Redelivered events are rejected like any other illegal transition;
    /// callers decide whether a rejection is worth surfacing.
    pub fn apply(self, event: &LifecycleEvent) -> Result<ServerState, TransitionError> {
        use LifecycleEvent as E;
        use ServerState as S;

        let next = match (self, event) {
            (S::Pending, E::InstallStarted) => S::Installing,
            (S::Installing, E::InstallSucceeded) => S::Running,
            (S::Running, E::Stopped) => S::Stopped,
            (S::Stopped, E::Started) => S::Running,
            (S::Stopped | S::Error, E::ReinstallRequested) => S::Installing,
            (S::Pending | S::Installing, E::InstallFailed { .. }) => S::Error,
            (S::Running, E::Crashed { .. }) => S::Error,
            _ => {
                return Err(TransitionError {
                    from: self,
                    event: event.event_type(),
                })
            }
        };

        Ok(next)
    }

    /// Enter `removing`. Allowed from every live state; re-entering is a no-op.
    pub fn begin_removal(self) -> Result<ServerState, TransitionError> {
        match self {
            Self::Deleted => Err(TransitionError {
                from: self,
                event: event_types::SERVER_REMOVAL_REQUESTED,
            }),
            _ => Ok(Self::Removing),
        }
    }

    /// Leave `removing` once the row is gone.
    pub fn finish_removal(self) -> Result<ServerState, TransitionError> {
        match self {
            Self::Removing => Ok(Self::Deleted),
            _ => Err(TransitionError {
                from: self,
                event: event_types::SERVER_REMOVED,
            }),
        }
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Lifecycle Events
// =============================================================================

/// An event reported by the deployment executor about a single server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    InstallStarted,
    InstallSucceeded,
    InstallFailed { reason: String },
    Started,
    Stopped,
    Crashed { reason: String },
    ReinstallRequested,
}

impl LifecycleEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::InstallStarted => event_types::SERVER_INSTALL_STARTED,
            Self::InstallSucceeded => event_types::SERVER_INSTALL_SUCCEEDED,
            Self::InstallFailed { .. } => event_types::SERVER_INSTALL_FAILED,
            Self::Started => event_types::SERVER_STARTED,
            Self::Stopped => event_types::SERVER_STOPPED,
            Self::Crashed { .. } => event_types::SERVER_CRASHED,
            Self::ReinstallRequested => event_types::SERVER_REINSTALL_REQUESTED,
        }
    }

    /// Failure reason carried by the event, if any.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::InstallFailed { reason } | Self::Crashed { reason } => Some(reason),
            _ => None,
        }
    }
}
