//! Domain error taxonomy of the control-plane core.
//!
//! Store-level failures ([`DbError`]) are translated into these kinds before
//! they leave the core; callers never see a raw `sqlx` error.

use thiserror::Error;
use warden_events::TransitionError;
use warden_id::{AllocationId, NodeId, RegionId, ServerId};
use warden_networking::NetworkError;

use crate::db::DbError;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Coarse classification used by outer layers to pick a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    NoCapacity,
    NoAvailableRegion,
    StoreUnavailable,
    MigrationFailed,
    Invalid,
    Internal,
}

/// Errors surfaced by the allocation and lifecycle core.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error(transparent)]
    Conflict(#[from] Conflict),

    #[error("no free allocation on node {node_id}")]
    NoCapacity { node_id: NodeId },

    #[error("no region reachable from {region_id} can place a server")]
    NoAvailableRegion { region_id: RegionId },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("schema evolution of table {table} failed: {reason}")]
    MigrationFailed { table: &'static str, reason: String },

    #[error("invalid {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

/// Uniqueness and invariant violations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Conflict {
    #[error("allocation {allocation_id} is already bound to server {bound_to}")]
    AlreadyBound {
        allocation_id: AllocationId,
        bound_to: ServerId,
    },

    #[error("{bind_address}:{port} already exists on node {node_id}")]
    DuplicatePort {
        node_id: NodeId,
        bind_address: String,
        port: u16,
    },

    #[error("{entity} already exists: {detail}")]
    AlreadyExists {
        entity: &'static str,
        detail: String,
    },

    #[error("allocation {allocation_id}: {reason}")]
    AllocationConflict {
        allocation_id: AllocationId,
        reason: &'static str,
    },

    #[error("node {node_id} still has {assigned} assigned allocations")]
    NodeInUse { node_id: NodeId, assigned: i64 },

    #[error("{entity} {id} is still referenced by {count} servers")]
    InUse {
        entity: &'static str,
        id: String,
        count: i64,
    },

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("server {server_id} changed state concurrently")]
    StaleState { server_id: ServerId },

    #[error("setting the fallback of region {region_id} would form a cycle")]
    FallbackCycle { region_id: RegionId },

    #[error("constraint violated: {0}")]
    Constraint(String),
}

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::NoCapacity { .. } => ErrorKind::NoCapacity,
            Self::NoAvailableRegion { .. } => ErrorKind::NoAvailableRegion,
            Self::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            Self::MigrationFailed { .. } => ErrorKind::MigrationFailed,
            Self::Invalid { .. } => ErrorKind::Invalid,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Transient failures that are safe to retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

impl From<DbError> for CoreError {
    fn from(err: DbError) -> Self {
        if err.is_transient() {
            return Self::StoreUnavailable(err.to_string());
        }
        if err.is_unique_violation() {
            return Conflict::AlreadyExists {
                entity: "record",
                detail: err.to_string(),
            }
            .into();
        }
        if err.is_foreign_key_violation() {
            return Conflict::Constraint(err.to_string()).into();
        }
        Self::Internal(err.to_string())
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        DbError::Query(err).into()
    }
}

impl From<TransitionError> for CoreError {
    fn from(err: TransitionError) -> Self {
        Conflict::InvalidTransition(err).into()
    }
}

impl From<NetworkError> for CoreError {
    fn from(err: NetworkError) -> Self {
        let field = match err {
            NetworkError::InvalidAddress(_) => "bind_address",
            _ => "port",
        };
        Self::invalid(field, err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization error: {err}"))
    }
}

/// Translate a unique violation into a specific conflict, anything else
/// through the default mapping.
pub(crate) fn on_unique(err: sqlx::Error, conflict: impl FnOnce() -> Conflict) -> CoreError {
    let err = DbError::Query(err);
    if err.is_unique_violation() {
        conflict().into()
    } else {
        err.into()
    }
}

/// Translate a foreign key violation, typically a missing parent row.
pub(crate) fn on_foreign_key(err: sqlx::Error, missing: impl FnOnce() -> CoreError) -> CoreError {
    let err = DbError::Query(err);
    if err.is_foreign_key_violation() {
        missing()
    } else {
        err.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn timeout_is_retryable_store_unavailable() {
        let err: CoreError = DbError::Timeout(Duration::from_secs(5)).into();
        assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
        assert!(err.is_retryable());
    }

    #[test]
    fn pool_timeout_is_retryable() {
        let err: CoreError = sqlx::Error::PoolTimedOut.into();
        assert!(err.is_retryable());
    }

    #[test]
    fn conflicts_are_not_retryable() {
        let err: CoreError = Conflict::NodeInUse {
            node_id: NodeId::new(),
            assigned: 2,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(!err.is_retryable());
    }

    #[test]
    fn network_errors_name_their_field() {
        let err: CoreError = NetworkError::InvalidAddress("x".into()).into();
        assert!(matches!(
            err,
            CoreError::Invalid {
                field: "bind_address",
                ..
            }
        ));
    }
}
