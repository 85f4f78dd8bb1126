//! Error types for lifecycle transitions and signal decoding.

use thiserror::Error;

use crate::ServerState;

/// A lifecycle transition that the state machine does not allow.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("cannot apply {event} to a server in state {from}")]
pub struct TransitionError {
    pub from: ServerState,
    pub event: &'static str,
}

/// Errors that can occur when decoding a signal envelope.
#[derive(Debug, Error, Clone)]
pub enum SignalError {
    /// The envelope declares a version this build does not understand.
    #[error("unsupported signal envelope version {0}")]
    UnsupportedVersion(u64),

    /// The envelope has no version field.
    #[error("signal envelope is missing its version")]
    MissingVersion,

    /// The signal payload is invalid.
    #[error("invalid signal payload: {0}")]
    InvalidPayload(String),
}

impl From<serde_json::Error> for SignalError {
    fn from(err: serde_json::Error) -> Self {
        SignalError::InvalidPayload(err.to_string())
    }
}
