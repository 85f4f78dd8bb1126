//! # warden-events
//!
//! Lifecycle vocabulary shared by the control-plane and the collaborators
//! that report to it.
//!
//! ## Server Lifecycle
//!
//! ```text
//! pending → installing → running ⇄ stopped → removing → deleted
//!    │           │          │
//!    └───────────┴──────────┴──→ error
//! ```
//!
//! Transitions are driven by external signals (deployment outcomes, process
//! exits). [`ServerState::apply`] is the single authority on which
//! transitions are legal; it is pure so the control-plane can validate a
//! transition before it touches the store.
//!
//! ## Signals
//!
//! Collaborators deliver [`Signal`]s wrapped in a versioned
//! [`SignalEnvelope`]:
//! - Node health (`node.health`) from the health-check source
//! - Deployment events (`server.*`) from the workload deployment executor

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::{SignalError, TransitionError};
pub use types::*;
