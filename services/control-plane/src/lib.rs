//! warden control-plane core.
//!
//! Allocation and entity lifecycle for a game-server fleet: which
//! `(node, bind address, port)` pairs exist, which server owns each one,
//! where new servers land and how units stored in older shapes are upgraded
//! in place. The crate ships a `control-plane` binary that feeds external
//! signals into the core; the library surface is what callers and the
//! integration tests drive.

pub mod allocation;
pub mod config;
pub mod db;
pub mod error;
pub mod evolution;
pub mod provisioning;
pub mod repos;
pub mod state;
pub mod tokens;
pub mod topology;
pub mod workers;

pub use error::{Conflict, CoreError, CoreResult, ErrorKind};
pub use state::ControlPlane;
