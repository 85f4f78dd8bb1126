//! Background workers: signal intake and periodic maintenance.

mod maintenance;
mod signals;

pub use maintenance::{MaintenanceConfig, MaintenanceWorker, SweepReport};
pub use signals::{SignalOutcome, SignalWorker};
