//! Power-cycle state machine.

pub mod controller;
pub mod state;

pub use controller::{CycleConfig, CycleController};
pub use state::{BurstReport, Cycle, CycleError, CycleOutcome, CycleState, SuccessMode};
