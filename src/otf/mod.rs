//! The on-the-fly loop.
//!
//! - [`controller::LoopController`] -- per-step state machine that decides
//!   when to call the oracle and keeps the model, active set and mapping in
//!   sync.
//! - [`runner::OtfRunner`] -- drives a controller along a trajectory and
//!   reports every step to the configured observers.

pub mod controller;
pub mod runner;

pub use controller::{ControllerConfig, LoopController, RunState, StepOutcome, StepReport};
pub use runner::{OtfRunner, RunOutcome, RunSettings};
