//! Trajectory integration.
//!
//! The loop controller only produces forces; a [`Stepper`] turns them into
//! the next frame. [`verlet::VerletStepper`] is the built-in integrator.

pub mod verlet;

pub use verlet::{maxwell_boltzmann, VerletConfig, VerletStepper};

use crate::error::OtfResult;
use crate::structure::{Configuration, Vec3};

/// Advances a frame by one time step under the given forces.
pub trait Stepper {
    fn advance(&mut self, configuration: &Configuration, forces: &[Vec3]) -> OtfResult<Configuration>;

    /// Simulated time per step.
    fn time_step(&self) -> f64;
}
