//! Atomic configurations and the local-environment descriptors derived from
//! them.
//!
//! - [`types::Configuration`] -- the immutable per-step snapshot.
//! - [`types::Prediction`] / [`types::ForceLabel`] -- forces with provenance.
//! - [`env::AtomicEnvironment`] -- the neighbourhood of one atom within the
//!   model cutoffs, the unit the surrogate learns from.

pub mod env;
pub mod types;

pub use env::{environments, AtomicEnvironment, Bond, Cutoffs, Triplet};
pub use types::{Configuration, ForceField, ForceLabel, ForceSource, Prediction, Vec3};
