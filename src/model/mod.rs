//! The Gaussian-process force surrogate.
//!
//! This module provides:
//! - [`hyps`] -- kernel body-order selection and the hyperparameter vector.
//! - [`kernel::ForceKernel`] -- force/force covariance between environments.
//! - [`gp::GaussianProcess`] -- the conditioned model: incremental updates,
//!   prediction with per-component std, likelihood and its gradient.
//! - [`optimizer`] -- bounded gradient ascent on the log marginal likelihood.
//! - [`checkpoint::ModelCheckpoint`] -- JSON persistence of a trained model.

pub mod checkpoint;
pub mod gp;
pub mod hyps;
pub mod kernel;
pub mod optimizer;

pub use checkpoint::ModelCheckpoint;
pub use gp::{GaussianProcess, SurrogateState, UpdateKind};
pub use hyps::{Hyperparameters, KernelKind, SquaredExponential};
pub use kernel::ForceKernel;
pub use optimizer::{OptimizationReport, OptimizerConfig};
