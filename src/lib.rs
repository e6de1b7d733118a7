//! otf-md: on-the-fly active-learning molecular dynamics.
//!
//! A Gaussian-process surrogate predicts forces together with a per-atom
//! uncertainty. When the uncertainty on some atom crosses a tolerance, the
//! frame is sent to an expensive reference calculator (the oracle), the
//! labels are folded into a bounded active set and the surrogate is updated
//! before the trajectory continues.

pub mod config;
pub mod error;
pub mod learning;
pub mod log;
pub mod mapping;
pub mod md;
pub mod model;
pub mod oracle;
pub mod otf;
pub mod structure;

pub use config::OtfConfig;
pub use error::{OracleError, OtfError, OtfResult};
pub use otf::{LoopController, OtfRunner};
