//! The ground-truth calculator interface and its wire types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::OracleError;
use crate::structure::{Configuration, Vec3};

/// What the oracle is sent: the full frame plus static calculator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleRequest {
    pub step_index: usize,
    pub positions: Vec<Vec3>,
    pub cell: [Vec3; 3],
    pub species: Vec<String>,
    /// Passed through verbatim from the run configuration.
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl OracleRequest {
    pub fn new(configuration: &Configuration, parameters: &serde_json::Value) -> Self {
        Self {
            step_index: configuration.step_index,
            positions: configuration.positions.clone(),
            cell: configuration.cell,
            species: configuration.species.clone(),
            parameters: parameters.clone(),
        }
    }
}

/// Ground-truth forces on every atom of a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleOutput {
    pub forces: Vec<Vec3>,
    #[serde(default)]
    pub energy: Option<f64>,
}

impl OracleOutput {
    /// Reject outputs that do not describe `n_atoms` finite forces.
    pub fn validate(self, n_atoms: usize) -> Result<Self, OracleError> {
        if self.forces.len() != n_atoms {
            return Err(OracleError::AtomCount {
                expected: n_atoms,
                got: self.forces.len(),
            });
        }
        if !self.forces.iter().flatten().all(|f| f.is_finite()) {
            return Err(OracleError::Malformed("non-finite force component".into()));
        }
        if matches!(self.energy, Some(e) if !e.is_finite()) {
            return Err(OracleError::Malformed("non-finite energy".into()));
        }
        Ok(self)
    }
}

/// Convert a configured per-call limit, rejecting values no `Duration` can
/// hold.
pub fn timeout_from_secs(secs: f64) -> Result<Duration, OracleError> {
    if !(secs > 0.0) {
        return Err(OracleError::InvalidTimeout(secs));
    }
    Duration::try_from_secs_f64(secs).map_err(|_| OracleError::InvalidTimeout(secs))
}

/// An expensive, trusted force calculator.
///
/// One call evaluates one whole frame; the caller waits for it to finish
/// and treats any error as fatal.
#[allow(async_fn_in_trait)]
pub trait Oracle: Send + Sync {
    async fn evaluate(&self, configuration: &Configuration) -> Result<OracleOutput, OracleError>;

    /// Short label for logs.
    fn name(&self) -> &str;
}
