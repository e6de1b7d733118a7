//! Atomic snapshot types passed between the stepper, the controller and the
//! oracle.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{OtfError, OtfResult};

/// A plain 3-vector as stored on the wire and in logs.
pub type Vec3 = [f64; 3];

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Immutable snapshot of the simulated system at one step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Configuration {
    /// Cartesian positions, one per atom.
    pub positions: Vec<Vec3>,
    /// Periodic cell; each row is a lattice vector.
    pub cell: [Vec3; 3],
    /// Species label of each atom (e.g. `"Si"`).
    pub species: Vec<String>,
    /// Cartesian velocities, one per atom.
    pub velocities: Vec<Vec3>,
    /// Index of the MD step this snapshot belongs to.
    pub step_index: usize,
}

impl Configuration {
    /// Build a snapshot at rest at step 0.
    pub fn new(positions: Vec<Vec3>, cell: [Vec3; 3], species: Vec<String>) -> Self {
        let velocities = vec![[0.0; 3]; positions.len()];
        Self {
            positions,
            cell,
            species,
            velocities,
            step_index: 0,
        }
    }

    /// Number of atoms.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Whether the snapshot holds no atoms.
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// The cell as a matrix whose rows are lattice vectors.
    pub fn cell_matrix(&self) -> Matrix3<f64> {
        let [a, b, c] = self.cell;
        Matrix3::new(a[0], a[1], a[2], b[0], b[1], b[2], c[0], c[1], c[2])
    }

    /// Cell volume (absolute determinant).
    pub fn volume(&self) -> f64 {
        self.cell_matrix().determinant().abs()
    }

    /// Distinct species labels in first-seen order.
    pub fn unique_species(&self) -> Vec<String> {
        let mut seen: Vec<String> = Vec::new();
        for s in &self.species {
            if !seen.contains(s) {
                seen.push(s.clone());
            }
        }
        seen
    }

    /// Check shapes and numeric sanity.
    pub fn validate(&self) -> OtfResult<()> {
        let n = self.positions.len();
        if n == 0 {
            return Err(OtfError::Structure("configuration has no atoms".into()));
        }
        if self.species.len() != n {
            return Err(OtfError::Structure(format!(
                "{} species labels for {n} positions",
                self.species.len()
            )));
        }
        if self.velocities.len() != n {
            return Err(OtfError::Structure(format!(
                "{} velocities for {n} positions",
                self.velocities.len()
            )));
        }
        let finite = |v: &Vec3| v.iter().all(|x| x.is_finite());
        if !self.positions.iter().all(finite) || !self.velocities.iter().all(finite) {
            return Err(OtfError::Structure("non-finite coordinate".into()));
        }
        if !(self.volume() > 1e-12) {
            return Err(OtfError::Structure("cell is singular".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Force provenance
// ---------------------------------------------------------------------------

/// Which calculator produced a force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForceSource {
    Surrogate,
    Mapping,
    Oracle,
}

impl ForceSource {
    /// Short label used in log headers.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Surrogate => "GP",
            Self::Mapping => "MGP",
            Self::Oracle => "DFT",
        }
    }
}

/// One atom's force for one step, tagged with its source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForceLabel {
    pub atom_index: usize,
    pub force: Vec3,
    pub source: ForceSource,
}

/// Per-atom forces and uncertainties returned by any force field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub forces: Vec<Vec3>,
    /// Standard deviation of each force component (force units, >= 0).
    pub stds: Vec<Vec3>,
    pub source: ForceSource,
}

impl Prediction {
    /// Per-atom scalar uncertainty: the largest component std.
    pub fn uncertainties(&self) -> Vec<f64> {
        self.stds
            .iter()
            .map(|s| s[0].max(s[1]).max(s[2]))
            .collect()
    }
}

/// Capability shared by every calculator that can be asked for forces with
/// uncertainties (the surrogate and its tabulated copy).
pub trait ForceField {
    fn predict(&self, configuration: &Configuration) -> OtfResult<Prediction>;
}

/// Convert a wire vector to nalgebra.
pub fn to_vector(v: &Vec3) -> Vector3<f64> {
    Vector3::new(v[0], v[1], v[2])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cubic(side: f64) -> [Vec3; 3] {
        [[side, 0.0, 0.0], [0.0, side, 0.0], [0.0, 0.0, side]]
    }

    #[test]
    fn test_validate_accepts_well_formed_snapshot() {
        let cfg = Configuration::new(
            vec![[0.0; 3], [1.0, 0.0, 0.0]],
            cubic(5.0),
            vec!["Ar".into(), "Ar".into()],
        );
        assert!(cfg.validate().is_ok());
        assert!((cfg.volume() - 125.0).abs() < 1e-9);
        assert_eq!(cfg.unique_species(), vec!["Ar".to_string()]);
    }

    #[test]
    fn test_validate_rejects_species_mismatch() {
        let mut cfg = Configuration::new(vec![[0.0; 3]], cubic(5.0), vec!["Ar".into()]);
        cfg.species.push("Ne".into());
        assert!(matches!(cfg.validate(), Err(OtfError::Structure(_))));
    }

    #[test]
    fn test_validate_rejects_flat_cell() {
        let cfg = Configuration::new(
            vec![[0.0; 3]],
            [[1.0, 0.0, 0.0], [2.0, 0.0, 0.0], [0.0, 0.0, 1.0]],
            vec!["Ar".into()],
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_uncertainty_is_largest_component() {
        let p = Prediction {
            forces: vec![[0.0; 3]; 2],
            stds: vec![[0.1, 0.3, 0.2], [0.0, 0.0, 0.05]],
            source: ForceSource::Surrogate,
        };
        assert_eq!(p.uncertainties(), vec![0.3, 0.05]);
    }
}
