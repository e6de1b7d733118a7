//! The training buffer the surrogate conditions on.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{OtfError, OtfResult};
use crate::structure::{AtomicEnvironment, Configuration, Cutoffs, Vec3};

/// Which step and atom a label came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Provenance {
    pub step_index: usize,
    pub atom_index: usize,
}

/// One oracle-labelled environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingPoint {
    pub environment: AtomicEnvironment,
    pub label: Vec3,
    pub provenance: Provenance,
}

/// Build training points for `selected` atoms of `configuration` from the
/// oracle's full-frame forces, in ascending atom order.
pub fn training_points(
    configuration: &Configuration,
    forces: &[Vec3],
    selected: &[usize],
    cutoffs: &Cutoffs,
) -> OtfResult<Vec<TrainingPoint>> {
    if forces.len() != configuration.len() {
        return Err(OtfError::Structure(format!(
            "{} forces for {} atoms",
            forces.len(),
            configuration.len()
        )));
    }
    let mut atoms = selected.to_vec();
    atoms.sort_unstable();
    atoms.dedup();
    atoms
        .into_iter()
        .map(|atom| {
            let environment = AtomicEnvironment::new(configuration, atom, cutoffs)?;
            Ok(TrainingPoint {
                environment,
                label: forces[atom],
                provenance: Provenance {
                    step_index: configuration.step_index,
                    atom_index: atom,
                },
            })
        })
        .collect()
}

/// What one [`ActiveSet::extend`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtendReport {
    pub added: usize,
    pub evicted: usize,
}

/// Insertion-ordered training points with an optional size cap.
///
/// `version` changes on every mutation; `generation` changes only when
/// points are evicted, which tells the surrogate an incremental update is
/// no longer possible.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActiveSet {
    points: Vec<TrainingPoint>,
    cap: Option<usize>,
    version: u64,
    generation: u64,
}

impl ActiveSet {
    pub fn new(cap: Option<usize>) -> OtfResult<Self> {
        if cap == Some(0) {
            return Err(OtfError::Config("active set cap must be positive".into()));
        }
        Ok(Self {
            cap,
            ..Self::default()
        })
    }

    pub fn points(&self) -> &[TrainingPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn cap(&self) -> Option<usize> {
        self.cap
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Atoms that already carry a label from `step_index`.
    pub fn labelled_atoms(&self, step_index: usize) -> HashSet<usize> {
        self.points
            .iter()
            .filter(|p| p.provenance.step_index == step_index)
            .map(|p| p.provenance.atom_index)
            .collect()
    }

    /// Append `batch` as a unit, then evict oldest-first down to the cap.
    ///
    /// Fails without mutating anything if the batch repeats a provenance
    /// already present (or repeats one internally), or if it alone would
    /// overflow the cap.
    pub fn extend(&mut self, batch: Vec<TrainingPoint>) -> OtfResult<ExtendReport> {
        if batch.is_empty() {
            return Ok(ExtendReport::default());
        }
        if let Some(cap) = self.cap {
            if batch.len() > cap {
                return Err(OtfError::BatchExceedsCap {
                    batch: batch.len(),
                    cap,
                });
            }
        }

        let mut seen: HashSet<Provenance> = self.points.iter().map(|p| p.provenance).collect();
        for point in &batch {
            if !seen.insert(point.provenance) {
                return Err(OtfError::DuplicateProvenance {
                    step: point.provenance.step_index,
                    atom: point.provenance.atom_index,
                });
            }
        }

        let added = batch.len();
        self.points.extend(batch);

        let mut evicted = 0;
        if let Some(cap) = self.cap {
            if self.points.len() > cap {
                // The batch sits at the tail and fits within the cap, so only
                // older points are drained.
                evicted = self.points.len() - cap;
                self.points.drain(..evicted);
                self.generation += 1;
            }
        }
        self.version += 1;

        debug!(added, evicted, size = self.points.len(), "active set extended");
        Ok(ExtendReport { added, evicted })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(step: usize) -> Configuration {
        let mut cfg = Configuration::new(
            vec![[0.0; 3], [1.1, 0.0, 0.0], [0.0, 1.2, 0.0]],
            [[10.0, 0.0, 0.0], [0.0, 10.0, 0.0], [0.0, 0.0, 10.0]],
            vec!["Ar".into(); 3],
        );
        cfg.step_index = step;
        cfg
    }

    fn batch(step: usize, atoms: &[usize]) -> Vec<TrainingPoint> {
        let cfg = frame(step);
        let forces = vec![[0.1, 0.2, 0.3]; 3];
        training_points(&cfg, &forces, atoms, &Cutoffs::default()).unwrap()
    }

    #[test]
    fn test_points_come_out_in_ascending_atom_order() {
        let points = batch(4, &[2, 0]);
        let atoms: Vec<usize> = points.iter().map(|p| p.provenance.atom_index).collect();
        assert_eq!(atoms, vec![0, 2]);
        assert!(points.iter().all(|p| p.provenance.step_index == 4));
    }

    #[test]
    fn test_extend_bumps_version_but_not_generation() {
        let mut set = ActiveSet::new(None).unwrap();
        set.extend(batch(0, &[0, 1])).unwrap();
        set.extend(batch(1, &[2])).unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.version(), 2);
        assert_eq!(set.generation(), 0);
    }

    #[test]
    fn test_empty_batch_is_a_no_op() {
        let mut set = ActiveSet::new(None).unwrap();
        let report = set.extend(Vec::new()).unwrap();
        assert_eq!(report, ExtendReport::default());
        assert_eq!(set.version(), 0);
    }

    #[test]
    fn test_duplicate_provenance_is_rejected_atomically() {
        let mut set = ActiveSet::new(None).unwrap();
        set.extend(batch(0, &[0])).unwrap();
        let before = set.clone();
        let err = set.extend(batch(0, &[0, 1])).unwrap_err();
        assert!(matches!(err, OtfError::DuplicateProvenance { step: 0, atom: 0 }));
        assert_eq!(set, before);
    }

    #[test]
    fn test_eviction_is_oldest_first_and_keeps_the_batch() {
        let mut set = ActiveSet::new(Some(3)).unwrap();
        set.extend(batch(0, &[0, 1])).unwrap();
        let report = set.extend(batch(1, &[0, 1, 2])).unwrap();
        assert_eq!(report, ExtendReport { added: 3, evicted: 2 });
        assert_eq!(set.len(), 3);
        assert!(set.points().iter().all(|p| p.provenance.step_index == 1));
        assert_eq!(set.generation(), 1);
    }

    #[test]
    fn test_batch_larger_than_cap_fails() {
        let mut set = ActiveSet::new(Some(2)).unwrap();
        let err = set.extend(batch(0, &[0, 1, 2])).unwrap_err();
        assert!(matches!(err, OtfError::BatchExceedsCap { batch: 3, cap: 2 }));
        assert!(set.is_empty());
    }

    #[test]
    fn test_zero_cap_is_invalid() {
        assert!(ActiveSet::new(Some(0)).is_err());
    }

    #[test]
    fn test_labelled_atoms_filters_by_step() {
        let mut set = ActiveSet::new(None).unwrap();
        set.extend(batch(0, &[0, 2])).unwrap();
        set.extend(batch(1, &[1])).unwrap();
        let atoms = set.labelled_atoms(0);
        assert!(atoms.contains(&0) && atoms.contains(&2) && !atoms.contains(&1));
    }
}
