//! Run logging.
//!
//! The runner reports every step to a [`StepObserver`] synchronously and in
//! step order. Included observers:
//! - [`text::TextLog`] -- human-readable frame log with an interval filter.
//! - [`jsonl::JsonlLog`] -- one JSON record per line.
//! - [`memory::MemoryLog`] -- keeps everything in memory behind a shared
//!   handle (tests, embedding).

pub mod jsonl;
pub mod memory;
pub mod text;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use jsonl::JsonlLog;
pub use memory::MemoryLog;
pub use text::TextLog;

use crate::model::KernelKind;
use crate::structure::{Cutoffs, ForceLabel, ForceSource, Vec3};

/// Written once before the first step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunHeader {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub n_atoms: usize,
    pub species: Vec<String>,
    pub cell: [Vec3; 3],
    pub kernel: KernelKind,
    pub cutoffs: Cutoffs,
    pub hyperparameters: Vec<(String, f64)>,
    pub tolerance_factor: f64,
    pub max_atoms_added: usize,
    pub freeze_hyps: Option<usize>,
    pub time_step: f64,
    pub steps: usize,
    pub oracle: String,
    pub mapping_enabled: bool,
}

/// Everything that happened in one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_index: usize,
    pub time: f64,
    pub species: Vec<String>,
    pub positions: Vec<Vec3>,
    pub velocities: Vec<Vec3>,
    /// Forces handed to the stepper.
    pub forces: Vec<Vec3>,
    pub stds: Vec<Vec3>,
    pub source: ForceSource,
    /// Per-atom uncertainty the gate saw.
    pub uncertainties: Vec<f64>,
    pub threshold: f64,
    /// Atoms sent to the oracle (empty on quiet steps).
    pub selected: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oracle_energy: Option<f64>,
    /// Hyperparameters after this step's update, on triggering steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hyperparameters: Option<Vec<(String, f64)>>,
    /// Hyperparameters were re-optimized this step.
    #[serde(default)]
    pub optimized: bool,
    pub active_set_size: usize,
    /// The mapping was bypassed this step after a domain violation.
    #[serde(default)]
    pub mapping_fallback: bool,
}

impl StepRecord {
    pub fn is_quiet(&self) -> bool {
        self.selected.is_empty()
    }

    /// The emitted force on each atom, in atom order.
    pub fn labels(&self) -> impl Iterator<Item = ForceLabel> + '_ {
        self.forces
            .iter()
            .enumerate()
            .map(|(atom_index, force)| ForceLabel {
                atom_index,
                force: *force,
                source: self.source,
            })
    }
}

/// Written once after the last step of a successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub finished_at: DateTime<Utc>,
    pub steps: usize,
    pub triggers: usize,
    pub oracle_calls: usize,
    pub active_set_size: usize,
    pub hyperparameters: Vec<(String, f64)>,
    pub wall_seconds: f64,
}

/// Receives run events in order.
pub trait StepObserver {
    fn on_start(&mut self, header: &RunHeader) -> std::io::Result<()>;
    fn on_step(&mut self, record: &StepRecord) -> std::io::Result<()>;
    fn on_finish(&mut self, summary: &RunSummary) -> std::io::Result<()>;
}

/// Fans events out to several observers.
#[derive(Default)]
pub struct ObserverSet {
    observers: Vec<Box<dyn StepObserver + Send>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, observer: impl StepObserver + Send + 'static) {
        self.observers.push(Box::new(observer));
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl StepObserver for ObserverSet {
    fn on_start(&mut self, header: &RunHeader) -> std::io::Result<()> {
        self.observers.iter_mut().try_for_each(|o| o.on_start(header))
    }

    fn on_step(&mut self, record: &StepRecord) -> std::io::Result<()> {
        self.observers.iter_mut().try_for_each(|o| o.on_step(record))
    }

    fn on_finish(&mut self, summary: &RunSummary) -> std::io::Result<()> {
        self.observers.iter_mut().try_for_each(|o| o.on_finish(summary))
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn header() -> RunHeader {
        RunHeader {
            run_id: Uuid::nil(),
            started_at: Utc::now(),
            n_atoms: 2,
            species: vec!["Ar".into(), "Ar".into()],
            cell: [[10.0, 0.0, 0.0], [0.0, 10.0, 0.0], [0.0, 0.0, 10.0]],
            kernel: KernelKind::TwoBody,
            cutoffs: Cutoffs::default(),
            hyperparameters: vec![("Noise Std".into(), 0.05)],
            tolerance_factor: 1.0,
            max_atoms_added: 1,
            freeze_hyps: None,
            time_step: 0.01,
            steps: 3,
            oracle: "lennard_jones".into(),
            mapping_enabled: false,
        }
    }

    pub fn record(step_index: usize, selected: Vec<usize>) -> StepRecord {
        StepRecord {
            step_index,
            time: step_index as f64 * 0.01,
            species: vec!["Ar".into(), "Ar".into()],
            positions: vec![[0.0; 3], [1.1, 0.0, 0.0]],
            velocities: vec![[0.0; 3]; 2],
            forces: vec![[0.1, 0.0, 0.0], [-0.1, 0.0, 0.0]],
            stds: vec![[0.01; 3]; 2],
            source: ForceSource::Surrogate,
            uncertainties: vec![0.01, 0.02],
            threshold: 0.05,
            oracle_energy: (!selected.is_empty()).then_some(-1.0),
            hyperparameters: None,
            optimized: false,
            selected,
            active_set_size: 4,
            mapping_fallback: false,
        }
    }

    pub fn summary() -> RunSummary {
        RunSummary {
            run_id: Uuid::nil(),
            finished_at: Utc::now(),
            steps: 3,
            triggers: 1,
            oracle_calls: 1,
            active_set_size: 4,
            hyperparameters: vec![("Noise Std".into(), 0.05)],
            wall_seconds: 0.5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observer_set_fans_out() {
        let a = MemoryLog::new();
        let b = MemoryLog::new();
        let mut set = ObserverSet::new();
        set.push(a.clone());
        set.push(b.clone());
        set.on_start(&fixtures::header()).unwrap();
        set.on_step(&fixtures::record(0, vec![])).unwrap();
        set.on_finish(&fixtures::summary()).unwrap();
        assert_eq!(a.records().len(), 1);
        assert_eq!(b.records().len(), 1);
        assert!(b.summary().is_some());
    }

    #[test]
    fn test_one_label_per_atom_tagged_with_source() {
        let mut record = fixtures::record(0, vec![1]);
        record.source = ForceSource::Mapping;
        let labels: Vec<ForceLabel> = record.labels().collect();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels[1].atom_index, 1);
        assert_eq!(labels[1].force, [-0.1, 0.0, 0.0]);
        assert!(labels.iter().all(|l| l.source == ForceSource::Mapping));
    }

    #[test]
    fn test_quiet_record() {
        assert!(fixtures::record(0, vec![]).is_quiet());
        assert!(!fixtures::record(0, vec![1]).is_quiet());
    }
}
