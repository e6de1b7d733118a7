//! Active-learning bookkeeping: the training buffer and the gate that decides
//! when to grow it.

pub mod active_set;
pub mod gate;

pub use active_set::{training_points, ActiveSet, ExtendReport, Provenance, TrainingPoint};
pub use gate::{GateConfig, ReferenceScale, Selection, UncertaintyGate};
