//! Tabulated ("mapped") copy of the surrogate.
//!
//! - [`grid`] -- uniform cubic (1-D) and trilinear (3-D) tables.
//! - [`mapped::MappedForceField`] -- force field evaluated from the tables.
//! - [`mapped::MappingSynchronizer`] -- rebuild/serve-stale policy.

pub mod grid;
pub mod mapped;

pub use grid::{CubicTable, Interval, TrilinearTable};
pub use mapped::{MappedForceField, MappingConfig, MappingState, MappingSynchronizer, StalenessPolicy};
