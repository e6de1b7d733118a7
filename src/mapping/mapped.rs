//! Tabulated copy of the surrogate and the policy that keeps it in sync.
//!
//! The surrogate mean force on an atom decomposes exactly into a sum over its
//! bonds of a radial function `g(r)` times the bond direction, plus a sum
//! over its triplets of two functions `g₁, g₂` of `(r1, r2, r12)` times the
//! two bond directions. Those functions depend only on the training data and
//! hyperparameters, so they can be tabulated once per surrogate version and
//! evaluated in O(neighbours) afterwards.
//!
//! Uncertainty is tabulated the same way as the posterior variance of each
//! bond (triplet) term and combined as if the terms were independent.

use std::collections::BTreeMap;

use nalgebra::DVector;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::grid::{CubicTable, Interval, TrilinearTable};
use crate::error::{OtfError, OtfResult};
use crate::model::{GaussianProcess, SquaredExponential};
use crate::structure::{environments, AtomicEnvironment, Configuration, Cutoffs, ForceField, ForceSource, Prediction};

/// What to do with a mapping whose surrogate has moved on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalenessPolicy {
    /// Rebuild before the next force query.
    Rebuild,
    /// Keep serving the old tables until something forces a rebuild.
    ServeStale,
}

/// Tabulation settings.
///
/// Mapped uncertainty adds the posterior variance of every bond and triplet
/// term as if the terms were independent. Correlations between terms are
/// dropped, so on atoms with several neighbours the mapped uncertainty runs
/// higher than the surrogate's (a few times higher in dense environments)
/// and the same tolerance factor triggers more often with mapping enabled.
/// With a single term the two agree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    pub enabled: bool,
    pub policy: StalenessPolicy,
    /// Under `serve_stale`, rebuild after every n-th triggering step
    /// (default: only when the caller asks for it).
    pub rebuild_every: Option<usize>,
    /// Nodes on the bond-length axis.
    pub two_body_grid: usize,
    /// Nodes per axis of the triplet grid.
    pub three_body_grid: usize,
    /// Shortest distance the tables cover.
    pub min_distance: f64,
    /// Longest bond the pair tables cover; defaults to the two-body cutoff.
    pub max_distance: Option<f64>,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            policy: StalenessPolicy::Rebuild,
            rebuild_every: None,
            two_body_grid: 128,
            three_body_grid: 12,
            min_distance: 0.5,
            max_distance: None,
        }
    }
}

impl MappingConfig {
    pub fn validate(&self, cutoffs: &Cutoffs) -> OtfResult<()> {
        if self.rebuild_every == Some(0) {
            return Err(OtfError::Config("mapping rebuild_every must be positive".into()));
        }
        if self.two_body_grid < 4 || self.three_body_grid < 4 {
            return Err(OtfError::Config(format!(
                "mapping grids need at least 4 nodes per axis, got {} and {}",
                self.two_body_grid, self.three_body_grid
            )));
        }
        if !(self.min_distance > 0.0) {
            return Err(OtfError::Config(format!(
                "mapping lower bound must be positive, got {}",
                self.min_distance
            )));
        }
        let upper = self.two_body_domain(cutoffs).max;
        if !(upper > self.min_distance) {
            return Err(OtfError::Config(format!(
                "mapping bounds [{}, {upper}] are empty",
                self.min_distance
            )));
        }
        if let Some(c3) = cutoffs.three_body {
            if !(c3 > self.min_distance) {
                return Err(OtfError::Config(format!(
                    "three-body cutoff {c3} lies below the mapping lower bound {}",
                    self.min_distance
                )));
            }
        }
        Ok(())
    }

    pub fn two_body_domain(&self, cutoffs: &Cutoffs) -> Interval {
        Interval {
            min: self.min_distance,
            max: self.max_distance.unwrap_or(cutoffs.two_body),
        }
    }

    pub fn three_body_domain(&self, cutoffs: &Cutoffs) -> Option<Interval> {
        cutoffs.three_body.map(|c3| Interval {
            min: self.min_distance,
            max: c3,
        })
    }
}

/// Provenance and freshness of the current tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingState {
    pub two_body_domain: Option<Interval>,
    pub three_body_domain: Option<Interval>,
    pub grid_resolution: [usize; 2],
    /// Surrogate version the tables were computed from.
    pub built_from: u64,
    pub is_stale: bool,
}

#[derive(Debug, Clone)]
struct PairTable {
    force: CubicTable,
    variance: CubicTable,
}

#[derive(Debug, Clone)]
struct TripletTable {
    force: [TrilinearTable; 2],
    variance: [TrilinearTable; 2],
}

/// Force field evaluated from interpolation tables.
#[derive(Debug, Clone)]
pub struct MappedForceField {
    cutoffs: Cutoffs,
    pairs: BTreeMap<(String, String), PairTable>,
    triplets: BTreeMap<(String, String, String), TripletTable>,
    state: MappingState,
}

fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Posterior mean and variance of one linear functional of the surrogate,
/// given its covariance `k` with the training forces and its prior variance.
fn posterior(gp: &GaussianProcess, k: DVector<f64>, prior: f64) -> (f64, f64) {
    if k.is_empty() {
        return (0.0, prior);
    }
    let mean = k.dot(gp.alpha());
    let var = match gp.cholesky_factor().solve_lower_triangular(&k) {
        Some(v) => prior - v.norm_squared(),
        None => prior,
    };
    (mean, var)
}

fn pair_entry(gp: &GaussianProcess, a: &str, b: &str, r: f64, se: SquaredExponential) -> (f64, f64) {
    let kernel = gp.kernel();
    let k = DVector::from_iterator(
        3 * gp.training().len(),
        gp.training()
            .iter()
            .flat_map(|train| kernel.pair_response(a, b, r, train, se)),
    );
    posterior(gp, k, se.sigma * se.sigma / (se.length * se.length))
}

fn triplet_entry(
    gp: &GaussianProcess,
    species: [&str; 3],
    x: [f64; 3],
    p: usize,
    se: SquaredExponential,
) -> (f64, f64) {
    let kernel = gp.kernel();
    let k = DVector::from_iterator(
        3 * gp.training().len(),
        gp.training()
            .iter()
            .flat_map(|train| kernel.triplet_response(species, x, p, train, se)),
    );
    posterior(gp, k, se.sigma * se.sigma / (se.length * se.length))
}

impl MappedForceField {
    /// Tabulate `gp` for every pair and ordered triplet of `species`.
    pub fn build(gp: &GaussianProcess, species: &[String], config: &MappingConfig) -> OtfResult<Self> {
        let cutoffs = *gp.cutoffs();
        let hyps = gp.hyperparameters();
        let mut species: Vec<String> = species.to_vec();
        species.sort();
        species.dedup();

        let mut pairs = BTreeMap::new();
        let mut two_body_domain = None;
        if let Some(se) = hyps.two_body() {
            let domain = config.two_body_domain(&cutoffs);
            let nodes = domain.nodes(config.two_body_grid);
            for (i, a) in species.iter().enumerate() {
                for b in &species[i..] {
                    let entries: Vec<(f64, f64)> =
                        nodes.par_iter().map(|r| pair_entry(gp, a, b, *r, se)).collect();
                    let (force, variance): (Vec<f64>, Vec<f64>) = entries.into_iter().unzip();
                    pairs.insert(
                        pair_key(a, b),
                        PairTable {
                            force: CubicTable::new(domain, force),
                            variance: CubicTable::new(domain, variance),
                        },
                    );
                }
            }
            two_body_domain = Some(domain);
        }

        let mut triplets = BTreeMap::new();
        let mut three_body_domain = None;
        if let (Some(se), Some(axis)) = (hyps.three_body(), config.three_body_domain(&cutoffs)) {
            let n = config.three_body_grid;
            let domain = [axis; 3];
            let shape = [n; 3];
            let nodes = TrilinearTable::node_coordinates(&domain, shape);
            for c in &species {
                for s1 in &species {
                    for s2 in &species {
                        let key = [c.as_str(), s1.as_str(), s2.as_str()];
                        let entries: Vec<[(f64, f64); 2]> = nodes
                            .par_iter()
                            .map(|x| [0, 1].map(|p| triplet_entry(gp, key, *x, p, se)))
                            .collect();
                        let column = |p: usize, variance: bool| {
                            let values = entries
                                .iter()
                                .map(|e| if variance { e[p].1 } else { e[p].0 })
                                .collect();
                            TrilinearTable::new(domain, shape, values)
                        };
                        triplets.insert(
                            (c.clone(), s1.clone(), s2.clone()),
                            TripletTable {
                                force: [column(0, false), column(1, false)],
                                variance: [column(0, true), column(1, true)],
                            },
                        );
                    }
                }
            }
            three_body_domain = Some(axis);
        }

        let state = MappingState {
            two_body_domain,
            three_body_domain,
            grid_resolution: [config.two_body_grid, config.three_body_grid],
            built_from: gp.version(),
            is_stale: false,
        };
        info!(
            built_from = state.built_from,
            pair_tables = pairs.len(),
            triplet_tables = triplets.len(),
            "mapping rebuilt"
        );
        Ok(Self {
            cutoffs,
            pairs,
            triplets,
            state,
        })
    }

    pub fn state(&self) -> &MappingState {
        &self.state
    }

    fn predict_environment(&self, env: &AtomicEnvironment) -> OtfResult<([f64; 3], [f64; 3])> {
        let mut force = [0.0; 3];
        let mut var = [0.0; 3];

        if !self.pairs.is_empty() {
            for bond in env.bonds_within(self.cutoffs.two_body) {
                let table = self
                    .pairs
                    .get(&pair_key(&env.species, &bond.species))
                    .ok_or_else(|| OtfError::UnmappedSpecies(format!("{}-{}", env.species, bond.species)))?;
                let r = bond.distance;
                let (g, v) = match (table.force.eval(r), table.variance.eval(r)) {
                    (Some(g), Some(v)) => (g, v),
                    _ => {
                        return Err(OtfError::DomainViolation {
                            body_order: 2,
                            value: r,
                            min: table.force.domain.min,
                            max: table.force.domain.max,
                        })
                    }
                };
                for d in 0..3 {
                    let u = bond.direction(d);
                    force[d] += g * u;
                    var[d] += u * u * v.max(0.0);
                }
            }
        }

        if !self.triplets.is_empty() {
            for t in &env.triplets {
                let b = [&env.bonds[t.first], &env.bonds[t.second]];
                let key = (env.species.clone(), b[0].species.clone(), b[1].species.clone());
                let table = self.triplets.get(&key).ok_or_else(|| {
                    OtfError::UnmappedSpecies(format!("{}-{}-{}", key.0, key.1, key.2))
                })?;
                let x = [b[0].distance, b[1].distance, t.r12];
                if let Some(axis) = table.force[0].out_of_domain(x) {
                    let domain = table.force[0].domain[axis];
                    return Err(OtfError::DomainViolation {
                        body_order: 3,
                        value: x[axis],
                        min: domain.min,
                        max: domain.max,
                    });
                }
                for p in 0..2 {
                    let g = table.force[p].eval(x).unwrap_or(0.0);
                    let v = table.variance[p].eval(x).unwrap_or(0.0).max(0.0);
                    for d in 0..3 {
                        let u = b[p].direction(d);
                        force[d] += g * u;
                        var[d] += u * u * v;
                    }
                }
            }
        }

        Ok((force, var.map(f64::sqrt)))
    }
}

impl ForceField for MappedForceField {
    fn predict(&self, configuration: &Configuration) -> OtfResult<Prediction> {
        let envs = environments(configuration, &self.cutoffs)?;
        let per_atom: Vec<([f64; 3], [f64; 3])> = envs
            .par_iter()
            .map(|env| self.predict_environment(env))
            .collect::<OtfResult<_>>()?;
        let (forces, stds) = per_atom.into_iter().unzip();
        Ok(Prediction {
            forces,
            stds,
            source: ForceSource::Mapping,
        })
    }
}

/// Owns the tables and applies the staleness policy.
#[derive(Debug, Clone)]
pub struct MappingSynchronizer {
    config: MappingConfig,
    species: Vec<String>,
    mapped: Option<MappedForceField>,
}

impl MappingSynchronizer {
    pub fn new(config: MappingConfig, species: Vec<String>) -> Self {
        Self {
            config,
            species,
            mapped: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn policy(&self) -> StalenessPolicy {
        self.config.policy
    }

    pub fn state(&self) -> Option<&MappingState> {
        self.mapped.as_ref().map(|m| m.state())
    }

    /// Whether the tables lag behind `surrogate_version` (or do not exist).
    pub fn is_stale(&self, surrogate_version: u64) -> bool {
        match &self.mapped {
            Some(m) => m.state.is_stale || m.state.built_from != surrogate_version,
            None => true,
        }
    }

    pub fn mark_stale(&mut self) {
        if let Some(m) = self.mapped.as_mut() {
            m.state.is_stale = true;
        }
    }

    /// Whether a `serve_stale` mapping is due for a rebuild after the
    /// `triggers`-th triggering step.
    pub fn rebuild_due(&self, triggers: usize) -> bool {
        matches!(self.config.rebuild_every, Some(n) if triggers % n == 0)
    }

    pub fn rebuild(&mut self, gp: &GaussianProcess) -> OtfResult<()> {
        if !self.config.enabled {
            return Ok(());
        }
        self.mapped = Some(MappedForceField::build(gp, &self.species, &self.config)?);
        Ok(())
    }

    /// Bring the tables to the state the policy requires before a query:
    /// current under [`StalenessPolicy::Rebuild`]. Under
    /// [`StalenessPolicy::ServeStale`] the first build waits until the
    /// surrogate has training data, since tables of the prior would be
    /// served for as long as nothing forces a rebuild.
    pub fn prepare(&mut self, gp: &GaussianProcess) -> OtfResult<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let needs_build = match self.config.policy {
            StalenessPolicy::Rebuild => self.is_stale(gp.version()),
            StalenessPolicy::ServeStale => self.mapped.is_none() && !gp.training().is_empty(),
        };
        if needs_build {
            debug!(surrogate_version = gp.version(), "building mapping");
            self.rebuild(gp)?;
        }
        Ok(())
    }

    /// Tables to query this step, if the policy allows serving them.
    pub fn usable(&self, surrogate_version: u64) -> Option<&MappedForceField> {
        if !self.config.enabled {
            return None;
        }
        let mapped = self.mapped.as_ref()?;
        match self.config.policy {
            StalenessPolicy::Rebuild if self.is_stale(surrogate_version) => None,
            _ => Some(mapped),
        }
    }
}
