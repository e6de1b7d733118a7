//! The per-step active-learning state machine.
//!
//! ```text
//! PREDICT -> GATE -> QUIET ----------------------------------------------> EMIT
//!                 \-> ORACLE_CALL -> UPDATE_MODEL -> MAYBE_OPTIMIZE -> MAYBE_REMAP -> EMIT
//! ```
//!
//! All mutation of the active set, the surrogate and the mapping happens
//! here, between predictions. Oracle results are committed only after the
//! oracle returns and the updated surrogate has been fitted, so a failure at
//! any point before the commit leaves every piece of state as it was.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{OtfError, OtfResult};
use crate::learning::{training_points, ActiveSet, GateConfig, UncertaintyGate};
use crate::mapping::{MappingSynchronizer, StalenessPolicy};
use crate::model::{GaussianProcess, OptimizationReport, OptimizerConfig};
use crate::oracle::Oracle;
use crate::structure::{Configuration, ForceField, Prediction};

/// Policy knobs the controller consults every step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub gate: GateConfig,
    pub optimizer: OptimizerConfig,
    /// Hyperparameters stay fixed from this step on.
    pub freeze_hyps: Option<usize>,
    /// Optimize on every n-th triggering step.
    pub optimize_every: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            gate: GateConfig::default(),
            optimizer: OptimizerConfig::default(),
            freeze_hyps: None,
            optimize_every: 1,
        }
    }
}

/// Counters and flags owned by the controller for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub step_index: usize,
    /// `step_index >= freeze_hyps`.
    pub frozen: bool,
    pub tolerance: GateConfig,
    pub triggers: usize,
    pub oracle_calls: usize,
    pub optimizations: usize,
}

/// What a step did beyond predicting.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Quiet,
    Triggered {
        selected: Vec<usize>,
        oracle_energy: Option<f64>,
        optimization: Option<OptimizationReport>,
    },
}

/// Result of one controller step.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub step_index: usize,
    /// Forces to integrate with, plus their uncertainty.
    pub prediction: Prediction,
    /// Per-atom uncertainty seen by the gate.
    pub uncertainties: Vec<f64>,
    pub threshold: f64,
    pub outcome: StepOutcome,
    /// The mapping rejected this frame and the surrogate answered instead.
    pub mapping_fallback: bool,
    pub active_set_size: usize,
}

impl StepReport {
    pub fn selected(&self) -> &[usize] {
        match &self.outcome {
            StepOutcome::Quiet => &[],
            StepOutcome::Triggered { selected, .. } => selected,
        }
    }

    pub fn is_quiet(&self) -> bool {
        matches!(self.outcome, StepOutcome::Quiet)
    }
}

pub struct LoopController<O: Oracle> {
    gp: GaussianProcess,
    active_set: ActiveSet,
    gate: UncertaintyGate,
    mapping: MappingSynchronizer,
    oracle: O,
    config: ControllerConfig,
    state: RunState,
}

impl<O: Oracle> LoopController<O> {
    pub fn new(
        gp: GaussianProcess,
        active_set: ActiveSet,
        mapping: MappingSynchronizer,
        oracle: O,
        config: ControllerConfig,
    ) -> OtfResult<Self> {
        let gate = UncertaintyGate::new(config.gate.clone())?;
        if config.optimize_every == 0 {
            return Err(OtfError::Config("optimize_every must be positive".into()));
        }
        if let Some(cap) = active_set.cap() {
            if cap < config.gate.max_atoms_added {
                return Err(OtfError::Config(format!(
                    "active set cap {cap} is smaller than max_atoms_added {}",
                    config.gate.max_atoms_added
                )));
            }
        }
        let state = RunState {
            step_index: 0,
            frozen: config.freeze_hyps == Some(0),
            tolerance: config.gate.clone(),
            triggers: 0,
            oracle_calls: 0,
            optimizations: 0,
        };
        Ok(Self {
            gp,
            active_set,
            gate,
            mapping,
            oracle,
            config,
            state,
        })
    }

    pub fn gp(&self) -> &GaussianProcess {
        &self.gp
    }

    pub fn active_set(&self) -> &ActiveSet {
        &self.active_set
    }

    pub fn mapping(&self) -> &MappingSynchronizer {
        &self.mapping
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    fn enter_step(&mut self, step_index: usize) {
        self.state.step_index = step_index;
        self.state.frozen = self.config.freeze_hyps.is_some_and(|f| step_index >= f);
    }

    /// Bring the surrogate up to date with the active set.
    fn refresh(&mut self) -> OtfResult<()> {
        if !self.gp.is_fitted_to(&self.active_set) {
            self.gp.update(&self.active_set)?;
            self.mapping.mark_stale();
        }
        Ok(())
    }

    /// Predict from the mapping when the policy allows it, otherwise from the
    /// surrogate. Returns whether a mapping miss forced the fallback.
    fn predict(&mut self, configuration: &Configuration, allow_stale: bool) -> OtfResult<(Prediction, bool)> {
        if !self.mapping.is_enabled() {
            return Ok((self.gp.predict(configuration)?, false));
        }
        self.mapping.prepare(&self.gp)?;
        let version = self.gp.version();
        let mapped = match self.mapping.usable(version) {
            Some(m) if allow_stale || !self.mapping.is_stale(version) => m,
            _ => return Ok((self.gp.predict(configuration)?, false)),
        };
        match mapped.predict(configuration) {
            Ok(prediction) => Ok((prediction, false)),
            Err(err) if !err.is_fatal() => {
                warn!(
                    step = configuration.step_index,
                    error = %err,
                    "mapping unusable for this frame, falling back to surrogate"
                );
                Ok((self.gp.predict(configuration)?, true))
            }
            Err(err) => Err(err),
        }
    }

    /// Label atoms of `configuration` with the oracle and fold them into the
    /// model as one atomic commit. Returns the oracle energy.
    async fn label(&mut self, configuration: &Configuration, atoms: &[usize]) -> OtfResult<Option<f64>> {
        let output = self.oracle.evaluate(configuration).await?;
        self.state.oracle_calls += 1;

        let batch = training_points(configuration, &output.forces, atoms, self.gp.cutoffs())?;
        let mut next_set = self.active_set.clone();
        let report = next_set.extend(batch)?;
        let mut next_gp = self.gp.clone();
        next_gp.update(&next_set)?;

        self.active_set = next_set;
        self.gp = next_gp;
        self.mapping.mark_stale();
        debug!(
            added = report.added,
            evicted = report.evicted,
            size = self.active_set.len(),
            "oracle labels committed"
        );
        Ok(output.energy)
    }

    fn maybe_optimize(&mut self) -> OtfResult<Option<OptimizationReport>> {
        if self.state.frozen || self.state.triggers % self.config.optimize_every != 0 {
            return Ok(None);
        }
        let report = self
            .gp
            .optimize_hyperparameters(&self.active_set, &self.config.optimizer)?;
        self.state.optimizations += 1;
        Ok(Some(report))
    }

    fn maybe_remap(&mut self) -> OtfResult<()> {
        if !self.mapping.is_enabled() {
            return Ok(());
        }
        match self.mapping.policy() {
            StalenessPolicy::Rebuild => self.mapping.rebuild(&self.gp),
            StalenessPolicy::ServeStale if self.mapping.rebuild_due(self.state.triggers) => {
                self.mapping.rebuild(&self.gp)
            }
            StalenessPolicy::ServeStale => {
                self.mapping.mark_stale();
                Ok(())
            }
        }
    }

    /// Rebuild the mapping from the current surrogate regardless of policy.
    pub fn remap(&mut self) -> OtfResult<()> {
        self.refresh()?;
        self.mapping.rebuild(&self.gp)
    }

    /// Label every atom of the first frame before the trajectory starts, then
    /// optimize unless hyperparameters are already frozen.
    pub async fn seed(&mut self, configuration: &Configuration) -> OtfResult<usize> {
        self.enter_step(configuration.step_index);
        self.refresh()?;
        let atoms: Vec<usize> = (0..configuration.len()).collect();
        self.label(configuration, &atoms).await?;
        if !self.state.frozen {
            self.gp
                .optimize_hyperparameters(&self.active_set, &self.config.optimizer)?;
            self.state.optimizations += 1;
        }
        self.maybe_remap()?;
        info!(atoms = atoms.len(), "seeded active set from initial frame");
        Ok(atoms.len())
    }

    /// Run one step of the loop for `configuration`.
    pub async fn step(&mut self, configuration: &Configuration) -> OtfResult<StepReport> {
        self.enter_step(configuration.step_index);

        // PREDICT
        self.refresh()?;
        let (prediction, mut mapping_fallback) = self.predict(configuration, true)?;

        // GATE
        let uncertainties = prediction.uncertainties();
        let labelled = self.active_set.labelled_atoms(configuration.step_index);
        let selection = self
            .gate
            .select_excluding(&uncertainties, self.gp.noise(), |i| labelled.contains(&i));

        if selection.is_quiet() {
            debug!(step = configuration.step_index, threshold = selection.threshold, "quiet step");
            return Ok(StepReport {
                step_index: configuration.step_index,
                prediction,
                uncertainties,
                threshold: selection.threshold,
                outcome: StepOutcome::Quiet,
                mapping_fallback,
                active_set_size: self.active_set.len(),
            });
        }

        // ORACLE_CALL + UPDATE_MODEL
        info!(
            step = configuration.step_index,
            atoms = ?selection.atoms,
            threshold = selection.threshold,
            "uncertainty above tolerance, calling oracle"
        );
        let oracle_energy = self.label(configuration, &selection.atoms).await?;
        self.state.triggers += 1;

        // MAYBE_OPTIMIZE
        let optimization = self.maybe_optimize()?;

        // MAYBE_REMAP
        self.maybe_remap()?;

        // EMIT_FORCES from the updated model; a stale mapping is not
        // consulted here since it predates this step's labels.
        let (emitted, fallback) = self.predict(configuration, false)?;
        mapping_fallback |= fallback;

        Ok(StepReport {
            step_index: configuration.step_index,
            prediction: emitted,
            uncertainties,
            threshold: selection.threshold,
            outcome: StepOutcome::Triggered {
                selected: selection.atoms,
                oracle_energy,
                optimization,
            },
            mapping_fallback,
            active_set_size: self.active_set.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::error::OracleError;
    use crate::mapping::{MappingConfig, StalenessPolicy};
    use crate::model::{Hyperparameters, KernelKind};
    use crate::oracle::{LennardJones, LennardJonesConfig, OracleOutput};
    use crate::structure::{Cutoffs, ForceSource};

    /// Lennard-Jones that fails once `budget` calls have been made.
    struct Budgeted {
        inner: LennardJones,
        calls: AtomicUsize,
        budget: usize,
    }

    impl Oracle for Budgeted {
        async fn evaluate(&self, configuration: &Configuration) -> Result<OracleOutput, OracleError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) >= self.budget {
                return Err(OracleError::Process {
                    status: "exit status: 1".into(),
                    stderr: "scf did not converge".into(),
                });
            }
            self.inner.evaluate(configuration).await
        }

        fn name(&self) -> &str {
            "budgeted"
        }
    }

    fn frame(step: usize) -> Configuration {
        let s = 0.02 * step as f64;
        let mut cfg = Configuration::new(
            vec![[0.0, 0.0, 0.0], [1.15 + s, 0.05, 0.0], [0.1, 1.1 - s, 0.05 + s]],
            [[12.0, 0.0, 0.0], [0.0, 12.0, 0.0], [0.0, 0.0, 12.0]],
            vec!["Ar".into(); 3],
        );
        cfg.step_index = step;
        cfg
    }

    fn cutoffs() -> Cutoffs {
        Cutoffs {
            two_body: 2.5,
            three_body: None,
        }
    }

    fn controller(factor: f64, max_atoms_added: usize, budget: usize, mapping: bool) -> LoopController<Budgeted> {
        mapped_controller(
            factor,
            max_atoms_added,
            budget,
            MappingConfig {
                enabled: mapping,
                two_body_grid: 64,
                ..MappingConfig::default()
            },
        )
    }

    fn mapped_controller(
        factor: f64,
        max_atoms_added: usize,
        budget: usize,
        mapping: MappingConfig,
    ) -> LoopController<Budgeted> {
        let gp = GaussianProcess::new(cutoffs(), Hyperparameters::default_for(KernelKind::TwoBody)).unwrap();
        let mapping = MappingSynchronizer::new(mapping, vec!["Ar".into()]);
        let oracle = Budgeted {
            inner: LennardJones::new(LennardJonesConfig::default()),
            calls: AtomicUsize::new(0),
            budget,
        };
        let config = ControllerConfig {
            gate: GateConfig {
                factor,
                max_atoms_added,
                ..GateConfig::default()
            },
            freeze_hyps: Some(2),
            ..ControllerConfig::default()
        };
        LoopController::new(gp, ActiveSet::new(None).unwrap(), mapping, oracle, config).unwrap()
    }

    #[tokio::test]
    async fn test_quiet_step_mutates_nothing() {
        let mut ctl = controller(1e12, 2, 10, false);
        let before_set = ctl.active_set().clone();
        let before_gp = ctl.gp().state();
        let report = ctl.step(&frame(0)).await.unwrap();
        assert!(report.is_quiet());
        assert_eq!(ctl.active_set(), &before_set);
        assert_eq!(ctl.gp().state(), before_gp);
        assert_eq!(ctl.state().oracle_calls, 0);
    }

    #[tokio::test]
    async fn test_triggering_step_respects_max_atoms_added() {
        let mut ctl = controller(0.0, 2, 10, false);
        let report = ctl.step(&frame(0)).await.unwrap();
        assert_eq!(report.selected().len(), 2);
        assert_eq!(ctl.active_set().len(), 2);
        assert_eq!(ctl.state().triggers, 1);
        assert_eq!(ctl.state().optimizations, 1);
        assert_eq!(report.prediction.source, ForceSource::Surrogate);
        assert!(ctl.gp().is_fitted_to(ctl.active_set()));
    }

    #[tokio::test]
    async fn test_already_labelled_atoms_are_not_requested_again() {
        let mut ctl = controller(0.0, 3, 10, false);
        ctl.step(&frame(0)).await.unwrap();
        let again = ctl.step(&frame(0)).await.unwrap();
        assert!(again.is_quiet());
        assert_eq!(ctl.state().oracle_calls, 1);
    }

    #[tokio::test]
    async fn test_oracle_failure_leaves_state_untouched() {
        let mut ctl = controller(0.0, 1, 1, false);
        ctl.step(&frame(0)).await.unwrap();
        let set = ctl.active_set().clone();
        let gp = ctl.gp().state();
        let err = ctl.step(&frame(1)).await.unwrap_err();
        assert!(matches!(err, OtfError::Oracle(_)));
        assert!(err.is_fatal());
        assert_eq!(ctl.active_set(), &set);
        assert_eq!(ctl.gp().state(), gp);
    }

    #[tokio::test]
    async fn test_frozen_steps_keep_hyperparameters() {
        let mut ctl = controller(0.0, 1, 10, false);
        ctl.step(&frame(0)).await.unwrap();
        ctl.step(&frame(1)).await.unwrap();
        let at_freeze = ctl.gp().hyperparameters().clone();
        ctl.step(&frame(2)).await.unwrap();
        ctl.step(&frame(3)).await.unwrap();
        assert!(ctl.state().frozen);
        assert_eq!(ctl.gp().hyperparameters(), &at_freeze);
        assert_eq!(ctl.state().optimizations, 2);
    }

    #[tokio::test]
    async fn test_mapping_is_fresh_after_every_trigger() {
        let mut ctl = controller(0.0, 1, 10, true);
        for step in 0..3 {
            let report = ctl.step(&frame(step)).await.unwrap();
            assert_eq!(report.prediction.source, ForceSource::Mapping);
            let state = ctl.mapping().state().unwrap();
            assert_eq!(state.built_from, ctl.gp().version());
            assert!(!state.is_stale);
        }
    }

    fn serve_stale(rebuild_every: Option<usize>) -> MappingConfig {
        MappingConfig {
            enabled: true,
            policy: StalenessPolicy::ServeStale,
            rebuild_every,
            two_body_grid: 64,
            ..MappingConfig::default()
        }
    }

    #[tokio::test]
    async fn test_out_of_domain_frame_falls_back_to_surrogate() {
        let mut ctl = mapped_controller(
            1e12,
            1,
            10,
            MappingConfig {
                enabled: true,
                min_distance: 1.12,
                two_body_grid: 64,
                ..MappingConfig::default()
            },
        );
        // Atoms 0 and 2 sit about 1.106 apart.
        let report = ctl.step(&frame(0)).await.unwrap();
        assert!(report.mapping_fallback);
        assert_eq!(report.prediction.source, ForceSource::Surrogate);
        assert!(report.is_quiet());

        let mut stretched = frame(0);
        for p in &mut stretched.positions {
            *p = [1.1 * p[0], 1.1 * p[1], 1.1 * p[2]];
        }
        stretched.step_index = 1;
        let report = ctl.step(&stretched).await.unwrap();
        assert!(!report.mapping_fallback);
        assert_eq!(report.prediction.source, ForceSource::Mapping);
    }

    #[tokio::test]
    async fn test_serve_stale_gates_on_old_tables_and_emits_from_surrogate() {
        let mut ctl = mapped_controller(0.0, 1, 10, serve_stale(None));

        // Tables are first built at EMIT, from the surrogate trained on step 0.
        let first = ctl.step(&frame(0)).await.unwrap();
        assert_eq!(first.prediction.source, ForceSource::Mapping);
        let built_from = ctl.mapping().state().unwrap().built_from;
        assert_eq!(built_from, ctl.gp().version());

        // The trigger leaves the tables behind; EMIT answers from the surrogate.
        let second = ctl.step(&frame(1)).await.unwrap();
        assert!(!second.is_quiet());
        assert_eq!(second.prediction.source, ForceSource::Surrogate);
        assert!(ctl.mapping().is_stale(ctl.gp().version()));
        assert_eq!(ctl.mapping().state().unwrap().built_from, built_from);

        // PREDICT keeps gating on the stale tables.
        let third = ctl.step(&frame(2)).await.unwrap();
        assert!(!third.is_quiet());
        assert_eq!(third.prediction.source, ForceSource::Surrogate);
        assert_eq!(ctl.mapping().state().unwrap().built_from, built_from);
        let stale = ctl
            .mapping()
            .usable(ctl.gp().version())
            .unwrap()
            .predict(&frame(2))
            .unwrap();
        assert_eq!(third.uncertainties, stale.uncertainties());

        ctl.remap().unwrap();
        let state = ctl.mapping().state().unwrap();
        assert_eq!(state.built_from, ctl.gp().version());
        assert!(!state.is_stale);
    }

    #[tokio::test]
    async fn test_serve_stale_rebuilds_on_cadence() {
        let mut ctl = mapped_controller(0.0, 1, 10, serve_stale(Some(2)));
        ctl.step(&frame(0)).await.unwrap();
        ctl.step(&frame(1)).await.unwrap();
        assert_eq!(ctl.state().triggers, 2);
        let state = ctl.mapping().state().unwrap();
        assert_eq!(state.built_from, ctl.gp().version());
        assert!(!state.is_stale);

        let report = ctl.step(&frame(2)).await.unwrap();
        assert!(!report.is_quiet());
        assert!(ctl.mapping().is_stale(ctl.gp().version()));
    }

    #[tokio::test]
    async fn test_seeding_labels_the_whole_frame() {
        let mut ctl = controller(1e12, 1, 10, false);
        let added = ctl.seed(&frame(0)).await.unwrap();
        assert_eq!(added, 3);
        assert_eq!(ctl.active_set().len(), 3);
        assert_eq!(ctl.state().oracle_calls, 1);
        assert_eq!(ctl.state().triggers, 0);
    }
}
