//! Wires a controller, a stepper and observers into a complete run.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;
use uuid::Uuid;

use super::controller::{ControllerConfig, LoopController, StepOutcome, StepReport};
use crate::config::OtfConfig;
use crate::learning::ActiveSet;
use crate::log::{JsonlLog, ObserverSet, RunHeader, RunSummary, StepObserver, StepRecord, TextLog};
use crate::mapping::MappingSynchronizer;
use crate::md::{maxwell_boltzmann, Stepper, VerletStepper};
use crate::model::{GaussianProcess, ModelCheckpoint};
use crate::oracle::{AnyOracle, Oracle};
use crate::structure::Configuration;

/// Run-level settings outside the per-step policy.
#[derive(Debug, Clone, Default)]
pub struct RunSettings {
    pub steps: usize,
    pub seed_initial_frame: bool,
    pub checkpoint_path: Option<PathBuf>,
}

/// What a completed run leaves behind.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub final_configuration: Configuration,
    pub summary: RunSummary,
}

pub struct OtfRunner<O: Oracle, S: Stepper> {
    run_id: Uuid,
    controller: LoopController<O>,
    stepper: S,
    observers: ObserverSet,
    settings: RunSettings,
}

impl<O: Oracle> LoopController<O> {
    /// Build a controller from a validated run configuration.
    pub fn from_config(config: &OtfConfig, species: Vec<String>, oracle: O) -> Result<Self> {
        let hyps = config
            .model
            .initial_hyperparameters()
            .context("Invalid initial hyperparameters")?;
        let gp = GaussianProcess::new(config.model.cutoffs, hyps).context("Invalid surrogate model")?;
        let active_set = ActiveSet::new(config.active_set.max_size).context("Invalid active set")?;
        let mapping = MappingSynchronizer::new(config.mapping.clone(), species);
        let controller_config = ControllerConfig {
            gate: config.gate.clone(),
            optimizer: config.model.optimizer.clone(),
            freeze_hyps: config.model.freeze_hyps,
            optimize_every: config.model.optimize_every,
        };
        let controller = LoopController::new(gp, active_set, mapping, oracle, controller_config)
            .context("Invalid controller configuration")?;
        Ok(controller)
    }
}

impl OtfRunner<AnyOracle, VerletStepper> {
    /// Validate `config` and build everything it describes, including the
    /// file observers under `output`. Returns the runner and the first frame.
    pub fn from_config(config: &OtfConfig) -> Result<(Self, Configuration)> {
        config.validate().context("Configuration rejected")?;

        let mut initial = config.structure.to_configuration()?;
        if let Some(kt) = config.md.initial_kt {
            let mut rng = StdRng::seed_from_u64(config.md.seed);
            initial.velocities = maxwell_boltzmann(&initial, &config.md.masses, kt, &mut rng)?;
        }

        let oracle = AnyOracle::from_config(&config.oracle).context("Failed to set up oracle")?;
        let controller = LoopController::from_config(config, initial.unique_species(), oracle)?;
        let stepper = VerletStepper::new(config.verlet());
        let settings = RunSettings {
            steps: config.md.steps,
            seed_initial_frame: config.model.seed_initial_frame,
            checkpoint_path: config.output.checkpoint_path.clone(),
        };

        let mut runner = OtfRunner::new(controller, stepper, settings);
        if let Some(path) = &config.output.log_path {
            let log = TextLog::create(path, config.output.log_interval)
                .with_context(|| format!("Failed to create log file {}", path.display()))?;
            runner.observe(log);
        }
        if let Some(path) = &config.output.jsonl_path {
            let log = JsonlLog::create(path)
                .with_context(|| format!("Failed to create JSONL log {}", path.display()))?;
            runner.observe(log);
        }
        Ok((runner, initial))
    }
}

impl<O: Oracle, S: Stepper> OtfRunner<O, S> {
    pub fn new(controller: LoopController<O>, stepper: S, settings: RunSettings) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            controller,
            stepper,
            observers: ObserverSet::new(),
            settings,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn controller(&self) -> &LoopController<O> {
        &self.controller
    }

    pub fn observe(&mut self, observer: impl StepObserver + Send + 'static) {
        self.observers.push(observer);
    }

    fn header(&self, initial: &Configuration) -> RunHeader {
        let gp = self.controller.gp();
        let config = &self.controller.state().tolerance;
        RunHeader {
            run_id: self.run_id,
            started_at: Utc::now(),
            n_atoms: initial.len(),
            species: initial.species.clone(),
            cell: initial.cell,
            kernel: gp.hyperparameters().kind(),
            cutoffs: *gp.cutoffs(),
            hyperparameters: gp.hyperparameters().named(),
            tolerance_factor: config.factor,
            max_atoms_added: config.max_atoms_added,
            freeze_hyps: self.controller.config().freeze_hyps,
            time_step: self.stepper.time_step(),
            steps: self.settings.steps,
            oracle: self.controller.oracle().name().to_string(),
            mapping_enabled: self.controller.mapping().is_enabled(),
        }
    }

    fn record(&self, configuration: &Configuration, report: &StepReport) -> StepRecord {
        let (oracle_energy, hyperparameters, optimized) = match &report.outcome {
            StepOutcome::Quiet => (None, None, false),
            StepOutcome::Triggered {
                oracle_energy,
                optimization,
                ..
            } => (
                *oracle_energy,
                Some(self.controller.gp().hyperparameters().named()),
                optimization.is_some(),
            ),
        };
        StepRecord {
            step_index: report.step_index,
            time: report.step_index as f64 * self.stepper.time_step(),
            species: configuration.species.clone(),
            positions: configuration.positions.clone(),
            velocities: configuration.velocities.clone(),
            forces: report.prediction.forces.clone(),
            stds: report.prediction.stds.clone(),
            source: report.prediction.source,
            uncertainties: report.uncertainties.clone(),
            threshold: report.threshold,
            selected: report.selected().to_vec(),
            oracle_energy,
            hyperparameters,
            optimized,
            active_set_size: report.active_set_size,
            mapping_fallback: report.mapping_fallback,
        }
    }

    /// Drive the trajectory from `initial` for the configured number of
    /// steps. Any fatal error stops the run before the failing step is
    /// logged; no checkpoint is written in that case.
    pub async fn run(&mut self, initial: Configuration) -> Result<RunOutcome> {
        let started = Instant::now();
        let header = self.header(&initial);
        self.observers
            .on_start(&header)
            .context("Failed to write run header")?;
        info!(
            run_id = %self.run_id,
            atoms = initial.len(),
            steps = self.settings.steps,
            oracle = %header.oracle,
            "starting on-the-fly run"
        );

        if self.settings.seed_initial_frame {
            self.controller
                .seed(&initial)
                .await
                .context("Failed to seed the active set from the initial frame")?;
        }

        let mut configuration = initial;
        for _ in 0..self.settings.steps {
            let report = self
                .controller
                .step(&configuration)
                .await
                .with_context(|| format!("Step {} failed", configuration.step_index))?;
            let record = self.record(&configuration, &report);
            self.observers
                .on_step(&record)
                .with_context(|| format!("Failed to log step {}", record.step_index))?;
            configuration = self
                .stepper
                .advance(&configuration, &report.prediction.forces)
                .with_context(|| format!("Failed to advance step {}", report.step_index))?;
        }

        let state = self.controller.state();
        let summary = RunSummary {
            run_id: self.run_id,
            finished_at: Utc::now(),
            steps: self.settings.steps,
            triggers: state.triggers,
            oracle_calls: state.oracle_calls,
            active_set_size: self.controller.active_set().len(),
            hyperparameters: self.controller.gp().hyperparameters().named(),
            wall_seconds: started.elapsed().as_secs_f64(),
        };
        self.observers
            .on_finish(&summary)
            .context("Failed to write run summary")?;

        if let Some(path) = &self.settings.checkpoint_path {
            ModelCheckpoint::capture(self.run_id, self.controller.gp(), self.controller.active_set())
                .save_to_file(path)?;
        }
        info!(
            run_id = %self.run_id,
            triggers = summary.triggers,
            oracle_calls = summary.oracle_calls,
            active_set_size = summary.active_set_size,
            "run complete"
        );

        Ok(RunOutcome {
            run_id: self.run_id,
            final_configuration: configuration,
            summary,
        })
    }
}
