use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::{OtfError, OtfResult};
use crate::learning::{GateConfig, ReferenceScale};
use crate::mapping::MappingConfig;
use crate::md::VerletConfig;
use crate::model::{Hyperparameters, KernelKind, OptimizerConfig};
use crate::oracle::{timeout_from_secs, OracleConfig};
use crate::structure::{Configuration, Cutoffs, Vec3};

/// Complete configuration for an on-the-fly MD run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OtfConfig {
    pub md: MdConfig,
    pub structure: StructureConfig,
    pub model: ModelConfig,
    pub gate: GateConfig,
    pub active_set: ActiveSetConfig,
    pub mapping: MappingConfig,
    pub oracle: OracleConfig,
    pub output: OutputConfig,
}

/// Trajectory settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MdConfig {
    /// Number of MD steps (default: 100).
    pub steps: usize,
    /// Time step (default: 0.005).
    pub dt: f64,
    /// Mass per species.
    pub masses: HashMap<String, f64>,
    /// If set, initial velocities are drawn at this kT instead of read from
    /// the structure.
    #[serde(default)]
    pub initial_kt: Option<f64>,
    /// RNG seed for velocity sampling (default: 0).
    #[serde(default)]
    pub seed: u64,
}

/// Initial frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructureConfig {
    pub positions: Vec<Vec3>,
    /// Rows are lattice vectors.
    pub cell: [Vec3; 3],
    pub species: Vec<String>,
    /// Defaults to rest.
    #[serde(default)]
    pub velocities: Option<Vec<Vec3>>,
}

impl StructureConfig {
    pub fn to_configuration(&self) -> OtfResult<Configuration> {
        let mut cfg = Configuration::new(self.positions.clone(), self.cell, self.species.clone());
        if let Some(v) = &self.velocities {
            cfg.velocities = v.clone();
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Surrogate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Body orders (default: two_body).
    pub kernel: KernelKind,
    pub cutoffs: Cutoffs,
    /// Starting hyperparameters `[σ₂, ℓ₂][σ₃, ℓ₃] σₙ`; kernel defaults when
    /// absent.
    #[serde(default)]
    pub hyperparameters: Option<Vec<f64>>,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    /// Stop optimizing hyperparameters from this step on (default: never).
    #[serde(default)]
    pub freeze_hyps: Option<usize>,
    /// Optimize on every n-th triggering step (default: 1).
    #[serde(default = "default_optimize_every")]
    pub optimize_every: usize,
    /// Label every atom of the first frame before step 0 (default: false).
    #[serde(default)]
    pub seed_initial_frame: bool,
}

fn default_optimize_every() -> usize {
    1
}

impl ModelConfig {
    pub fn initial_hyperparameters(&self) -> OtfResult<Hyperparameters> {
        match &self.hyperparameters {
            Some(values) => Hyperparameters::new(self.kernel, values.clone()),
            None => Ok(Hyperparameters::default_for(self.kernel)),
        }
    }
}

/// Training buffer settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActiveSetConfig {
    /// Maximum number of training environments (default: unbounded).
    #[serde(default)]
    pub max_size: Option<usize>,
}

/// Output files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Human-readable frame log.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// Write quiet frames every n steps (default: 1).
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,
    /// One JSON record per step.
    #[serde(default)]
    pub jsonl_path: Option<PathBuf>,
    /// Model checkpoint written after a successful run.
    #[serde(default)]
    pub checkpoint_path: Option<PathBuf>,
}

fn default_log_interval() -> usize {
    1
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            log_path: None,
            log_interval: 1,
            jsonl_path: None,
            checkpoint_path: None,
        }
    }
}

impl Default for MdConfig {
    fn default() -> Self {
        Self {
            steps: 100,
            dt: 0.005,
            masses: HashMap::from([("Ar".to_string(), 1.0)]),
            initial_kt: None,
            seed: 0,
        }
    }
}

impl Default for StructureConfig {
    /// Slightly perturbed four-atom fcc cell in Lennard-Jones units.
    fn default() -> Self {
        let a = 1.6;
        Self {
            positions: vec![
                [0.02, 0.0, -0.01],
                [0.5 * a, 0.5 * a + 0.03, 0.0],
                [0.5 * a - 0.02, 0.0, 0.5 * a],
                [0.0, 0.5 * a, 0.5 * a + 0.01],
            ],
            cell: [[a, 0.0, 0.0], [0.0, a, 0.0], [0.0, 0.0, a]],
            species: vec!["Ar".into(); 4],
            velocities: None,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            kernel: KernelKind::TwoBody,
            cutoffs: Cutoffs {
                two_body: 2.5,
                three_body: None,
            },
            hyperparameters: None,
            optimizer: OptimizerConfig::default(),
            freeze_hyps: None,
            optimize_every: 1,
            seed_initial_frame: false,
        }
    }
}

impl Default for OtfConfig {
    fn default() -> Self {
        Self {
            md: MdConfig::default(),
            structure: StructureConfig::default(),
            model: ModelConfig::default(),
            gate: GateConfig {
                factor: 1.0,
                reference: ReferenceScale::Noise,
                max_atoms_added: 1,
            },
            active_set: ActiveSetConfig::default(),
            mapping: MappingConfig::default(),
            oracle: OracleConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl OtfConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config from {}", path.as_ref().display()))?;
        let config: Self = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse config {}", path.as_ref().display()))?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize config to JSON")?;
        std::fs::write(path.as_ref(), json)
            .with_context(|| format!("Failed to write config to {}", path.as_ref().display()))
    }

    pub fn verlet(&self) -> VerletConfig {
        VerletConfig {
            dt: self.md.dt,
            masses: self.md.masses.clone(),
        }
    }

    /// Every check that must pass before step 0.
    pub fn validate(&self) -> OtfResult<()> {
        self.gate.validate()?;

        let cap = self.active_set.max_size;
        match cap {
            Some(0) => return Err(OtfError::Config("active set cap must be positive".into())),
            Some(c) if c < self.gate.max_atoms_added => {
                return Err(OtfError::Config(format!(
                    "active set cap {c} is smaller than max_atoms_added {}",
                    self.gate.max_atoms_added
                )))
            }
            _ => {}
        }

        let model = &self.model;
        model.cutoffs.validate()?;
        if model.kernel.has_three_body() && model.cutoffs.three_body.is_none() {
            return Err(OtfError::Config(format!(
                "{} kernel needs a three-body cutoff",
                model.kernel.as_str()
            )));
        }
        model.initial_hyperparameters()?;
        if model.optimize_every == 0 {
            return Err(OtfError::Config("optimize_every must be positive".into()));
        }
        if model.optimizer.max_iterations == 0 || !(model.optimizer.initial_step > 0.0) {
            return Err(OtfError::Config(
                "optimizer needs at least one iteration and a positive step".into(),
            ));
        }

        if self.mapping.enabled {
            self.mapping.validate(&model.cutoffs)?;
        }

        let initial = self.structure.to_configuration()?;
        self.verlet().validate(&initial.unique_species())?;
        if let Some(kt) = self.md.initial_kt {
            if !(kt >= 0.0 && kt.is_finite()) {
                return Err(OtfError::Config(format!("initial kT must be non-negative, got {kt}")));
            }
        }
        if model.seed_initial_frame {
            if let Some(c) = cap {
                if c < initial.len() {
                    return Err(OtfError::Config(format!(
                        "seeding labels {} atoms but the active set cap is {c}",
                        initial.len()
                    )));
                }
            }
        }

        if self.output.log_interval == 0 {
            return Err(OtfError::Config("log_interval must be positive".into()));
        }
        let timeout = match &self.oracle {
            OracleConfig::Command(c) if c.command.is_empty() => {
                return Err(OtfError::Config("oracle command is empty".into()))
            }
            OracleConfig::Http(c) if c.base_url.is_empty() => {
                return Err(OtfError::Config("oracle base_url is empty".into()))
            }
            OracleConfig::Command(c) => c.timeout_secs,
            OracleConfig::Http(c) => c.timeout_secs,
            OracleConfig::LennardJones(_) => None,
        };
        if let Some(secs) = timeout {
            timeout_from_secs(secs).map_err(|e| OtfError::Config(e.to_string()))?;
        }
        Ok(())
    }
}
