//! JSON snapshots of a trained surrogate.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::gp::GaussianProcess;
use super::hyps::{Hyperparameters, KernelKind};
use crate::learning::ActiveSet;
use crate::structure::Cutoffs;

/// Everything needed to rebuild the surrogate: the active set plus the
/// hyperparameters it was fitted with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCheckpoint {
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub kernel: KernelKind,
    pub cutoffs: Cutoffs,
    pub hyperparameters: Hyperparameters,
    pub active_set: ActiveSet,
}

impl ModelCheckpoint {
    pub fn capture(run_id: Uuid, gp: &GaussianProcess, active_set: &ActiveSet) -> Self {
        Self {
            run_id,
            created_at: Utc::now(),
            kernel: gp.hyperparameters().kind(),
            cutoffs: *gp.cutoffs(),
            hyperparameters: gp.hyperparameters().clone(),
            active_set: active_set.clone(),
        }
    }

    /// Rebuild and fit the surrogate.
    pub fn restore(&self) -> Result<(GaussianProcess, ActiveSet)> {
        let mut gp = GaussianProcess::new(self.cutoffs, self.hyperparameters.clone())
            .context("Checkpoint holds an invalid model definition")?;
        gp.refit(&self.active_set)
            .context("Failed to refit surrogate from checkpoint")?;
        Ok((gp, self.active_set.clone()))
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize model checkpoint to JSON")?;
        std::fs::write(path.as_ref(), json).with_context(|| {
            format!("Failed to write model checkpoint to {}", path.as_ref().display())
        })?;
        tracing::info!(
            path = %path.as_ref().display(),
            training_points = self.active_set.len(),
            "Saved model checkpoint"
        );
        Ok(())
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref()).with_context(|| {
            format!("Failed to read model checkpoint from {}", path.as_ref().display())
        })?;
        let checkpoint: Self =
            serde_json::from_str(&data).context("Failed to deserialize model checkpoint JSON")?;
        Ok(checkpoint)
    }
}
