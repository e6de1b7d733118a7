//! Uncertainty gate: which atoms need a ground-truth label this step.

use std::cmp::Reverse;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::error::{OtfError, OtfResult};

/// What the tolerance factor multiplies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceScale {
    /// The surrogate's current noise hyperparameter.
    Noise,
    /// A fixed value in force units.
    Constant(f64),
}

/// Tolerance policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub factor: f64,
    pub reference: ReferenceScale,
    pub max_atoms_added: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            factor: 1.0,
            reference: ReferenceScale::Noise,
            max_atoms_added: 1,
        }
    }
}

impl GateConfig {
    pub fn validate(&self) -> OtfResult<()> {
        if !(self.factor.is_finite() && self.factor >= 0.0) {
            return Err(OtfError::Config(format!(
                "tolerance factor must be finite and non-negative, got {}",
                self.factor
            )));
        }
        if self.max_atoms_added == 0 {
            return Err(OtfError::Config("max_atoms_added must be positive".into()));
        }
        if let ReferenceScale::Constant(v) = self.reference {
            if !(v.is_finite() && v > 0.0) {
                return Err(OtfError::Config(format!(
                    "constant reference scale must be positive, got {v}"
                )));
            }
        }
        Ok(())
    }
}

/// Gate decision for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub threshold: f64,
    /// Selected atoms in ascending index order.
    pub atoms: Vec<usize>,
}

impl Selection {
    pub fn is_quiet(&self) -> bool {
        self.atoms.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct UncertaintyGate {
    config: GateConfig,
}

impl UncertaintyGate {
    pub fn new(config: GateConfig) -> OtfResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn threshold(&self, noise: f64) -> f64 {
        let scale = match self.config.reference {
            ReferenceScale::Noise => noise,
            ReferenceScale::Constant(v) => v,
        };
        self.config.factor * scale
    }

    /// Atoms whose uncertainty reaches the threshold, capped at
    /// `max_atoms_added` (highest first, lower index wins ties).
    pub fn select(&self, uncertainties: &[f64], noise: f64) -> Selection {
        self.select_excluding(uncertainties, noise, |_| false)
    }

    /// As [`select`](Self::select), skipping atoms for which `skip` holds
    /// before the cap is applied.
    pub fn select_excluding<F>(&self, uncertainties: &[f64], noise: f64, skip: F) -> Selection
    where
        F: Fn(usize) -> bool,
    {
        let threshold = self.threshold(noise);
        let mut candidates: Vec<(usize, f64)> = uncertainties
            .iter()
            .copied()
            .enumerate()
            .filter(|(i, u)| !u.is_nan() && *u >= threshold && !skip(*i))
            .collect();
        candidates.sort_by_key(|(i, u)| (Reverse(OrderedFloat(*u)), *i));
        candidates.truncate(self.config.max_atoms_added);

        let mut atoms: Vec<usize> = candidates.into_iter().map(|(i, _)| i).collect();
        atoms.sort_unstable();
        Selection { threshold, atoms }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(factor: f64, max_atoms_added: usize) -> UncertaintyGate {
        UncertaintyGate::new(GateConfig {
            factor,
            reference: ReferenceScale::Noise,
            max_atoms_added,
        })
        .unwrap()
    }

    #[test]
    fn test_nothing_above_threshold_is_quiet() {
        let sel = gate(10.0, 4).select(&[0.1, 0.2, 0.3], 0.05);
        assert!(sel.is_quiet());
        assert!((sel.threshold - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_highest_first_then_returned_ascending() {
        let sel = gate(1.0, 2).select(&[0.2, 0.9, 0.1, 0.5], 0.15);
        assert_eq!(sel.atoms, vec![1, 3]);
    }

    #[test]
    fn test_ties_prefer_lower_index() {
        let sel = gate(1.0, 2).select(&[0.5, 0.5, 0.5], 0.1);
        assert_eq!(sel.atoms, vec![0, 1]);
    }

    #[test]
    fn test_zero_factor_selects_even_zero_uncertainty() {
        let sel = gate(0.0, 3).select(&[0.0, 0.0, 0.0], 0.05);
        assert_eq!(sel.atoms, vec![0, 1, 2]);
    }

    #[test]
    fn test_nan_is_never_selected() {
        let sel = gate(0.0, 3).select(&[f64::NAN, 0.1], 0.05);
        assert_eq!(sel.atoms, vec![1]);
    }

    #[test]
    fn test_skipped_atoms_do_not_consume_the_cap() {
        let sel = gate(0.0, 1).select_excluding(&[0.9, 0.1], 0.05, |i| i == 0);
        assert_eq!(sel.atoms, vec![1]);
    }

    #[test]
    fn test_constant_reference_ignores_noise() {
        let g = UncertaintyGate::new(GateConfig {
            factor: 2.0,
            reference: ReferenceScale::Constant(0.1),
            max_atoms_added: 1,
        })
        .unwrap();
        assert!((g.threshold(100.0) - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_validation_rejects_bad_policies() {
        assert!(UncertaintyGate::new(GateConfig {
            factor: -1.0,
            ..GateConfig::default()
        })
        .is_err());
        assert!(UncertaintyGate::new(GateConfig {
            factor: f64::INFINITY,
            ..GateConfig::default()
        })
        .is_err());
        assert!(UncertaintyGate::new(GateConfig {
            max_atoms_added: 0,
            ..GateConfig::default()
        })
        .is_err());
    }
}
