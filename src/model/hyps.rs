//! Kernel selection and the named hyperparameter vector.

use serde::{Deserialize, Serialize};

use crate::error::{OtfError, OtfResult};

/// Which body orders the force kernel sums over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelKind {
    TwoBody,
    ThreeBody,
    TwoPlusThree,
}

impl KernelKind {
    pub fn has_two_body(&self) -> bool {
        matches!(self, Self::TwoBody | Self::TwoPlusThree)
    }

    pub fn has_three_body(&self) -> bool {
        matches!(self, Self::ThreeBody | Self::TwoPlusThree)
    }

    /// Number of hyperparameters, noise included.
    pub fn n_hyps(&self) -> usize {
        let mut n = 1;
        if self.has_two_body() {
            n += 2;
        }
        if self.has_three_body() {
            n += 2;
        }
        n
    }

    /// Human-readable labels in vector order.
    pub fn labels(&self) -> Vec<&'static str> {
        let mut labels = Vec::with_capacity(self.n_hyps());
        if self.has_two_body() {
            labels.extend(["Signal Std 2-body", "Length Scale 2-body"]);
        }
        if self.has_three_body() {
            labels.extend(["Signal Std 3-body", "Length Scale 3-body"]);
        }
        labels.push("Noise Std");
        labels
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TwoBody => "two_body",
            Self::ThreeBody => "three_body",
            Self::TwoPlusThree => "two_plus_three",
        }
    }
}

/// Signal std and length scale of one body order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SquaredExponential {
    pub sigma: f64,
    pub length: f64,
}

/// Positive hyperparameters laid out as `[σ₂, ℓ₂][σ₃, ℓ₃] σₙ`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    kind: KernelKind,
    values: Vec<f64>,
}

impl Hyperparameters {
    pub fn new(kind: KernelKind, values: Vec<f64>) -> OtfResult<Self> {
        if values.len() != kind.n_hyps() {
            return Err(OtfError::Config(format!(
                "{} kernel takes {} hyperparameters, got {}",
                kind.as_str(),
                kind.n_hyps(),
                values.len()
            )));
        }
        if let Some(bad) = values.iter().find(|v| !(v.is_finite() && **v > 0.0)) {
            return Err(OtfError::Config(format!(
                "hyperparameters must be positive and finite, got {bad}"
            )));
        }
        Ok(Self { kind, values })
    }

    /// Starting point used when the configuration gives none.
    pub fn default_for(kind: KernelKind) -> Self {
        let mut values = Vec::with_capacity(kind.n_hyps());
        if kind.has_two_body() {
            values.extend([1.0, 1.0]);
        }
        if kind.has_three_body() {
            values.extend([0.1, 1.0]);
        }
        values.push(0.05);
        Self { kind, values }
    }

    pub fn kind(&self) -> KernelKind {
        self.kind
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn two_body(&self) -> Option<SquaredExponential> {
        self.kind.has_two_body().then(|| SquaredExponential {
            sigma: self.values[0],
            length: self.values[1],
        })
    }

    pub fn three_body(&self) -> Option<SquaredExponential> {
        if !self.kind.has_three_body() {
            return None;
        }
        let offset = if self.kind.has_two_body() { 2 } else { 0 };
        Some(SquaredExponential {
            sigma: self.values[offset],
            length: self.values[offset + 1],
        })
    }

    /// Index of the first three-body hyperparameter.
    pub fn three_body_offset(&self) -> usize {
        if self.kind.has_two_body() {
            2
        } else {
            0
        }
    }

    /// Observation noise std (always the last entry).
    pub fn noise(&self) -> f64 {
        self.values[self.values.len() - 1]
    }

    /// `(label, value)` pairs for logging.
    pub fn named(&self) -> Vec<(String, f64)> {
        self.kind
            .labels()
            .into_iter()
            .zip(self.values.iter())
            .map(|(label, v)| (label.to_string(), *v))
            .collect()
    }
}
