//! Bounded gradient ascent on the log marginal likelihood.
//!
//! Works in log-hyperparameter space so positivity is automatic. Each
//! iteration steps along the normalized gradient and backtracks until the
//! objective improves; the step grows again after every accepted move.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::OtfResult;

const MIN_LOG: f64 = -13.815_510_557_964_274; // ln(1e-6)
const MAX_LOG: f64 = 13.815_510_557_964_274; // ln(1e6)
const MAX_BACKTRACKS: usize = 20;

/// Optimizer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Maximum accepted steps per call.
    pub max_iterations: usize,
    /// Stop once the log-space gradient norm falls below this.
    pub gradient_tolerance: f64,
    /// Initial step length in log space.
    pub initial_step: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            gradient_tolerance: 1e-4,
            initial_step: 0.1,
        }
    }
}

/// Outcome of one optimization call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationReport {
    pub values: Vec<f64>,
    pub log_likelihood: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// Maximize `objective` starting from `start`.
///
/// `objective` returns the log likelihood and its gradient with respect to
/// the (linear-space) hyperparameters. The best point seen is always
/// returned, converged or not.
pub fn maximize<F>(start: &[f64], config: &OptimizerConfig, mut objective: F) -> OtfResult<OptimizationReport>
where
    F: FnMut(&[f64]) -> OtfResult<(f64, Vec<f64>)>,
{
    let mut theta: Vec<f64> = start.iter().map(|v| v.ln().clamp(MIN_LOG, MAX_LOG)).collect();
    let mut current = exp_all(&theta);
    let (mut best, mut grad) = objective(&current)?;
    let mut step = config.initial_step;
    let mut converged = false;
    let mut iterations = 0;

    while iterations < config.max_iterations {
        let log_grad = log_gradient(&grad, &current);
        let norm = log_grad.iter().map(|g| g * g).sum::<f64>().sqrt();
        if !norm.is_finite() {
            warn!("non-finite likelihood gradient, keeping current hyperparameters");
            break;
        }
        if norm < config.gradient_tolerance {
            converged = true;
            break;
        }

        let mut accepted = None;
        for _ in 0..MAX_BACKTRACKS {
            let trial: Vec<f64> = theta
                .iter()
                .zip(&log_grad)
                .map(|(t, g)| (t + step * g / norm).clamp(MIN_LOG, MAX_LOG))
                .collect();
            let values = exp_all(&trial);
            // A failed factorization at the trial point counts as no improvement.
            match objective(&values) {
                Ok((ll, g)) if ll.is_finite() && ll > best => {
                    accepted = Some((trial, values, ll, g));
                    break;
                }
                _ => step *= 0.5,
            }
        }

        let Some((trial, values, ll, g)) = accepted else {
            // No ascent direction within the step floor: a stationary point
            // for practical purposes.
            converged = true;
            break;
        };
        iterations += 1;
        debug!(iteration = iterations, log_likelihood = ll, step, "hyperparameter step accepted");
        theta = trial;
        current = values;
        best = ll;
        grad = g;
        step *= 1.5;
    }

    if !converged {
        let log_grad = log_gradient(&grad, &current);
        let norm = log_grad.iter().map(|g| g * g).sum::<f64>().sqrt();
        converged = norm < config.gradient_tolerance;
    }
    if !converged {
        warn!(
            iterations,
            log_likelihood = best,
            "hyperparameter optimization did not converge, keeping best point"
        );
    }

    Ok(OptimizationReport {
        values: current,
        log_likelihood: best,
        iterations,
        converged,
    })
}

fn exp_all(theta: &[f64]) -> Vec<f64> {
    theta.iter().map(|t| t.exp()).collect()
}

/// Chain rule: d/d(ln x) = x · d/dx.
fn log_gradient(grad: &[f64], values: &[f64]) -> Vec<f64> {
    grad.iter().zip(values).map(|(g, v)| g * v).collect()
}
