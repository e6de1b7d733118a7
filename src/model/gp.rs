//! Gaussian-process force surrogate.
//!
//! Training data are oracle forces on local environments; each environment
//! contributes three rows (x, y, z) to the covariance matrix. The model keeps
//! the lower Cholesky factor of `K + σₙ²I` and the weight vector
//! `α = (K + σₙ²I)⁻¹y`, so prediction is a cross-covariance product and an
//! extension of the training set only needs the new rows of the factor.

use nalgebra::{Cholesky, DMatrix, DVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::hyps::{Hyperparameters, KernelKind};
use super::kernel::{Block, ForceKernel};
use super::optimizer::{self, OptimizationReport, OptimizerConfig};
use crate::error::{OtfError, OtfResult};
use crate::learning::ActiveSet;
use crate::structure::{environments, AtomicEnvironment, Configuration, Cutoffs, ForceField, ForceSource, Prediction};

/// Identity of the active set a fit was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FitStamp {
    version: u64,
    generation: u64,
    len: usize,
}

/// How [`GaussianProcess::update`] brought the model up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Unchanged,
    Incremental { added: usize },
    Refit,
}

/// Serializable summary of the surrogate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurrogateState {
    pub kernel: KernelKind,
    pub cutoffs: Cutoffs,
    pub hyperparameters: Vec<(String, f64)>,
    /// Active set version the model is conditioned on.
    pub fitted_from: Option<u64>,
    pub training_size: usize,
    pub version: u64,
}

#[derive(Debug, Clone)]
pub struct GaussianProcess {
    kernel: ForceKernel,
    hyps: Hyperparameters,
    training: Vec<AtomicEnvironment>,
    labels: DVector<f64>,
    l_factor: DMatrix<f64>,
    alpha: DVector<f64>,
    stamp: Option<FitStamp>,
    version: u64,
}

impl GaussianProcess {
    pub fn new(cutoffs: Cutoffs, hyps: Hyperparameters) -> OtfResult<Self> {
        cutoffs.validate()?;
        let kind = hyps.kind();
        if kind.has_three_body() && cutoffs.three_body.is_none() {
            return Err(OtfError::Config(format!(
                "{} kernel needs a three-body cutoff",
                kind.as_str()
            )));
        }
        Ok(Self {
            kernel: ForceKernel::new(kind, cutoffs),
            hyps,
            training: Vec::new(),
            labels: DVector::zeros(0),
            l_factor: DMatrix::zeros(0, 0),
            alpha: DVector::zeros(0),
            stamp: None,
            version: 0,
        })
    }

    pub fn kernel(&self) -> &ForceKernel {
        &self.kernel
    }

    pub fn cutoffs(&self) -> &Cutoffs {
        &self.kernel.cutoffs
    }

    pub fn hyperparameters(&self) -> &Hyperparameters {
        &self.hyps
    }

    pub fn noise(&self) -> f64 {
        self.hyps.noise()
    }

    /// Training environments in active-set order.
    pub fn training(&self) -> &[AtomicEnvironment] {
        &self.training
    }

    /// `(K + σₙ²I)⁻¹y`, three entries per training environment.
    pub fn alpha(&self) -> &DVector<f64> {
        &self.alpha
    }

    /// Lower Cholesky factor of `K + σₙ²I`.
    pub fn cholesky_factor(&self) -> &DMatrix<f64> {
        &self.l_factor
    }

    /// Bumped whenever the posterior changes.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Whether the model is conditioned on exactly this active set.
    pub fn is_fitted_to(&self, set: &ActiveSet) -> bool {
        match self.stamp {
            Some(stamp) => stamp.version == set.version(),
            None => set.is_empty(),
        }
    }

    pub fn state(&self) -> SurrogateState {
        SurrogateState {
            kernel: self.hyps.kind(),
            cutoffs: self.kernel.cutoffs,
            hyperparameters: self.hyps.named(),
            fitted_from: self.stamp.map(|s| s.version),
            training_size: self.training.len(),
            version: self.version,
        }
    }

    /// Condition the model on `set`, extending the factor in place when the
    /// set only grew since the last fit.
    pub fn update(&mut self, set: &ActiveSet) -> OtfResult<UpdateKind> {
        if self.is_fitted_to(set) {
            return Ok(UpdateKind::Unchanged);
        }
        if let Some(stamp) = self.stamp {
            if stamp.generation == set.generation() && set.len() > stamp.len && stamp.len > 0 {
                let added = set.len() - stamp.len;
                match self.extend_factor(set, stamp.len) {
                    Ok(()) => {
                        self.stamp = Some(stamp_of(set));
                        self.version += 1;
                        debug!(added, size = set.len(), "surrogate extended incrementally");
                        return Ok(UpdateKind::Incremental { added });
                    }
                    Err(err) => {
                        debug!(error = %err, "incremental update failed, refitting");
                    }
                }
            }
        }
        self.refit(set)?;
        Ok(UpdateKind::Refit)
    }

    /// Rebuild the factor from scratch on `set`.
    pub fn refit(&mut self, set: &ActiveSet) -> OtfResult<()> {
        let training: Vec<AtomicEnvironment> =
            set.points().iter().map(|p| p.environment.clone()).collect();
        let labels = stack_labels(set);
        let (l_factor, alpha) = if training.is_empty() {
            (DMatrix::zeros(0, 0), DVector::zeros(0))
        } else {
            let k = self.covariance(&training, &self.hyps);
            let l = Cholesky::new(k)
                .ok_or_else(|| OtfError::Linalg("training covariance is not positive definite".into()))?
                .l();
            let alpha = solve_alpha(&l, &labels)?;
            (l, alpha)
        };
        self.training = training;
        self.labels = labels;
        self.l_factor = l_factor;
        self.alpha = alpha;
        self.stamp = Some(stamp_of(set));
        self.version += 1;
        debug!(size = self.training.len(), "surrogate refit");
        Ok(())
    }

    /// Append the points past `old_len` to the Cholesky factor.
    fn extend_factor(&mut self, set: &ActiveSet, old_len: usize) -> OtfResult<()> {
        let new_envs: Vec<AtomicEnvironment> = set.points()[old_len..]
            .iter()
            .map(|p| p.environment.clone())
            .collect();
        let m_old = 3 * old_len;
        let m_new = 3 * new_envs.len();

        let k12 = self.cross_covariance(&self.training, &new_envs);
        let k22 = self.covariance(&new_envs, &self.hyps);

        let x = self
            .l_factor
            .solve_lower_triangular(&k12)
            .ok_or_else(|| OtfError::Linalg("singular factor during extension".into()))?;
        let schur = k22 - x.transpose() * &x;
        let l22 = Cholesky::new(schur)
            .ok_or_else(|| OtfError::Linalg("extension lost positive definiteness".into()))?
            .l();

        let mut l = DMatrix::zeros(m_old + m_new, m_old + m_new);
        l.view_mut((0, 0), (m_old, m_old)).copy_from(&self.l_factor);
        l.view_mut((m_old, 0), (m_new, m_old)).copy_from(&x.transpose());
        l.view_mut((m_old, m_old), (m_new, m_new)).copy_from(&l22);

        let labels = stack_labels(set);
        let alpha = solve_alpha(&l, &labels)?;

        self.training.extend(new_envs);
        self.labels = labels;
        self.l_factor = l;
        self.alpha = alpha;
        Ok(())
    }

    /// `K + σₙ²I` over `envs`, blocks evaluated in parallel.
    fn covariance(&self, envs: &[AtomicEnvironment], hyps: &Hyperparameters) -> DMatrix<f64> {
        let n = envs.len();
        let rows: Vec<Vec<Block>> = (0..n)
            .into_par_iter()
            .map(|i| (i..n).map(|j| self.kernel.block(&envs[i], &envs[j], hyps)).collect())
            .collect();
        let mut k = DMatrix::zeros(3 * n, 3 * n);
        for (i, row) in rows.iter().enumerate() {
            for (offset, block) in row.iter().enumerate() {
                place_symmetric(&mut k, i, i + offset, block);
            }
        }
        let noise2 = hyps.noise() * hyps.noise();
        for d in 0..3 * n {
            k[(d, d)] += noise2;
        }
        k
    }

    /// Noise-free covariance between `left` rows and `right` columns.
    fn cross_covariance(&self, left: &[AtomicEnvironment], right: &[AtomicEnvironment]) -> DMatrix<f64> {
        let blocks: Vec<Vec<Block>> = left
            .par_iter()
            .map(|a| right.iter().map(|b| self.kernel.block(a, b, &self.hyps)).collect())
            .collect();
        let mut k = DMatrix::zeros(3 * left.len(), 3 * right.len());
        for (i, row) in blocks.iter().enumerate() {
            for (j, block) in row.iter().enumerate() {
                for d1 in 0..3 {
                    for d2 in 0..3 {
                        k[(3 * i + d1, 3 * j + d2)] = block[d1][d2];
                    }
                }
            }
        }
        k
    }

    /// Predictive mean and per-component std of the force on one environment.
    fn predict_environment(&self, env: &AtomicEnvironment) -> OtfResult<([f64; 3], [f64; 3])> {
        let prior = self.kernel.block(env, env, &self.hyps);
        if self.training.is_empty() {
            let stds = [0, 1, 2].map(|d| prior[d][d].abs().sqrt());
            return Ok(([0.0; 3], stds));
        }
        let k_star = {
            let mut k = DMatrix::zeros(3 * self.training.len(), 3);
            for (i, train) in self.training.iter().enumerate() {
                let block = self.kernel.block(train, env, &self.hyps);
                for d1 in 0..3 {
                    for d2 in 0..3 {
                        k[(3 * i + d1, d2)] = block[d1][d2];
                    }
                }
            }
            k
        };
        let mean = k_star.transpose() * &self.alpha;
        let v = self
            .l_factor
            .solve_lower_triangular(&k_star)
            .ok_or_else(|| OtfError::Linalg("singular factor during prediction".into()))?;
        let mut force = [0.0; 3];
        let mut stds = [0.0; 3];
        for d in 0..3 {
            force[d] = mean[d];
            let var = prior[d][d] - v.column(d).norm_squared();
            stds[d] = var.abs().sqrt();
        }
        Ok((force, stds))
    }

    /// Log marginal likelihood of the current fit.
    pub fn log_likelihood(&self) -> f64 {
        if self.training.is_empty() {
            return 0.0;
        }
        let m = self.labels.len() as f64;
        let log_det_half: f64 = self.l_factor.diagonal().iter().map(|x| x.ln()).sum();
        -0.5 * self.labels.dot(&self.alpha) - log_det_half - 0.5 * m * (2.0 * std::f64::consts::PI).ln()
    }

    /// Log marginal likelihood of the current training data under `hyps`,
    /// with its gradient `½ tr((ααᵀ − K⁻¹) ∂K/∂θ)`.
    pub fn likelihood_and_gradient(&self, hyps: &Hyperparameters) -> OtfResult<(f64, Vec<f64>)> {
        let envs = &self.training;
        let n = envs.len();
        let m = 3 * n;
        let n_grad = hyps.len() - 1;

        let rows: Vec<Vec<(Block, Vec<Block>)>> = (0..n)
            .into_par_iter()
            .map(|i| {
                (i..n)
                    .map(|j| self.kernel.block_with_grads(&envs[i], &envs[j], hyps))
                    .collect()
            })
            .collect();

        let mut k = DMatrix::zeros(m, m);
        let mut dk = vec![DMatrix::zeros(m, m); n_grad];
        for (i, row) in rows.iter().enumerate() {
            for (offset, (block, grads)) in row.iter().enumerate() {
                let j = i + offset;
                place_symmetric(&mut k, i, j, block);
                for (g, grad) in grads.iter().enumerate() {
                    place_symmetric(&mut dk[g], i, j, grad);
                }
            }
        }
        let noise = hyps.noise();
        for d in 0..m {
            k[(d, d)] += noise * noise;
        }

        let chol = Cholesky::new(k)
            .ok_or_else(|| OtfError::Linalg("covariance not positive definite at trial point".into()))?;
        let alpha = chol.solve(&self.labels);
        let log_det_half: f64 = chol.l_dirty().diagonal().iter().map(|x| x.ln()).sum();
        let ll = -0.5 * self.labels.dot(&alpha) - log_det_half - 0.5 * m as f64 * (2.0 * std::f64::consts::PI).ln();

        let q = &alpha * alpha.transpose() - chol.inverse();
        let mut grad: Vec<f64> = dk.iter().map(|d| 0.5 * q.component_mul(d).sum()).collect();
        grad.push(noise * q.trace());
        Ok((ll, grad))
    }

    /// Re-estimate hyperparameters on the current training data and refit.
    pub fn optimize_hyperparameters(
        &mut self,
        set: &ActiveSet,
        config: &OptimizerConfig,
    ) -> OtfResult<OptimizationReport> {
        self.update(set)?;
        if self.training.is_empty() {
            return Ok(OptimizationReport {
                values: self.hyps.values().to_vec(),
                log_likelihood: 0.0,
                iterations: 0,
                converged: true,
            });
        }
        let kind = self.hyps.kind();
        let report = optimizer::maximize(self.hyps.values(), config, |values| {
            let hyps = Hyperparameters::new(kind, values.to_vec())?;
            self.likelihood_and_gradient(&hyps)
        })?;
        self.hyps = Hyperparameters::new(kind, report.values.clone())?;
        self.refit(set)?;
        info!(
            log_likelihood = report.log_likelihood,
            iterations = report.iterations,
            converged = report.converged,
            hyperparameters = ?self.hyps.values(),
            "hyperparameters optimized"
        );
        Ok(report)
    }

    /// Replace the hyperparameters and refit on `set`.
    pub fn set_hyperparameters(&mut self, hyps: Hyperparameters, set: &ActiveSet) -> OtfResult<()> {
        if hyps.kind() != self.hyps.kind() {
            return Err(OtfError::Config("hyperparameters belong to a different kernel".into()));
        }
        self.hyps = hyps;
        self.refit(set)
    }
}

impl ForceField for GaussianProcess {
    fn predict(&self, configuration: &Configuration) -> OtfResult<Prediction> {
        let envs = environments(configuration, self.cutoffs())?;
        let per_atom: Vec<([f64; 3], [f64; 3])> = envs
            .par_iter()
            .map(|env| self.predict_environment(env))
            .collect::<OtfResult<_>>()?;
        let (forces, stds) = per_atom.into_iter().unzip();
        Ok(Prediction {
            forces,
            stds,
            source: ForceSource::Surrogate,
        })
    }
}

fn stamp_of(set: &ActiveSet) -> FitStamp {
    FitStamp {
        version: set.version(),
        generation: set.generation(),
        len: set.len(),
    }
}

fn stack_labels(set: &ActiveSet) -> DVector<f64> {
    DVector::from_iterator(
        3 * set.len(),
        set.points().iter().flat_map(|p| p.label.iter().copied()),
    )
}

fn solve_alpha(l: &DMatrix<f64>, labels: &DVector<f64>) -> OtfResult<DVector<f64>> {
    let y = l
        .solve_lower_triangular(labels)
        .ok_or_else(|| OtfError::Linalg("singular factor".into()))?;
    l.tr_solve_lower_triangular(&y)
        .ok_or_else(|| OtfError::Linalg("singular factor".into()))
}

/// Write block (i, j) and its transpose at (j, i).
fn place_symmetric(k: &mut DMatrix<f64>, i: usize, j: usize, block: &Block) {
    for d1 in 0..3 {
        for d2 in 0..3 {
            k[(3 * i + d1, 3 * j + d2)] = block[d1][d2];
            k[(3 * j + d2, 3 * i + d1)] = block[d1][d2];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning::training_points;

    fn cluster(shift: f64, step: usize) -> Configuration {
        let mut cfg = Configuration::new(
            vec![
                [0.0, 0.0, 0.0],
                [1.1 + shift, 0.1, 0.0],
                [0.2, 1.2 - shift, 0.1],
                [-0.3, 0.4, 1.0 + shift],
            ],
            [[20.0, 0.0, 0.0], [0.0, 20.0, 0.0], [0.0, 0.0, 20.0]],
            vec!["Ar".into(); 4],
        );
        cfg.step_index = step;
        cfg
    }

    fn fake_forces(cfg: &Configuration) -> Vec<[f64; 3]> {
        cfg.positions.iter().map(|p| [-p[0], 0.5 * p[1], -0.2 * p[2]]).collect()
    }

    fn cutoffs() -> Cutoffs {
        Cutoffs {
            two_body: 3.0,
            three_body: Some(2.5),
        }
    }

    fn model(kind: KernelKind, noise: f64) -> GaussianProcess {
        let mut values = Hyperparameters::default_for(kind).values().to_vec();
        *values.last_mut().unwrap() = noise;
        GaussianProcess::new(cutoffs(), Hyperparameters::new(kind, values).unwrap()).unwrap()
    }

    fn add_frame(set: &mut ActiveSet, shift: f64, step: usize, atoms: &[usize]) {
        let cfg = cluster(shift, step);
        let points = training_points(&cfg, &fake_forces(&cfg), atoms, &cutoffs()).unwrap();
        set.extend(points).unwrap();
    }

    #[test]
    fn test_incremental_update_matches_full_refit() {
        let mut set = ActiveSet::new(None).unwrap();
        add_frame(&mut set, 0.0, 0, &[0, 1]);
        let mut incremental = model(KernelKind::TwoPlusThree, 0.05);
        assert_eq!(incremental.update(&set).unwrap(), UpdateKind::Refit);

        add_frame(&mut set, 0.1, 1, &[2, 3]);
        assert_eq!(incremental.update(&set).unwrap(), UpdateKind::Incremental { added: 2 });

        let mut full = model(KernelKind::TwoPlusThree, 0.05);
        full.refit(&set).unwrap();

        assert!((incremental.alpha() - full.alpha()).amax() < 1e-8);
        let query = cluster(0.05, 9);
        let a = incremental.predict(&query).unwrap();
        let b = full.predict(&query).unwrap();
        for (fa, fb) in a.forces.iter().zip(&b.forces) {
            for d in 0..3 {
                assert!((fa[d] - fb[d]).abs() < 1e-8);
            }
        }
    }

    #[test]
    fn test_eviction_forces_a_refit() {
        let mut set = ActiveSet::new(Some(2)).unwrap();
        add_frame(&mut set, 0.0, 0, &[0, 1]);
        let mut gp = model(KernelKind::TwoBody, 0.05);
        gp.update(&set).unwrap();
        add_frame(&mut set, 0.1, 1, &[2]);
        assert_eq!(gp.update(&set).unwrap(), UpdateKind::Refit);
        assert_eq!(gp.training().len(), 2);
        assert_eq!(gp.update(&set).unwrap(), UpdateKind::Unchanged);
    }

    #[test]
    fn test_reproduces_training_labels_with_small_noise() {
        let mut set = ActiveSet::new(None).unwrap();
        add_frame(&mut set, 0.0, 0, &[1]);
        let mut gp = model(KernelKind::TwoPlusThree, 1e-3);
        gp.update(&set).unwrap();
        let cfg = cluster(0.0, 0);
        let pred = gp.predict(&cfg).unwrap();
        let (f, y) = (pred.forces[1], fake_forces(&cfg)[1]);
        for d in 0..3 {
            assert!((f[d] - y[d]).abs() < 1e-2, "{f:?} vs {y:?}");
        }
        assert!(pred.uncertainties()[1] < 0.05);
    }

    #[test]
    fn test_prediction_does_not_mutate() {
        let mut set = ActiveSet::new(None).unwrap();
        add_frame(&mut set, 0.0, 0, &[0]);
        let mut gp = model(KernelKind::TwoBody, 0.05);
        gp.update(&set).unwrap();
        let before = gp.state();
        let _ = gp.predict(&cluster(0.2, 5)).unwrap();
        assert_eq!(gp.state(), before);
    }

    #[test]
    fn test_empty_model_reports_prior_uncertainty() {
        let gp = model(KernelKind::TwoBody, 0.05);
        let pred = gp.predict(&cluster(0.0, 0)).unwrap();
        assert!(pred.forces.iter().flatten().all(|f| *f == 0.0));
        assert!(pred.uncertainties().iter().all(|u| *u > 0.0));
    }

    #[test]
    fn test_likelihood_gradient_matches_finite_difference() {
        let mut set = ActiveSet::new(None).unwrap();
        add_frame(&mut set, 0.0, 0, &[0, 1, 2]);
        let mut gp = model(KernelKind::TwoPlusThree, 0.1);
        gp.update(&set).unwrap();

        let base = gp.hyperparameters().values().to_vec();
        let (ll, grad) = gp.likelihood_and_gradient(gp.hyperparameters()).unwrap();
        assert!((ll - gp.log_likelihood()).abs() < 1e-8);

        let h = 1e-6;
        for i in 0..base.len() {
            let mut up = base.clone();
            up[i] += h;
            let mut down = base.clone();
            down[i] -= h;
            let kind = KernelKind::TwoPlusThree;
            let (lu, _) = gp.likelihood_and_gradient(&Hyperparameters::new(kind, up).unwrap()).unwrap();
            let (ld, _) = gp.likelihood_and_gradient(&Hyperparameters::new(kind, down).unwrap()).unwrap();
            let fd = (lu - ld) / (2.0 * h);
            assert!(
                (fd - grad[i]).abs() < 1e-4 * (1.0 + fd.abs()),
                "hyp {i}: fd {fd} vs analytic {}",
                grad[i]
            );
        }
    }

    #[test]
    fn test_optimization_does_not_lower_likelihood() {
        let mut set = ActiveSet::new(None).unwrap();
        add_frame(&mut set, 0.0, 0, &[0, 1, 2, 3]);
        let mut gp = model(KernelKind::TwoBody, 0.1);
        gp.update(&set).unwrap();
        let before = gp.log_likelihood();
        let version = gp.version();
        let report = gp.optimize_hyperparameters(&set, &OptimizerConfig::default()).unwrap();
        assert!(report.log_likelihood >= before - 1e-9);
        assert!((gp.log_likelihood() - report.log_likelihood).abs() < 1e-6);
        assert!(gp.version() > version);
    }

    #[test]
    fn test_three_body_kernel_requires_cutoff() {
        let cutoffs = Cutoffs {
            two_body: 3.0,
            three_body: None,
        };
        let hyps = Hyperparameters::default_for(KernelKind::ThreeBody);
        assert!(GaussianProcess::new(cutoffs, hyps).is_err());
    }
}
