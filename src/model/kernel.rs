//! Force/force covariance between local environments.
//!
//! The latent local energy of an atom is a sum of pair terms over bond
//! lengths and of triplet terms over `(r1, r2, r12)`, each drawn from a
//! squared-exponential prior. The force on the central atom is the negative
//! gradient with respect to its own position, so the covariance between force
//! components is the mixed second derivative of the energy kernel projected on
//! the bond directions:
//!
//! ```text
//! k(ρᵢ, d₁; ρⱼ, d₂) = Σ_a Σ_b  ûₐ[d₁] û_b[d₂] ∂²k(xₐ, x_b)/∂xₐ∂x_b
//! ```
//!
//! Descriptors only contribute when their species match (unordered pair for
//! two-body terms, ordered triplet for three-body terms).

use super::hyps::{Hyperparameters, KernelKind, SquaredExponential};
use crate::structure::{AtomicEnvironment, Bond, Cutoffs};

/// A 3×3 covariance block between two environments' force components.
pub type Block = [[f64; 3]; 3];

/// Mixed second derivative of an SE kernel and its hyperparameter gradients.
#[derive(Debug, Clone, Copy)]
pub struct MixedDerivative {
    pub value: f64,
    pub d_sigma: f64,
    pub d_length: f64,
}

/// `∂²/∂aₚ∂b_q  σ² exp(-|a-b|²/2ℓ²)` evaluated at `delta = a - b`.
pub fn se_mixed(delta: &[f64], p: usize, q: usize, se: SquaredExponential) -> MixedDerivative {
    let SquaredExponential { sigma, length } = se;
    let d2: f64 = delta.iter().map(|x| x * x).sum();
    let l2 = length * length;
    let l3 = l2 * length;
    let l4 = l2 * l2;
    let exp = (-d2 / (2.0 * l2)).exp();
    let kron = if p == q { 1.0 } else { 0.0 };
    let cross = delta[p] * delta[q];
    let bracket = kron / l2 - cross / l4;
    let s2 = sigma * sigma;
    MixedDerivative {
        value: s2 * exp * bracket,
        d_sigma: 2.0 * sigma * exp * bracket,
        d_length: s2 * exp * (d2 / l3 * bracket - 2.0 * kron / l3 + 4.0 * cross / (l4 * length)),
    }
}

fn same_pair(a: &str, b: &str, c: &str, d: &str) -> bool {
    (a == c && b == d) || (a == d && b == c)
}

/// The force kernel for a fixed body-order selection and cutoffs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForceKernel {
    pub kind: KernelKind,
    pub cutoffs: Cutoffs,
}

impl ForceKernel {
    pub fn new(kind: KernelKind, cutoffs: Cutoffs) -> Self {
        Self { kind, cutoffs }
    }

    /// Covariance block between the forces on the centres of `a` and `b`.
    pub fn block(&self, a: &AtomicEnvironment, b: &AtomicEnvironment, hyps: &Hyperparameters) -> Block {
        let mut block = [[0.0; 3]; 3];
        self.accumulate(a, b, hyps, &mut block, None);
        block
    }

    /// Covariance block plus its gradient with respect to every non-noise
    /// hyperparameter (in vector order).
    pub fn block_with_grads(
        &self,
        a: &AtomicEnvironment,
        b: &AtomicEnvironment,
        hyps: &Hyperparameters,
    ) -> (Block, Vec<Block>) {
        let mut block = [[0.0; 3]; 3];
        let mut grads = vec![[[0.0; 3]; 3]; hyps.len() - 1];
        self.accumulate(a, b, hyps, &mut block, Some(&mut grads));
        (block, grads)
    }

    fn accumulate(
        &self,
        a: &AtomicEnvironment,
        b: &AtomicEnvironment,
        hyps: &Hyperparameters,
        block: &mut Block,
        mut grads: Option<&mut Vec<Block>>,
    ) {
        if let Some(se) = hyps.two_body() {
            let c2 = self.cutoffs.two_body;
            for ba in a.bonds_within(c2) {
                for bb in b.bonds_within(c2) {
                    if !same_pair(&a.species, &ba.species, &b.species, &bb.species) {
                        continue;
                    }
                    let m = se_mixed(&[ba.distance - bb.distance], 0, 0, se);
                    add_projected(block, grads.as_deref_mut(), 0, &m, ba, bb);
                }
            }
        }

        if let Some(se) = hyps.three_body() {
            if a.species != b.species {
                return;
            }
            let offset = hyps.three_body_offset();
            for ta in &a.triplets {
                let pa = [&a.bonds[ta.first], &a.bonds[ta.second]];
                for tb in &b.triplets {
                    let pb = [&b.bonds[tb.first], &b.bonds[tb.second]];
                    if pa[0].species != pb[0].species || pa[1].species != pb[1].species {
                        continue;
                    }
                    let delta = [
                        pa[0].distance - pb[0].distance,
                        pa[1].distance - pb[1].distance,
                        ta.r12 - tb.r12,
                    ];
                    for p in 0..2 {
                        for q in 0..2 {
                            let m = se_mixed(&delta, p, q, se);
                            add_projected(block, grads.as_deref_mut(), offset, &m, pa[p], pb[q]);
                        }
                    }
                }
            }
        }
    }

    /// Radial response of one bond of length `r` between species `centre`
    /// and `neighbour` against every force component of `train`.
    ///
    /// Dotted with the surrogate weights this gives the pair force magnitude
    /// along the bond, which is what the mapping tabulates.
    pub fn pair_response(
        &self,
        centre: &str,
        neighbour: &str,
        r: f64,
        train: &AtomicEnvironment,
        se: SquaredExponential,
    ) -> [f64; 3] {
        let mut out = [0.0; 3];
        for bb in train.bonds_within(self.cutoffs.two_body) {
            if !same_pair(centre, neighbour, &train.species, &bb.species) {
                continue;
            }
            let m = se_mixed(&[r - bb.distance], 0, 0, se);
            for (d, o) in out.iter_mut().enumerate() {
                *o += m.value * bb.direction(d);
            }
        }
        out
    }

    /// Response of coordinate `p` (0 = r1, 1 = r2) of a triplet descriptor
    /// against every force component of `train`.
    pub fn triplet_response(
        &self,
        species: [&str; 3],
        descriptor: [f64; 3],
        p: usize,
        train: &AtomicEnvironment,
        se: SquaredExponential,
    ) -> [f64; 3] {
        let mut out = [0.0; 3];
        if species[0] != train.species {
            return out;
        }
        for tb in &train.triplets {
            let pb = [&train.bonds[tb.first], &train.bonds[tb.second]];
            if species[1] != pb[0].species || species[2] != pb[1].species {
                continue;
            }
            let delta = [
                descriptor[0] - pb[0].distance,
                descriptor[1] - pb[1].distance,
                descriptor[2] - tb.r12,
            ];
            for (q, bond) in pb.iter().enumerate() {
                let m = se_mixed(&delta, p, q, se);
                for (d, o) in out.iter_mut().enumerate() {
                    *o += m.value * bond.direction(d);
                }
            }
        }
        out
    }
}

fn add_projected(
    block: &mut Block,
    grads: Option<&mut Vec<Block>>,
    offset: usize,
    m: &MixedDerivative,
    left: &Bond,
    right: &Bond,
) {
    let u = [left.direction(0), left.direction(1), left.direction(2)];
    let w = [right.direction(0), right.direction(1), right.direction(2)];
    for d1 in 0..3 {
        for d2 in 0..3 {
            block[d1][d2] += m.value * u[d1] * w[d2];
        }
    }
    if let Some(grads) = grads {
        for d1 in 0..3 {
            for d2 in 0..3 {
                let proj = u[d1] * w[d2];
                grads[offset][d1][d2] += m.d_sigma * proj;
                grads[offset + 1][d1][d2] += m.d_length * proj;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structure::Configuration;

    fn env_of(positions: Vec<[f64; 3]>, atom: usize, cutoffs: &Cutoffs) -> AtomicEnvironment {
        let n = positions.len();
        let cfg = Configuration::new(
            positions,
            [[30.0, 0.0, 0.0], [0.0, 30.0, 0.0], [0.0, 0.0, 30.0]],
            vec!["Ar".to_string(); n],
        );
        AtomicEnvironment::new(&cfg, atom, cutoffs).unwrap()
    }

    fn cutoffs3() -> Cutoffs {
        Cutoffs {
            two_body: 3.0,
            three_body: Some(3.0),
        }
    }

    #[test]
    fn test_self_block_is_symmetric_and_positive() {
        let env = env_of(
            vec![[0.0; 3], [1.1, 0.2, 0.0], [0.1, 1.3, 0.4], [-0.9, 0.3, 0.8]],
            0,
            &cutoffs3(),
        );
        let kernel = ForceKernel::new(KernelKind::TwoPlusThree, cutoffs3());
        let hyps = Hyperparameters::default_for(KernelKind::TwoPlusThree);
        let block = kernel.block(&env, &env, &hyps);
        for d1 in 0..3 {
            assert!(block[d1][d1] > 0.0);
            for d2 in 0..3 {
                assert!((block[d1][d2] - block[d2][d1]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_kernel_is_symmetric_between_environments() {
        let cutoffs = cutoffs3();
        let a = env_of(vec![[0.0; 3], [1.1, 0.2, 0.0], [0.1, 1.3, 0.4]], 0, &cutoffs);
        let b = env_of(vec![[0.0; 3], [0.9, -0.1, 0.3], [0.2, 1.1, -0.2]], 0, &cutoffs);
        let kernel = ForceKernel::new(KernelKind::TwoPlusThree, cutoffs);
        let hyps = Hyperparameters::default_for(KernelKind::TwoPlusThree);
        let ab = kernel.block(&a, &b, &hyps);
        let ba = kernel.block(&b, &a, &hyps);
        for d1 in 0..3 {
            for d2 in 0..3 {
                assert!((ab[d1][d2] - ba[d2][d1]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_length_gradient_matches_finite_difference() {
        let cutoffs = cutoffs3();
        let a = env_of(vec![[0.0; 3], [1.1, 0.2, 0.0], [0.1, 1.3, 0.4]], 0, &cutoffs);
        let b = env_of(vec![[0.0; 3], [0.9, -0.1, 0.3], [0.2, 1.1, -0.2]], 0, &cutoffs);
        let kernel = ForceKernel::new(KernelKind::TwoPlusThree, cutoffs);
        let base = vec![0.8, 0.7, 0.3, 0.9, 0.05];
        let hyps = Hyperparameters::new(KernelKind::TwoPlusThree, base.clone()).unwrap();
        let (_, grads) = kernel.block_with_grads(&a, &b, &hyps);

        let h = 1e-6;
        for index in 0..4 {
            let mut up = base.clone();
            up[index] += h;
            let mut down = base.clone();
            down[index] -= h;
            let kup = kernel.block(&a, &b, &Hyperparameters::new(KernelKind::TwoPlusThree, up).unwrap());
            let kdn =
                kernel.block(&a, &b, &Hyperparameters::new(KernelKind::TwoPlusThree, down).unwrap());
            for d1 in 0..3 {
                for d2 in 0..3 {
                    let fd = (kup[d1][d2] - kdn[d1][d2]) / (2.0 * h);
                    assert!(
                        (fd - grads[index][d1][d2]).abs() < 1e-5,
                        "hyp {index} ({d1},{d2}): fd {fd} vs analytic {}",
                        grads[index][d1][d2]
                    );
                }
            }
        }
    }

    #[test]
    fn test_species_mismatch_gives_zero() {
        let cutoffs = Cutoffs {
            two_body: 3.0,
            three_body: None,
        };
        let cfg = Configuration::new(
            vec![[0.0; 3], [1.0, 0.0, 0.0]],
            [[30.0, 0.0, 0.0], [0.0, 30.0, 0.0], [0.0, 0.0, 30.0]],
            vec!["Ar".into(), "Ne".into()],
        );
        let ar = AtomicEnvironment::new(&cfg, 0, &cutoffs).unwrap();
        let other = env_of(vec![[0.0; 3], [1.0, 0.0, 0.0]], 0, &cutoffs);
        let kernel = ForceKernel::new(KernelKind::TwoBody, cutoffs);
        let block = kernel.block(&ar, &other, &Hyperparameters::default_for(KernelKind::TwoBody));
        assert!(block.iter().flatten().all(|v| *v == 0.0));
    }

    #[test]
    fn test_pair_response_reconstructs_block() {
        // With a single bond on each side, the block is the outer product of
        // the left direction with the pair response.
        let cutoffs = Cutoffs {
            two_body: 3.0,
            three_body: None,
        };
        let a = env_of(vec![[0.0; 3], [1.2, 0.5, 0.0]], 0, &cutoffs);
        let b = env_of(vec![[0.0; 3], [0.3, 1.4, 0.2]], 0, &cutoffs);
        let kernel = ForceKernel::new(KernelKind::TwoBody, cutoffs);
        let hyps = Hyperparameters::default_for(KernelKind::TwoBody);
        let block = kernel.block(&a, &b, &hyps);
        let bond = &a.bonds[0];
        let response = kernel.pair_response("Ar", "Ar", bond.distance, &b, hyps.two_body().unwrap());
        for d1 in 0..3 {
            for d2 in 0..3 {
                assert!((block[d1][d2] - bond.direction(d1) * response[d2]).abs() < 1e-12);
            }
        }
    }
}
