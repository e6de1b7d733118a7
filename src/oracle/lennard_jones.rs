//! Analytic periodic Lennard-Jones reference calculator.
//!
//! Cheap enough to label every frame, which makes it the ground truth for
//! demos and end-to-end tests.

use serde::{Deserialize, Serialize};

use super::traits::{Oracle, OracleOutput};
use crate::error::OracleError;
use crate::structure::{environments, Configuration, Cutoffs};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LennardJonesConfig {
    pub epsilon: f64,
    pub sigma: f64,
    pub cutoff: f64,
}

impl Default for LennardJonesConfig {
    fn default() -> Self {
        Self {
            epsilon: 1.0,
            sigma: 1.0,
            cutoff: 2.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LennardJones {
    config: LennardJonesConfig,
}

impl LennardJones {
    pub fn new(config: LennardJonesConfig) -> Self {
        Self { config }
    }

    /// Pair energy, shifted to zero at the cutoff.
    fn pair_energy(&self, r: f64) -> f64 {
        let raw = |r: f64| {
            let s6 = (self.config.sigma / r).powi(6);
            4.0 * self.config.epsilon * (s6 * s6 - s6)
        };
        raw(r) - raw(self.config.cutoff)
    }

    /// dφ/dr.
    fn pair_derivative(&self, r: f64) -> f64 {
        let s6 = (self.config.sigma / r).powi(6);
        4.0 * self.config.epsilon * (-12.0 * s6 * s6 + 6.0 * s6) / r
    }

    /// Forces and total energy of `configuration`.
    pub fn compute(&self, configuration: &Configuration) -> Result<OracleOutput, OracleError> {
        let cutoffs = Cutoffs {
            two_body: self.config.cutoff,
            three_body: None,
        };
        let envs = environments(configuration, &cutoffs).map_err(|e| OracleError::Malformed(e.to_string()))?;
        let mut forces = Vec::with_capacity(envs.len());
        let mut energy = 0.0;
        for env in &envs {
            let mut f = [0.0; 3];
            for bond in &env.bonds {
                let dphi = self.pair_derivative(bond.distance);
                for (d, component) in f.iter_mut().enumerate() {
                    *component += dphi * bond.direction(d);
                }
                energy += 0.5 * self.pair_energy(bond.distance);
            }
            forces.push(f);
        }
        Ok(OracleOutput {
            forces,
            energy: Some(energy),
        })
    }
}

impl Oracle for LennardJones {
    async fn evaluate(&self, configuration: &Configuration) -> Result<OracleOutput, OracleError> {
        self.compute(configuration)?.validate(configuration.len())
    }

    fn name(&self) -> &str {
        "lennard_jones"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dimer(r: f64) -> Configuration {
        Configuration::new(
            vec![[0.0; 3], [r, 0.0, 0.0]],
            [[20.0, 0.0, 0.0], [0.0, 20.0, 0.0], [0.0, 0.0, 20.0]],
            vec!["Ar".into(), "Ar".into()],
        )
    }

    #[tokio::test]
    async fn test_dimer_forces_are_equal_and_opposite() {
        let lj = LennardJones::new(LennardJonesConfig::default());
        let out = lj.evaluate(&dimer(1.0)).await.unwrap();
        for d in 0..3 {
            assert!((out.forces[0][d] + out.forces[1][d]).abs() < 1e-12);
        }
        // Compressed below the minimum: atoms push apart.
        assert!(out.forces[0][0] < 0.0);
        assert!(out.forces[1][0] > 0.0);
    }

    #[test]
    fn test_force_vanishes_at_potential_minimum() {
        let lj = LennardJones::new(LennardJonesConfig::default());
        let r_min = 2.0_f64.powf(1.0 / 6.0);
        let out = lj.compute(&dimer(r_min)).unwrap();
        assert!(out.forces[0][0].abs() < 1e-10);
    }

    #[test]
    fn test_force_is_negative_energy_gradient() {
        let lj = LennardJones::new(LennardJonesConfig::default());
        let r = 1.3;
        let h = 1e-6;
        let e_plus = lj.compute(&dimer(r + h)).unwrap().energy.unwrap();
        let e_minus = lj.compute(&dimer(r - h)).unwrap().energy.unwrap();
        let fd = -(e_plus - e_minus) / (2.0 * h);
        let out = lj.compute(&dimer(r)).unwrap();
        assert!((out.forces[1][0] - fd).abs() < 1e-5);
    }
}
