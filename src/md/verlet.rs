//! Position Verlet integration.

use std::collections::HashMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::Stepper;
use crate::error::{OtfError, OtfResult};
use crate::structure::{Configuration, Vec3};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerletConfig {
    /// Time step.
    pub dt: f64,
    /// Mass of each species.
    pub masses: HashMap<String, f64>,
}

impl VerletConfig {
    pub fn validate(&self, species: &[String]) -> OtfResult<()> {
        if !(self.dt > 0.0 && self.dt.is_finite()) {
            return Err(OtfError::Config(format!("time step must be positive, got {}", self.dt)));
        }
        for s in species {
            match self.masses.get(s) {
                Some(m) if *m > 0.0 && m.is_finite() => {}
                Some(m) => {
                    return Err(OtfError::Config(format!("mass of {s} must be positive, got {m}")))
                }
                None => return Err(OtfError::Config(format!("no mass given for species {s}"))),
            }
        }
        Ok(())
    }
}

/// `x(t+dt) = 2x(t) - x(t-dt) + dt² F/m`.
///
/// The emitted frame carries the central-difference velocity
/// `(x(t+dt) - x(t-dt)) / 2dt`. The first call bootstraps `x(t-dt)` from the
/// initial velocities.
#[derive(Debug, Clone)]
pub struct VerletStepper {
    config: VerletConfig,
    previous: Option<Vec<Vec3>>,
}

impl VerletStepper {
    pub fn new(config: VerletConfig) -> Self {
        Self {
            config,
            previous: None,
        }
    }

    fn mass(&self, species: &str) -> OtfResult<f64> {
        self.config
            .masses
            .get(species)
            .copied()
            .ok_or_else(|| OtfError::Config(format!("no mass given for species {species}")))
    }
}

impl Stepper for VerletStepper {
    fn advance(&mut self, configuration: &Configuration, forces: &[Vec3]) -> OtfResult<Configuration> {
        let n = configuration.len();
        if forces.len() != n {
            return Err(OtfError::Structure(format!("{} forces for {n} atoms", forces.len())));
        }
        let dt = self.config.dt;
        let mut accel = Vec::with_capacity(n);
        for (species, f) in configuration.species.iter().zip(forces) {
            let m = self.mass(species)?;
            accel.push([f[0] / m, f[1] / m, f[2] / m]);
        }

        let previous = match self.previous.take() {
            Some(prev) if prev.len() == n => prev,
            _ => configuration
                .positions
                .iter()
                .zip(&configuration.velocities)
                .zip(&accel)
                .map(|((x, v), a)| [0, 1, 2].map(|d| x[d] - v[d] * dt + 0.5 * a[d] * dt * dt))
                .collect(),
        };

        let mut next = configuration.clone();
        for i in 0..n {
            let x = configuration.positions[i];
            for d in 0..3 {
                let new = 2.0 * x[d] - previous[i][d] + accel[i][d] * dt * dt;
                next.positions[i][d] = new;
                next.velocities[i][d] = (new - previous[i][d]) / (2.0 * dt);
            }
        }
        next.step_index = configuration.step_index + 1;
        self.previous = Some(configuration.positions.clone());
        Ok(next)
    }

    fn time_step(&self) -> f64 {
        self.config.dt
    }
}

/// Draw velocities from the Maxwell-Boltzmann distribution at `kt` (energy
/// units) and remove the centre-of-mass drift.
pub fn maxwell_boltzmann<R: Rng>(
    configuration: &Configuration,
    masses: &HashMap<String, f64>,
    kt: f64,
    rng: &mut R,
) -> OtfResult<Vec<Vec3>> {
    let mut velocities = Vec::with_capacity(configuration.len());
    let mut momentum = [0.0; 3];
    let mut total_mass = 0.0;
    for s in &configuration.species {
        let m = *masses
            .get(s)
            .ok_or_else(|| OtfError::Config(format!("no mass given for species {s}")))?;
        let scale = (kt / m).sqrt();
        let v = [0, 1, 2].map(|_| scale * standard_normal(rng));
        for d in 0..3 {
            momentum[d] += m * v[d];
        }
        total_mass += m;
        velocities.push(v);
    }
    if total_mass > 0.0 {
        for v in &mut velocities {
            for d in 0..3 {
                v[d] -= momentum[d] / total_mass;
            }
        }
    }
    Ok(velocities)
}

/// Box-Muller transform.
fn standard_normal<R: Rng>(rng: &mut R) -> f64 {
    let u1: f64 = 1.0 - rng.gen::<f64>();
    let u2: f64 = rng.gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}
