//! Local atomic environments: the periodic neighbourhood of one atom within
//! the model cutoffs.

use nalgebra::Vector3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::types::{to_vector, Configuration, Vec3};
use crate::error::{OtfError, OtfResult};

/// Interaction radii per body order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cutoffs {
    /// Pair cutoff; also bounds the neighbour search.
    pub two_body: f64,
    /// Triplet cutoff (must not exceed the pair cutoff). `None` skips
    /// triplet construction.
    #[serde(default)]
    pub three_body: Option<f64>,
}

impl Default for Cutoffs {
    fn default() -> Self {
        Self {
            two_body: 5.0,
            three_body: None,
        }
    }
}

impl Cutoffs {
    pub fn validate(&self) -> OtfResult<()> {
        if !(self.two_body > 0.0 && self.two_body.is_finite()) {
            return Err(OtfError::Config(format!(
                "two-body cutoff must be positive, got {}",
                self.two_body
            )));
        }
        if let Some(c3) = self.three_body {
            if !(c3 > 0.0) || c3 > self.two_body {
                return Err(OtfError::Config(format!(
                    "three-body cutoff {c3} must lie in (0, {}]",
                    self.two_body
                )));
            }
        }
        Ok(())
    }
}

/// A neighbour of the central atom (one periodic image).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bond {
    pub species: String,
    /// Neighbour position minus central position.
    pub displacement: Vec3,
    pub distance: f64,
}

impl Bond {
    /// Unit vector component `d` pointing from the centre to the neighbour.
    #[inline]
    pub fn direction(&self, d: usize) -> f64 {
        self.displacement[d] / self.distance
    }
}

/// An ordered pair of bonds that both fall inside the three-body cutoff.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Triplet {
    pub first: usize,
    pub second: usize,
    /// Distance between the two neighbours.
    pub r12: f64,
}

/// Descriptor of one atom and its neighbours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomicEnvironment {
    pub atom_index: usize,
    pub species: String,
    pub bonds: Vec<Bond>,
    pub triplets: Vec<Triplet>,
}

impl AtomicEnvironment {
    /// Build the environment of `atom` in `configuration`.
    pub fn new(configuration: &Configuration, atom: usize, cutoffs: &Cutoffs) -> OtfResult<Self> {
        if atom >= configuration.len() {
            return Err(OtfError::Structure(format!(
                "atom {atom} out of range for {} atoms",
                configuration.len()
            )));
        }
        let lattice = configuration.cell_matrix();
        let inverse = lattice
            .try_inverse()
            .ok_or_else(|| OtfError::Structure("cell is singular".into()))?;
        let rows = [
            lattice.row(0).transpose(),
            lattice.row(1).transpose(),
            lattice.row(2).transpose(),
        ];
        let images = image_counts(&rows, cutoffs.two_body);

        let centre = to_vector(&configuration.positions[atom]);
        let mut bonds = Vec::new();
        for (j, pos) in configuration.positions.iter().enumerate() {
            // Minimum-image base displacement in fractional space.
            let raw = to_vector(pos) - centre;
            let frac = (inverse.transpose() * raw).map(|x| x - x.round());
            let base = lattice.transpose() * frac;

            for i in -images[0]..=images[0] {
                for k in -images[1]..=images[1] {
                    for l in -images[2]..=images[2] {
                        let shift = rows[0] * f64::from(i)
                            + rows[1] * f64::from(k)
                            + rows[2] * f64::from(l);
                        let delta = base + shift;
                        let r = delta.norm();
                        if r < 1e-8 || r >= cutoffs.two_body {
                            continue;
                        }
                        bonds.push(Bond {
                            species: configuration.species[j].clone(),
                            displacement: [delta.x, delta.y, delta.z],
                            distance: r,
                        });
                    }
                }
            }
        }

        let triplets = match cutoffs.three_body {
            Some(c3) => build_triplets(&bonds, c3),
            None => Vec::new(),
        };

        Ok(Self {
            atom_index: atom,
            species: configuration.species[atom].clone(),
            bonds,
            triplets,
        })
    }

    /// Bonds shorter than `cutoff`.
    pub fn bonds_within(&self, cutoff: f64) -> impl Iterator<Item = &Bond> {
        self.bonds.iter().filter(move |b| b.distance < cutoff)
    }

    /// Shortest neighbour distance, if any neighbour exists.
    pub fn min_distance(&self) -> Option<f64> {
        self.bonds.iter().map(|b| b.distance).reduce(f64::min)
    }
}

/// Environments of every atom, built in parallel and returned in atom order.
pub fn environments(configuration: &Configuration, cutoffs: &Cutoffs) -> OtfResult<Vec<AtomicEnvironment>> {
    (0..configuration.len())
        .into_par_iter()
        .map(|atom| AtomicEnvironment::new(configuration, atom, cutoffs))
        .collect()
}

/// Number of periodic images needed along each lattice vector so that every
/// neighbour within `cutoff` is visited.
fn image_counts(rows: &[Vector3<f64>; 3], cutoff: f64) -> [i32; 3] {
    let volume = rows[0].dot(&rows[1].cross(&rows[2])).abs();
    let mut counts = [0i32; 3];
    for (axis, count) in counts.iter_mut().enumerate() {
        let a = &rows[(axis + 1) % 3];
        let b = &rows[(axis + 2) % 3];
        let height = volume / a.cross(b).norm();
        *count = (cutoff / height).ceil() as i32;
    }
    counts
}

fn build_triplets(bonds: &[Bond], cutoff: f64) -> Vec<Triplet> {
    let mut triplets = Vec::new();
    for (a, first) in bonds.iter().enumerate() {
        if first.distance >= cutoff {
            continue;
        }
        for (b, second) in bonds.iter().enumerate() {
            if a == b || second.distance >= cutoff {
                continue;
            }
            let r12 = (to_vector(&second.displacement) - to_vector(&first.displacement)).norm();
            if r12 < cutoff {
                triplets.push(Triplet {
                    first: a,
                    second: b,
                    r12,
                });
            }
        }
    }
    triplets
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dimer(separation: f64, side: f64) -> Configuration {
        Configuration::new(
            vec![[0.0, 0.0, 0.0], [separation, 0.0, 0.0]],
            [[side, 0.0, 0.0], [0.0, side, 0.0], [0.0, 0.0, side]],
            vec!["Ar".into(), "Ar".into()],
        )
    }

    #[test]
    fn test_dimer_in_large_box_has_one_bond() {
        let cfg = dimer(1.5, 20.0);
        let cutoffs = Cutoffs {
            two_body: 3.0,
            three_body: None,
        };
        let env = AtomicEnvironment::new(&cfg, 0, &cutoffs).unwrap();
        assert_eq!(env.bonds.len(), 1);
        assert!((env.bonds[0].distance - 1.5).abs() < 1e-12);
        assert!((env.bonds[0].direction(0) - 1.0).abs() < 1e-12);
        assert!(env.triplets.is_empty());
    }

    #[test]
    fn test_periodic_images_are_found() {
        // Single atom in a 2.0 box with a 2.5 cutoff sees its six face images.
        let cfg = Configuration::new(
            vec![[0.5, 0.5, 0.5]],
            [[2.0, 0.0, 0.0], [0.0, 2.0, 0.0], [0.0, 0.0, 2.0]],
            vec!["Ar".into()],
        );
        let cutoffs = Cutoffs {
            two_body: 2.5,
            three_body: None,
        };
        let env = AtomicEnvironment::new(&cfg, 0, &cutoffs).unwrap();
        assert_eq!(env.bonds.len(), 6);
        assert!(env.bonds.iter().all(|b| (b.distance - 2.0).abs() < 1e-12));
    }

    #[test]
    fn test_minimum_image_wraps_distant_positions() {
        // The second atom sits just across the boundary.
        let cfg = dimer(9.0, 10.0);
        let cutoffs = Cutoffs {
            two_body: 2.0,
            three_body: None,
        };
        let env = AtomicEnvironment::new(&cfg, 0, &cutoffs).unwrap();
        assert_eq!(env.bonds.len(), 1);
        assert!((env.bonds[0].displacement[0] + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_triplets_are_ordered_pairs() {
        let cfg = Configuration::new(
            vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            [[20.0, 0.0, 0.0], [0.0, 20.0, 0.0], [0.0, 0.0, 20.0]],
            vec!["Si".into(), "Si".into(), "Si".into()],
        );
        let cutoffs = Cutoffs {
            two_body: 3.0,
            three_body: Some(2.0),
        };
        let env = AtomicEnvironment::new(&cfg, 0, &cutoffs).unwrap();
        assert_eq!(env.bonds.len(), 2);
        assert_eq!(env.triplets.len(), 2);
        let r12 = 2.0_f64.sqrt();
        assert!(env.triplets.iter().all(|t| (t.r12 - r12).abs() < 1e-12));
    }

    #[test]
    fn test_environments_keep_atom_order() {
        let cfg = dimer(1.2, 10.0);
        let envs = environments(&cfg, &Cutoffs::default()).unwrap();
        assert_eq!(envs.len(), 2);
        assert_eq!(envs[1].atom_index, 1);
        assert!((envs[1].bonds[0].displacement[0] + 1.2).abs() < 1e-12);
    }

    #[test]
    fn test_cutoff_validation() {
        let bad = Cutoffs {
            two_body: 3.0,
            three_body: Some(4.0),
        };
        assert!(bad.validate().is_err());
        assert!(Cutoffs::default().validate().is_ok());
    }
}
