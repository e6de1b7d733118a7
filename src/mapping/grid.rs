//! Uniform interpolation tables.

use serde::{Deserialize, Serialize};

/// Closed interval covered by a table axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub min: f64,
    pub max: f64,
}

impl Interval {
    pub fn contains(&self, x: f64) -> bool {
        x >= self.min && x <= self.max
    }

    /// Evenly spaced nodes including both ends.
    pub fn nodes(&self, n: usize) -> Vec<f64> {
        let h = (self.max - self.min) / (n - 1) as f64;
        (0..n)
            .map(|k| if k + 1 == n { self.max } else { self.min + h * k as f64 })
            .collect()
    }

    /// Cell index and fractional offset of `x` on an `n`-node axis.
    fn locate(&self, x: f64, n: usize) -> (usize, f64) {
        let h = (self.max - self.min) / (n - 1) as f64;
        let t = (x - self.min) / h;
        let k = (t.floor().max(0.0) as usize).min(n - 2);
        (k, t - k as f64)
    }
}

/// Values on a 1-D uniform grid, interpolated with Catmull-Rom cubics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CubicTable {
    pub domain: Interval,
    pub values: Vec<f64>,
}

impl CubicTable {
    pub fn new(domain: Interval, values: Vec<f64>) -> Self {
        Self { domain, values }
    }

    /// Interpolated value at `x`, or `None` outside the domain.
    pub fn eval(&self, x: f64) -> Option<f64> {
        if !self.domain.contains(x) {
            return None;
        }
        let n = self.values.len();
        let (k, f) = self.domain.locate(x, n);
        let y = &self.values;
        let p1 = y[k];
        let p2 = y[k + 1];
        // Linear extension past the end nodes.
        let p0 = if k == 0 { 2.0 * p1 - p2 } else { y[k - 1] };
        let p3 = if k + 2 < n { y[k + 2] } else { 2.0 * p2 - p1 };
        Some(
            0.5 * (2.0 * p1
                + (p2 - p0) * f
                + (2.0 * p0 - 5.0 * p1 + 4.0 * p2 - p3) * f * f
                + (3.0 * p1 - p0 - 3.0 * p2 + p3) * f * f * f),
        )
    }
}

/// Values on a 3-D uniform grid, interpolated trilinearly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrilinearTable {
    pub domain: [Interval; 3],
    pub shape: [usize; 3],
    /// Row-major, last axis fastest.
    pub values: Vec<f64>,
}

impl TrilinearTable {
    pub fn new(domain: [Interval; 3], shape: [usize; 3], values: Vec<f64>) -> Self {
        Self {
            domain,
            shape,
            values,
        }
    }

    pub fn index(shape: [usize; 3], i: usize, j: usize, k: usize) -> usize {
        (i * shape[1] + j) * shape[2] + k
    }

    /// Every grid node in storage order.
    pub fn node_coordinates(domain: &[Interval; 3], shape: [usize; 3]) -> Vec<[f64; 3]> {
        let axes = [
            domain[0].nodes(shape[0]),
            domain[1].nodes(shape[1]),
            domain[2].nodes(shape[2]),
        ];
        let mut out = Vec::with_capacity(shape.iter().product());
        for &a in &axes[0] {
            for &b in &axes[1] {
                for &c in &axes[2] {
                    out.push([a, b, c]);
                }
            }
        }
        out
    }

    /// Index of the first axis whose bounds `x` violates, if any.
    pub fn out_of_domain(&self, x: [f64; 3]) -> Option<usize> {
        (0..3).find(|&a| !self.domain[a].contains(x[a]))
    }

    pub fn eval(&self, x: [f64; 3]) -> Option<f64> {
        if self.out_of_domain(x).is_some() {
            return None;
        }
        let (i, fi) = self.domain[0].locate(x[0], self.shape[0]);
        let (j, fj) = self.domain[1].locate(x[1], self.shape[1]);
        let (k, fk) = self.domain[2].locate(x[2], self.shape[2]);
        let mut acc = 0.0;
        for (di, wi) in [(0, 1.0 - fi), (1, fi)] {
            for (dj, wj) in [(0, 1.0 - fj), (1, fj)] {
                for (dk, wk) in [(0, 1.0 - fk), (1, fk)] {
                    acc += wi * wj * wk * self.values[Self::index(self.shape, i + di, j + dj, k + dk)];
                }
            }
        }
        Some(acc)
    }
}
