//! Linear recalibration of predicted retention times.
//!
//! Least trimmed squares fit of observed against predicted times, so that a
//! few misidentified calibration peptides cannot drag the line. Candidate
//! lines start from random pairs of points and are refined with C-steps
//! (Rousseeuw & Van Driessen, 2006).

use crate::Error;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Below this many points, all of them are used for an ordinary fit
const MIN_LTS_POINTS: usize = 4;
const MAX_CSTEPS: usize = 100;

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub slope: f64,
    pub intercept: f64,
}

impl Calibration {
    pub fn apply(&self, t: f64) -> f64 {
        self.slope * t + self.intercept
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Lts {
    /// Fraction of points the trimmed sum of squares is computed over
    pub coverage: f64,
    /// Random two-point starting lines
    pub starts: usize,
    /// Best starts refined until convergence
    pub keep: usize,
    pub epsilon: f64,
    pub seed: u64,
}

impl Default for Lts {
    fn default() -> Self {
        Lts {
            coverage: 0.95,
            starts: 500,
            keep: 10,
            epsilon: 1E-4,
            seed: 1,
        }
    }
}

/// Ordinary least squares over `subset`. Without spread in `x`, only the
/// offset is fit.
fn least_squares(x: &[f64], y: &[f64], subset: &[usize]) -> Calibration {
    let h = subset.len() as f64;
    let (mut sx, mut sy, mut sxy, mut sxx) = (0.0, 0.0, 0.0, 0.0);
    for &i in subset {
        sx += x[i];
        sy += y[i];
        sxy += x[i] * y[i];
        sxx += x[i] * x[i];
    }
    let slope = (h * sxy - sx * sy) / (h * sxx - sx * sx);
    match slope.is_finite() {
        true => Calibration {
            slope,
            intercept: (sy - slope * sx) / h,
        },
        false => Calibration {
            slope: 1.0,
            intercept: (sy - sx) / h,
        },
    }
}

/// The `h` points closest to `line`, and their sum of squared residuals
fn trim(x: &[f64], y: &[f64], line: &Calibration, h: usize) -> (Vec<usize>, f64) {
    let residuals = x
        .iter()
        .zip(y)
        .map(|(x, y)| (y - line.apply(*x)).powi(2))
        .collect::<Vec<_>>();
    let mut order = (0..x.len()).collect::<Vec<_>>();
    order.sort_by(|&a, &b| residuals[a].total_cmp(&residuals[b]).then(a.cmp(&b)));
    order.truncate(h);
    let q = order.iter().map(|&i| residuals[i]).sum();
    (order, q)
}

fn c_step(x: &[f64], y: &[f64], subset: &[usize], h: usize) -> (Calibration, Vec<usize>, f64) {
    let line = least_squares(x, y, subset);
    let (subset, q) = trim(x, y, &line, h);
    (line, subset, q)
}

impl Lts {
    /// Fit `observed ≈ slope * predicted + intercept`
    pub fn fit(&self, predicted: &[f64], observed: &[f64]) -> Result<Calibration, Error> {
        let (x, y) = (predicted, observed);
        if x.len() != y.len() {
            return Err(Error::Schema(format!(
                "{} predictions for {} observed retention times",
                x.len(),
                y.len()
            )));
        }
        let n = x.len();
        if n < 2 {
            return Err(Error::Schema(
                "at least 2 calibration peptides are required".into(),
            ));
        }
        if n < MIN_LTS_POINTS {
            return Ok(least_squares(x, y, &(0..n).collect::<Vec<_>>()));
        }

        let h = ((self.coverage * n as f64).round() as usize).clamp(2, n);
        let mut rng = StdRng::seed_from_u64(self.seed);

        // (trimmed sum of squares, subset), smallest first
        let mut best: Vec<(f64, Vec<usize>)> = Vec::with_capacity(self.keep + 1);
        for _ in 0..self.starts {
            let i = rng.gen_range(0..n);
            let mut j = rng.gen_range(0..n);
            while j == i {
                j = rng.gen_range(0..n);
            }
            if x[i] == x[j] {
                continue;
            }
            let slope = (y[j] - y[i]) / (x[j] - x[i]);
            let start = Calibration {
                slope,
                intercept: y[i] - slope * x[i],
            };
            let (subset, _) = trim(x, y, &start, h);
            let (_, subset, _) = c_step(x, y, &subset, h);
            let (_, subset, q) = c_step(x, y, &subset, h);

            let pos = best.partition_point(|(b, _)| *b <= q);
            if pos < self.keep.max(1) {
                best.insert(pos, (q, subset));
                best.truncate(self.keep.max(1));
            }
        }

        if best.is_empty() {
            // Every sampled pair shared the same prediction
            return Ok(least_squares(x, y, &(0..n).collect::<Vec<_>>()));
        }

        let mut result: Option<(f64, Calibration)> = None;
        for (mut q, mut subset) in best {
            let mut line = least_squares(x, y, &subset);
            for _ in 0..MAX_CSTEPS {
                let (next_line, next_subset, next_q) = c_step(x, y, &subset, h);
                let change = (q - next_q).abs();
                line = next_line;
                subset = next_subset;
                q = next_q;
                if change < self.epsilon {
                    break;
                }
            }
            if result.as_ref().map_or(true, |(b, _)| q < *b) {
                result = Some((q, line));
            }
        }

        let (q, line) = result.ok_or_else(|| Error::Schema("no calibration line".into()))?;
        log::trace!(
            "- LTS calibration over {} of {} points: slope {}, intercept {}, trimmed SS {}",
            h,
            n,
            line.slope,
            line.intercept,
            q
        );
        Ok(line)
    }
}
