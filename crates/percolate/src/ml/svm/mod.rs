//! Linear L2-SVM trained with the Modified Finite Newton method
//!
//! Solves
//! `min_w 0.5 * lambda * w'w + 0.5 * sum_i C_i * max(0, 1 - y_i * w'x_i)^2`
//! where `C_i` is `cpos` for confident targets and `cneg` for decoys, and `x_i`
//! is extended with a constant 1 so that the last weight is the bias.
//!
//! Keerthi & DeCoste, JMLR 6 (2005) 341–361

mod cgls;
mod line_search;

use super::{Classifier, TrainingSet};
use crate::scoring::Weights;
use crate::Error;
use serde::{Deserialize, Serialize};

/// Looser tolerance used until the first optimality check passes
const BIG_EPSILON: f64 = 0.01;
const RELATIVE_STOP_EPS: f64 = 1e-9;
/// CG iteration cap for the very first Newton step
const SMALL_CGITERMAX: usize = 10;

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SvmOptions {
    /// L2 regularization
    pub lambda: f64,
    pub epsilon: f64,
    pub cg_max_iterations: usize,
    pub mfn_max_iterations: usize,
}

impl Default for SvmOptions {
    fn default() -> Self {
        Self {
            lambda: 1.0,
            epsilon: 1e-7,
            cg_max_iterations: 10000,
            mfn_max_iterations: 50,
        }
    }
}

/// Training examples with their per-example costs
struct Problem<'a> {
    data: &'a TrainingSet,
    cost: Vec<f64>,
    lambda: f64,
}

impl<'a> Problem<'a> {
    fn new(data: &'a TrainingSet, cpos: f64, cneg: f64, lambda: f64) -> Self {
        let cost = data
            .labels
            .iter()
            .map(|&y| if y > 0.0 { cpos } else { cneg })
            .collect();
        Problem { data, cost, lambda }
    }

    fn examples(&self) -> usize {
        self.data.labels.len()
    }

    /// Dimension of the weight vector, bias included
    fn dim(&self) -> usize {
        self.data.features.cols + 1
    }

    fn label(&self, i: usize) -> f64 {
        self.data.labels[i]
    }

    /// `w'x_i` for the bias-extended example
    fn output(&self, i: usize, w: &[f64]) -> f64 {
        let bias = w[w.len() - 1];
        self.data
            .features
            .row(i)
            .iter()
            .zip(w)
            .fold(bias, |acc, (x, w)| acc + x * w)
    }

    /// `r += scale * x_i` for the bias-extended example
    fn accumulate(&self, i: usize, scale: f64, r: &mut [f64]) {
        let n = r.len() - 1;
        for (r, x) in r[..n].iter_mut().zip(self.data.features.row(i)) {
            *r += scale * x;
        }
        r[n] += scale;
    }

    /// Objective value, and the examples with a non-zero loss
    fn objective(&self, w: &[f64], o: &[f64]) -> (f64, Vec<usize>) {
        let mut f = 0.5 * self.lambda * w.iter().map(|w| w * w).sum::<f64>();
        let mut active = Vec::new();
        for (i, o) in o.iter().enumerate() {
            let diff = 1.0 - self.label(i) * o;
            if diff > 0.0 {
                active.push(i);
                f += 0.5 * self.cost[i] * diff * diff;
            }
        }
        (f, active)
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct L2Svm {
    pub options: SvmOptions,
}

impl L2Svm {
    pub fn new(options: SvmOptions) -> Self {
        L2Svm { options }
    }

    fn train(&self, problem: &Problem) -> Result<Vec<f64>, Error> {
        let (m, n) = (problem.examples(), problem.dim());
        let mut w = vec![0.0; n];
        let mut o = vec![0.0; m];
        let (mut f, mut active) = problem.objective(&w, &o);

        let mut epsilon = BIG_EPSILON;
        let mut cg_max = SMALL_CGITERMAX;
        let mut in_active = vec![false; m];

        for iter in 1..=self.options.mfn_max_iterations {
            let mut w_bar = w.clone();
            let mut o_bar = o.clone();
            let cg_optimal = cgls::solve(problem, &active, &mut w_bar, &mut o_bar, epsilon, cg_max);
            cg_max = self.options.cg_max_iterations;

            in_active.iter_mut().for_each(|a| *a = false);
            active.iter().for_each(|&i| in_active[i] = true);
            for i in 0..m {
                if !in_active[i] {
                    o_bar[i] = problem.output(i, &w_bar);
                }
            }

            let optimal = cg_optimal
                && (0..m).all(|i| {
                    let margin = problem.label(i) * o_bar[i];
                    match in_active[i] {
                        true => margin <= 1.0 + epsilon,
                        false => margin >= 1.0 - epsilon,
                    }
                });

            if optimal {
                if epsilon > self.options.epsilon {
                    log::trace!("- L2-SVM-MFN: tightening tolerance after {} iterations", iter);
                    epsilon = self.options.epsilon;
                    continue;
                }
                log::trace!("- L2-SVM-MFN converged (optimality) in {} iterations", iter);
                return Ok(w_bar);
            }

            let delta = line_search::search(problem, &w, &w_bar, &o, &o_bar);
            for (w, w_bar) in w.iter_mut().zip(&w_bar) {
                *w += delta * (w_bar - *w);
            }
            for (o, o_bar) in o.iter_mut().zip(&o_bar) {
                *o += delta * (o_bar - *o);
            }

            let f_old = f;
            (f, active) = problem.objective(&w, &o);
            if (f - f_old).abs() < RELATIVE_STOP_EPS * f_old.abs() {
                log::trace!(
                    "- L2-SVM-MFN converged (relative improvement) in {} iterations",
                    iter
                );
                return Ok(w);
            }
        }

        Err(Error::ClassifierConvergence(format!(
            "L2-SVM-MFN did not converge within {} iterations",
            self.options.mfn_max_iterations
        )))
    }
}

impl Classifier for L2Svm {
    fn fit(&self, data: &TrainingSet, cpos: f64, cneg: f64) -> Result<Weights, Error> {
        if data.labels.is_empty() {
            return Err(Error::DegenerateTrainingSet("no training examples".into()));
        }
        let problem = Problem::new(data, cpos, cneg, self.options.lambda);
        let mut w = self.train(&problem)?;
        if !w.iter().all(|x| x.is_finite()) {
            return Err(Error::ClassifierConvergence(
                "L2-SVM-MFN produced non-finite weights".into(),
            ));
        }
        let bias = w.pop().unwrap_or_default();
        Ok(Weights::new(w, bias))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ml::matrix::Matrix;

    fn data(rows: &[[f64; 2]], labels: &[f64]) -> TrainingSet {
        let features = Matrix::from_rows(rows.iter().map(|r| r.as_slice()), 2);
        TrainingSet::new(features, labels.to_vec())
    }

    #[test]
    fn separable() {
        let set = data(
            &[[2.0, 1.0], [1.5, 2.0], [-1.0, -2.0], [-2.0, -1.0]],
            &[1.0, 1.0, -1.0, -1.0],
        );
        let w = L2Svm::default().fit(&set, 1.0, 1.0).unwrap();
        for i in 0..4 {
            let out = crate::scoring::score(&w, set.features.row(i));
            assert!(out * set.labels[i] > 0.5, "example {} has output {}", i, out);
        }
    }

    #[test]
    fn noisy() {
        let set = data(
            &[
                [1.0, 1.0],
                [1.2, 0.8],
                [0.8, 1.2],
                [-1.0, -1.0],
                [-0.8, -1.2],
                [0.1, -0.1],
            ],
            &[1.0, 1.0, 1.0, -1.0, -1.0, -1.0],
        );
        let w = L2Svm::default().fit(&set, 1.0, 1.0).unwrap();
        let correct = (0..6)
            .filter(|&i| crate::scoring::score(&w, set.features.row(i)) * set.labels[i] > 0.0)
            .count();
        assert!(correct >= 5);
    }

    #[test]
    fn class_costs_matter() {
        let set = data(
            &[[1.0, 0.5], [0.2, 0.1], [-1.0, 0.5], [-0.1, 0.3]],
            &[1.0, 1.0, -1.0, -1.0],
        );
        let svm = L2Svm::default();
        let pos = svm.fit(&set, 10.0, 1.0).unwrap();
        let neg = svm.fit(&set, 1.0, 10.0).unwrap();
        let diff = pos
            .as_slice()
            .iter()
            .zip(neg.as_slice())
            .map(|(a, b)| (a - b).abs())
            .sum::<f64>();
        assert!(diff > 0.05, "{:?} {:?}", pos, neg);
    }

    #[test]
    fn objective_decreases_from_zero() {
        let set = data(&[[3.0, 0.0], [-3.0, 0.0]], &[1.0, -1.0]);
        let svm = L2Svm::default();
        let problem = Problem::new(&set, 1.0, 1.0, svm.options.lambda);
        let (f0, active) = problem.objective(&[0.0; 3], &[0.0; 2]);
        assert_eq!(active, vec![0, 1]);
        let w = svm.train(&problem).unwrap();
        let o = (0..2).map(|i| problem.output(i, &w)).collect::<Vec<_>>();
        let (f1, _) = problem.objective(&w, &o);
        assert!(f1 < f0);
    }
}
