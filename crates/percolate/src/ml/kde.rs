//! Posterior error probabilities for re-ranked PSMs.
//!
//! Kernel density estimates of the target and decoy score distributions are
//! evaluated on a fixed grid of scores; PEPs for arbitrary scores are then
//! linearly interpolated between grid points.
//!
//! Käll, 2008 [https://pubmed.ncbi.nlm.nih.gov/18052118/]

use super::*;
use rayon::prelude::*;

pub struct Kde<'a> {
    sample: &'a [f64],
    pub bandwidth: f64,
    constant: f64,
}

impl<'a> Kde<'a> {
    /// Gaussian kernel with Silverman's rule-of-thumb bandwidth
    pub fn new(sample: &'a [f64]) -> Self {
        let factor = 4. / 3.;
        let exponent = 1. / 5.;
        let sigma = std(sample);
        let bandwidth = match sigma * (factor / sample.len() as f64).powf(exponent) {
            bw if bw > 0.0 && bw.is_finite() => bw,
            // Degenerate sample (single value): fall back to a narrow kernel
            _ => 1E-3,
        };
        let constant = (2.0 * std::f64::consts::PI).sqrt() * bandwidth * sample.len() as f64;
        Self {
            sample,
            bandwidth,
            constant,
        }
    }

    fn kernel(&self, x: f64) -> f64 {
        (-0.5 * x.powi(2)).exp()
    }

    pub fn pdf(&self, x: f64) -> f64 {
        let h = self.bandwidth;

        let sum = self
            .sample
            .iter()
            .fold(0.0, |acc, xi| acc + self.kernel((x - xi) / h));

        sum / self.constant
    }
}

/// Score grid resolution
const BINS: usize = 1000;

pub struct Estimator {
    bins: Vec<f64>,
    min_score: f64,
    score_step: f64,
}

impl Estimator {
    /// Fit target and decoy densities on a grid spanning `scores`. PEPs are
    /// forced to be non-increasing with score.
    pub fn fit(scores: &[f64], decoys: &[bool]) -> Self {
        let (d, t): (Vec<(f64, bool)>, Vec<(f64, bool)>) = scores
            .iter()
            .copied()
            .zip(decoys.iter().copied())
            .partition(|&(_, decoy)| decoy);
        let d = d.into_iter().map(|(s, _)| s).collect::<Vec<_>>();
        let t = t.into_iter().map(|(s, _)| s).collect::<Vec<_>>();

        let mut min_score = f64::MAX;
        let mut max_score = f64::MIN;
        for s in scores {
            min_score = min_score.min(*s);
            max_score = max_score.max(*s);
        }
        let score_step = match (max_score - min_score) / (BINS - 1) as f64 {
            step if step > 0.0 && step.is_finite() => step,
            _ => 1.0,
        };

        // Without one of the two classes there is nothing to estimate
        if d.is_empty() || t.is_empty() {
            let pep = if t.is_empty() { 1.0 } else { 0.0 };
            return Estimator {
                bins: vec![pep; 2],
                min_score,
                score_step,
            };
        }

        // P(decoy)
        let pi = d.len() as f64 / scores.len() as f64;
        let decoy = Kde::new(&d);
        let target = Kde::new(&t);

        let target_mean = mean(&t);
        // Bins are evaluated in parallel, each density sum stays sequential
        let mut bins = (0..BINS)
            .into_par_iter()
            .map(|bin| {
                let score = (bin as f64 * score_step) + min_score;
                let decoy = decoy.pdf(score) * pi;
                let target = target.pdf(score) * (1.0 - pi);
                match decoy / (target + decoy) {
                    pep if pep.is_finite() => pep,
                    // Both densities underflowed, far outside the sample
                    _ if score > target_mean => 0.0,
                    _ => 1.0,
                }
            })
            .collect::<Vec<_>>();

        // PEP may only grow as the score decreases
        let mut acc = 0.0f64;
        for x in bins.iter_mut().rev() {
            acc = acc.max(*x);
            *x = acc;
        }

        Estimator {
            bins,
            min_score,
            score_step,
        }
    }

    /// Calculate the posterior error probability for a given score, under the
    /// pre-fit non-parametric probability model.
    pub fn posterior_error(&self, score: f64) -> f64 {
        let position = ((score - self.min_score) / self.score_step).max(0.0);
        let bin_lo = self.bins.len().saturating_sub(1).min(position.floor() as usize);
        let bin_hi = self.bins.len().saturating_sub(1).min(bin_lo + 1);

        // PEP of lower & one higher bin
        let lower = self.bins[bin_lo];
        let upper = self.bins[bin_hi];

        // What percent of the way to the higher bin are we?
        let linear = (position - bin_lo as f64).clamp(0.0, 1.0);

        // Linear interpolation between lower and upper bin
        (lower + (upper - lower) * linear).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pep_decreases_with_score() {
        let mut scores = Vec::new();
        let mut decoys = Vec::new();
        for i in 0..200 {
            let x = i as f64 / 50.0;
            scores.push(x);
            decoys.push(false);
            scores.push(x - 3.0);
            decoys.push(true);
        }
        let kde = Estimator::fit(&scores, &decoys);
        let lo = kde.posterior_error(-2.5);
        let mid = kde.posterior_error(0.5);
        let hi = kde.posterior_error(3.5);
        assert!(lo > 0.9, "{}", lo);
        assert!(hi < 0.1, "{}", hi);
        assert!(lo >= mid && mid >= hi);

        // Outside of the fitted range
        assert!(kde.posterior_error(-100.0) <= 1.0);
        assert!(kde.posterior_error(100.0) >= 0.0);
    }

    #[test]
    fn pep_is_monotonic_on_overlapping_classes() {
        // Interleaved decoys above the targets would make the raw density
        // ratio rise again at the top of the score range
        let scores = [0.0, 0.5, 1.0, 1.5, 2.0, 2.5, 3.0, 6.0, 6.2];
        let decoys = [true, true, false, true, false, false, false, true, false];
        let kde = Estimator::fit(&scores, &decoys);
        assert_eq!(kde.bins.len(), BINS);
        assert!(kde.bins.windows(2).all(|w| w[0] >= w[1]));

        let grid = (0..=70).map(|i| i as f64 / 10.0).collect::<Vec<_>>();
        let peps = grid.iter().map(|&s| kde.posterior_error(s)).collect::<Vec<_>>();
        assert!(peps.windows(2).all(|w| w[0] >= w[1]), "{:?}", peps);
    }

    #[test]
    fn single_class() {
        let kde = Estimator::fit(&[1.0, 2.0], &[false, false]);
        assert_eq!(kde.posterior_error(1.5), 0.0);
        let kde = Estimator::fit(&[1.0, 2.0], &[true, true]);
        assert_eq!(kde.posterior_error(1.5), 1.0);
    }
}
