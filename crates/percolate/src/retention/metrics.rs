//! Agreement between predicted and observed retention times

use crate::ml::mean;
use serde::Serialize;

/// Fraction of peptides the Δt window has to cover
pub const WINDOW_COVERAGE: f64 = 0.95;

/// Pearson's correlation coefficient, 0 when either side has no spread
pub fn pearson(x: &[f64], y: &[f64]) -> f64 {
    assert_eq!(x.len(), y.len());
    if x.is_empty() {
        return 0.0;
    }
    let (mx, my) = (mean(x), mean(y));
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (x, y) in x.iter().zip(y) {
        sxy += (x - mx) * (y - my);
        sxx += (x - mx).powi(2);
        syy += (y - my).powi(2);
    }
    match sxy / (sxx * syy).sqrt() {
        r if r.is_finite() => r,
        _ => 0.0,
    }
}

/// 1-based ranks, ties receive their average rank
pub fn ranks(x: &[f64]) -> Vec<f64> {
    let mut order = (0..x.len()).collect::<Vec<_>>();
    order.sort_by(|&a, &b| x[a].total_cmp(&x[b]));
    let mut ranks = vec![0.0; x.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && x[order[end]] == x[order[start]] {
            end += 1;
        }
        // Positions start..end hold ranks start+1..=end
        let rank = (start + end + 1) as f64 / 2.0;
        for &i in &order[start..end] {
            ranks[i] = rank;
        }
        start = end;
    }
    ranks
}

/// Spearman's rank correlation
pub fn spearman(x: &[f64], y: &[f64]) -> f64 {
    pearson(&ranks(x), &ranks(y))
}

/// Width of the narrowest window holding `coverage` of the prediction errors
pub fn delta_t(predicted: &[f64], observed: &[f64], coverage: f64) -> f64 {
    assert_eq!(predicted.len(), observed.len());
    let mut errors = predicted
        .iter()
        .zip(observed)
        .map(|(p, o)| p - o)
        .collect::<Vec<_>>();
    if errors.is_empty() {
        return 0.0;
    }
    errors.sort_by(|a, b| a.total_cmp(b));
    let k = ((coverage * errors.len() as f64).round() as usize).clamp(1, errors.len());
    errors
        .windows(k)
        .map(|w| w[k - 1] - w[0])
        .fold(f64::INFINITY, f64::min)
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct Performance {
    pub pearson: f64,
    pub spearman: f64,
    pub delta_t95: f64,
}

impl Performance {
    pub fn evaluate(predicted: &[f64], observed: &[f64]) -> Self {
        Performance {
            pearson: pearson(predicted, observed),
            spearman: spearman(predicted, observed),
            delta_t95: delta_t(predicted, observed, WINDOW_COVERAGE),
        }
    }

    pub fn log(&self) {
        log::info!("Performance measures for the test data:");
        log::info!("  Pearson's correlation r = {:.4}", self.pearson);
        log::info!("  Spearman's rank correlation rho = {:.4}", self.spearman);
        log::info!("  Delta_t 95% = {:.4}", self.delta_t95);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn correlations() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        let y = [2.0, 4.0, 6.0, 8.0, 10.0];
        assert!((pearson(&x, &y) - 1.0).abs() < 1E-12);
        let rev = [5.0, 4.0, 3.0, 2.0, 1.0];
        assert!((pearson(&x, &rev) + 1.0).abs() < 1E-12);
        assert_eq!(pearson(&x, &[1.0; 5]), 0.0);

        // Monotone but non-linear
        let cubes = x.iter().map(|v| v * v * v).collect::<Vec<_>>();
        assert!(pearson(&x, &cubes) < 1.0);
        assert!((spearman(&x, &cubes) - 1.0).abs() < 1E-12);
    }

    #[test]
    fn tied_ranks() {
        assert_eq!(ranks(&[10.0, 20.0, 10.0, 30.0]), vec![1.5, 3.0, 1.5, 4.0]);
        assert_eq!(ranks(&[1.0, 1.0, 1.0]), vec![2.0, 2.0, 2.0]);
    }

    #[test]
    fn window() {
        // errors 0..=19, 95% of 20 is 19 values
        let predicted = (0..20).map(|i| i as f64).collect::<Vec<_>>();
        let observed = vec![0.0; 20];
        assert_eq!(delta_t(&predicted, &observed, 0.95), 18.0);

        let mut predicted = vec![1.0; 20];
        predicted[3] = 100.0;
        assert_eq!(delta_t(&predicted, &observed, 0.95), 0.0);
    }
}
