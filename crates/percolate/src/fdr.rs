//! Target-decoy FDR, q-values and null proportion (pi_0) estimation

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Empirical FDR and q-value for each position of a score-descending list.
///
/// `sorted` holds `(score, is_decoy)` pairs. PSMs sharing a score form a
/// plateau and share the FDR computed after the whole plateau is counted.
/// Positions before the first target have FDR 1.
///
/// # Invariants
/// * `sorted` must be sorted in descending order (e.g. best PSM is first)
pub fn estimate(sorted: &[(f64, bool)], pi0: f64) -> Vec<(f64, f64)> {
    let mut fdr = Vec::with_capacity(sorted.len());
    let (mut decoys, mut targets) = (0usize, 0usize);

    let mut start = 0;
    while start < sorted.len() {
        let mut end = start;
        loop {
            match sorted[end].1 {
                true => decoys += 1,
                false => targets += 1,
            }
            end += 1;
            if end == sorted.len() || sorted[end].0 != sorted[start].0 {
                break;
            }
        }

        let value = match targets {
            0 => 1.0,
            t => (pi0 * decoys as f64 / t as f64).clamp(0.0, 1.0),
        };
        fdr.extend(std::iter::repeat(value).take(end - start));
        start = end;
    }

    // Reverse pass, calculating the cumulative minimum
    let mut q_min = 1.0f64;
    let mut out = vec![(0.0, 0.0); fdr.len()];
    for (idx, value) in fdr.iter().enumerate().rev() {
        q_min = q_min.min(*value);
        out[idx] = (*value, q_min);
    }
    out
}

#[derive(Clone, Debug, PartialEq)]
pub struct ScoredPsm {
    /// Row of the originating feature matrix
    pub index: usize,
    pub score: f64,
    /// 1-based position in the ranking
    pub rank: usize,
    pub decoy: bool,
    pub fdr: f64,
    pub q_value: f64,
    pub posterior_error: f64,
}

/// Score-descending ranking of a feature matrix with FDR annotations
#[derive(Clone, Debug, PartialEq)]
pub struct ScoreTable {
    rows: Vec<ScoredPsm>,
    pi0: f64,
}

impl ScoreTable {
    /// Rank `scores` (in matrix order) and annotate them. Ties are ordered by
    /// matrix index, so identical scores always give identical tables.
    pub fn new(scores: &[f64], decoys: &[bool], pi0: f64) -> Self {
        assert_eq!(scores.len(), decoys.len());
        let mut order = (0..scores.len()).collect::<Vec<_>>();
        order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));

        let rows = order
            .into_iter()
            .enumerate()
            .map(|(rank, index)| ScoredPsm {
                index,
                score: scores[index],
                rank: rank + 1,
                decoy: decoys[index],
                fdr: 1.0,
                q_value: 1.0,
                posterior_error: 1.0,
            })
            .collect();

        ScoreTable { rows, pi0: 1.0 }.with_pi0(pi0)
    }

    /// Recompute FDR and q-values under a new pi_0
    pub fn with_pi0(mut self, pi0: f64) -> Self {
        let pi0 = clamp_pi0(pi0);
        let estimates = estimate(&self.labeled(), pi0);
        for (row, (fdr, q)) in self.rows.iter_mut().zip(estimates) {
            row.fdr = fdr;
            row.q_value = q;
        }
        self.pi0 = pi0;
        self
    }

    pub fn with_posterior_errors<F: Fn(f64) -> f64>(mut self, pep: F) -> Self {
        for row in self.rows.iter_mut() {
            row.posterior_error = pep(row.score).clamp(0.0, 1.0);
        }
        self
    }

    pub fn rows(&self) -> &[ScoredPsm] {
        &self.rows
    }

    pub fn pi0(&self) -> f64 {
        self.pi0
    }

    /// `(score, is_decoy)` pairs in ranking order
    pub fn labeled(&self) -> Vec<(f64, bool)> {
        self.rows.iter().map(|r| (r.score, r.decoy)).collect()
    }

    /// Number of targets with q-value at or below `threshold`
    pub fn passing(&self, threshold: f64) -> usize {
        self.rows
            .iter()
            .filter(|r| !r.decoy && r.q_value <= threshold)
            .count()
    }

    /// Matrix indices of targets with q-value at or below `threshold`,
    /// in ascending matrix order
    pub fn confident_targets(&self, threshold: f64) -> Vec<usize> {
        let mut idx = self
            .rows
            .iter()
            .filter(|r| !r.decoy && r.q_value <= threshold)
            .map(|r| r.index)
            .collect::<Vec<_>>();
        idx.sort_unstable();
        idx
    }
}

const MIN_PI0: f64 = 1E-6;

/// Keep pi_0 inside (0, 1]; undefined estimates fall back to 1
pub fn clamp_pi0(pi0: f64) -> f64 {
    match pi0 {
        x if x.is_nan() => 1.0,
        x => x.clamp(MIN_PI0, 1.0),
    }
}

/// Empirical p-value of each target: the fraction of decoys scoring at or
/// above it. Returned in ascending order.
pub fn p_values(labeled: &[(f64, bool)]) -> Vec<f64> {
    let mut decoys = 0usize;
    let mut p = Vec::new();
    for &(_, decoy) in labeled {
        match decoy {
            true => decoys += 1,
            false => p.push(decoys as f64),
        }
    }
    if decoys > 0 {
        p.iter_mut().for_each(|x| *x /= decoys as f64);
    }
    p
}

/// Strategy for estimating the proportion of incorrect targets
pub trait Pi0Estimator {
    /// `labeled` holds `(score, is_decoy)` pairs sorted by descending score
    fn estimate(&self, labeled: &[(f64, bool)]) -> f64;
}

/// Grid of lambda thresholds: `(i + 1) / count * max` for `i` in `0..=count`
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LambdaGrid {
    pub count: usize,
    pub max_lambda: f64,
}

impl Default for LambdaGrid {
    fn default() -> Self {
        LambdaGrid {
            count: 20,
            max_lambda: 0.9,
        }
    }
}

impl LambdaGrid {
    pub fn lambdas(&self) -> Vec<f64> {
        let count = self.count.max(1);
        (0..=count)
            .map(|ix| ((ix + 1) as f64 / count as f64) * self.max_lambda)
            .filter(|&l| l < 1.0)
            .collect()
    }

    /// Storey's estimate `W(lambda) / n / (1 - lambda)` for each lambda,
    /// where `W(lambda)` counts p-values at or above lambda
    fn pi0s(lambdas: &[f64], p: &[f64]) -> Vec<f64> {
        lambdas
            .iter()
            .map(|&lambda| {
                let above = p.len() - p.partition_point(|&x| x < lambda);
                above as f64 / p.len() as f64 / (1.0 - lambda)
            })
            .collect()
    }
}

impl Pi0Estimator for LambdaGrid {
    /// Least-squares line through the per-lambda estimates, evaluated at the
    /// largest lambda
    fn estimate(&self, labeled: &[(f64, bool)]) -> f64 {
        let p = p_values(labeled);
        if p.is_empty() || !labeled.iter().any(|(_, d)| *d) {
            return 1.0;
        }
        let lambdas = self.lambdas();
        let pi0s = Self::pi0s(&lambdas, &p);
        let n = lambdas.len() as f64;
        let (x_bar, y_bar) = (
            lambdas.iter().sum::<f64>() / n,
            pi0s.iter().sum::<f64>() / n,
        );
        let (mut sxy, mut sxx) = (0.0, 0.0);
        for (x, y) in lambdas.iter().zip(&pi0s) {
            sxy += (x - x_bar) * (y - y_bar);
            sxx += (x - x_bar).powi(2);
        }
        let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };
        let x_max = lambdas.last().copied().unwrap_or(0.0);
        clamp_pi0(y_bar + slope * (x_max - x_bar))
    }
}

/// Pick the lambda whose bootstrapped estimate is most stable
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Bootstrap {
    pub grid: LambdaGrid,
    pub samples: usize,
    pub seed: u64,
}

impl Default for Bootstrap {
    fn default() -> Self {
        Bootstrap {
            grid: LambdaGrid::default(),
            samples: 100,
            seed: 1,
        }
    }
}

impl Pi0Estimator for Bootstrap {
    fn estimate(&self, labeled: &[(f64, bool)]) -> f64 {
        let p = p_values(labeled);
        if p.is_empty() || !labeled.iter().any(|(_, d)| *d) {
            return 1.0;
        }
        let lambdas = self.grid.lambdas();
        let pi0s = LambdaGrid::pi0s(&lambdas, &p);
        let min_pi0 = pi0s.iter().copied().fold(f64::INFINITY, f64::min);

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut mse = vec![0.0; lambdas.len()];
        let mut sample = vec![0.0; p.len()];
        for _ in 0..self.samples {
            sample
                .iter_mut()
                .for_each(|x| *x = p[rng.gen_range(0..p.len())]);
            sample.sort_by(|a, b| a.total_cmp(b));
            for (err, boot) in mse.iter_mut().zip(LambdaGrid::pi0s(&lambdas, &sample)) {
                *err += (boot - min_pi0).powi(2);
            }
        }

        // First lambda wins ties
        let mut best = 0;
        for (ix, err) in mse.iter().enumerate() {
            if *err < mse[best] {
                best = ix;
            }
        }
        clamp_pi0(pi0s[best])
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pi0Strategy {
    Fixed(f64),
    LambdaGrid(LambdaGrid),
    Bootstrap(Bootstrap),
}

impl Default for Pi0Strategy {
    fn default() -> Self {
        Pi0Strategy::Bootstrap(Bootstrap::default())
    }
}

impl Pi0Estimator for Pi0Strategy {
    fn estimate(&self, labeled: &[(f64, bool)]) -> f64 {
        match self {
            Pi0Strategy::Fixed(pi0) => clamp_pi0(*pi0),
            Pi0Strategy::LambdaGrid(grid) => grid.estimate(labeled),
            Pi0Strategy::Bootstrap(boot) => boot.estimate(labeled),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn sorted(data: Vec<(u8, bool)>) -> Vec<(f64, bool)> {
        // Small integer scores make plateaus likely
        let mut data = data
            .into_iter()
            .map(|(s, d)| ((s % 16) as f64, d))
            .collect::<Vec<_>>();
        data.sort_by(|a, b| b.0.total_cmp(&a.0));
        data
    }

    #[quickcheck]
    fn q_value_is_tail_minimum(data: Vec<(u8, bool)>, pi0: u8) -> bool {
        let pi0 = (pi0 as f64 + 1.0) / 256.0;
        let est = estimate(&sorted(data), pi0);
        (0..est.len()).all(|i| {
            let brute = est[i..].iter().map(|e| e.0).fold(f64::INFINITY, f64::min);
            est[i].1 == brute
        })
    }

    #[quickcheck]
    fn fdr_is_bounded(data: Vec<(u8, bool)>) -> bool {
        estimate(&sorted(data), 1.0)
            .iter()
            .all(|&(fdr, q)| (0.0..=1.0).contains(&fdr) && (0.0..=1.0).contains(&q))
    }

    #[quickcheck]
    fn plateaus_share_fdr(data: Vec<(u8, bool)>) -> bool {
        let data = sorted(data);
        let est = estimate(&data, 1.0);
        data.windows(2)
            .zip(est.windows(2))
            .all(|(d, e)| d[0].0 != d[1].0 || e[0].0 == e[1].0)
    }

    #[test]
    fn fdr_edge_cases() {
        // No decoys above: FDR is zero
        let est = estimate(&[(3.0, false), (2.0, false), (1.0, true)], 1.0);
        assert_eq!(est[0], (0.0, 0.0));
        assert_eq!(est[1], (0.0, 0.0));
        assert_eq!(est[2], (0.5, 0.5));

        // No targets yet: FDR is one
        let est = estimate(&[(3.0, true), (2.0, false), (1.0, false)], 1.0);
        assert_eq!(est[0].0, 1.0);
        assert_eq!(est[1].0, 1.0);
        assert_eq!(est[2].0, 0.5);
        assert_eq!(est[0].1, 0.5);

        // pi_0 scales decoy counts
        let est = estimate(&[(2.0, false), (1.0, true)], 0.5);
        assert_eq!(est[1], (0.25, 0.25));
    }

    #[test]
    fn score_table() {
        let scores = [0.1, 5.0, 3.0, 3.0, -1.0];
        let decoys = [true, false, false, true, false];
        let table = ScoreTable::new(&scores, &decoys, 1.0);
        let order = table.rows().iter().map(|r| r.index).collect::<Vec<_>>();
        assert_eq!(order, vec![1, 2, 3, 0, 4]);
        assert_eq!(table.rows()[0].rank, 1);
        // plateau at 3.0: 2 targets, 1 decoy
        assert_eq!(table.rows()[1].fdr, 0.5);
        assert_eq!(table.rows()[2].fdr, 0.5);
        assert_eq!(table.passing(0.0), 1);
        assert_eq!(table.confident_targets(0.5), vec![1, 2]);
    }

    fn mixture(nulls: usize, correct: usize, decoys: usize) -> Vec<(f64, bool)> {
        // Null targets interleave with decoys, correct targets score above all
        let mut data = Vec::new();
        for i in 0..decoys {
            data.push((i as f64 / decoys as f64, true));
        }
        for i in 0..nulls {
            data.push(((i as f64 + 0.5) / nulls as f64, false));
        }
        for i in 0..correct {
            data.push((10.0 + i as f64, false));
        }
        data.sort_by(|a, b| b.0.total_cmp(&a.0));
        data
    }

    #[test]
    fn pi0_estimators() {
        let data = mixture(400, 600, 1000);
        let grid = LambdaGrid::default().estimate(&data);
        let boot = Bootstrap::default().estimate(&data);
        assert!((grid - 0.4).abs() < 0.1, "{}", grid);
        assert!((boot - 0.4).abs() < 0.1, "{}", boot);
        assert_eq!(Bootstrap::default().estimate(&data), boot);

        assert_eq!(Pi0Strategy::Fixed(2.0).estimate(&data), 1.0);
        assert!(Pi0Strategy::Fixed(0.0).estimate(&data) > 0.0);

        // No decoys: nothing to calibrate against
        let targets = vec![(1.0, false), (0.5, false)];
        assert_eq!(Pi0Strategy::default().estimate(&targets), 1.0);
    }

    #[test]
    fn strategy_from_json() {
        let s: Pi0Strategy = serde_json::from_str(r#"{"fixed": 0.8}"#).unwrap();
        assert_eq!(s, Pi0Strategy::Fixed(0.8));
        let s: Pi0Strategy = serde_json::from_str(r#"{"bootstrap": {"samples": 10}}"#).unwrap();
        assert_eq!(
            s,
            Pi0Strategy::Bootstrap(Bootstrap {
                samples: 10,
                ..Default::default()
            })
        );
    }
}
