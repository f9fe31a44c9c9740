//! Iterative semi-supervised re-ranking of PSMs.
//!
//! Starting from an initial direction, the engine alternates between training
//! a linear classifier (confident targets vs. decoys) and re-scoring every PSM
//! with the new weights, until the number of targets passing the FDR threshold
//! stops improving.
//!
//! Training is cross-validated. PSMs are split into folds by spectrum and each
//! fold is scored with weights trained on the remaining folds only.

use crate::fdr::{Pi0Estimator, Pi0Strategy, ScoreTable};
use crate::feature_matrix::{FeatureMatrix, Normalizer};
use crate::ml::kde;
use crate::ml::linear_discriminant::LinearDiscriminant;
use crate::ml::matrix::Matrix;
use crate::ml::svm::{L2Svm, SvmOptions};
use crate::ml::{Classifier, TrainingSet};
use crate::scoring::{score, Weights};
use crate::Error;
use fnv::FnvHashMap;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Instant;

const CPOS_GRID: [f64; 3] = [10.0, 1.0, 0.1];
const CFRAC_GRID: [f64; 3] = [1.0, 3.0, 10.0];

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierKind {
    Svm,
    Lda,
}

impl Default for ClassifierKind {
    fn default() -> Self {
        ClassifierKind::Svm
    }
}

/// Weight vector the first training step starts from
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialDirection {
    /// Single feature (and sign) separating the most targets
    BestFeature,
    /// All feature weights 1
    Uniform,
    /// Raw feature weights followed by a bias
    Seed(Vec<f64>),
}

impl Default for InitialDirection {
    fn default() -> Self {
        InitialDirection::BestFeature
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// FDR threshold for counting passing PSMs and testing convergence
    pub test_fdr: f64,
    /// Threshold for selecting confident targets, defaults to `test_fdr`
    pub selection_fdr: Option<f64>,
    /// Threshold for the first training step, defaults to `test_fdr`
    pub initial_selection_fdr: Option<f64>,
    pub max_iterations: usize,
    /// Relative improvement in passing PSMs below which training stops
    pub epsilon: f64,
    /// Cost of misclassified targets. Searched over a grid when unset
    pub cpos: Option<f64>,
    /// Cost of misclassified decoys. Searched over a grid when unset
    pub cneg: Option<f64>,
    pub classifier: ClassifierKind,
    pub svm: SvmOptions,
    pub initial_direction: InitialDirection,
    pub pi0: Pi0Strategy,
    /// Standardize feature columns before training
    pub normalize: bool,
    /// Wall-clock budget in seconds, checked between iterations
    pub time_limit: Option<f64>,
    /// Cross-validation folds. With a single fold every PSM is scored by
    /// weights trained on it
    pub folds: usize,
    /// Folds within each training set used to pick the costs. With a single
    /// nested fold the costs are picked on the training set itself
    pub nested_folds: usize,
    /// Seed of the spectrum shuffle behind the fold assignment
    pub seed: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            test_fdr: 0.01,
            selection_fdr: None,
            initial_selection_fdr: None,
            max_iterations: 10,
            epsilon: 0.01,
            cpos: None,
            cneg: None,
            classifier: ClassifierKind::default(),
            svm: SvmOptions::default(),
            initial_direction: InitialDirection::default(),
            pi0: Pi0Strategy::default(),
            normalize: true,
            time_limit: None,
            folds: 3,
            nested_folds: 1,
            seed: 1,
        }
    }
}

impl EngineConfig {
    pub fn selection_fdr(&self) -> f64 {
        self.selection_fdr.unwrap_or(self.test_fdr)
    }

    pub fn initial_selection_fdr(&self) -> f64 {
        self.initial_selection_fdr.unwrap_or(self.test_fdr)
    }

    pub fn validate(&self) -> Result<(), Error> {
        for (name, fdr) in [
            ("test_fdr", self.test_fdr),
            ("selection_fdr", self.selection_fdr()),
            ("initial_selection_fdr", self.initial_selection_fdr()),
        ] {
            if !(fdr > 0.0 && fdr <= 1.0) {
                return Err(Error::Schema(format!(
                    "{} must be in (0, 1], got {}",
                    name, fdr
                )));
            }
        }
        for (name, cost) in [("cpos", self.cpos), ("cneg", self.cneg)] {
            if let Some(c) = cost {
                if !(c > 0.0 && c.is_finite()) {
                    return Err(Error::Schema(format!("{} must be positive, got {}", name, c)));
                }
            }
        }
        if self.epsilon < 0.0 || self.epsilon.is_nan() {
            return Err(Error::Schema("epsilon must not be negative".into()));
        }
        for (name, folds) in [("folds", self.folds), ("nested_folds", self.nested_folds)] {
            if folds == 0 {
                return Err(Error::Schema(format!("{} must be at least 1", name)));
            }
        }
        Ok(())
    }
}

/// Engine states, in the order they are visited
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Initializing,
    Training(usize),
    Scoring(usize),
    Converged,
    IterationLimitReached,
    Done,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum Termination {
    Converged,
    IterationLimitReached,
    TimeLimitReached,
    /// Classifier fitting failed; the report holds the last accepted iteration
    ClassifierFailed,
}

/// Training and test members of one cross-validation fold, as record indices
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fold {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Split `members` of `matrix` into `k` folds, keeping the PSMs of a spectrum
/// together. Spectra are shuffled with a seeded generator and dealt round
/// robin. A single fold trains and tests on every member.
pub fn partition(
    matrix: &FeatureMatrix,
    members: &[usize],
    k: usize,
    seed: u64,
) -> Result<Vec<Fold>, Error> {
    if k <= 1 {
        return Ok(vec![Fold {
            train: members.to_vec(),
            test: members.to_vec(),
        }]);
    }

    let records = matrix.records();
    let mut spectra: FnvHashMap<&str, usize> = FnvHashMap::default();
    let groups = members
        .iter()
        .map(|&idx| {
            let next = spectra.len();
            *spectra.entry(records[idx].spectrum_key()).or_insert(next)
        })
        .collect::<Vec<_>>();
    if spectra.len() < k {
        return Err(Error::Schema(format!(
            "{} spectra cannot be split into {} cross-validation folds",
            spectra.len(),
            k
        )));
    }

    let mut order = (0..spectra.len()).collect::<Vec<_>>();
    order.shuffle(&mut StdRng::seed_from_u64(seed));
    let mut fold_of = vec![0; order.len()];
    for (i, group) in order.into_iter().enumerate() {
        fold_of[group] = i % k;
    }

    let mut folds = vec![
        Fold {
            train: Vec::new(),
            test: Vec::new(),
        };
        k
    ];
    for (&idx, &group) in members.iter().zip(&groups) {
        for (f, fold) in folds.iter_mut().enumerate() {
            match f == fold_of[group] {
                true => fold.test.push(idx),
                false => fold.train.push(idx),
            }
        }
    }
    Ok(folds)
}

/// Training diagnostics of one cross-validation fold
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FoldReport {
    pub training_targets: usize,
    pub training_decoys: usize,
    pub cpos: f64,
    pub cneg: f64,
}

/// Diagnostics of a single training iteration
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IterationReport {
    pub iteration: usize,
    /// Threshold used to select confident targets for training
    pub selection_fdr: f64,
    pub folds: Vec<FoldReport>,
    pub pi0: f64,
    /// Targets passing the test FDR with this iteration's weights
    pub passing: usize,
    /// False if the iteration lowered the passing count and was rolled back
    pub accepted: bool,
}

#[derive(Clone, Debug)]
pub struct Report {
    /// Final ranking, annotated with q-values and posterior error probabilities
    pub table: ScoreTable,
    /// Raw-feature weights averaged over the folds: the initial direction,
    /// then one row per accepted iteration
    pub weights: Vec<Weights>,
    /// Cross-validation folds the ranking was scored with
    pub folds: Vec<Fold>,
    /// Raw-feature weights that scored the test members of each fold
    pub fold_weights: Vec<Weights>,
    pub iterations: Vec<IterationReport>,
    /// Targets passing the test FDR with the initial direction
    pub initial_passing: usize,
    /// Targets passing the test FDR in the final ranking
    pub passing: usize,
    /// pi_0 used during training
    pub training_pi0: f64,
    /// pi_0 of the final ranking
    pub pi0: f64,
    pub termination: Termination,
    /// Set when training stopped early on a classifier failure
    pub partial: Option<String>,
}

impl Report {
    /// Final raw-feature weights
    pub fn final_weights(&self) -> &Weights {
        &self.weights[self.weights.len() - 1]
    }
}

/// Candidate weights from one (cpos, cneg) pair
struct Candidate {
    cpos: f64,
    cneg: f64,
    weights: Weights,
    selected: usize,
}

/// Training members of one fold in one iteration
struct FoldTraining<'a> {
    index: usize,
    fold: &'a Fold,
    targets: Vec<usize>,
    decoys: Vec<usize>,
}

struct FoldFit {
    weights: Weights,
    report: FoldReport,
}

/// Score `members` with `weights`. Row indices of the table are positions in
/// `members`.
fn member_table(data: &FeatureMatrix, members: &[usize], weights: &Weights, pi0: f64) -> ScoreTable {
    let records = data.records();
    let (scores, decoys): (Vec<f64>, Vec<bool>) = members
        .iter()
        .map(|&idx| {
            let record = &records[idx];
            (score(weights, &record.features), record.label.is_decoy())
        })
        .unzip();
    ScoreTable::new(&scores, &decoys, pi0)
}

fn training_set(data: &FeatureMatrix, targets: &[usize], decoys: &[usize]) -> TrainingSet {
    let records = data.records();
    let rows = targets
        .iter()
        .chain(decoys)
        .map(|&idx| records[idx].features.as_slice());
    let features = Matrix::from_rows(rows, data.n_features());
    let labels = std::iter::repeat(1.0)
        .take(targets.len())
        .chain(std::iter::repeat(-1.0).take(decoys.len()))
        .collect();
    TrainingSet::new(features, labels)
}

/// Shift and scale that move a fold's score at `fdr` to 0 and its median
/// decoy score to -1
fn fold_scale(table: &ScoreTable, fdr: f64) -> (f64, f64) {
    let rows = table.rows();
    let threshold = rows
        .iter()
        .rev()
        .find(|r| !r.decoy && r.q_value <= fdr)
        .or_else(|| rows.first())
        .map_or(0.0, |r| r.score);
    let decoys = rows
        .iter()
        .filter(|r| r.decoy)
        .map(|r| r.score)
        .collect::<Vec<_>>();
    let median = match decoys.len() {
        0 => return (threshold, 1.0),
        n if n % 2 == 1 => decoys[n / 2],
        n => (decoys[n / 2 - 1] + decoys[n / 2]) / 2.0,
    };
    match threshold - median {
        scale if scale > 0.0 && scale.is_finite() => (threshold, scale),
        _ => (threshold, 1.0),
    }
}

/// Element-wise mean of per-fold weights
fn average(weights: &[Weights]) -> Weights {
    let mut sum = vec![0.0; weights.first().map_or(0, |w| w.as_slice().len())];
    for w in weights {
        for (acc, x) in sum.iter_mut().zip(w.as_slice()) {
            *acc += x;
        }
    }
    let n = weights.len().max(1) as f64;
    let bias = sum.pop().unwrap_or_default() / n;
    Weights::new(sum.into_iter().map(|x| x / n).collect(), bias)
}

pub struct Engine {
    config: EngineConfig,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Engine { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn classifier(&self) -> Box<dyn Classifier> {
        match self.config.classifier {
            ClassifierKind::Svm => Box::new(L2Svm::new(self.config.svm)),
            ClassifierKind::Lda => Box::new(LinearDiscriminant),
        }
    }

    fn transition(state: &mut State, next: State) {
        log::trace!("- engine: {:?} -> {:?}", state, next);
        *state = next;
    }

    /// Initial weights of a fold, in the normalized feature space
    fn initial_weights(
        &self,
        data: &FeatureMatrix,
        members: &[usize],
        normalizer: &Normalizer,
    ) -> Result<Weights, Error> {
        let n = data.n_features();
        match &self.config.initial_direction {
            InitialDirection::Uniform => Ok(Weights::new(vec![1.0; n], 0.0)),
            InitialDirection::Seed(raw) => {
                let raw = Weights::from_slice(raw, n)?;
                Ok(normalizer.normalized_weights(&raw))
            }
            InitialDirection::BestFeature => {
                let records = data.records();
                let decoys = members
                    .iter()
                    .map(|&idx| records[idx].label.is_decoy())
                    .collect::<Vec<_>>();
                let mut best = (0, 1.0, 0);
                for col in 0..n {
                    for sign in [1.0, -1.0] {
                        let scores = members
                            .iter()
                            .map(|&idx| records[idx].features[col] * sign)
                            .collect::<Vec<_>>();
                        let passing =
                            ScoreTable::new(&scores, &decoys, 1.0).passing(self.config.test_fdr);
                        if passing > best.2 {
                            best = (col, sign, passing);
                        }
                    }
                }
                let (col, sign, passing) = best;
                log::info!(
                    "Selected feature {} as initial direction. Could separate {} positives with q<{} in that direction.",
                    data.names()[col],
                    passing,
                    self.config.test_fdr
                );
                Ok(Weights::unit(n, col, sign))
            }
        }
    }

    /// Confident targets and non-holdout decoys among `members`, as record
    /// indices. `table` holds the current scores of `members`.
    fn training_members(
        &self,
        data: &FeatureMatrix,
        members: &[usize],
        table: &ScoreTable,
        fdr: f64,
    ) -> Result<(Vec<usize>, Vec<usize>), Error> {
        let targets = table
            .confident_targets(fdr)
            .into_iter()
            .map(|pos| members[pos])
            .collect::<Vec<_>>();
        if targets.is_empty() {
            return Err(Error::DegenerateTrainingSet(format!(
                "no targets with q-value at or below {}",
                fdr
            )));
        }

        let records = data.records();
        let decoys = members
            .iter()
            .copied()
            .filter(|&idx| records[idx].label.is_decoy() && !records[idx].holdout)
            .collect::<Vec<_>>();
        if decoys.is_empty() {
            return Err(Error::DegenerateTrainingSet(
                "no decoys available for training".into(),
            ));
        }
        Ok((targets, decoys))
    }

    /// (cpos, cneg) pairs to evaluate, in priority order
    fn cost_grid(&self, positives: usize, negatives: usize) -> Vec<(f64, f64)> {
        if !self.classifier().uses_costs() {
            return vec![(1.0, 1.0)];
        }
        let ratio = positives as f64 / negatives as f64;
        let cpos = match self.config.cpos {
            Some(c) => vec![c],
            None => CPOS_GRID.to_vec(),
        };
        let mut grid = Vec::new();
        for cp in cpos {
            match self.config.cneg {
                Some(cn) => grid.push((cp, cn)),
                None => grid.extend(CFRAC_GRID.iter().map(|frac| (cp, cp * frac * ratio))),
            }
        }
        grid
    }

    /// Pick the cost pair passing the most targets summed over nested folds of
    /// the training members. The whole grid is returned when no nested fold
    /// has both targets and decoys to train on.
    fn nested_costs(
        &self,
        classifier: &dyn Classifier,
        data: &FeatureMatrix,
        job: &FoldTraining,
        grid: Vec<(f64, f64)>,
        pi0: f64,
        fdr: f64,
    ) -> Result<Vec<(f64, f64)>, Error> {
        let nested = partition(data, &job.fold.train, self.config.nested_folds, self.config.seed)?;
        let mut inside = vec![false; data.len()];
        let sets = nested
            .iter()
            .filter_map(|part| {
                inside.iter_mut().for_each(|x| *x = false);
                for &idx in &part.train {
                    inside[idx] = true;
                }
                let targets = job
                    .targets
                    .iter()
                    .copied()
                    .filter(|&idx| inside[idx])
                    .collect::<Vec<_>>();
                let decoys = job
                    .decoys
                    .iter()
                    .copied()
                    .filter(|&idx| inside[idx])
                    .collect::<Vec<_>>();
                match targets.is_empty() || decoys.is_empty() {
                    true => None,
                    false => Some((training_set(data, &targets, &decoys), part.test.as_slice())),
                }
            })
            .collect::<Vec<_>>();
        if sets.is_empty() {
            log::warn!(
                "- fold {}: nested folds lack targets or decoys, selecting costs on the training set",
                job.index
            );
            return Ok(grid);
        }

        let totals = grid
            .par_iter()
            .map(|&(cpos, cneg)| {
                sets.iter()
                    .try_fold(0, |acc, (set, test)| -> Result<usize, Error> {
                        let w = classifier.fit(set, cpos, cneg)?;
                        Ok(acc + member_table(data, test, &w, pi0).passing(fdr))
                    })
                    .map(|total| (cpos, cneg, total))
            })
            .collect::<Vec<_>>();

        let mut best: Option<(f64, f64, usize)> = None;
        let mut first_error = None;
        for result in totals {
            match result {
                Ok(pair) if best.map_or(true, |b| pair.2 > b.2) => best = Some(pair),
                Ok(_) => {}
                Err(e) => {
                    log::warn!("- fold {}: {}", job.index, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match (best, first_error) {
            (Some((cpos, cneg, total)), _) => {
                log::trace!(
                    "- fold {}: nested folds pass {} targets with cpos {} and cneg {}",
                    job.index,
                    total,
                    cpos,
                    cneg
                );
                Ok(vec![(cpos, cneg)])
            }
            (None, Some(e)) => Err(e),
            (None, None) => Err(Error::ClassifierConvergence("empty cost grid".into())),
        }
    }

    /// Fit the weights of one fold. Each cost pair is judged by the targets
    /// passing `fdr` among the fold's training members; the first pair wins
    /// ties.
    fn train_fold(
        &self,
        classifier: &dyn Classifier,
        data: &FeatureMatrix,
        job: &FoldTraining,
        pi0: f64,
        fdr: f64,
    ) -> Result<FoldFit, Error> {
        let mut grid = self.cost_grid(job.targets.len(), job.decoys.len());
        if grid.len() > 1 && self.config.nested_folds > 1 {
            grid = self.nested_costs(classifier, data, job, grid, pi0, fdr)?;
        }

        let set = training_set(data, &job.targets, &job.decoys);
        let results = grid
            .par_iter()
            .map(|&(cpos, cneg)| {
                classifier.fit(&set, cpos, cneg).map(|weights| Candidate {
                    cpos,
                    cneg,
                    selected: member_table(data, &job.fold.train, &weights, pi0).passing(fdr),
                    weights,
                })
            })
            .collect::<Vec<_>>();

        let mut best: Option<Candidate> = None;
        let mut first_error = None;
        for result in results {
            match result {
                Ok(candidate) => {
                    if best.as_ref().map_or(true, |b| candidate.selected > b.selected) {
                        best = Some(candidate);
                    }
                }
                Err(e) => {
                    log::warn!("- fold {}: {}", job.index, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match (best, first_error) {
            (Some(best), _) => Ok(FoldFit {
                weights: best.weights,
                report: FoldReport {
                    training_targets: job.targets.len(),
                    training_decoys: job.decoys.len(),
                    cpos: best.cpos,
                    cneg: best.cneg,
                },
            }),
            (None, Some(e)) => Err(e),
            (None, None) => Err(Error::ClassifierConvergence(
                "no candidate weights to score".into(),
            )),
        }
    }

    /// Score the test members of every fold with that fold's weights and rank
    /// them together. With several folds each fold's scores are first put on
    /// a common scale.
    fn merge(
        &self,
        data: &FeatureMatrix,
        decoys: &[bool],
        folds: &[Fold],
        weights: &[Weights],
        pi0: f64,
    ) -> ScoreTable {
        let mut scores = vec![0.0; data.len()];
        for (fold, w) in folds.iter().zip(weights) {
            let table = member_table(data, &fold.test, w, pi0);
            let (shift, scale) = match folds.len() {
                1 => (0.0, 1.0),
                _ => fold_scale(&table, self.config.selection_fdr()),
            };
            for row in table.rows() {
                scores[fold.test[row.index]] = (row.score - shift) / scale;
            }
        }
        ScoreTable::new(&scores, decoys, pi0)
    }

    pub fn run(&self, matrix: &FeatureMatrix) -> Result<Report, Error> {
        self.config.validate()?;
        if matrix.is_empty() {
            return Err(Error::Schema("feature matrix contains no records".into()));
        }
        let start = Instant::now();
        let test_fdr = self.config.test_fdr;
        let mut state = State::Initializing;

        let normalizer = match self.config.normalize {
            true => Normalizer::fit(matrix),
            false => Normalizer::identity(matrix.n_features()),
        };
        let data = normalizer.apply(matrix);
        let decoys = data.decoys();

        let members = (0..data.len()).collect::<Vec<_>>();
        let folds = partition(&data, &members, self.config.folds, self.config.seed)?;
        log::info!(
            "Split {} PSMs into {} cross-validation folds",
            data.len(),
            folds.len()
        );

        let classifier = self.classifier();
        if self.config.cpos.is_none() && classifier.uses_costs() {
            log::info!("Selecting Cpos by cross-validation.");
        }
        if self.config.cneg.is_none() && classifier.uses_costs() {
            log::info!("Selecting Cneg by cross-validation.");
        }

        let mut weights = folds
            .iter()
            .map(|fold| self.initial_weights(&data, &fold.train, &normalizer))
            .collect::<Result<Vec<_>, _>>()?;
        let table = self.merge(&data, &decoys, &folds, &weights, 1.0);
        let training_pi0 = self.config.pi0.estimate(&table.labeled());
        log::info!("Selecting pi_0={:.4}", training_pi0);
        let mut table = table.with_pi0(training_pi0);
        let initial_passing = table.passing(test_fdr);
        log::info!(
            "Found {} PSMs with q<{} using the initial direction",
            initial_passing,
            test_fdr
        );

        let mut history = vec![normalizer.raw_weights(&average(&weights))];
        let mut iterations = Vec::new();
        let mut passing = initial_passing;
        let mut termination = Termination::IterationLimitReached;
        let mut partial = None;
        let mut fitted: Vec<FoldFit> = Vec::new();

        Self::transition(&mut state, State::Training(1));
        loop {
            let next = match state {
                State::Initializing => State::Training(1),
                State::Training(iteration) if iteration > self.config.max_iterations => {
                    State::IterationLimitReached
                }
                State::Training(iteration) => {
                    let elapsed = start.elapsed().as_secs_f64();
                    match self.config.time_limit {
                        Some(limit) if elapsed > limit => {
                            log::warn!(
                                "Time limit of {}s reached after {} iterations",
                                limit,
                                iteration - 1
                            );
                            termination = Termination::TimeLimitReached;
                            State::Done
                        }
                        _ => {
                            let fdr = match iteration {
                                1 => self.config.initial_selection_fdr(),
                                _ => self.config.selection_fdr(),
                            };
                            fitted.clear();
                            let mut failure = None;
                            for (index, (fold, w)) in folds.iter().zip(&weights).enumerate() {
                                let current = member_table(&data, &fold.train, w, training_pi0);
                                let (targets, training_decoys) =
                                    self.training_members(&data, &fold.train, &current, fdr)?;
                                log::trace!(
                                    "- iteration {}, fold {}: training on {} targets and {} decoys",
                                    iteration,
                                    index,
                                    targets.len(),
                                    training_decoys.len()
                                );
                                let job = FoldTraining {
                                    index,
                                    fold,
                                    targets,
                                    decoys: training_decoys,
                                };
                                match self.train_fold(
                                    classifier.as_ref(),
                                    &data,
                                    &job,
                                    training_pi0,
                                    fdr,
                                ) {
                                    Ok(fit) => fitted.push(fit),
                                    Err(e) => {
                                        failure = Some(e);
                                        break;
                                    }
                                }
                            }

                            match failure {
                                Some(e) => {
                                    log::error!(
                                        "Training failed in iteration {}, reporting the last accepted iteration: {}",
                                        iteration,
                                        e
                                    );
                                    partial = Some(e.to_string());
                                    termination = Termination::ClassifierFailed;
                                    State::Done
                                }
                                None => State::Scoring(iteration),
                            }
                        }
                    }
                }
                State::Scoring(iteration) => {
                    let selection_fdr = match iteration {
                        1 => self.config.initial_selection_fdr(),
                        _ => self.config.selection_fdr(),
                    };
                    let proposed = fitted
                        .iter()
                        .map(|fit| fit.weights.clone())
                        .collect::<Vec<_>>();
                    let merged = self.merge(&data, &decoys, &folds, &proposed, training_pi0);

                    let count = merged.passing(test_fdr);
                    log::info!(
                        "Iteration {}:\tEstimated {} PSMs with q<{}",
                        iteration,
                        count,
                        test_fdr
                    );
                    let accepted = count >= passing;
                    iterations.push(IterationReport {
                        iteration,
                        selection_fdr,
                        folds: fitted.iter().map(|fit| fit.report.clone()).collect(),
                        pi0: training_pi0,
                        passing: count,
                        accepted,
                    });

                    if !accepted {
                        log::info!(
                            "Iteration {} lowered the number of PSMs with q<{} from {} to {}, keeping previous weights",
                            iteration,
                            test_fdr,
                            passing,
                            count
                        );
                        State::Converged
                    } else {
                        let improvement = (count - passing) as f64;
                        let converged = improvement <= self.config.epsilon * passing as f64;
                        weights = proposed;
                        history.push(normalizer.raw_weights(&average(&weights)));
                        table = merged;
                        passing = count;
                        match converged {
                            true => State::Converged,
                            false => State::Training(iteration + 1),
                        }
                    }
                }
                State::Converged => {
                    termination = Termination::Converged;
                    State::Done
                }
                State::IterationLimitReached => {
                    log::info!(
                        "Reached the maximum of {} iterations",
                        self.config.max_iterations
                    );
                    termination = Termination::IterationLimitReached;
                    State::Done
                }
                State::Done => break,
            };
            Self::transition(&mut state, next);
        }
        let fold_weights = weights
            .iter()
            .map(|w| normalizer.raw_weights(w))
            .collect::<Vec<_>>();
        log::trace!("- final weights per fold: {:?}", fold_weights);

        let pi0 = self.config.pi0.estimate(&table.labeled());
        let table = table.with_pi0(pi0);
        let passing = table.passing(test_fdr);
        log::info!(
            "New pi_0 estimate on merged list gives {} PSMs over q={} (pi_0={:.4})",
            passing,
            test_fdr,
            pi0
        );

        let (scores, labels): (Vec<f64>, Vec<bool>) =
            table.rows().iter().map(|r| (r.score, r.decoy)).unzip();
        let pep = kde::Estimator::fit(&scores, &labels);
        let table = table.with_posterior_errors(|s| pep.posterior_error(s));

        Ok(Report {
            table,
            weights: history,
            folds,
            fold_weights,
            iterations,
            initial_passing,
            passing,
            training_pi0,
            pi0,
            termination,
            partial,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fdr::Pi0Strategy;
    use crate::feature_matrix::Row;

    fn row(id: usize, label: i32, features: Vec<f64>) -> Row {
        Row {
            id: format!("psm{}", id),
            label,
            features,
            ..Default::default()
        }
    }

    /// Targets are perfectly separated from decoys by the first feature
    fn separable() -> FeatureMatrix {
        let mut rows = Vec::new();
        for i in 0..60 {
            let jitter = (i % 7) as f64 * 0.1;
            rows.push(row(i, 1, vec![3.0 + jitter, (i % 5) as f64 * 0.2]));
            rows.push(row(i + 60, -1, vec![-jitter, (i % 3) as f64 * 0.3]));
        }
        FeatureMatrix::parse(vec!["f0".into(), "f1".into()], rows).unwrap()
    }

    #[test]
    fn separable_converges() {
        let report = Engine::new(EngineConfig::default())
            .run(&separable())
            .unwrap();
        assert_eq!(report.termination, Termination::Converged);
        assert!(report.iterations.len() <= 5);
        assert!(report.partial.is_none());

        let mut last = report.initial_passing;
        for it in report.iterations.iter().filter(|it| it.accepted) {
            assert!(it.passing >= last);
            assert_eq!(it.folds.len(), 3);
            last = it.passing;
        }
        assert_eq!(report.passing, 60);
        assert_eq!(report.weights.len(), 1 + report.iterations.iter().filter(|i| i.accepted).count());
        assert_eq!(report.fold_weights.len(), 3);

        // Every target outranks every decoy
        let rows = report.table.rows();
        assert!(rows[..60].iter().all(|r| !r.decoy));
        assert!(rows.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn lda_converges() {
        let config = EngineConfig {
            classifier: ClassifierKind::Lda,
            ..Default::default()
        };
        let report = Engine::new(config).run(&separable()).unwrap();
        assert_eq!(report.passing, 60);
        assert!(report
            .iterations
            .iter()
            .flat_map(|it| &it.folds)
            .all(|f| f.cpos == 1.0 && f.cneg == 1.0));
    }

    #[test]
    fn nested_folds_pick_costs_from_the_grid() {
        let config = EngineConfig {
            nested_folds: 2,
            ..Default::default()
        };
        let report = Engine::new(config).run(&separable()).unwrap();
        assert_eq!(report.passing, 60);
        assert!(!report.iterations.is_empty());
        for fold in report.iterations.iter().flat_map(|it| &it.folds) {
            assert!(CPOS_GRID.contains(&fold.cpos), "{:?}", fold);
        }
    }

    #[test]
    fn degenerate_training_set() {
        let rows = (0..20).map(|i| row(i, if i % 2 == 0 { 1 } else { -1 }, vec![1.0, 2.0]));
        let matrix = FeatureMatrix::parse(vec!["a".into(), "b".into()], rows).unwrap();
        let config = EngineConfig {
            initial_direction: InitialDirection::Uniform,
            pi0: Pi0Strategy::Fixed(1.0),
            ..Default::default()
        };
        assert!(matches!(
            Engine::new(config).run(&matrix),
            Err(Error::DegenerateTrainingSet(_))
        ));
    }

    #[test]
    fn classifier_failure_is_partial() {
        let config = EngineConfig {
            cpos: Some(1.0),
            cneg: Some(1.0),
            svm: SvmOptions {
                mfn_max_iterations: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let report = Engine::new(config).run(&separable()).unwrap();
        assert_eq!(report.termination, Termination::ClassifierFailed);
        assert!(report.partial.is_some());
        assert!(report.iterations.is_empty());
        assert_eq!(report.weights.len(), 1);
        assert_eq!(report.table.rows().len(), 120);
    }

    #[test]
    fn seed_direction() {
        let config = EngineConfig {
            initial_direction: InitialDirection::Seed(vec![1.0, 0.0, 0.5]),
            max_iterations: 0,
            ..Default::default()
        };
        let report = Engine::new(config).run(&separable()).unwrap();
        assert_eq!(report.termination, Termination::IterationLimitReached);
        let w = report.final_weights().as_slice();
        assert!(crate::ml::all_close(w, &[1.0, 0.0, 0.5], 1E-9), "{:?}", w);

        let config = EngineConfig {
            initial_direction: InitialDirection::Seed(vec![1.0, 0.0]),
            ..Default::default()
        };
        assert!(matches!(
            Engine::new(config).run(&separable()),
            Err(Error::Schema(_))
        ));
    }

    #[test]
    fn holdout_decoys_are_not_trained_on() {
        let mut rows = Vec::new();
        for i in 0..40 {
            let label = if i % 2 == 0 { -1 } else { -2 };
            rows.push(row(i, 1, vec![2.0 + (i % 4) as f64 * 0.1, 0.0]));
            rows.push(row(i + 40, label, vec![-((i % 4) as f64) * 0.1, 1.0]));
        }
        let matrix = FeatureMatrix::parse(vec!["a".into(), "b".into()], rows).unwrap();
        let report = Engine::new(EngineConfig::default()).run(&matrix).unwrap();
        assert!(!report.iterations.is_empty());
        // Each of the 20 trainable decoys sits in the training part of two folds
        for it in &report.iterations {
            assert_eq!(it.folds.iter().map(|f| f.training_decoys).sum::<usize>(), 40);
        }
        // Holdout decoys still count towards the FDR
        assert_eq!(report.table.rows().iter().filter(|r| r.decoy).count(), 40);
    }

    #[test]
    fn partition_keeps_spectra_together() {
        let rows = (0..30).map(|i| Row {
            spectrum: Some(format!("scan{}", i / 3)),
            ..row(i, if i % 2 == 0 { 1 } else { -1 }, vec![i as f64])
        });
        let matrix = FeatureMatrix::parse(vec!["a".into()], rows).unwrap();
        let members = (0..30).collect::<Vec<_>>();

        let folds = partition(&matrix, &members, 3, 1).unwrap();
        assert_eq!(folds, partition(&matrix, &members, 3, 1).unwrap());

        let mut fold_of = vec![None; 30];
        for (f, fold) in folds.iter().enumerate() {
            for &idx in &fold.test {
                assert!(fold_of[idx].is_none());
                fold_of[idx] = Some(f);
            }
            let mut all = fold.train.iter().chain(&fold.test).copied().collect::<Vec<_>>();
            all.sort_unstable();
            assert_eq!(all, members);
        }
        for spectrum in fold_of.chunks(3) {
            assert!(spectrum[0].is_some());
            assert!(spectrum.iter().all(|f| *f == spectrum[0]));
        }

        // 10 spectra of 3 PSMs dealt over 3 folds
        let mut sizes = folds.iter().map(|f| f.test.len()).collect::<Vec<_>>();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![9, 9, 12]);

        assert!(matches!(
            partition(&matrix, &members, 11, 1),
            Err(Error::Schema(_))
        ));
        let single = partition(&matrix, &members, 1, 1).unwrap();
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].train, members);
        assert_eq!(single[0].test, members);
    }

    #[test]
    fn training_members_stay_in_fold() {
        let data = separable();
        let engine = Engine::new(EngineConfig::default());
        let members = (0..data.len()).collect::<Vec<_>>();
        let folds = partition(&data, &members, 3, 7).unwrap();
        for fold in &folds {
            let w = Weights::unit(2, 0, 1.0);
            let table = member_table(&data, &fold.train, &w, 1.0);
            let (targets, decoys) = engine
                .training_members(&data, &fold.train, &table, 0.01)
                .unwrap();
            assert_eq!(targets.len() + decoys.len(), fold.train.len());
            for idx in targets.iter().chain(&decoys) {
                assert!(fold.train.contains(idx));
                assert!(!fold.test.contains(idx));
            }
        }
    }

    #[test]
    fn fold_scale_aligns_thresholds() {
        // Targets at 5, 4, 3; decoys at 2, 1, 0
        let scores = [5.0, 4.0, 3.0, 2.0, 1.0, 0.0];
        let decoys = [false, false, false, true, true, true];
        let table = ScoreTable::new(&scores, &decoys, 1.0);
        assert_eq!(fold_scale(&table, 0.01), (3.0, 2.0));

        // No decoys: shift only
        let table = ScoreTable::new(&[2.0, 1.0], &[false, false], 1.0);
        assert_eq!(fold_scale(&table, 0.01), (1.0, 1.0));
    }

    #[test]
    fn averaged_weights() {
        let w = average(&[Weights::new(vec![1.0, 2.0], 0.0), Weights::new(vec![3.0, 0.0], 1.0)]);
        assert_eq!(w, Weights::new(vec![2.0, 1.0], 0.5));
    }

    #[test]
    fn config_from_json() {
        let config: EngineConfig = serde_json::from_str(
            r#"{
                "test_fdr": 0.05,
                "classifier": "lda",
                "initial_direction": { "seed": [1.0, 2.0, 0.0] },
                "pi0": { "fixed": 0.5 },
                "folds": 5
            }"#,
        )
        .unwrap();
        assert_eq!(config.test_fdr, 0.05);
        assert_eq!(config.selection_fdr(), 0.05);
        assert_eq!(config.classifier, ClassifierKind::Lda);
        assert_eq!(config.initial_direction, InitialDirection::Seed(vec![1.0, 2.0, 0.0]));
        assert_eq!(config.pi0, Pi0Strategy::Fixed(0.5));
        assert_eq!(config.max_iterations, 10);
        assert_eq!(config.folds, 5);
        assert_eq!(config.nested_folds, 1);

        let bad = EngineConfig {
            test_fdr: 0.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = EngineConfig {
            folds: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
