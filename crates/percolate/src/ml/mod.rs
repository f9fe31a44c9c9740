//! Linear algebra and classifiers used to re-rank PSMs

pub mod gauss;
pub mod kde;
pub mod linear_discriminant;
pub mod matrix;
pub mod svm;

use crate::scoring::Weights;
use crate::Error;
use matrix::Matrix;

#[allow(dead_code)]
pub(crate) fn all_close(lhs: &[f64], rhs: &[f64], eps: f64) -> bool {
    lhs.len() == rhs.len()
        && lhs
            .iter()
            .zip(rhs.iter())
            .all(|(l, r)| (l - r).abs() <= eps)
}

pub fn norm(slice: &[f64]) -> f64 {
    slice.iter().fold(0.0, |acc, x| acc + x.powi(2)).sqrt()
}

pub fn mean(slice: &[f64]) -> f64 {
    slice.iter().sum::<f64>() / slice.len() as f64
}

/// Population standard deviation
pub fn std(slice: &[f64]) -> f64 {
    let mean = mean(slice);
    let x = slice.iter().fold(0.0, |acc, x| acc + (x - mean).powi(2));
    (x / slice.len() as f64).sqrt()
}

/// Examples for a binary classifier: `+1` for confident targets, `-1` for
/// decoys
pub struct TrainingSet {
    pub features: Matrix,
    pub labels: Vec<f64>,
}

impl TrainingSet {
    pub fn new(features: Matrix, labels: Vec<f64>) -> Self {
        assert_eq!(features.rows, labels.len());
        TrainingSet { features, labels }
    }

    pub fn positives(&self) -> usize {
        self.labels.iter().filter(|&&y| y > 0.0).count()
    }

    pub fn negatives(&self) -> usize {
        self.labels.len() - self.positives()
    }
}

/// A linear classifier separating confident targets from decoys
pub trait Classifier: Sync {
    /// Fit weights (including a bias term), given per-class costs
    fn fit(&self, data: &TrainingSet, cpos: f64, cneg: f64) -> Result<Weights, Error>;

    /// Whether `fit` depends on the per-class costs at all
    fn uses_costs(&self) -> bool {
        true
    }
}
