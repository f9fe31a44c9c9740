//! Linear scoring of feature rows

use crate::feature_matrix::FeatureMatrix;
use crate::Error;
use serde::{Deserialize, Serialize};

/// `N` feature weights followed by a bias term
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Weights(Vec<f64>);

impl Weights {
    pub fn new(mut features: Vec<f64>, bias: f64) -> Self {
        features.push(bias);
        Weights(features)
    }

    /// Build from a full `N + 1` vector (feature weights, then bias)
    pub fn from_slice(values: &[f64], features: usize) -> Result<Self, Error> {
        if values.len() != features + 1 {
            return Err(Error::Schema(format!(
                "weight vector has {} values, expected {} feature weights and a bias",
                values.len(),
                features
            )));
        }
        Ok(Weights(values.to_vec()))
    }

    /// A single feature, with the given sign
    pub fn unit(features: usize, feature: usize, sign: f64) -> Self {
        let mut w = vec![0.0; features + 1];
        w[feature] = sign;
        Weights(w)
    }

    pub fn features(&self) -> &[f64] {
        &self.0[..self.0.len() - 1]
    }

    pub fn bias(&self) -> f64 {
        self.0[self.0.len() - 1]
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|w| w.is_finite())
    }

    /// Parse a weight file and return its last row. Lines starting with `#`
    /// and blank lines are skipped; values may be separated by any whitespace
    pub fn parse_last_row(contents: &str, features: usize) -> Result<Self, Error> {
        let line = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .last()
            .ok_or_else(|| Error::Schema("weight file contains no weights".into()))?;
        let values = line
            .split_whitespace()
            .map(|v| {
                v.parse::<f64>()
                    .map_err(|_| Error::Schema(format!("invalid weight `{}`", v)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_slice(&values, features)
    }
}

/// Dot product of feature weights and row, plus bias
#[inline]
pub fn score(weights: &Weights, row: &[f64]) -> f64 {
    weights
        .features()
        .iter()
        .zip(row)
        .fold(0.0, |acc, (w, x)| acc + w * x)
        + weights.bias()
}

/// Score every record of a matrix, in matrix order
pub fn score_all(weights: &Weights, matrix: &FeatureMatrix) -> Vec<f64> {
    matrix
        .records()
        .iter()
        .map(|record| score(weights, &record.features))
        .collect()
}
