pub mod engine;
pub mod fdr;
pub mod feature_matrix;
pub mod ml;
pub mod retention;
pub mod scoring;

use std::path::Path;

#[derive(Debug)]
pub enum Error {
    /// Malformed or internally inconsistent input
    Schema(String),
    /// No confident targets (or no decoys) to train a classifier on
    DegenerateTrainingSet(String),
    /// Classifier fitting failed internally
    ClassifierConvergence(String),
    /// Peptides use symbols that a retention model was never trained on
    InconsistentAlphabet { missing: Vec<String> },
    Io(std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Schema(msg) => write!(f, "malformed input: {}", msg),
            Self::DegenerateTrainingSet(msg) => write!(f, "degenerate training set: {}", msg),
            Self::ClassifierConvergence(msg) => {
                write!(f, "classifier failed to converge: {}", msg)
            }
            Self::InconsistentAlphabet { missing } => write!(
                f,
                "peptides contain symbols missing from the model alphabet: {}",
                missing.join(" ")
            ),
            Self::Io(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Read a feature file and its companion label file
pub fn read_features<P: AsRef<Path>>(
    features: P,
    labels: P,
) -> Result<feature_matrix::FeatureMatrix, Error> {
    let features = std::fs::read_to_string(features)?;
    let labels = std::fs::read_to_string(labels)?;
    feature_matrix::FeatureMatrix::from_tab_delimited(&features, &labels)
}

/// Read a percolator-input (PIN) file
pub fn read_pin<P: AsRef<Path>>(path: P) -> Result<feature_matrix::FeatureMatrix, Error> {
    let contents = std::fs::read_to_string(path)?;
    feature_matrix::FeatureMatrix::from_pin(&contents)
}

/// Read the last row of a weight file
pub fn read_weights<P: AsRef<Path>>(
    path: P,
    features: usize,
) -> Result<scoring::Weights, Error> {
    let contents = std::fs::read_to_string(path)?;
    scoring::Weights::parse_last_row(&contents, features)
}

pub fn read_retention_model<P: AsRef<Path>>(
    path: P,
) -> Result<retention::RetentionModel, Error> {
    let contents = std::fs::read_to_string(path)?;
    retention::RetentionModel::load(&contents)
}

/// Read peptides (and, if `with_times`, observed retention times)
pub fn read_peptides<P: AsRef<Path>>(
    path: P,
    with_times: bool,
) -> Result<retention::PeptideSet, Error> {
    let contents = std::fs::read_to_string(path)?;
    retention::PeptideSet::parse(&contents, with_times)
}
