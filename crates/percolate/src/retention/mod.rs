//! Retention time prediction from peptide sequence

pub mod alphabet;
pub mod calibration;
pub mod features;
pub mod metrics;
pub mod model;
pub mod selection;

pub use alphabet::{Alphabet, AlphabetPolicy};
pub use calibration::{Calibration, Lts};
pub use metrics::Performance;
pub use model::RetentionModel;
pub use selection::{select, CalibrationScore, RankCorrelation, Selection};

use crate::Error;

/// Peptides, and optionally their observed retention times
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PeptideSet {
    pub peptides: Vec<String>,
    pub times: Option<Vec<f64>>,
}

impl PeptideSet {
    /// One peptide per line, followed by a tab and its retention time when
    /// `with_times` is set. Blank lines and lines starting with `#` are
    /// skipped.
    pub fn parse(contents: &str, with_times: bool) -> Result<Self, Error> {
        let mut peptides = Vec::new();
        let mut times = Vec::new();
        for (line_no, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split('\t').map(str::trim);
            let peptide = fields.next().unwrap_or_default();
            // Validate the sequence up front
            alphabet::symbols(peptide)?;
            peptides.push(peptide.to_string());

            if with_times {
                let time = fields
                    .next()
                    .and_then(|t| t.parse::<f64>().ok())
                    .filter(|t| t.is_finite())
                    .ok_or_else(|| {
                        Error::Schema(format!(
                            "line {}: expected a retention time after `{}`",
                            line_no + 1,
                            peptide
                        ))
                    })?;
                times.push(time);
            }
        }
        if peptides.is_empty() {
            return Err(Error::Schema("no peptides found".into()));
        }
        Ok(PeptideSet {
            peptides,
            times: with_times.then_some(times),
        })
    }

    pub fn len(&self) -> usize {
        self.peptides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peptides.is_empty()
    }
}
