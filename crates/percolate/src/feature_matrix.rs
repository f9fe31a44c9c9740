//! Labeled feature matrix: one row per peptide-spectrum match

use crate::ml::{mean, std};
use crate::scoring::Weights;
use crate::Error;
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Label {
    Target,
    Decoy,
}

impl Label {
    /// Decode a numeric label: `1` target, `-1` decoy, `-2` test-only decoy.
    /// The boolean is true for test-only decoys.
    pub fn decode(code: i32) -> Option<(Label, bool)> {
        match code {
            1 => Some((Label::Target, false)),
            -1 => Some((Label::Decoy, false)),
            -2 => Some((Label::Decoy, true)),
            _ => None,
        }
    }

    pub fn is_decoy(&self) -> bool {
        *self == Label::Decoy
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PsmRecord {
    pub id: String,
    pub label: Label,
    /// Decoy used for FDR estimation only, never for training
    pub holdout: bool,
    pub charge: u8,
    /// Enzymatic cleavage at the (N-terminal, C-terminal) boundary
    pub enzymatic: (bool, bool),
    pub features: Vec<f64>,
    pub peptide: Option<String>,
    pub proteins: Vec<String>,
    /// Spectrum the match was made against. PSMs of one spectrum always
    /// share a cross-validation fold.
    pub spectrum: Option<String>,
}

impl PsmRecord {
    /// Grouping key for cross-validation, the identifier when no spectrum is known
    pub fn spectrum_key(&self) -> &str {
        self.spectrum.as_deref().unwrap_or(&self.id)
    }
}

/// Unvalidated input row, as produced by a reader or converter
#[derive(Clone, Debug, Default)]
pub struct Row {
    pub id: String,
    pub label: i32,
    pub charge: u8,
    pub enzymatic: (bool, bool),
    pub features: Vec<f64>,
    pub peptide: Option<String>,
    pub proteins: Vec<String>,
    pub spectrum: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FeatureMatrix {
    names: Vec<String>,
    records: Vec<PsmRecord>,
}

impl FeatureMatrix {
    /// Validate rows against a feature schema
    pub fn parse<I>(names: Vec<String>, rows: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = Row>,
    {
        if names.is_empty() {
            return Err(Error::Schema("feature matrix has no feature columns".into()));
        }

        let mut records = Vec::new();
        for row in rows {
            if row.features.len() != names.len() {
                return Err(Error::Schema(format!(
                    "record `{}` has {} features, expected {}",
                    row.id,
                    row.features.len(),
                    names.len()
                )));
            }
            if let Some(col) = row.features.iter().position(|x| !x.is_finite()) {
                return Err(Error::Schema(format!(
                    "record `{}` has a non-finite value for feature `{}`",
                    row.id, names[col]
                )));
            }
            let (label, holdout) = Label::decode(row.label).ok_or_else(|| {
                Error::Schema(format!(
                    "record `{}` has unrecognized label {}",
                    row.id, row.label
                ))
            })?;
            records.push(PsmRecord {
                id: row.id,
                label,
                holdout,
                charge: row.charge,
                enzymatic: row.enzymatic,
                features: row.features,
                peptide: row.peptide,
                proteins: row.proteins,
                spectrum: row.spectrum,
            });
        }

        if records.is_empty() {
            return Err(Error::Schema("feature matrix contains no records".into()));
        }

        Ok(FeatureMatrix { names, records })
    }

    /// Parse a whitespace-delimited feature file (header row, first column is
    /// the identifier) together with a label file mapping identifier to label
    pub fn from_tab_delimited(features: &str, labels: &str) -> Result<Self, Error> {
        let mut label_map = FnvHashMap::default();
        for (line_no, line) in labels.lines().enumerate() {
            let mut fields = line.split_whitespace();
            let (id, code) = match (fields.next(), fields.next()) {
                (Some(id), Some(code)) => (id, code),
                (None, _) => continue,
                (Some(_), None) => {
                    return Err(Error::Schema(format!(
                        "label file line {} is missing a label",
                        line_no + 1
                    )))
                }
            };
            match code.parse::<i32>() {
                Ok(code) => {
                    if label_map.insert(id, code).is_some() {
                        return Err(Error::Schema(format!(
                            "label file line {}: record `{}` is labeled twice",
                            line_no + 1,
                            id
                        )));
                    }
                }
                // Tolerate a header line
                Err(_) if line_no == 0 => continue,
                Err(_) => {
                    return Err(Error::Schema(format!(
                        "label file line {}: `{}` is not a label",
                        line_no + 1,
                        code
                    )))
                }
            }
        }

        let mut lines = features.lines().filter(|line| !line.trim().is_empty());
        let header = lines
            .next()
            .ok_or_else(|| Error::Schema("feature file is empty".into()))?;
        let names = header
            .split_whitespace()
            .skip(1)
            .map(String::from)
            .collect::<Vec<_>>();

        let mut rows = Vec::new();
        for line in lines {
            let mut fields = line.split_whitespace();
            let id = fields.next().unwrap_or_default();
            let features = fields
                .map(|field| parse_value(id, field))
                .collect::<Result<Vec<_>, _>>()?;
            let label = *label_map
                .get(id)
                .ok_or_else(|| Error::Schema(format!("record `{}` has no label", id)))?;
            rows.push(Row {
                id: id.into(),
                label,
                features,
                ..Default::default()
            });
        }

        Self::parse(names, rows)
    }

    /// Parse a tab-delimited percolator-input file:
    /// `SpecId Label [ScanNr] features... Peptide Proteins...`
    pub fn from_pin(contents: &str) -> Result<Self, Error> {
        let mut lines = contents.lines().filter(|line| !line.trim().is_empty());
        let header = lines
            .next()
            .ok_or_else(|| Error::Schema("PIN file is empty".into()))?
            .split('\t')
            .map(str::trim)
            .collect::<Vec<_>>();

        let column = |name: &str| header.iter().position(|h| h.eq_ignore_ascii_case(name));
        let label_col = column("label").unwrap_or(1);
        let scan_col = column("scannr");
        let first_feature = scan_col.map_or(label_col, |c| c.max(label_col)) + 1;
        let peptide_col = column("peptide")
            .ok_or_else(|| Error::Schema("PIN header has no `Peptide` column".into()))?;
        if peptide_col < first_feature {
            return Err(Error::Schema(
                "PIN `Peptide` column precedes the feature columns".into(),
            ));
        }

        let names = header[first_feature..peptide_col]
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>();

        let mut rows = Vec::new();
        for line in lines {
            if line.starts_with("DefaultDirection") {
                continue;
            }
            let fields = line.split('\t').collect::<Vec<_>>();
            if fields.len() <= peptide_col {
                return Err(Error::Schema(format!(
                    "PIN row `{}` has {} fields, expected at least {}",
                    fields[0],
                    fields.len(),
                    peptide_col + 1
                )));
            }
            let id = fields[0].trim();
            let label = fields[label_col]
                .trim()
                .parse::<i32>()
                .map_err(|_| Error::Schema(format!("record `{}` has no numeric label", id)))?;
            let features = fields[first_feature..peptide_col]
                .iter()
                .map(|field| parse_value(id, field))
                .collect::<Result<Vec<_>, _>>()?;

            let mut row = Row {
                id: id.into(),
                label,
                features,
                peptide: Some(fields[peptide_col].trim().to_string()),
                proteins: fields[peptide_col + 1..]
                    .iter()
                    .map(|p| p.trim())
                    .filter(|p| !p.is_empty())
                    .map(String::from)
                    .collect(),
                spectrum: scan_col.map(|c| fields[c].trim().to_string()),
                ..Default::default()
            };
            for (name, value) in names.iter().zip(&row.features) {
                let lower = name.to_ascii_lowercase();
                match lower.as_str() {
                    "enzn" => row.enzymatic.0 = *value != 0.0,
                    "enzc" => row.enzymatic.1 = *value != 0.0,
                    "charge" => row.charge = parse_charge(id, *value)?,
                    _ => {
                        if let Some(z) = lower.strip_prefix("charge") {
                            if *value != 0.0 {
                                row.charge = z.parse().unwrap_or(row.charge);
                            }
                        }
                    }
                }
            }
            rows.push(row);
        }

        Self::parse(names, rows)
    }

    /// Return a new matrix holding the records matching `predicate`
    pub fn subset<F>(&self, predicate: F) -> FeatureMatrix
    where
        F: Fn(&PsmRecord) -> bool,
    {
        FeatureMatrix {
            names: self.names.clone(),
            records: self
                .records
                .iter()
                .filter(|r| predicate(r))
                .cloned()
                .collect(),
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn records(&self) -> &[PsmRecord] {
        &self.records
    }

    pub fn n_features(&self) -> usize {
        self.names.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Decoy flag of each record, in matrix order
    pub fn decoys(&self) -> Vec<bool> {
        self.records.iter().map(|r| r.label.is_decoy()).collect()
    }

    pub fn column(&self, col: usize) -> impl Iterator<Item = f64> + '_ {
        self.records.iter().map(move |r| r.features[col])
    }
}

/// Charge states are small non-negative integers
fn parse_charge(id: &str, value: f64) -> Result<u8, Error> {
    match value {
        z if z.fract() == 0.0 && (0.0..=u8::MAX as f64).contains(&z) => Ok(z as u8),
        _ => Err(Error::Schema(format!(
            "record `{}` has invalid charge {}",
            id, value
        ))),
    }
}

fn parse_value(id: &str, field: &str) -> Result<f64, Error> {
    field.trim().parse::<f64>().map_err(|_| {
        Error::Schema(format!(
            "record `{}` has non-numeric feature value `{}`",
            id, field
        ))
    })
}

/// Standard score normalization of feature columns
#[derive(Clone, Debug, PartialEq)]
pub struct Normalizer {
    mean: Vec<f64>,
    sd: Vec<f64>,
}

impl Normalizer {
    pub fn fit(matrix: &FeatureMatrix) -> Self {
        let (mean, sd) = (0..matrix.n_features())
            .map(|col| {
                let values = matrix.column(col).collect::<Vec<_>>();
                let sd = match std(&values) {
                    sd if sd > 0.0 && sd.is_finite() => sd,
                    _ => 1.0,
                };
                (mean(&values), sd)
            })
            .unzip();
        Normalizer { mean, sd }
    }

    /// Normalizer that leaves features untouched
    pub fn identity(features: usize) -> Self {
        Normalizer {
            mean: vec![0.0; features],
            sd: vec![1.0; features],
        }
    }

    pub fn apply(&self, matrix: &FeatureMatrix) -> FeatureMatrix {
        let records = matrix
            .records
            .iter()
            .map(|record| PsmRecord {
                features: record
                    .features
                    .iter()
                    .zip(self.mean.iter().zip(&self.sd))
                    .map(|(x, (mu, sd))| (x - mu) / sd)
                    .collect(),
                ..record.clone()
            })
            .collect();
        FeatureMatrix {
            names: matrix.names.clone(),
            records,
        }
    }

    /// Map weights learned on normalized features back onto raw features
    pub fn raw_weights(&self, normalized: &Weights) -> Weights {
        let features = normalized
            .features()
            .iter()
            .zip(&self.sd)
            .map(|(w, sd)| w / sd)
            .collect::<Vec<_>>();
        let shift = features
            .iter()
            .zip(&self.mean)
            .fold(0.0, |acc, (w, mu)| acc + w * mu);
        Weights::new(features, normalized.bias() - shift)
    }

    /// Map raw-feature weights into the normalized feature space
    pub fn normalized_weights(&self, raw: &Weights) -> Weights {
        let shift = raw
            .features()
            .iter()
            .zip(&self.mean)
            .fold(0.0, |acc, (w, mu)| acc + w * mu);
        let features = raw
            .features()
            .iter()
            .zip(&self.sd)
            .map(|(w, sd)| w * sd)
            .collect();
        Weights::new(features, raw.bias() + shift)
    }
}
