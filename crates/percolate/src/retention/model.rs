//! Linear retention time model over peptide descriptors

use super::alphabet::{symbols, Alphabet, AlphabetPolicy};
use super::calibration::{Calibration, Lts};
use super::features::{self, RetentionIndex};
use super::metrics::Performance;
use crate::ml::gauss::least_squares;
use crate::ml::matrix::Matrix;
use crate::Error;
use std::fmt::Display;

const HEADER: &str = "RetentionModel 1";
/// Ridge penalty of the per-symbol retention index regression
const INDEX_RIDGE: f64 = 1E-2;
/// Ridge penalty of the descriptor regression; the index sum is collinear
/// with the symbol counts
const MODEL_RIDGE: f64 = 1E-3;

#[derive(Clone, Debug, PartialEq)]
pub struct RetentionModel {
    alphabet: Alphabet,
    index: RetentionIndex,
    /// Retention times are normalized as `(t - sub) / div`
    sub: f64,
    div: f64,
    /// Descriptors are normalized as `(v - vsub) / vdiv`
    vsub: Vec<f64>,
    vdiv: Vec<f64>,
    /// Descriptor coefficients, then the intercept
    beta: Vec<f64>,
    calibration: Option<Calibration>,
    policy: AlphabetPolicy,
}

/// Minimum and spread of each column; constant columns get spread 1
fn min_max(rows: &[Vec<f64>], cols: usize) -> (Vec<f64>, Vec<f64>) {
    (0..cols)
        .map(|col| {
            let (lo, hi) = rows
                .iter()
                .map(|r| r[col])
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), x| {
                    (lo.min(x), hi.max(x))
                });
            match hi - lo {
                d if d > 0.0 && d.is_finite() => (lo, d),
                _ => (lo, 1.0),
            }
        })
        .unzip()
}

impl RetentionModel {
    pub fn train(peptides: &[String], times: &[f64], policy: AlphabetPolicy) -> Result<Self, Error> {
        if peptides.len() != times.len() {
            return Err(Error::Schema(format!(
                "{} peptides but {} retention times",
                peptides.len(),
                times.len()
            )));
        }
        if peptides.len() < 2 {
            return Err(Error::Schema(
                "at least 2 peptides are required to train a retention model".into(),
            ));
        }
        if let Some(t) = times.iter().find(|t| !t.is_finite()) {
            return Err(Error::Schema(format!("invalid retention time {}", t)));
        }

        let tokens = peptides
            .iter()
            .map(|p| symbols(p))
            .collect::<Result<Vec<_>, _>>()?;
        let alphabet = Alphabet::from_peptides(peptides.iter().map(String::as_str))?;

        let sub = times.iter().copied().fold(f64::INFINITY, f64::min);
        let div = match times.iter().copied().fold(f64::NEG_INFINITY, f64::max) - sub {
            d if d > 0.0 => d,
            _ => 1.0,
        };
        let y = times.iter().map(|t| (t - sub) / div).collect::<Vec<_>>();

        // Retention index: normalized time regressed on symbol counts
        let a = alphabet.len();
        let mut counts = Matrix::zeros(tokens.len(), a + 1);
        for (row, symbols) in tokens.iter().enumerate() {
            for symbol in symbols {
                if let Some(col) = alphabet.position(symbol) {
                    counts[(row, col)] += 1.0;
                }
            }
            counts[(row, a)] = 1.0;
        }
        let coef = least_squares(&counts, &y, INDEX_RIDGE).ok_or_else(|| {
            Error::ClassifierConvergence("retention index regression is singular".into())
        })?;
        let index = alphabet
            .iter()
            .zip(&coef)
            .map(|(s, c)| (s.to_string(), *c))
            .collect::<RetentionIndex>();

        let raw = tokens
            .iter()
            .map(|symbols| features::describe(symbols, &alphabet, &index))
            .collect::<Vec<_>>();
        let n = features::dimension(&alphabet);
        let (vsub, vdiv) = min_max(&raw, n);

        let mut x = Matrix::zeros(raw.len(), n + 1);
        for (row, values) in raw.iter().enumerate() {
            for col in 0..n {
                x[(row, col)] = (values[col] - vsub[col]) / vdiv[col];
            }
            x[(row, n)] = 1.0;
        }
        let beta = least_squares(&x, &y, MODEL_RIDGE).ok_or_else(|| {
            Error::ClassifierConvergence("retention time regression is singular".into())
        })?;

        log::info!(
            "Trained retention model on {} peptides, alphabet of {} symbols",
            peptides.len(),
            alphabet.len()
        );
        Ok(RetentionModel {
            alphabet,
            index,
            sub,
            div,
            vsub,
            vdiv,
            beta,
            calibration: None,
            policy,
        })
    }

    pub fn alphabet(&self) -> &Alphabet {
        &self.alphabet
    }

    pub fn index(&self) -> &RetentionIndex {
        &self.index
    }

    pub fn policy(&self) -> AlphabetPolicy {
        self.policy
    }

    pub fn with_policy(mut self, policy: AlphabetPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn calibration(&self) -> Option<Calibration> {
        self.calibration
    }

    pub fn with_calibration(mut self, calibration: Option<Calibration>) -> Self {
        self.calibration = calibration;
        self
    }

    /// Symbols of `peptides` this model cannot handle under its policy
    pub fn missing(&self, peptides: &[String]) -> Result<Vec<String>, Error> {
        self.alphabet
            .missing(peptides.iter().map(String::as_str), self.policy)
    }

    fn predict_uncalibrated(&self, peptides: &[String]) -> Result<Vec<f64>, Error> {
        self.alphabet
            .check(peptides.iter().map(String::as_str), self.policy)?;
        let n = self.vsub.len();
        peptides
            .iter()
            .map(|peptide| {
                let resolved = symbols(peptide)?
                    .into_iter()
                    .map(|s| self.alphabet.resolve(s, self.policy).unwrap_or(s))
                    .collect::<Vec<_>>();
                let raw = features::describe(&resolved, &self.alphabet, &self.index);
                let y = (0..n).fold(self.beta[n], |acc, col| {
                    acc + self.beta[col] * (raw[col] - self.vsub[col]) / self.vdiv[col]
                });
                Ok(y * self.div + self.sub)
            })
            .collect()
    }

    /// Predicted retention times. Fails with `InconsistentAlphabet` if any
    /// peptide uses a symbol outside of the model's alphabet.
    pub fn predict(&self, peptides: &[String]) -> Result<Vec<f64>, Error> {
        let predicted = self.predict_uncalibrated(peptides)?;
        Ok(match self.calibration {
            Some(c) => predicted.into_iter().map(|t| c.apply(t)).collect(),
            None => predicted,
        })
    }

    /// Fit a linear recalibration of this model's predictions onto the
    /// observed `times`, replacing any previous calibration
    pub fn calibrate(self, peptides: &[String], times: &[f64], lts: &Lts) -> Result<Self, Error> {
        let predicted = self.predict_uncalibrated(peptides)?;
        let calibration = lts.fit(&predicted, times)?;
        log::info!(
            "Linear calibration: slope {:.4}, intercept {:.4}",
            calibration.slope,
            calibration.intercept
        );
        Ok(self.with_calibration(Some(calibration)))
    }

    /// Compare predictions for `peptides` with their observed `times`
    pub fn evaluate(&self, peptides: &[String], times: &[f64]) -> Result<Performance, Error> {
        let predicted = self.predict(peptides)?;
        if predicted.len() != times.len() {
            return Err(Error::Schema(format!(
                "{} peptides but {} retention times",
                predicted.len(),
                times.len()
            )));
        }
        Ok(Performance::evaluate(&predicted, times))
    }

    /// Text artifact; the last line lists the alphabet and has no trailing
    /// newline
    pub fn save(&self) -> String {
        self.to_string()
    }

    pub fn load(contents: &str) -> Result<Self, Error> {
        let bad = |msg: String| Error::Schema(format!("retention model: {}", msg));
        let mut lines = contents.lines().map(str::trim).filter(|l| !l.is_empty());
        if lines.next() != Some(HEADER) {
            return Err(bad(format!("missing `{}` header", HEADER)));
        }

        let floats = |key: &str, values: &[&str]| -> Result<Vec<f64>, Error> {
            values
                .iter()
                .map(|v| {
                    v.parse::<f64>()
                        .map_err(|_| bad(format!("invalid value `{}` for {}", v, key)))
                })
                .collect()
        };
        let count = |key: &str, value: Option<&&str>| -> Result<usize, Error> {
            value
                .and_then(|v| v.parse::<usize>().ok())
                .ok_or_else(|| bad(format!("invalid count for {}", key)))
        };

        let mut n = None;
        let (mut sub, mut div) = (None, None);
        let (mut vsub, mut vdiv, mut beta) = (None, None, None);
        let mut calibration = None;
        let mut index = None;
        let mut alphabet = None;

        for line in lines {
            let fields = line.split_whitespace().collect::<Vec<_>>();
            let (key, values) = match fields.split_first() {
                Some((key, values)) => (*key, values),
                None => continue,
            };
            match key {
                "Number_features" => n = Some(count(key, values.first())?),
                "Sub" => sub = floats(key, values)?.first().copied(),
                "Div" => div = floats(key, values)?.first().copied(),
                "VSub" => vsub = Some(floats(key, values)?),
                "VDiv" => vdiv = Some(floats(key, values)?),
                "Beta" => beta = Some(floats(key, values)?),
                "Calibration" => match floats(key, values)?.as_slice() {
                    [slope, intercept] => {
                        calibration = Some(Calibration {
                            slope: *slope,
                            intercept: *intercept,
                        })
                    }
                    _ => return Err(bad("calibration needs a slope and an intercept".into())),
                },
                "Index" => {
                    let k = count(key, values.first())?;
                    let pairs = &values[1..];
                    if pairs.len() != 2 * k {
                        return Err(bad(format!("index lists {} symbols", k)));
                    }
                    let mut map = RetentionIndex::new();
                    for pair in pairs.chunks(2) {
                        map.insert(pair[0].to_string(), floats(key, &pair[1..])?[0]);
                    }
                    index = Some(map);
                }
                "AA_alphabet" => {
                    let k = count(key, values.first())?;
                    if values.len() != k + 1 {
                        return Err(bad(format!("alphabet lists {} symbols", k)));
                    }
                    alphabet = Some(
                        values[1..]
                            .iter()
                            .map(|s| s.to_string())
                            .collect::<Alphabet>(),
                    );
                }
                other => return Err(bad(format!("unknown entry `{}`", other))),
            }
        }

        let missing = |key: &str| bad(format!("missing {}", key));
        let n = n.ok_or_else(|| missing("Number_features"))?;
        let alphabet = alphabet.ok_or_else(|| missing("AA_alphabet"))?;
        let index = index.ok_or_else(|| missing("Index"))?;
        let vsub = vsub.ok_or_else(|| missing("VSub"))?;
        let vdiv = vdiv.ok_or_else(|| missing("VDiv"))?;
        let beta = beta.ok_or_else(|| missing("Beta"))?;

        if n != features::dimension(&alphabet)
            || vsub.len() != n
            || vdiv.len() != n
            || beta.len() != n + 1
        {
            return Err(bad(format!(
                "inconsistent dimensions for {} features and {} symbols",
                n,
                alphabet.len()
            )));
        }
        if index.keys().any(|s| !alphabet.contains(s)) {
            return Err(bad("index holds symbols outside of the alphabet".into()));
        }
        if vdiv.iter().any(|d| *d == 0.0) {
            return Err(bad("zero feature spread".into()));
        }

        Ok(RetentionModel {
            alphabet,
            index,
            sub: sub.ok_or_else(|| missing("Sub"))?,
            div: div.ok_or_else(|| missing("Div"))?,
            vsub,
            vdiv,
            beta,
            calibration,
            policy: AlphabetPolicy::default(),
        })
    }
}

fn join(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

impl Display for RetentionModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", HEADER)?;
        writeln!(f, "Number_features {}", self.vsub.len())?;
        writeln!(f, "Sub {}", self.sub)?;
        writeln!(f, "Div {}", self.div)?;
        writeln!(f, "VSub {}", join(&self.vsub))?;
        writeln!(f, "VDiv {}", join(&self.vdiv))?;
        writeln!(f, "Beta {}", join(&self.beta))?;
        if let Some(c) = &self.calibration {
            writeln!(f, "Calibration {} {}", c.slope, c.intercept)?;
        }
        write!(f, "Index {}", self.index.len())?;
        for (symbol, value) in &self.index {
            write!(f, " {} {}", symbol, value)?;
        }
        writeln!(f)?;
        write!(f, "{}", self.alphabet)
    }
}
