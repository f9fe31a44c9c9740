//! Pick the library model that best fits a small set of calibration peptides

use super::alphabet::AlphabetPolicy;
use super::metrics::spearman;
use super::model::RetentionModel;
use super::PeptideSet;
use crate::Error;
use rayon::prelude::*;

/// Agreement between a candidate's predictions and observed retention
/// times; higher is better
pub trait CalibrationScore: Sync {
    fn score(&self, predicted: &[f64], observed: &[f64]) -> f64;
}

/// Spearman's rank correlation
#[derive(Copy, Clone, Debug, Default)]
pub struct RankCorrelation;

impl CalibrationScore for RankCorrelation {
    fn score(&self, predicted: &[f64], observed: &[f64]) -> f64 {
        spearman(predicted, observed)
    }
}

#[derive(Clone, Debug)]
pub struct Selection {
    /// Position of the chosen model in the library
    pub index: usize,
    /// Calibration score, unset when there were too few calibration peptides
    /// to compare models
    pub score: Option<f64>,
    pub model: RetentionModel,
}

/// Calibration sets at or below this size select the first compatible model
const MIN_CALIBRATION: usize = 2;

/// Choose among `library` the model whose predictions on `calibration` score
/// highest. Only models whose alphabet covers both the calibration and the
/// `test` peptides under `policy` are considered; the first such model in
/// library order wins ties.
pub fn select<S: CalibrationScore>(
    library: &[RetentionModel],
    calibration: &PeptideSet,
    test: &[String],
    policy: AlphabetPolicy,
    scorer: &S,
) -> Result<Selection, Error> {
    if library.is_empty() {
        return Err(Error::Schema("retention model library is empty".into()));
    }
    let observed = calibration.times.as_deref().ok_or_else(|| {
        Error::Schema("calibration peptides need observed retention times".into())
    })?;

    let mut compatible = Vec::new();
    for (index, model) in library.iter().enumerate() {
        let model = model.clone().with_policy(policy);
        let mut missing = model.missing(&calibration.peptides)?;
        missing.extend(model.missing(test)?);
        match missing.is_empty() {
            true => compatible.push((index, model)),
            false => log::debug!(
                "Library model {} discarded, alphabet lacks {}",
                index,
                missing.join(" ")
            ),
        }
    }

    if compatible.is_empty() {
        let first = library[0].clone().with_policy(policy);
        let mut missing = first.missing(&calibration.peptides)?;
        missing.extend(first.missing(test)?);
        missing.sort();
        missing.dedup();
        return Err(Error::InconsistentAlphabet { missing });
    }

    if calibration.peptides.len() <= MIN_CALIBRATION {
        log::warn!(
            "Not enough calibration peptides available, selecting the first suitable model in the library"
        );
        let (index, model) = compatible.swap_remove(0);
        return Ok(Selection {
            index,
            score: None,
            model,
        });
    }

    let scores = compatible
        .par_iter()
        .map(|(_, model)| {
            model
                .predict(&calibration.peptides)
                .map(|predicted| scorer.score(&predicted, observed))
        })
        .collect::<Result<Vec<_>, Error>>()?;

    let mut best = 0;
    for (i, score) in scores.iter().enumerate() {
        if *score > scores[best] {
            best = i;
        }
    }
    let (index, model) = compatible.swap_remove(best);
    log::info!(
        "Selected library model {} with calibration score {:.4}",
        index,
        scores[best]
    );
    Ok(Selection {
        index,
        score: Some(scores[best]),
        model,
    })
}
