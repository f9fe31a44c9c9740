//! Descriptors of a peptide used by the retention time regression

use super::alphabet::Alphabet;
use std::collections::BTreeMap;

/// Residues at either terminus contributing to the terminal index features
pub const TERMINAL: usize = 2;
/// Width of the most hydrophobic stretch
pub const WINDOW: usize = 5;
/// Descriptors in addition to one count per alphabet symbol
pub const EXTRA: usize = 6;

/// Retention coefficient of each alphabet symbol
pub type RetentionIndex = BTreeMap<String, f64>;

pub fn dimension(alphabet: &Alphabet) -> usize {
    alphabet.len() + EXTRA
}

/// Unnormalized descriptors of a peptide whose symbols are already resolved
/// onto `alphabet`:
/// symbol counts, index sum, N- and C-terminal index, length, mean index and
/// the largest index sum over a window of consecutive residues
pub fn describe(symbols: &[&str], alphabet: &Alphabet, index: &RetentionIndex) -> Vec<f64> {
    let mut features = vec![0.0; dimension(alphabet)];
    for symbol in symbols {
        if let Some(pos) = alphabet.position(symbol) {
            features[pos] += 1.0;
        }
    }

    let values = symbols
        .iter()
        .map(|s| index.get(*s).copied().unwrap_or_default())
        .collect::<Vec<_>>();
    let sum = values.iter().sum::<f64>();
    let len = values.len();
    let n_term = values.iter().take(TERMINAL).sum::<f64>();
    let c_term = values.iter().rev().take(TERMINAL).sum::<f64>();
    let window = match len > WINDOW {
        true => values
            .windows(WINDOW)
            .map(|w| w.iter().sum::<f64>())
            .fold(f64::MIN, f64::max),
        false => sum,
    };

    let extra = &mut features[alphabet.len()..];
    extra[0] = sum;
    extra[1] = n_term;
    extra[2] = c_term;
    extra[3] = len as f64;
    extra[4] = if len > 0 { sum / len as f64 } else { 0.0 };
    extra[5] = window;
    features
}
