//! Residue symbols and the alphabet a retention model was trained on

use crate::Error;
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Display;

/// How symbols outside of a model's alphabet are treated
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlphabetPolicy {
    /// Every symbol must be part of the alphabet
    Strict,
    /// A modified residue unknown to the model falls back to its unmodified
    /// residue
    IgnorePtms,
}

impl Default for AlphabetPolicy {
    fn default() -> Self {
        AlphabetPolicy::Strict
    }
}

/// Strip flanking residues from the context format `A.SEQUENCE.B`
pub fn strip_flanks(peptide: &str) -> &str {
    let peptide = peptide.trim();
    let bytes = peptide.as_bytes();
    let n = bytes.len();
    if n >= 4 && bytes[1] == b'.' && bytes[n - 2] == b'.' {
        &peptide[2..n - 2]
    } else {
        peptide
    }
}

/// Split a peptide into residue symbols: an upper-case residue letter,
/// optionally followed by a bracketed modification, e.g. `S[unimod:21]`.
/// Flanking residues are stripped first.
pub fn symbols(peptide: &str) -> Result<Vec<&str>, Error> {
    let sequence = strip_flanks(peptide);
    let bytes = sequence.as_bytes();
    let mut symbols = Vec::with_capacity(bytes.len());
    let mut start = 0;
    while start < bytes.len() {
        if !bytes[start].is_ascii_uppercase() {
            return Err(Error::Schema(format!(
                "peptide `{}` has an invalid residue at position {}",
                peptide, start
            )));
        }
        let mut end = start + 1;
        if bytes.get(end) == Some(&b'[') {
            end = match sequence[end..].find(']') {
                Some(close) => end + close + 1,
                None => {
                    return Err(Error::Schema(format!(
                        "peptide `{}` has an unterminated modification",
                        peptide
                    )))
                }
            };
        }
        symbols.push(&sequence[start..end]);
        start = end;
    }
    if symbols.is_empty() {
        return Err(Error::Schema(format!("peptide `{}` is empty", peptide)));
    }
    Ok(symbols)
}

/// Unmodified residue of a symbol
pub fn base(symbol: &str) -> &str {
    &symbol[..1]
}

/// Sorted set of residue symbols
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Alphabet {
    symbols: BTreeSet<String>,
    /// Sorted position of each symbol, the descriptor column it counts into
    columns: FnvHashMap<String, usize>,
}

impl Alphabet {
    fn new(symbols: BTreeSet<String>) -> Self {
        let columns = symbols
            .iter()
            .enumerate()
            .map(|(col, s)| (s.clone(), col))
            .collect();
        Alphabet { symbols, columns }
    }

    pub fn from_peptides<'a, I>(peptides: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut set = BTreeSet::new();
        for peptide in peptides {
            for symbol in symbols(peptide)? {
                if !set.contains(symbol) {
                    set.insert(symbol.to_string());
                }
            }
        }
        Ok(Alphabet::new(set))
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.columns.contains_key(symbol)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> + '_ {
        self.symbols.iter().map(String::as_str)
    }

    /// Position of a symbol in sorted order
    pub fn position(&self, symbol: &str) -> Option<usize> {
        self.columns.get(symbol).copied()
    }

    /// Map a symbol onto this alphabet
    pub fn resolve<'s>(&self, symbol: &'s str, policy: AlphabetPolicy) -> Option<&'s str> {
        if self.contains(symbol) {
            return Some(symbol);
        }
        match policy {
            AlphabetPolicy::IgnorePtms if self.contains(base(symbol)) => Some(base(symbol)),
            _ => None,
        }
    }

    /// Symbols used by `peptides` that cannot be resolved, in sorted order
    pub fn missing<'a, I>(&self, peptides: I, policy: AlphabetPolicy) -> Result<Vec<String>, Error>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut missing = BTreeSet::new();
        for peptide in peptides {
            for symbol in symbols(peptide)? {
                if self.resolve(symbol, policy).is_none() {
                    missing.insert(symbol.to_string());
                }
            }
        }
        Ok(missing.into_iter().collect())
    }

    /// Fail with `InconsistentAlphabet` unless every symbol resolves
    pub fn check<'a, I>(&self, peptides: I, policy: AlphabetPolicy) -> Result<(), Error>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let missing = self.missing(peptides, policy)?;
        match missing.is_empty() {
            true => Ok(()),
            false => Err(Error::InconsistentAlphabet { missing }),
        }
    }
}

impl FromIterator<String> for Alphabet {
    fn from_iter<T: IntoIterator<Item = String>>(iter: T) -> Self {
        Alphabet::new(iter.into_iter().collect())
    }
}

/// `AA_alphabet <count> <sym1> ... <symN>`
impl Display for Alphabet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AA_alphabet {}", self.len())?;
        for symbol in self.iter() {
            write!(f, " {}", symbol)?;
        }
        Ok(())
    }
}
