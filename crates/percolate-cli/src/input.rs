use anyhow::{ensure, Context};
use clap::ArgMatches;
use percolate_core::engine::EngineConfig;
use percolate_core::retention::{AlphabetPolicy, Lts};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub fn read_json<T: DeserializeOwned, S: AsRef<str>>(path: S) -> anyhow::Result<T> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    Ok(serde_json::from_str(&contents)?)
}

fn thread_count(threads: Option<usize>) -> usize {
    match threads {
        Some(0) => {
            log::warn!("`threads: 0` is not valid, using all available CPUs");
            num_cpus::get()
        }
        Some(n) => n,
        None => num_cpus::get(),
    }
}

/// Where the feature matrix is read from
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatrixSource {
    /// Feature file plus a label file
    Tabular { features: String, labels: String },
    Pin(String),
}

#[derive(Serialize)]
/// Actual rescoring parameters - may include overrides or default values not set by user
pub struct Rescore {
    pub version: String,
    pub source: MatrixSource,
    /// Weight file whose last row seeds the first training step
    pub initial_weights: Option<String>,
    pub engine: EngineConfig,
    pub output_directory: PathBuf,
    pub write_decoys: bool,
    pub threads: usize,
    pub output_paths: Vec<String>,
}

#[derive(Deserialize, Default)]
/// User-facing rescoring parameters
pub struct RescoreInput {
    pub features: Option<String>,
    pub labels: Option<String>,
    pub pin: Option<String>,
    pub initial_weights: Option<String>,
    pub engine: Option<EngineConfig>,
    pub output_directory: Option<String>,
    pub write_decoys: Option<bool>,
    pub threads: Option<usize>,
}

impl RescoreInput {
    pub fn from_arguments(matches: &ArgMatches) -> anyhow::Result<Self> {
        let path = matches
            .get_one::<String>("parameters")
            .context("`parameters` must be set")?;
        let mut input = Self::load(path)
            .with_context(|| format!("Failed to read parameters from `{path}`"))?;

        // Handle JSON configuration overrides
        if let Some(output_directory) = matches.get_one::<String>("output_directory") {
            log::trace!("overriding `output_directory` parameter.");
            input.output_directory = Some(output_directory.into());
        }
        if let Some(pin) = matches.get_one::<String>("pin") {
            log::trace!("overriding `pin` parameter.");
            input.pin = Some(pin.into());
            input.features = None;
            input.labels = None;
        }
        if let Some(threads) = matches.get_one::<u16>("threads") {
            log::trace!("overriding `threads` parameter.");
            input.threads = Some(*threads as usize);
        }

        ensure!(
            input.pin.is_some() || input.features.is_some(),
            "either `pin` or `features` must be set. For more information try '--help'"
        );
        Ok(input)
    }

    pub fn load<S: AsRef<str>>(path: S) -> anyhow::Result<Self> {
        read_json(path)
    }

    pub fn build(self) -> anyhow::Result<Rescore> {
        let source = match (self.pin, self.features, self.labels) {
            (Some(pin), None, None) => MatrixSource::Pin(pin),
            (None, Some(features), Some(labels)) => MatrixSource::Tabular { features, labels },
            (None, Some(_), None) => anyhow::bail!("`features` requires a `labels` file"),
            (Some(_), _, _) => anyhow::bail!("`pin` and `features`/`labels` are exclusive"),
            (None, None, _) => anyhow::bail!("either `pin` or `features` must be set"),
        };

        let engine = self.engine.unwrap_or_default();
        engine.validate()?;
        if engine.test_fdr > 0.1 {
            log::warn!(
                "`test_fdr` of {} is unusually permissive, is this correct?",
                engine.test_fdr
            );
        }
        if engine.initial_selection_fdr() > engine.selection_fdr() {
            log::warn!(
                "`initial_selection_fdr` ({}) is looser than `selection_fdr` ({})",
                engine.initial_selection_fdr(),
                engine.selection_fdr()
            );
        }

        let output_directory = match self.output_directory {
            Some(path) => PathBuf::from(path),
            None => std::env::current_dir()?,
        };

        Ok(Rescore {
            version: clap::crate_version!().into(),
            source,
            initial_weights: self.initial_weights,
            engine,
            output_directory,
            write_decoys: self.write_decoys.unwrap_or(false),
            threads: thread_count(self.threads),
            output_paths: Vec::new(),
        })
    }
}

#[derive(Serialize)]
/// Actual retention time parameters
pub struct Retention {
    pub version: String,
    /// Peptides with observed times: training data, or calibration data when
    /// a model is loaded or selected
    pub train: Option<String>,
    pub test: Option<String>,
    pub test_includes_rt: bool,
    pub load_model: Option<String>,
    pub save_model: Option<String>,
    /// Directory of model files, consulted by automatic selection
    pub library: Option<String>,
    pub auto_select: bool,
    pub linear_calibration: bool,
    pub policy: AlphabetPolicy,
    pub lts: Lts,
    pub output: Option<String>,
    pub threads: usize,
}

#[derive(Deserialize, Default)]
/// User-facing retention time parameters
pub struct RetentionInput {
    pub train: Option<String>,
    pub test: Option<String>,
    pub test_includes_rt: Option<bool>,
    pub load_model: Option<String>,
    pub save_model: Option<String>,
    pub library: Option<String>,
    pub auto_select: Option<bool>,
    pub linear_calibration: Option<bool>,
    pub ignore_ptms: Option<bool>,
    pub lts_coverage: Option<f64>,
    pub output: Option<String>,
    pub threads: Option<usize>,
}

impl RetentionInput {
    pub fn from_arguments(matches: &ArgMatches) -> anyhow::Result<Self> {
        let path = matches
            .get_one::<String>("parameters")
            .context("`parameters` must be set")?;
        let mut input = Self::load(path)
            .with_context(|| format!("Failed to read parameters from `{path}`"))?;

        if let Some(train) = matches.get_one::<String>("train") {
            log::trace!("overriding `train` parameter.");
            input.train = Some(train.into());
        }
        if let Some(test) = matches.get_one::<String>("test") {
            log::trace!("overriding `test` parameter.");
            input.test = Some(test.into());
        }
        if let Some(output) = matches.get_one::<String>("output") {
            log::trace!("overriding `output` parameter.");
            input.output = Some(output.into());
        }
        if let Some(threads) = matches.get_one::<u16>("threads") {
            log::trace!("overriding `threads` parameter.");
            input.threads = Some(*threads as usize);
        }
        Ok(input)
    }

    pub fn load<S: AsRef<str>>(path: S) -> anyhow::Result<Self> {
        read_json(path)
    }

    pub fn build(self) -> anyhow::Result<Retention> {
        let auto_select = self.auto_select.unwrap_or(false);
        let linear_calibration = self.linear_calibration.unwrap_or(false);

        ensure!(
            !(auto_select && self.load_model.is_some()),
            "`auto_select` and `load_model` are exclusive"
        );
        ensure!(
            !auto_select || self.library.is_some(),
            "`auto_select` requires a model `library` directory"
        );
        ensure!(
            self.train.is_some() || self.load_model.is_some() || auto_select,
            "one of `train`, `load_model` or `auto_select` must be set"
        );
        ensure!(
            !auto_select || self.train.is_some(),
            "`auto_select` requires calibration peptides in `train`"
        );
        ensure!(
            !linear_calibration || self.train.is_some(),
            "`linear_calibration` requires calibration peptides in `train`"
        );
        if self.library.is_some() && !auto_select {
            log::warn!("`library` is only used with `auto_select: true`");
        }
        if self.output.is_some() && self.test.is_none() {
            log::warn!("`output` is set, but there are no `test` peptides to predict");
        }
        if self.test.is_none() && self.save_model.is_none() {
            log::warn!("neither `test` nor `save_model` is set, nothing will be written");
        }

        let mut lts = Lts::default();
        if let Some(coverage) = self.lts_coverage {
            ensure!(
                coverage > 0.5 && coverage <= 1.0,
                "`lts_coverage` must be in (0.5, 1], got {}",
                coverage
            );
            lts.coverage = coverage;
        }

        let policy = match self.ignore_ptms.unwrap_or(false) {
            true => AlphabetPolicy::IgnorePtms,
            false => AlphabetPolicy::Strict,
        };

        Ok(Retention {
            version: clap::crate_version!().into(),
            train: self.train,
            test: self.test,
            test_includes_rt: self.test_includes_rt.unwrap_or(false),
            load_model: self.load_model,
            save_model: self.save_model,
            library: self.library,
            auto_select,
            linear_calibration,
            policy,
            lts,
            output: self.output,
            threads: thread_count(self.threads),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rescore_sources() {
        let input: RescoreInput =
            serde_json::from_str(r#"{ "pin": "a.pin", "engine": { "test_fdr": 0.05 } }"#).unwrap();
        let settings = input.build().unwrap();
        assert_eq!(settings.source, MatrixSource::Pin("a.pin".into()));
        assert_eq!(settings.engine.test_fdr, 0.05);
        assert!(!settings.write_decoys);

        let input: RescoreInput = serde_json::from_str(r#"{ "features": "a.tsv" }"#).unwrap();
        assert!(input.build().is_err());

        let input: RescoreInput =
            serde_json::from_str(r#"{ "pin": "a.pin", "features": "a.tsv", "labels": "b" }"#)
                .unwrap();
        assert!(input.build().is_err());

        let input: RescoreInput =
            serde_json::from_str(r#"{ "pin": "a.pin", "engine": { "test_fdr": 2.0 } }"#).unwrap();
        assert!(input.build().is_err());
    }

    #[test]
    fn retention_modes() {
        let input: RetentionInput =
            serde_json::from_str(r#"{ "train": "t.txt", "ignore_ptms": true }"#).unwrap();
        let settings = input.build().unwrap();
        assert_eq!(settings.policy, AlphabetPolicy::IgnorePtms);
        assert_eq!(settings.lts, Lts::default());

        let input: RetentionInput = serde_json::from_str(r#"{ "auto_select": true }"#).unwrap();
        assert!(input.build().is_err());

        let input: RetentionInput =
            serde_json::from_str(r#"{ "load_model": "m", "linear_calibration": true }"#).unwrap();
        assert!(input.build().is_err());

        let input: RetentionInput =
            serde_json::from_str(r#"{ "train": "t", "lts_coverage": 0.2 }"#).unwrap();
        assert!(input.build().is_err());

        let input: RetentionInput = serde_json::from_str("{}").unwrap();
        assert!(input.build().is_err());
    }
}
