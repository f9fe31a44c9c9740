use crate::input::{MatrixSource, Rescore, Retention};
use anyhow::Context;
use percolate_core::engine::{Engine, InitialDirection, IterationReport, Termination};
use percolate_core::feature_matrix::FeatureMatrix;
use percolate_core::retention::{select, PeptideSet, RankCorrelation, RetentionModel};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

pub struct Rescorer {
    pub settings: Rescore,
    pub matrix: FeatureMatrix,
}

#[derive(Serialize)]
struct Summary<'a> {
    parameters: &'a Rescore,
    termination: Termination,
    partial: Option<&'a str>,
    initial_passing: usize,
    passing: usize,
    training_pi0: f64,
    pi0: f64,
    iterations: &'a [IterationReport],
}

impl Rescorer {
    pub fn new(mut settings: Rescore) -> anyhow::Result<Self> {
        let start = Instant::now();
        let matrix = match &settings.source {
            MatrixSource::Pin(path) => percolate_core::read_pin(path)
                .with_context(|| format!("Failed to read PSMs from `{}`", path))?,
            MatrixSource::Tabular { features, labels } => {
                percolate_core::read_features(features, labels).with_context(|| {
                    format!("Failed to read PSMs from `{}` and `{}`", features, labels)
                })?
            }
        };

        if let Some(path) = &settings.initial_weights {
            let weights = percolate_core::read_weights(path, matrix.n_features())
                .with_context(|| format!("Failed to read weights from `{}`", path))?;
            log::trace!("seeding training with the last row of `{}`", path);
            settings.engine.initial_direction = InitialDirection::Seed(weights.as_slice().to_vec());
        }

        let decoys = matrix.decoys().iter().filter(|d| **d).count();
        log::info!(
            "read {} PSMs ({} targets, {} decoys) with {} features in {}ms",
            matrix.len(),
            matrix.len() - decoys,
            decoys,
            matrix.n_features(),
            start.elapsed().as_millis()
        );
        Ok(Rescorer { settings, matrix })
    }

    fn make_path<S: AsRef<str>>(&self, file_name: S) -> PathBuf {
        self.settings.output_directory.join(file_name.as_ref())
    }

    fn write_bytes<S: AsRef<str>>(&mut self, file_name: S, bytes: &[u8]) -> anyhow::Result<()> {
        let path = self.make_path(file_name);
        std::fs::write(&path, bytes)
            .with_context(|| format!("Failed to write `{}`", path.display()))?;
        self.settings.output_paths.push(path.display().to_string());
        Ok(())
    }

    pub fn run(mut self) -> anyhow::Result<()> {
        let start = Instant::now();
        let report = Engine::new(self.settings.engine.clone()).run(&self.matrix)?;
        if let Some(reason) = &report.partial {
            log::warn!(
                "training stopped early, reporting the last accepted iteration: {}",
                reason
            );
        }
        log::info!(
            "discovered {} target PSMs at {} FDR ({} with the initial direction) in {}ms",
            report.passing,
            self.settings.engine.test_fdr,
            report.initial_passing,
            start.elapsed().as_millis()
        );

        // Everything is serialized before the first file is created
        let targets = self.format_psms(&report, false)?;
        let decoys = match self.settings.write_decoys {
            true => Some(self.format_psms(&report, true)?),
            false => None,
        };
        let weights = self.format_weights(&report);

        let directory = self.settings.output_directory.clone();
        std::fs::create_dir_all(&directory)
            .with_context(|| format!("Failed to create `{}`", directory.display()))?;

        log::trace!("writing outputs");
        self.write_bytes("results.percolate.tsv", &targets)?;
        if let Some(decoys) = decoys {
            self.write_bytes("results.decoys.percolate.tsv", &decoys)?;
        }
        self.write_bytes("weights.tsv", weights.as_bytes())?;

        let path = self.make_path("results.json");
        self.settings.output_paths.push(path.display().to_string());
        let summary = Summary {
            parameters: &self.settings,
            termination: report.termination,
            partial: report.partial.as_deref(),
            initial_passing: report.initial_passing,
            passing: report.passing,
            training_pi0: report.training_pi0,
            pi0: report.pi0,
            iterations: &report.iterations,
        };
        let json = serde_json::to_string_pretty(&summary)?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write `{}`", path.display()))?;
        Ok(())
    }
}

pub struct RetentionRunner {
    pub settings: Retention,
    /// Training peptides, or calibration peptides for a loaded model
    train: Option<PeptideSet>,
    test: Option<PeptideSet>,
}

/// Model files of a library directory, in file name order
fn read_library<P: AsRef<Path>>(directory: P) -> anyhow::Result<Vec<(PathBuf, RetentionModel)>> {
    let directory = directory.as_ref();
    let mut paths = std::fs::read_dir(directory)
        .with_context(|| format!("Failed to read model library `{}`", directory.display()))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()?;
    paths.retain(|path| path.is_file());
    paths.sort();

    paths
        .into_iter()
        .map(|path| {
            let model = percolate_core::read_retention_model(&path)
                .with_context(|| format!("Failed to load model `{}`", path.display()))?;
            Ok((path, model))
        })
        .collect()
}

impl RetentionRunner {
    pub fn new(settings: Retention) -> anyhow::Result<Self> {
        let train = match &settings.train {
            Some(path) => Some(
                percolate_core::read_peptides(path, true)
                    .with_context(|| format!("Failed to read peptides from `{}`", path))?,
            ),
            None => None,
        };
        let test = match &settings.test {
            Some(path) => Some(
                percolate_core::read_peptides(path, settings.test_includes_rt)
                    .with_context(|| format!("Failed to read peptides from `{}`", path))?,
            ),
            None => None,
        };
        Ok(RetentionRunner {
            settings,
            train,
            test,
        })
    }

    fn train_set(&self) -> anyhow::Result<(&PeptideSet, &[f64])> {
        let train = self
            .train
            .as_ref()
            .context("peptides with observed retention times are required")?;
        let times = train
            .times
            .as_deref()
            .context("peptides with observed retention times are required")?;
        Ok((train, times))
    }

    fn model(&self) -> anyhow::Result<RetentionModel> {
        let policy = self.settings.policy;
        if let Some(path) = &self.settings.load_model {
            let model = percolate_core::read_retention_model(path)
                .with_context(|| format!("Failed to load model `{}`", path))?;
            log::info!("loaded retention model from `{}`", path);
            return Ok(model.with_policy(policy));
        }

        if self.settings.auto_select {
            let directory = self
                .settings
                .library
                .as_ref()
                .context("`auto_select` requires a model `library` directory")?;
            let (paths, library): (Vec<_>, Vec<_>) = read_library(directory)?.into_iter().unzip();
            let (calibration, _) = self.train_set()?;
            let test = self
                .test
                .as_ref()
                .map(|t| t.peptides.as_slice())
                .unwrap_or_default();
            let selection = select(&library, calibration, test, policy, &RankCorrelation)?;
            log::info!(
                "selected retention model `{}` out of {} library models",
                paths[selection.index].display(),
                library.len()
            );
            return Ok(selection.model);
        }

        let (train, times) = self.train_set()?;
        let start = Instant::now();
        let model = RetentionModel::train(&train.peptides, times, policy)?;
        log::info!(
            "trained retention model on {} peptides in {}ms",
            train.len(),
            start.elapsed().as_millis()
        );
        log::info!("{}", model.alphabet());
        Ok(model)
    }

    pub fn run(self) -> anyhow::Result<()> {
        let mut model = self.model()?;
        if self.settings.linear_calibration {
            let (calibration, times) = self.train_set()?;
            model = model.calibrate(&calibration.peptides, times, &self.settings.lts)?;
            if let Some(c) = model.calibration() {
                log::info!(
                    "linear calibration: slope {:.4}, intercept {:.4}",
                    c.slope,
                    c.intercept
                );
            }
        }

        // Predictions are checked against the alphabet before anything is written
        let predictions = match &self.test {
            Some(test) => {
                let predicted = model.predict(&test.peptides)?;
                if let Some(observed) = test.times.as_deref() {
                    model.evaluate(&test.peptides, observed)?.log();
                }
                let observed = test.times.as_deref();
                Some(self.format_predictions(&test.peptides, &predicted, observed)?)
            }
            None => None,
        };

        if let Some(path) = &self.settings.save_model {
            std::fs::write(path, model.save())
                .with_context(|| format!("Failed to save model to `{}`", path))?;
            log::trace!("saved retention model to `{}`", path);
        }

        if let Some(bytes) = predictions {
            match &self.settings.output {
                Some(path) => std::fs::write(path, bytes)
                    .with_context(|| format!("Failed to write `{}`", path))?,
                None => std::io::stdout().write_all(&bytes)?,
            }
        }
        Ok(())
    }
}
