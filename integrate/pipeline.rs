//! # End-to-end run
//!
//! Loads the blocks named in a [`RunConfig`], aligns them with the covariate
//! table, runs every enabled engine and scores each embedding with the grid-searched
//! separator. The engines do not depend on one another, so they run concurrently on
//! the rayon pool; their results are gathered behind a single mutex and put back in
//! configuration order.

use crate::align::{AlignedCohort, AlignmentError, MatrixAligner};
use crate::config::{ConfigError, RunConfig};
use crate::evaluate::{EvaluationError, SeparatorEvaluation};
use crate::io::{self, DataError};
use crate::latent::{LatentModelError, MixedLikelihoodLatentModel};
use crate::mfa::{MfaEngine, MfaError};
use crate::nmf::{JointNmfEngine, NmfError};
use crate::normalize::NormalizationError;
use crate::progress::LogObserver;
use crate::types::{EngineKind, IntegrationResult, OmicBlock, OmicsError};
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Omics(#[from] OmicsError),
    #[error("Alignment failed: {0}")]
    Alignment(#[from] AlignmentError),
    #[error("Normalization failed: {0}")]
    Normalization(#[from] NormalizationError),
    #[error("MFA failed: {0}")]
    Mfa(#[from] MfaError),
    #[error("Joint NMF failed: {0}")]
    Nmf(#[from] NmfError),
    #[error("Mixed-likelihood model failed: {0}")]
    Latent(#[from] LatentModelError),
    #[error("Evaluation failed: {0}")]
    Evaluation(#[from] EvaluationError),
    #[error("Could not create output directory '{path}': {source}")]
    OutputDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("An engine thread panicked while holding the results lock.")]
    PoisonedResults,
}

/// One engine's output plus its separator evaluations.
#[derive(Debug, Clone)]
pub struct EngineReport {
    pub engine: EngineKind,
    pub result: IntegrationResult,
    pub evaluations: Vec<SeparatorEvaluation>,
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub cohort: AlignedCohort,
    pub reports: Vec<EngineReport>,
}

impl PipelineOutcome {
    pub fn report(&self, engine: EngineKind) -> Option<&EngineReport> {
        self.reports.iter().find(|r| r.engine == engine)
    }
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    config: RunConfig,
}

impl Pipeline {
    pub fn new(config: RunConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn run(&self) -> Result<PipelineOutcome, PipelineError> {
        let cohort = self.load_cohort()?;
        let reports = self.run_engines(&cohort)?;
        Ok(PipelineOutcome { cohort, reports })
    }

    /// Reads every block and the covariate table, then aligns them.
    pub fn load_cohort(&self) -> Result<AlignedCohort, PipelineError> {
        let blocks = self
            .config
            .blocks
            .iter()
            .map(|spec| -> Result<OmicBlock, PipelineError> {
                let matrix = io::read_matrix(&spec.path)?;
                Ok(OmicBlock::new(spec.name.clone(), spec.noise_model()?, matrix))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let covariates = io::read_covariates(&self.config.covariates)?;
        Ok(MatrixAligner::new(self.config.alignment).align(blocks, &covariates)?)
    }

    /// Runs the enabled engines concurrently and evaluates each embedding.
    ///
    /// Fails with the error of the first failing engine in configuration order.
    pub fn run_engines(&self, cohort: &AlignedCohort) -> Result<Vec<EngineReport>, PipelineError> {
        let collected = Mutex::new(Vec::with_capacity(self.config.engines.len()));

        self.config
            .engines
            .par_iter()
            .enumerate()
            .for_each(|(index, &engine)| {
                let outcome = self.run_engine(engine, cohort).and_then(|result| {
                    let evaluations = self.evaluate(engine, &result, &cohort.labels)?;
                    Ok(EngineReport {
                        engine,
                        result,
                        evaluations,
                    })
                });
                if let Ok(mut guard) = collected.lock() {
                    guard.push((index, outcome));
                }
            });

        let mut collected = collected
            .into_inner()
            .map_err(|_| PipelineError::PoisonedResults)?;
        collected.sort_by_key(|(index, _)| *index);
        collected.into_iter().map(|(_, outcome)| outcome).collect()
    }

    fn run_engine(&self, engine: EngineKind, cohort: &AlignedCohort) -> Result<IntegrationResult, PipelineError> {
        log::info!("Running {engine} on {} samples", cohort.blocks.n_samples());
        let result = match engine {
            EngineKind::Mfa => MfaEngine::new(self.config.mfa).fit(&cohort.blocks)?.result,
            EngineKind::JointNmf => {
                let prepared = self.config.normalizer().prepare_for_nmf(&cohort.blocks)?;
                JointNmfEngine::new(self.config.nmf)
                    .fit_with_observer(&prepared, &LogObserver)?
                    .result
            }
            EngineKind::MixedLikelihood => {
                MixedLikelihoodLatentModel::new(self.config.latent_config())
                    .fit_with_observer(&cohort.blocks, &LogObserver)?
                    .result
            }
        };
        if !result.is_trustworthy() {
            log::warn!("{engine} did not converge; its embedding is reported but unverified");
        }
        Ok(result)
    }

    fn evaluate(
        &self,
        engine: EngineKind,
        result: &IntegrationResult,
        labels: &[String],
    ) -> Result<Vec<SeparatorEvaluation>, PipelineError> {
        let dims = self.config.evaluation_dims();
        let scores = result.embedding.scores();
        if scores.ncols() <= dims.0.max(dims.1) {
            log::warn!(
                "{engine} produced {} dimensions; skipping evaluation on dims {dims:?}",
                scores.ncols()
            );
            return Ok(Vec::new());
        }

        let evaluator = self.config.evaluator();
        let evaluations = match &self.config.evaluation.positive_class {
            Some(class) => vec![evaluator.search(scores, labels, class, dims)?],
            None => evaluator.evaluate_all_classes(scores, labels, dims)?,
        };
        for evaluation in &evaluations {
            log::info!(
                "{engine}: class '{}' separated with {} FP and {} FN ({:.1}% misclassified)",
                evaluation.positive_class,
                evaluation.false_positives,
                evaluation.false_negatives,
                100.0 * evaluation.misclassification_rate()
            );
        }
        Ok(evaluations)
    }

    /// Writes embeddings, loadings, provenance, convergence reports, the evaluation
    /// summary and the effective configuration under `out_dir`.
    pub fn write_outputs(&self, outcome: &PipelineOutcome, out_dir: &Path) -> Result<(), PipelineError> {
        create_dir(out_dir)?;
        let labels = &outcome.cohort.labels;

        let mut summary = Vec::new();
        for report in &outcome.reports {
            let stem = report.engine.as_str();
            io::write_embedding(
                &out_dir.join(format!("{stem}_embedding.tsv")),
                &report.result.embedding,
                Some(labels.as_slice()),
            )?;
            io::write_toml(
                &out_dir.join(format!("{stem}_provenance.toml")),
                report.result.embedding.provenance(),
            )?;
            if let Some(convergence) = &report.result.convergence {
                io::write_toml(&out_dir.join(format!("{stem}_convergence.toml")), convergence)?;
            }

            let loadings_dir = out_dir.join(format!("{stem}_loadings"));
            create_dir(&loadings_dir)?;
            for loadings in report.result.loadings.iter() {
                io::write_loadings(&loadings_dir.join(format!("{}.tsv", loadings.block())), loadings)?;
            }

            summary.extend(report.evaluations.iter().cloned().map(|e| (report.engine, e)));
        }

        io::write_evaluations(&out_dir.join("evaluation.tsv"), &summary)?;
        self.config.effective().save(&out_dir.join("run_effective.toml"))?;
        log::info!("Wrote results for {} engine(s) to '{}'", outcome.reports.len(), out_dir.display());
        Ok(())
    }
}

fn create_dir(path: &Path) -> Result<(), PipelineError> {
    fs::create_dir_all(path).map_err(|source| PipelineError::OutputDirectory {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BlockSpec, EvaluationSection, NormalizationSection};
    use crate::normalize::SignPolicy;
    use crate::synthetic::SyntheticCohortBuilder;
    use tempfile::tempdir;

    fn config_for(cohort_blocks: &[OmicBlock]) -> RunConfig {
        let mut config = RunConfig::from_toml_str(
            "covariates = \"labels.tsv\"\n[[blocks]]\nname = \"placeholder\"\npath = \"x.tsv\"\nnoise_model = \"continuous\"\n",
        )
        .unwrap();
        config.blocks = cohort_blocks
            .iter()
            .map(|b| BlockSpec {
                name: b.name().to_string(),
                path: PathBuf::from(format!("{}.tsv", b.name())),
                noise_model: b.noise_model().to_string(),
                l1: Some(0.05),
                weight: None,
            })
            .collect();
        config.normalization = NormalizationSection {
            sign_policy: SignPolicy::Split,
        };
        config.evaluation = EvaluationSection {
            positive_class: Some("A".to_string()),
            ..EvaluationSection::default()
        };
        config
    }

    fn aligned_cohort() -> (AlignedCohort, Vec<OmicBlock>) {
        let cohort = SyntheticCohortBuilder::new(16).seed(5).build().unwrap();
        let blocks = cohort.blocks.clone();
        let aligned = MatrixAligner::default()
            .align(cohort.blocks, &cohort.covariates)
            .unwrap();
        (aligned, blocks)
    }

    #[test]
    fn every_engine_reports_in_configuration_order() {
        let (cohort, blocks) = aligned_cohort();
        let pipeline = Pipeline::new(config_for(&blocks));
        let reports = pipeline.run_engines(&cohort).unwrap();

        let engines: Vec<EngineKind> = reports.iter().map(|r| r.engine).collect();
        assert_eq!(
            engines,
            [EngineKind::Mfa, EngineKind::JointNmf, EngineKind::MixedLikelihood]
        );
        for report in &reports {
            assert_eq!(report.result.embedding.n_samples(), 16);
            assert_eq!(report.result.loadings.len(), 3);
            assert_eq!(report.evaluations.len(), 1);
            assert_eq!(report.evaluations[0].positive_class, "A");
        }
        assert!(reports[0].result.convergence.is_none());
        assert!(reports[1].result.convergence.is_some());
    }

    #[test]
    fn nmf_without_split_policy_fails_on_signed_blocks() {
        let (cohort, blocks) = aligned_cohort();
        let mut config = config_for(&blocks);
        config.engines = vec![EngineKind::JointNmf];
        config.normalization.sign_policy = SignPolicy::Reject;
        let err = Pipeline::new(config).run_engines(&cohort).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Normalization(NormalizationError::SignConstraint { .. })
        ));
    }

    #[test]
    fn outputs_land_in_the_output_directory() {
        let (cohort, blocks) = aligned_cohort();
        let mut config = config_for(&blocks);
        config.engines = vec![EngineKind::Mfa, EngineKind::JointNmf];
        let pipeline = Pipeline::new(config);
        let reports = pipeline.run_engines(&cohort).unwrap();
        let outcome = PipelineOutcome { cohort, reports };

        let dir = tempdir().unwrap();
        let out = dir.path().join("results");
        pipeline.write_outputs(&outcome, &out).unwrap();

        for file in [
            "mfa_embedding.tsv",
            "mfa_provenance.toml",
            "joint_nmf_embedding.tsv",
            "joint_nmf_convergence.toml",
            "joint_nmf_loadings/copy_number.tsv",
            "evaluation.tsv",
            "run_effective.toml",
        ] {
            assert!(out.join(file).exists(), "missing {file}");
        }
        assert!(!out.join("mfa_convergence.toml").exists());

        let table = io::read_embedding(&out.join("mfa_embedding.tsv")).unwrap();
        assert_eq!(table.labels.as_deref(), Some(outcome.cohort.labels.as_slice()));
        assert!(outcome.report(EngineKind::JointNmf).is_some());

        let effective = RunConfig::load(&out.join("run_effective.toml")).unwrap();
        assert_eq!(effective.latent.blocks["expression"].l1, 0.05);
        assert_eq!(effective.latent.blocks["expression"].weight, 1.0);
    }
}
