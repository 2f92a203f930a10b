//! # Mixed-likelihood latent model
//!
//! Estimates a shared latent matrix `Z` (samples x K) and per-block loadings by
//! maximizing
//!
//! ```text
//! sum_b w_b * l_b(Z, B_b) - sum_b lambda_b * ||B_b||_1 - ||Z||_F^2 / 2
//! ```
//!
//! where `l_b` is the Gaussian, Bernoulli or multinomial log-likelihood of block `b`.
//! The standard normal prior on the rows of `Z` pins down the scale that the product
//! `Z B'` leaves free.
//!
//! Each outer iteration first refits every block's loadings on the current `Z`
//! (blocks are independent given `Z`, so this runs on rayon), then takes a fixed
//! number of backtracking gradient-ascent steps on `Z`. Both half-steps are ascent
//! steps on the same objective, which is therefore non-decreasing.

use crate::convergence::{ConvergenceReport, ConvergenceState, ConvergenceTracker, Objective};
use crate::likelihood::{BlockParameters, LikelihoodError, LikelihoodStrategy, strategy_for};
use crate::mfa::{MfaConfig, MfaEngine, MfaError};
use crate::progress::{EngineStage, IterationObserver, NoopObserver};
use crate::types::{
    BlockLoadings, Embedding, EngineKind, IntegrationResult, LoadingSet, NoiseModel,
    OmicBlock, OmicBlockSet, OmicsError, Provenance,
};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Sufficient-increase constant of the Armijo test on `Z` steps.
const ARMIJO_FRACTION: f64 = 1.0e-4;
const MAX_STEP_HALVINGS: usize = 40;
const MAX_LATENT_STEP: f64 = 1.0e3;

#[derive(Error, Debug)]
pub enum LatentModelError {
    #[error("Block '{block}' requests noise model '{tag}', which is not one of: continuous, binary, categorical.")]
    InvalidNoiseModel { block: String, tag: String },

    #[error(transparent)]
    IncompatibleBlock(#[from] LikelihoodError),

    #[error("Invalid settings for block '{block}': {reason}")]
    InvalidBlockSettings { block: String, reason: String },

    #[error("Latent dimension must be at least one.")]
    InvalidComponents,

    #[error("MFA initialization yields only {available} dimensions but {requested} were requested.")]
    InitializationTooNarrow { requested: usize, available: usize },

    #[error("MFA initialization failed: {0}")]
    Mfa(#[from] MfaError),

    #[error("Could not assemble the embedding: {0}")]
    Omics(#[from] OmicsError),
}

/// Per-block knobs of the latent model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockSettings {
    /// L1 penalty `lambda_b` on the block's loadings.
    pub l1: f64,
    /// Mixing weight `w_b` of the block's log-likelihood.
    pub weight: f64,
    /// Overrides the block's declared noise model for this fit.
    pub noise_model: Option<String>,
}

impl Default for BlockSettings {
    fn default() -> Self {
        Self {
            l1: 0.0,
            weight: 1.0,
            noise_model: None,
        }
    }
}

/// Starting point for `Z`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LatentInit {
    /// MFA scores on the same blocks, each column scaled to unit variance.
    #[default]
    Mfa,
    /// Independent standard normal entries.
    Random { seed: u64 },
}

impl LatentInit {
    fn describe(self) -> String {
        match self {
            Self::Mfa => "mfa".to_string(),
            Self::Random { seed } => format!("random(seed={seed})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatentModelConfig {
    pub components: usize,
    pub max_iterations: usize,
    /// Relative objective increase below which the fit has converged.
    pub tolerance: f64,
    /// Gradient steps on `Z` per outer iteration.
    pub latent_steps: usize,
    /// Penalized-regression passes per block per outer iteration.
    pub loading_steps: usize,
    pub standardize_continuous: bool,
    pub init: LatentInit,
    /// Settings keyed by block name; blocks without an entry use the defaults.
    pub blocks: BTreeMap<String, BlockSettings>,
}

impl Default for LatentModelConfig {
    fn default() -> Self {
        Self {
            components: 2,
            max_iterations: 100,
            tolerance: 1.0e-6,
            latent_steps: 5,
            loading_steps: 25,
            standardize_continuous: true,
            init: LatentInit::Mfa,
            blocks: BTreeMap::new(),
        }
    }
}

/// A fitted latent model.
#[derive(Debug, Clone)]
pub struct LatentModelFit {
    pub result: IntegrationResult,
    /// Intercepts per block, aligned with that block's loading rows.
    pub intercepts: Vec<(String, Array1<f64>)>,
    pub objective: f64,
}

impl LatentModelFit {
    pub fn convergence(&self) -> Option<&ConvergenceReport> {
        self.result.convergence.as_ref()
    }
}

struct BlockTerm {
    strategy: Box<dyn LikelihoodStrategy>,
    weight: f64,
    l1: f64,
    parameters: BlockParameters,
}

impl BlockTerm {
    fn effective_penalty(&self) -> f64 {
        self.l1 / self.weight
    }
}

#[derive(Debug, Clone, Default)]
pub struct MixedLikelihoodLatentModel {
    config: LatentModelConfig,
}

impl MixedLikelihoodLatentModel {
    pub fn new(config: LatentModelConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LatentModelConfig {
        &self.config
    }

    pub fn fit(&self, blocks: &OmicBlockSet) -> Result<LatentModelFit, LatentModelError> {
        self.fit_with_observer(blocks, &NoopObserver)
    }

    pub fn fit_with_observer<O>(
        &self,
        blocks: &OmicBlockSet,
        observer: &O,
    ) -> Result<LatentModelFit, LatentModelError>
    where
        O: IterationObserver,
    {
        let k = self.config.components;
        if k == 0 {
            return Err(LatentModelError::InvalidComponents);
        }
        for name in self.config.blocks.keys() {
            if blocks.get(name).is_none() {
                log::warn!("Latent settings name block '{name}', which is not in the input; ignored");
            }
        }

        let mut terms = self.build_terms(blocks, k)?;

        observer.on_stage_start(EngineKind::MixedLikelihood, EngineStage::Initialization, 0);
        let mut latent = self.initial_latent(blocks)?;
        observer.on_stage_finish(
            EngineKind::MixedLikelihood,
            EngineStage::Initialization,
            ConvergenceState::Initialized,
        );

        let stage = EngineStage::Optimization;
        let mut tracker = ConvergenceTracker::new(
            Objective::Maximize,
            self.config.tolerance,
            self.config.max_iterations,
        );
        observer.on_stage_start(EngineKind::MixedLikelihood, stage, self.config.max_iterations);
        tracker.start(full_objective(latent.view(), &terms));

        let mut step = 1.0;
        while tracker.is_iterating() {
            let loading_steps = self.config.loading_steps;
            let view = latent.view();
            terms.par_iter_mut().for_each(|term| {
                term.parameters = term.strategy.fit_loadings_given_latent(
                    view,
                    &term.parameters,
                    term.effective_penalty(),
                    loading_steps,
                );
            });

            for _ in 0..self.config.latent_steps {
                if !ascend_latent(&mut latent, &terms, &mut step) {
                    break;
                }
            }

            let objective = full_objective(latent.view(), &terms);
            tracker.record(objective);
            observer.on_iteration(EngineKind::MixedLikelihood, stage, tracker.iterations(), objective);
        }
        observer.on_stage_finish(EngineKind::MixedLikelihood, stage, tracker.state());

        let report = tracker.finish();
        let objective = report.objective_trace.last().copied().unwrap_or(f64::NAN);
        match report.state {
            ConvergenceState::MaxIterReached => log::warn!(
                "Mixed-likelihood model stopped after {} iterations without converging (objective {objective:.6e})",
                report.iterations
            ),
            _ => log::info!(
                "Mixed-likelihood model converged after {} iterations (objective {objective:.6e})",
                report.iterations
            ),
        }

        self.assemble(blocks, latent, terms, report, objective)
    }

    fn build_terms(&self, blocks: &OmicBlockSet, k: usize) -> Result<Vec<BlockTerm>, LatentModelError> {
        let defaults = BlockSettings::default();
        let mut terms = Vec::with_capacity(blocks.len());
        for block in blocks.iter() {
            let settings = self.config.blocks.get(block.name()).unwrap_or(&defaults);
            validate_settings(block.name(), settings)?;

            let noise_model = match &settings.noise_model {
                Some(tag) => tag.parse::<NoiseModel>().map_err(|_| {
                    LatentModelError::InvalidNoiseModel {
                        block: block.name().to_string(),
                        tag: tag.clone(),
                    }
                })?,
                None => block.noise_model(),
            };

            let strategy = strategy_for(block, noise_model, self.config.standardize_continuous)?;
            log::debug!(
                "Block '{}' modelled as {} with {} loading rows (l1 {}, weight {})",
                block.name(),
                strategy.noise_model(),
                strategy.loading_labels().len(),
                settings.l1,
                settings.weight
            );
            let parameters = strategy.initial_parameters(k);
            terms.push(BlockTerm {
                strategy,
                weight: settings.weight,
                l1: settings.l1,
                parameters,
            });
        }
        Ok(terms)
    }

    fn initial_latent(&self, blocks: &OmicBlockSet) -> Result<Array2<f64>, LatentModelError> {
        let k = self.config.components;
        match self.config.init {
            LatentInit::Mfa => {
                let mfa = MfaEngine::new(MfaConfig { components: k });
                let constant: Vec<&str> = blocks
                    .iter()
                    .filter(|b| !varies(b))
                    .map(|b| b.name())
                    .collect();
                let model = if constant.is_empty() || constant.len() == blocks.len() {
                    mfa.fit(blocks)?
                } else {
                    log::warn!(
                        "Blocks {constant:?} are constant across samples; MFA initialization uses the other blocks"
                    );
                    let varying = blocks.iter().filter(|b| varies(b)).cloned().collect();
                    mfa.fit(&OmicBlockSet::new(varying)?)?
                };
                let scores = model.result.embedding.scores();
                if scores.ncols() < k {
                    return Err(LatentModelError::InitializationTooNarrow {
                        requested: k,
                        available: scores.ncols(),
                    });
                }
                let mut latent = scores.to_owned();
                for mut column in latent.axis_iter_mut(Axis(1)) {
                    let sd = column.std(0.0);
                    if sd > 0.0 {
                        column /= sd;
                    }
                }
                Ok(latent)
            }
            LatentInit::Random { seed } => {
                let mut rng = StdRng::seed_from_u64(seed);
                Ok(Array2::from_shape_simple_fn((blocks.n_samples(), k), || {
                    rng.sample(StandardNormal)
                }))
            }
        }
    }

    fn assemble(
        &self,
        blocks: &OmicBlockSet,
        latent: Array2<f64>,
        terms: Vec<BlockTerm>,
        report: ConvergenceReport,
        objective: f64,
    ) -> Result<LatentModelFit, LatentModelError> {
        let mut provenance = Provenance::new(EngineKind::MixedLikelihood)
            .with("components", self.config.components)
            .with("max_iterations", self.config.max_iterations)
            .with("tolerance", self.config.tolerance)
            .with("latent_steps", self.config.latent_steps)
            .with("loading_steps", self.config.loading_steps)
            .with("standardize_continuous", self.config.standardize_continuous)
            .with("init", self.config.init.describe());

        let mut loadings = Vec::with_capacity(terms.len());
        let mut intercepts = Vec::with_capacity(terms.len());
        for term in terms {
            let name = term.strategy.block_name().to_string();
            provenance = provenance
                .with(&format!("{name}.noise_model"), term.strategy.noise_model())
                .with(&format!("{name}.l1"), term.l1)
                .with(&format!("{name}.weight"), term.weight);
            loadings.push(BlockLoadings::new(
                name.clone(),
                term.strategy.loading_labels().to_vec(),
                term.parameters.loadings,
            )?);
            intercepts.push((name, term.parameters.intercepts));
        }

        let embedding = Embedding::new(latent, blocks.sample_ids().to_vec(), provenance)?;
        Ok(LatentModelFit {
            result: IntegrationResult {
                embedding,
                loadings: LoadingSet::new(loadings),
                convergence: Some(report),
            },
            intercepts,
            objective,
        })
    }
}

fn validate_settings(block: &str, settings: &BlockSettings) -> Result<(), LatentModelError> {
    if !(settings.weight.is_finite() && settings.weight > 0.0) {
        return Err(LatentModelError::InvalidBlockSettings {
            block: block.to_string(),
            reason: format!("mixing weight must be positive, got {}", settings.weight),
        });
    }
    if !(settings.l1.is_finite() && settings.l1 >= 0.0) {
        return Err(LatentModelError::InvalidBlockSettings {
            block: block.to_string(),
            reason: format!("L1 penalty must be non-negative, got {}", settings.l1),
        });
    }
    Ok(())
}

/// False when every feature of the block takes a single value.
fn varies(block: &OmicBlock) -> bool {
    block
        .matrix()
        .values()
        .rows()
        .into_iter()
        .any(|row| row.first().is_some_and(|first| row.iter().any(|v| v != first)))
}

fn prior(latent: ArrayView2<f64>) -> f64 {
    -0.5 * latent.iter().map(|v| v * v).sum::<f64>()
}

/// The part of the objective that depends on `Z`.
fn latent_objective(latent: ArrayView2<f64>, terms: &[BlockTerm]) -> f64 {
    terms
        .iter()
        .map(|t| t.weight * t.strategy.log_likelihood(latent, &t.parameters))
        .sum::<f64>()
        + prior(latent)
}

fn full_objective(latent: ArrayView2<f64>, terms: &[BlockTerm]) -> f64 {
    latent_objective(latent, terms) - terms.iter().map(|t| t.l1 * t.parameters.l1_norm()).sum::<f64>()
}

/// One backtracking gradient-ascent step on `Z`. Returns false when no step
/// increases the objective.
fn ascend_latent(latent: &mut Array2<f64>, terms: &[BlockTerm], step: &mut f64) -> bool {
    let current = latent_objective(latent.view(), terms);
    let mut gradient = latent.mapv(|v| -v);
    for term in terms {
        let block_gradient = term
            .strategy
            .gradient_with_respect_to_latent(latent.view(), &term.parameters);
        gradient.scaled_add(term.weight, &block_gradient);
    }
    let squared_norm = gradient.iter().map(|g| g * g).sum::<f64>();
    if squared_norm == 0.0 || !squared_norm.is_finite() {
        return false;
    }

    let mut trial = *step;
    for _ in 0..MAX_STEP_HALVINGS {
        let candidate = &*latent + &(&gradient * trial);
        let value = latent_objective(candidate.view(), terms);
        if value >= current + ARMIJO_FRACTION * trial * squared_norm {
            *latent = candidate;
            *step = (trial * 2.0).min(MAX_LATENT_STEP);
            return true;
        }
        trial *= 0.5;
    }
    *step = trial;
    false
}
