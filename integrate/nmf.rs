//! # Joint non-negative matrix factorization
//!
//! The normalized blocks are stacked on the feature axis into one non-negative
//! matrix `X` (features x samples) and factored as `X ≈ W H` with a basis `W`
//! shared across blocks and per-sample coefficients `H`, minimizing the Frobenius
//! reconstruction error with the Lee-Seung multiplicative updates:
//!
//! - coefficients: `H <- H * (W'X) / (W'W H)`, elementwise;
//! - basis: `W <- W * (X H') / (W H H')`, elementwise.
//!
//! Each update keeps both factors non-negative and never increases the error.
//! Several seeded random starts can run in parallel; the lowest final error wins.

use crate::convergence::{ConvergenceReport, ConvergenceState, ConvergenceTracker, Objective};
use crate::progress::{EngineStage, IterationObserver, NoopObserver};
use crate::types::{
    BlockLoadings, Embedding, EngineKind, IntegrationResult, LoadingSet, OmicBlockSet,
    OmicsError, Provenance,
};
use ndarray::{Array2, ArrayView2, Axis, concatenate, s};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error;

/// Added to update denominators so empty rows or columns stay at zero instead of NaN.
const UPDATE_EPSILON: f64 = 1.0e-16;

#[derive(Error, Debug)]
pub enum NmfError {
    #[error(
        "Block '{block}' holds a negative value ({value}) at feature '{feature}', sample '{sample}'; joint NMF needs non-negative input."
    )]
    SignConstraint {
        block: String,
        feature: String,
        sample: String,
        value: f64,
    },

    #[error("Rank {rank} is invalid for a {features} x {samples} matrix; it must lie in 1..={max}.")]
    InvalidRank {
        rank: usize,
        features: usize,
        samples: usize,
        max: usize,
    },

    #[error("Restart count must be at least one.")]
    NoRestarts,

    #[error("Could not stack the blocks: {0}")]
    Stacking(String),

    #[error("Could not assemble the embedding: {0}")]
    Omics(#[from] OmicsError),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NmfConfig {
    /// Target rank `K` of the factorization.
    pub rank: usize,
    pub max_iterations: usize,
    /// Relative decrease in reconstruction error below which a run has converged.
    pub tolerance: f64,
    /// Number of random initializations; the lowest-error one is kept.
    pub restarts: usize,
    pub seed: u64,
}

impl Default for NmfConfig {
    fn default() -> Self {
        Self {
            rank: 2,
            max_iterations: 200,
            tolerance: 1.0e-4,
            restarts: 1,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JointNmfEngine {
    config: NmfConfig,
}

/// A fitted joint factorization. `basis` is features x K, `coefficients` is K x samples.
#[derive(Debug, Clone)]
pub struct NmfModel {
    pub result: IntegrationResult,
    pub basis: Array2<f64>,
    pub coefficients: Array2<f64>,
    pub reconstruction_error: f64,
    /// Index of the restart that produced this factorization.
    pub restart: usize,
}

struct Factorization {
    basis: Array2<f64>,
    coefficients: Array2<f64>,
    error: f64,
    report: ConvergenceReport,
    restart: usize,
}

impl JointNmfEngine {
    pub fn new(config: NmfConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NmfConfig {
        &self.config
    }

    pub fn fit(&self, blocks: &OmicBlockSet) -> Result<NmfModel, NmfError> {
        self.fit_with_observer(blocks, &NoopObserver)
    }

    pub fn fit_with_observer<O>(&self, blocks: &OmicBlockSet, observer: &O) -> Result<NmfModel, NmfError>
    where
        O: IterationObserver,
    {
        let stacked = stack_non_negative(blocks)?;
        let (features, samples) = stacked.dim();
        let max_rank = features.min(samples);
        if self.config.rank == 0 || self.config.rank > max_rank {
            return Err(NmfError::InvalidRank {
                rank: self.config.rank,
                features,
                samples,
                max: max_rank,
            });
        }
        if self.config.restarts == 0 {
            return Err(NmfError::NoRestarts);
        }

        log::info!(
            "Joint NMF: {features} stacked features x {samples} samples, rank {}, {} restart(s)",
            self.config.rank,
            self.config.restarts
        );

        let runs: Vec<Factorization> = (0..self.config.restarts)
            .into_par_iter()
            .map(|restart| self.run_single(stacked.view(), restart, observer))
            .collect();

        let best = runs
            .into_iter()
            .min_by(|a, b| {
                a.error
                    .partial_cmp(&b.error)
                    .unwrap_or(Ordering::Equal)
                    .then(a.restart.cmp(&b.restart))
            })
            .ok_or(NmfError::NoRestarts)?;

        if best.report.state == ConvergenceState::MaxIterReached {
            log::warn!(
                "Joint NMF restart {} reached {} iterations without converging (error {:.6e})",
                best.restart,
                best.report.iterations,
                best.error
            );
        }

        self.assemble(blocks, best)
    }

    fn run_single<O>(&self, x: ArrayView2<f64>, restart: usize, observer: &O) -> Factorization
    where
        O: IterationObserver,
    {
        let stage = EngineStage::Restart(restart);
        let seed = self.config.seed.wrapping_add(restart as u64);
        let (mut w, mut h) = random_initialization(x, self.config.rank, seed);

        let mut tracker = ConvergenceTracker::new(
            Objective::Minimize,
            self.config.tolerance,
            self.config.max_iterations,
        );
        observer.on_stage_start(EngineKind::JointNmf, stage, self.config.max_iterations);
        tracker.start(reconstruction_error(x, w.view(), h.view()));

        let mut best = (w.clone(), h.clone());
        while tracker.is_iterating() {
            multiplicative_update(x, &mut w, &mut h);
            let error = reconstruction_error(x, w.view(), h.view());
            tracker.record(error);
            observer.on_iteration(EngineKind::JointNmf, stage, tracker.iterations(), error);
            if tracker.latest_is_best() {
                best = (w.clone(), h.clone());
            }
        }
        observer.on_stage_finish(EngineKind::JointNmf, stage, tracker.state());

        let report = tracker.finish();
        Factorization {
            basis: best.0,
            coefficients: best.1,
            error: report.best_objective,
            report,
            restart,
        }
    }

    fn assemble(&self, blocks: &OmicBlockSet, best: Factorization) -> Result<NmfModel, NmfError> {
        let mut loadings = Vec::with_capacity(blocks.len());
        let mut offset = 0;
        for block in blocks.iter() {
            let width = block.n_features();
            loadings.push(BlockLoadings::new(
                block.name(),
                block.matrix().feature_ids().to_vec(),
                best.basis.slice(s![offset..offset + width, ..]).to_owned(),
            )?);
            offset += width;
        }

        let provenance = Provenance::new(EngineKind::JointNmf)
            .with("rank", self.config.rank)
            .with("max_iterations", self.config.max_iterations)
            .with("tolerance", self.config.tolerance)
            .with("restarts", self.config.restarts)
            .with("seed", self.config.seed)
            .with("selected_restart", best.restart);
        let embedding = Embedding::new(
            best.coefficients.t().to_owned(),
            blocks.sample_ids().to_vec(),
            provenance,
        )?;

        Ok(NmfModel {
            result: IntegrationResult {
                embedding,
                loadings: LoadingSet::new(loadings),
                convergence: Some(best.report),
            },
            basis: best.basis,
            coefficients: best.coefficients,
            reconstruction_error: best.error,
            restart: best.restart,
        })
    }
}

/// Stacks all blocks on the feature axis after checking every entry is non-negative.
pub fn stack_non_negative(blocks: &OmicBlockSet) -> Result<Array2<f64>, NmfError> {
    for block in blocks.iter() {
        let matrix = block.matrix();
        if let Some(((row, col), &value)) = matrix.values().indexed_iter().find(|(_, v)| **v < 0.0) {
            return Err(NmfError::SignConstraint {
                block: block.name().to_string(),
                feature: matrix.feature_ids()[row].clone(),
                sample: matrix.sample_ids()[col].clone(),
                value,
            });
        }
    }
    let views: Vec<ArrayView2<f64>> = blocks.iter().map(|b| b.matrix().values()).collect();
    concatenate(Axis(0), &views).map_err(|e| NmfError::Stacking(e.to_string()))
}

/// Uniform entries in `[0, sqrt(mean(X) / K))` for both factors.
fn random_initialization(x: ArrayView2<f64>, rank: usize, seed: u64) -> (Array2<f64>, Array2<f64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mean = x.mean().unwrap_or(0.0).max(f64::MIN_POSITIVE);
    let scale = (mean / rank as f64).sqrt();
    let (features, samples) = x.dim();
    let w = Array2::from_shape_simple_fn((features, rank), || rng.gen_range(0.0..1.0) * scale);
    let h = Array2::from_shape_simple_fn((rank, samples), || rng.gen_range(0.0..1.0) * scale);
    (w, h)
}

fn multiplicative_update(x: ArrayView2<f64>, w: &mut Array2<f64>, h: &mut Array2<f64>) {
    let numerator = w.t().dot(&x);
    let denominator = w.t().dot(&*w).dot(&*h);
    ndarray::Zip::from(&mut *h)
        .and(&numerator)
        .and(&denominator)
        .for_each(|value, &num, &den| *value *= num / (den + UPDATE_EPSILON));

    let numerator = x.dot(&h.t());
    let denominator = w.dot(&h.dot(&h.t()));
    ndarray::Zip::from(&mut *w)
        .and(&numerator)
        .and(&denominator)
        .for_each(|value, &num, &den| *value *= num / (den + UPDATE_EPSILON));
}

/// Frobenius norm of `X - W H`.
pub fn reconstruction_error(x: ArrayView2<f64>, w: ArrayView2<f64>, h: ArrayView2<f64>) -> f64 {
    let residual = &x - &w.dot(&h);
    residual.iter().map(|&r| r * r).sum::<f64>().sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::BlockNormalizer;
    use crate::types::{NoiseModel, OmicBlock, OmicMatrix};
    use ndarray::array;

    fn block(name: &str, noise: NoiseModel, values: Array2<f64>) -> OmicBlock {
        let features = (0..values.nrows()).map(|i| format!("{name}{i}")).collect();
        let samples = (0..values.ncols()).map(|i| format!("s{i}")).collect();
        OmicBlock::new(name, noise, OmicMatrix::new(values, features, samples).unwrap())
    }

    fn normalized_blocks() -> OmicBlockSet {
        let expr = array![
            [9.0, 8.5, 9.2, 8.8, 1.0, 1.3, 0.8, 1.1],
            [1.2, 0.9, 1.1, 1.0, 7.9, 8.4, 8.1, 7.7],
            [4.0, 4.2, 3.9, 4.1, 4.0, 3.8, 4.3, 4.1]
        ];
        let mutation = array![
            [1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 1.0],
            [0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 1.0, 1.0]
        ];
        let raw = OmicBlockSet::new(vec![
            block("expr", NoiseModel::Continuous, expr),
            block("mut", NoiseModel::Binary, mutation),
        ])
        .unwrap();
        BlockNormalizer::default().prepare_for_nmf(&raw).unwrap()
    }

    #[test]
    fn factors_are_non_negative() {
        let model = JointNmfEngine::default().fit(&normalized_blocks()).unwrap();
        assert!(model.basis.iter().all(|&v| v >= 0.0));
        assert!(model.coefficients.iter().all(|&v| v >= 0.0));
        assert_eq!(model.result.embedding.scores().dim(), (8, 2));
        assert_eq!(model.result.loadings.get("expr").unwrap().values().dim(), (3, 2));
        assert_eq!(model.result.loadings.get("mut").unwrap().values().dim(), (2, 2));
    }

    #[test]
    fn reconstruction_error_never_increases() {
        let config = NmfConfig {
            tolerance: 0.0,
            max_iterations: 150,
            ..NmfConfig::default()
        };
        let model = JointNmfEngine::new(config).fit(&normalized_blocks()).unwrap();
        let report = model.result.convergence.unwrap();
        for pair in report.objective_trace.windows(2) {
            assert!(
                pair[1] <= pair[0] * (1.0 + 1e-12),
                "error rose from {} to {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn final_error_is_bounded_by_initial_error() {
        let model = JointNmfEngine::default().fit(&normalized_blocks()).unwrap();
        let report = model.result.convergence.unwrap();
        assert!(model.reconstruction_error <= report.objective_trace[0]);
        let stacked = stack_non_negative(&normalized_blocks()).unwrap();
        let recomputed =
            reconstruction_error(stacked.view(), model.basis.view(), model.coefficients.view());
        approx::assert_relative_eq!(recomputed, model.reconstruction_error, max_relative = 1e-12);
    }

    #[test]
    fn exhausted_budget_is_reported_not_fatal() {
        let config = NmfConfig {
            tolerance: 0.0,
            max_iterations: 3,
            ..NmfConfig::default()
        };
        let model = JointNmfEngine::new(config).fit(&normalized_blocks()).unwrap();
        let report = model.result.convergence.as_ref().unwrap();
        assert_eq!(report.state, ConvergenceState::MaxIterReached);
        assert_eq!(report.iterations, 3);
        assert!(!model.result.is_trustworthy());
    }

    #[test]
    fn more_restarts_never_do_worse() {
        let single = JointNmfEngine::new(NmfConfig {
            restarts: 1,
            ..NmfConfig::default()
        })
        .fit(&normalized_blocks())
        .unwrap();
        let several = JointNmfEngine::new(NmfConfig {
            restarts: 4,
            ..NmfConfig::default()
        })
        .fit(&normalized_blocks())
        .unwrap();
        assert!(several.reconstruction_error <= single.reconstruction_error);
    }

    #[test]
    fn same_seed_is_reproducible() {
        let engine = JointNmfEngine::new(NmfConfig {
            restarts: 3,
            ..NmfConfig::default()
        });
        let a = engine.fit(&normalized_blocks()).unwrap();
        let b = engine.fit(&normalized_blocks()).unwrap();
        assert_eq!(a.basis, b.basis);
        assert_eq!(a.restart, b.restart);
    }

    #[test]
    fn negative_input_is_a_sign_constraint_error() {
        let blocks = OmicBlockSet::new(vec![block(
            "cnv",
            NoiseModel::Categorical,
            array![[1.0, -1.0, 2.0], [0.0, 1.0, 1.0]],
        )])
        .unwrap();
        let err = JointNmfEngine::default().fit(&blocks).unwrap_err();
        assert!(matches!(err, NmfError::SignConstraint { value, .. } if value == -1.0));
    }

    #[test]
    fn rank_must_fit_the_matrix() {
        let err = JointNmfEngine::new(NmfConfig {
            rank: 6,
            ..NmfConfig::default()
        })
        .fit(&normalized_blocks())
        .unwrap_err();
        assert!(matches!(err, NmfError::InvalidRank { max: 5, .. }));
    }
}
