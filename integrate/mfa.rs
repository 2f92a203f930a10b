//! # Multiple factor analysis
//!
//! A weighted multi-block PCA. Each block is centered and divided by its first
//! singular value so that its leading direction carries unit inertia; the weighted
//! blocks are concatenated feature-wise and a single PCA runs on the result.
//!
//! Both the per-block singular values and the joint decomposition come from
//! samples-by-samples Gram matrices, which stay small when features vastly
//! outnumber samples. No randomness and no iteration: identical input gives an
//! identical embedding.

use crate::types::{
    BlockLoadings, Embedding, EngineKind, IntegrationResult, LoadingSet, OmicBlockSet,
    OmicsError, Provenance,
};
use ndarray::{Array1, Array2, ArrayView2, Axis, concatenate};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{Eigh, UPLO};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error;

/// Eigenvalues at or below this fraction of the leading eigenvalue are treated as zero.
pub const EIGENVALUE_EPSILON: f64 = 1.0e-9;

#[derive(Error, Debug)]
pub enum MfaError {
    #[error("Only {usable} usable dimensions exist; at least 2 are required.")]
    RankDeficiency { usable: usize },

    #[error("Block '{0}' has no variance after centering and cannot be weighted.")]
    ZeroVarianceBlock(String),

    #[error("Requested component count must be at least one.")]
    InvalidComponents,

    #[error("Eigendecomposition failed: {0}")]
    Eigen(#[from] LinalgError),

    #[error("Could not assemble the embedding: {0}")]
    Omics(#[from] OmicsError),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MfaConfig {
    /// Number of components to keep (capped by the number of usable dimensions).
    pub components: usize,
}

impl Default for MfaConfig {
    fn default() -> Self {
        Self { components: 2 }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MfaEngine {
    config: MfaConfig,
}

/// A fitted MFA: the embedding/loadings plus the quantities behind the weighting.
#[derive(Debug, Clone)]
pub struct MfaModel {
    pub result: IntegrationResult,
    /// `(block name, 1 / first singular value)` in block order.
    pub block_weights: Vec<(String, f64)>,
    /// Usable eigenvalues of the joint Gram matrix, descending.
    pub eigenvalues: Vec<f64>,
    /// Share of total inertia carried by each retained component.
    pub explained_variance_ratio: Vec<f64>,
}

impl MfaEngine {
    pub fn new(config: MfaConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MfaConfig {
        &self.config
    }

    pub fn fit(&self, blocks: &OmicBlockSet) -> Result<MfaModel, MfaError> {
        if self.config.components == 0 {
            return Err(MfaError::InvalidComponents);
        }

        let mut weighted = Vec::with_capacity(blocks.len());
        let mut block_weights = Vec::with_capacity(blocks.len());
        for block in blocks.iter() {
            let centered = centered_samples_by_features(block.matrix().values());
            let leading = leading_eigenvalue(&gram(centered.view()))?;
            if leading <= 0.0 {
                return Err(MfaError::ZeroVarianceBlock(block.name().to_string()));
            }
            let weight = 1.0 / leading.sqrt();
            log::debug!(
                "MFA block '{}': first singular value {:.4e}, weight {:.4e}",
                block.name(),
                leading.sqrt(),
                weight
            );
            weighted.push(centered * weight);
            block_weights.push((block.name().to_string(), weight));
        }

        let views: Vec<ArrayView2<f64>> = weighted.iter().map(|b| b.view()).collect();
        let joint = concatenate(Axis(1), &views)
            .map_err(|_| MfaError::RankDeficiency { usable: 0 })?;

        let decomposition = descending_eigenpairs(&gram(joint.view()))?;
        let usable = decomposition.values.len();
        if usable < 2 {
            return Err(MfaError::RankDeficiency { usable });
        }
        let k = self.config.components.min(usable);
        let total_inertia: f64 = decomposition.values.iter().sum();

        let sigma: Array1<f64> = decomposition.values.iter().take(k).map(|&l| l.sqrt()).collect();
        let sample_basis = decomposition.vectors.slice(ndarray::s![.., ..k]).to_owned();
        let mut scores = &sample_basis * &sigma;
        let mut axes = joint.t().dot(&sample_basis) / &sigma;

        orient_components(&mut axes, &mut scores);

        let explained_variance_ratio = decomposition.values[..k]
            .iter()
            .map(|&l| l / total_inertia)
            .collect::<Vec<_>>();
        log::info!(
            "MFA kept {k} of {usable} usable components; explained variance {:?}",
            explained_variance_ratio
        );

        let mut loadings = Vec::with_capacity(blocks.len());
        let mut offset = 0;
        for block in blocks.iter() {
            let width = block.n_features();
            let rows = axes.slice(ndarray::s![offset..offset + width, ..]).to_owned();
            loadings.push(BlockLoadings::new(
                block.name(),
                block.matrix().feature_ids().to_vec(),
                rows,
            )?);
            offset += width;
        }

        let provenance = Provenance::new(EngineKind::Mfa)
            .with("components", k)
            .with("requested_components", self.config.components)
            .with("weighting", "inverse_first_singular_value");
        let embedding = Embedding::new(scores, blocks.sample_ids().to_vec(), provenance)?;

        Ok(MfaModel {
            result: IntegrationResult {
                embedding,
                loadings: LoadingSet::new(loadings),
                convergence: None,
            },
            block_weights,
            eigenvalues: decomposition.values,
            explained_variance_ratio,
        })
    }
}

/// Transposes a features-by-samples view and centers every feature column.
pub(crate) fn centered_samples_by_features(values: ArrayView2<f64>) -> Array2<f64> {
    let mut samples_by_features = values.t().to_owned();
    if let Some(means) = samples_by_features.mean_axis(Axis(0)) {
        samples_by_features -= &means;
    }
    samples_by_features
}

fn gram(x: ArrayView2<f64>) -> Array2<f64> {
    let product = x.dot(&x.t());
    (&product + &product.t()) * 0.5
}

fn leading_eigenvalue(gram: &Array2<f64>) -> Result<f64, MfaError> {
    let (values, _) = gram.eigh(UPLO::Lower)?;
    Ok(values.iter().copied().fold(0.0_f64, f64::max))
}

struct Eigenpairs {
    values: Vec<f64>,
    vectors: Array2<f64>,
}

/// Eigenpairs sorted by descending eigenvalue, with numerically zero ones removed.
fn descending_eigenpairs(gram: &Array2<f64>) -> Result<Eigenpairs, MfaError> {
    let (values, vectors) = gram.eigh(UPLO::Lower)?;

    let mut ordering: Vec<(usize, f64)> = values.iter().copied().enumerate().collect();
    ordering.sort_by(|lhs, rhs| rhs.1.partial_cmp(&lhs.1).unwrap_or(Ordering::Equal));

    let leading = ordering.first().map(|&(_, v)| v).unwrap_or(0.0);
    let threshold = EIGENVALUE_EPSILON * leading.max(0.0);
    let kept: Vec<(usize, f64)> = ordering
        .into_iter()
        .filter(|&(_, v)| leading > 0.0 && v > threshold)
        .collect();

    let indices: Vec<usize> = kept.iter().map(|&(i, _)| i).collect();
    Ok(Eigenpairs {
        values: kept.iter().map(|&(_, v)| v).collect(),
        vectors: vectors.select(Axis(1), &indices),
    })
}

/// Flips each component so its largest-magnitude loading is positive.
fn orient_components(axes: &mut Array2<f64>, scores: &mut Array2<f64>) {
    for j in 0..axes.ncols() {
        let pivot = axes
            .column(j)
            .iter()
            .copied()
            .fold(0.0_f64, |best, v| if v.abs() > best.abs() { v } else { best });
        if pivot < 0.0 {
            axes.column_mut(j).mapv_inplace(|v| -v);
            scores.column_mut(j).mapv_inplace(|v| -v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NoiseModel, OmicBlock, OmicMatrix};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn block(name: &str, noise: NoiseModel, values: Array2<f64>) -> OmicBlock {
        let features = (0..values.nrows()).map(|i| format!("{name}{i}")).collect();
        let samples = (0..values.ncols()).map(|i| format!("s{i}")).collect();
        OmicBlock::new(name, noise, OmicMatrix::new(values, features, samples).unwrap())
    }

    fn two_group_blocks() -> OmicBlockSet {
        let expr = array![
            [5.0, 5.2, 4.9, 5.1, 1.0, 1.2, 0.9, 1.1],
            [0.1, 0.3, 0.2, 0.0, 3.0, 3.1, 2.9, 3.2],
            [1.0, 2.0, 1.5, 1.2, 1.1, 1.9, 1.4, 1.3]
        ];
        let mutation = array![
            [1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            [0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0]
        ];
        OmicBlockSet::new(vec![
            block("expr", NoiseModel::Continuous, expr * 100.0),
            block("mut", NoiseModel::Binary, mutation),
        ])
        .unwrap()
    }

    #[test]
    fn identical_input_gives_identical_embedding() {
        let blocks = two_group_blocks();
        let engine = MfaEngine::new(MfaConfig { components: 2 });
        let first = engine.fit(&blocks).unwrap();
        let second = engine.fit(&blocks).unwrap();
        assert_eq!(first.result.embedding, second.result.embedding);
        assert_eq!(first.result.loadings, second.result.loadings);
    }

    #[test]
    fn first_component_separates_planted_groups() {
        let model = MfaEngine::default().fit(&two_group_blocks()).unwrap();
        let scores = model.result.embedding.scores();
        let first = scores.column(0);
        let left_sign = first[0].signum();
        assert!(first.iter().take(4).all(|v| v.signum() == left_sign));
        assert!(first.iter().skip(4).all(|v| v.signum() == -left_sign));
    }

    #[test]
    fn weighting_equalizes_blocks_despite_scale() {
        let model = MfaEngine::default().fit(&two_group_blocks()).unwrap();
        let (expr_name, expr_weight) = &model.block_weights[0];
        let (mut_name, mut_weight) = &model.block_weights[1];
        assert_eq!(expr_name, "expr");
        assert_eq!(mut_name, "mut");
        assert!(expr_weight < mut_weight, "the scaled-up block must be down-weighted");
    }

    #[test]
    fn scores_are_weighted_data_times_loadings() {
        let blocks = two_group_blocks();
        let model = MfaEngine::default().fit(&blocks).unwrap();
        let mut reconstructed = Array2::<f64>::zeros((blocks.n_samples(), 2));
        for ((block, (_, weight)), loadings) in blocks
            .iter()
            .zip(model.block_weights.iter())
            .zip(model.result.loadings.iter())
        {
            let centered = centered_samples_by_features(block.matrix().values()) * *weight;
            reconstructed = reconstructed + centered.dot(&loadings.values());
        }
        for (a, b) in reconstructed.iter().zip(model.result.embedding.scores().iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-8);
        }
    }

    #[test]
    fn explained_variance_is_a_descending_fraction() {
        let model = MfaEngine::new(MfaConfig { components: 5 }).fit(&two_group_blocks()).unwrap();
        let ratios = &model.explained_variance_ratio;
        assert!(ratios.windows(2).all(|w| w[0] >= w[1]));
        assert!(ratios.iter().sum::<f64>() <= 1.0 + 1e-12);
        assert_eq!(model.result.embedding.n_dims(), ratios.len());
    }

    #[test]
    fn two_samples_leave_too_few_dimensions() {
        let blocks = OmicBlockSet::new(vec![block(
            "expr",
            NoiseModel::Continuous,
            array![[1.0, 2.0], [3.0, 5.0], [0.0, 1.0]],
        )])
        .unwrap();
        let err = MfaEngine::default().fit(&blocks).unwrap_err();
        assert!(matches!(err, MfaError::RankDeficiency { usable: 1 }));
    }

    #[test]
    fn constant_block_has_no_variance() {
        let blocks = OmicBlockSet::new(vec![block(
            "flat",
            NoiseModel::Continuous,
            array![[2.0, 2.0, 2.0], [1.0, 1.0, 1.0]],
        )])
        .unwrap();
        assert!(matches!(
            MfaEngine::default().fit(&blocks),
            Err(MfaError::ZeroVarianceBlock(name)) if name == "flat"
        ));
    }
}
