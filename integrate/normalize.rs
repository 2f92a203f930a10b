//! # Block normalization
//!
//! Two scalings keep any one omic from dominating the shared factors:
//!
//! 1.  Feature normalization divides every row by its sum across samples, so
//!     each feature contributes the same total mass.
//! 2.  Block normalization divides the whole block by its Frobenius norm, so
//!     every block has unit norm regardless of how many features it has.
//!
//! The composition is idempotent: a normalized block has rows summing to
//! `1 / ||B||_F` and unit norm, and normalizing it again reproduces it.

use crate::types::{OmicBlock, OmicBlockSet, OmicMatrix, OmicsError};
use ndarray::{Array2, Axis, concatenate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NormalizationError {
    #[error("Feature '{feature}' in block '{block}' sums to zero across samples and cannot be normalized.")]
    DegenerateFeature { block: String, feature: String },

    #[error("Block '{0}' has zero Frobenius norm and cannot be normalized.")]
    DegenerateBlock(String),

    #[error(
        "Block '{block}' holds a negative value ({value}) at feature '{feature}', sample '{sample}'. Non-negative factorization needs non-negative input; choose the split sign policy to proceed."
    )]
    SignConstraint {
        block: String,
        feature: String,
        sample: String,
        value: f64,
    },

    #[error("Could not rebuild a normalized block: {0}")]
    Omics(#[from] OmicsError),
}

/// How to treat blocks with negative entries when preparing input for NMF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignPolicy {
    /// Fail with a sign-constraint error.
    #[default]
    Reject,
    /// Replace each feature `f` by its positive part `f+` and negative part `f-`.
    Split,
}

/// Feature-sum and Frobenius normalization of omic blocks.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockNormalizer {
    sign_policy: SignPolicy,
}

impl BlockNormalizer {
    pub fn new(sign_policy: SignPolicy) -> Self {
        Self { sign_policy }
    }

    pub fn sign_policy(&self) -> SignPolicy {
        self.sign_policy
    }

    /// Normalizes every block. The input is left untouched.
    pub fn normalize(&self, blocks: &OmicBlockSet) -> Result<OmicBlockSet, NormalizationError> {
        let normalized = blocks
            .iter()
            .map(normalize_block)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(OmicBlockSet::new(normalized)?)
    }

    /// Produces non-negative, normalized blocks suitable for joint NMF.
    ///
    /// Blocks with negative entries are rejected or split according to the sign policy.
    pub fn prepare_for_nmf(&self, blocks: &OmicBlockSet) -> Result<OmicBlockSet, NormalizationError> {
        let mut prepared = Vec::with_capacity(blocks.len());
        for block in blocks.iter() {
            let non_negative = if block.matrix().is_non_negative() {
                block.clone()
            } else {
                match self.sign_policy {
                    SignPolicy::Reject => return Err(first_negative_entry(block)),
                    SignPolicy::Split => split_signed_block(block)?,
                }
            };
            prepared.push(normalize_block(&non_negative)?);
        }
        Ok(OmicBlockSet::new(prepared)?)
    }
}

/// Divides rows by their sums, then the block by its Frobenius norm.
pub fn normalize_block(block: &OmicBlock) -> Result<OmicBlock, NormalizationError> {
    let matrix = block.matrix();
    let mut values = matrix.values().to_owned();

    for (row_index, mut row) in values.axis_iter_mut(Axis(0)).enumerate() {
        let sum = row.sum();
        if sum == 0.0 {
            return Err(NormalizationError::DegenerateFeature {
                block: block.name().to_string(),
                feature: matrix.feature_ids()[row_index].clone(),
            });
        }
        row /= sum;
    }

    let norm = values.iter().map(|&v| v * v).sum::<f64>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return Err(NormalizationError::DegenerateBlock(block.name().to_string()));
    }
    values /= norm;

    log::debug!(
        "Normalized block '{}' ({} features); pre-scaling Frobenius norm {:.4e}",
        block.name(),
        matrix.n_features(),
        norm
    );

    let normalized = OmicMatrix::new(
        values,
        matrix.feature_ids().to_vec(),
        matrix.sample_ids().to_vec(),
    )?;
    Ok(block.with_matrix(normalized))
}

/// Splits a signed block into positive and negative parts, dropping parts that are
/// identically zero.
pub fn split_signed_block(block: &OmicBlock) -> Result<OmicBlock, NormalizationError> {
    let matrix = block.matrix();
    let values = matrix.values();
    let positive = values.mapv(|v| v.max(0.0));
    let negative = values.mapv(|v| (-v).max(0.0));

    let mut keep_rows = Vec::new();
    let mut feature_ids = Vec::new();
    let stacked = concatenate(Axis(0), &[positive.view(), negative.view()])
        .map_err(|_| NormalizationError::DegenerateBlock(block.name().to_string()))?;

    for (suffix, offset) in [("+", 0), ("-", matrix.n_features())] {
        for (i, feature) in matrix.feature_ids().iter().enumerate() {
            let row = stacked.row(offset + i);
            if row.iter().any(|&v| v > 0.0) {
                keep_rows.push(offset + i);
                feature_ids.push(format!("{feature}{suffix}"));
            } else if values.row(i).iter().all(|&v| v == 0.0) && suffix == "+" {
                return Err(NormalizationError::DegenerateFeature {
                    block: block.name().to_string(),
                    feature: feature.clone(),
                });
            }
        }
    }

    let split: Array2<f64> = stacked.select(Axis(0), &keep_rows);
    log::info!(
        "Split signed block '{}' from {} into {} non-negative features",
        block.name(),
        matrix.n_features(),
        split.nrows()
    );
    let split_matrix = OmicMatrix::new(split, feature_ids, matrix.sample_ids().to_vec())?;
    Ok(block.with_matrix(split_matrix))
}

fn first_negative_entry(block: &OmicBlock) -> NormalizationError {
    let matrix = block.matrix();
    let ((row, col), &value) = matrix
        .values()
        .indexed_iter()
        .find(|(_, v)| **v < 0.0)
        .unwrap_or(((0, 0), &0.0));
    NormalizationError::SignConstraint {
        block: block.name().to_string(),
        feature: matrix.feature_ids()[row].clone(),
        sample: matrix.sample_ids()[col].clone(),
        value,
    }
}
