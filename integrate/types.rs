//! # Core data model
//!
//! Every engine in this crate speaks the same small vocabulary: feature-by-sample
//! matrices grouped into named blocks, a per-sample label table, and the
//! embedding/loading pair an engine hands back. The types here validate their
//! invariants at construction so downstream numeric code never has to re-check
//! shapes or identifiers.

use crate::convergence::ConvergenceReport;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while building the core data model.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OmicsError {
    #[error("Matrix has {found} {axis} identifiers but its data has {expected} {axis}s.")]
    ShapeMismatch {
        axis: &'static str,
        found: usize,
        expected: usize,
    },

    #[error("Matrix must contain at least one feature and one sample.")]
    EmptyMatrix,

    #[error("Sample identifier '{0}' appears more than once.")]
    DuplicateSample(String),

    #[error("Feature identifier '{0}' appears more than once within a block.")]
    DuplicateFeature(String),

    #[error("Non-finite value found at feature '{feature}', sample '{sample}'. All entries must be finite.")]
    NonFiniteValue { feature: String, sample: String },

    #[error(
        "Unrecognized noise model tag '{0}'. Expected one of: continuous, binary, categorical."
    )]
    InvalidNoiseModel(String),

    #[error("Block name '{0}' is used by more than one block.")]
    DuplicateBlockName(String),

    #[error("A block set needs at least one block.")]
    EmptyBlockSet,

    #[error("Block '{block}' does not share the sample axis of block '{reference}'.")]
    SampleAxisMismatch { block: String, reference: String },
}

/// A real-valued matrix with features as rows and samples as columns.
#[derive(Debug, Clone, PartialEq)]
pub struct OmicMatrix {
    values: Array2<f64>,
    feature_ids: Vec<String>,
    sample_ids: Vec<String>,
}

impl OmicMatrix {
    /// Builds a matrix after checking shape, identifier uniqueness and finiteness.
    pub fn new(
        values: Array2<f64>,
        feature_ids: Vec<String>,
        sample_ids: Vec<String>,
    ) -> Result<Self, OmicsError> {
        let (n_features, n_samples) = values.dim();
        if n_features == 0 || n_samples == 0 {
            return Err(OmicsError::EmptyMatrix);
        }
        if feature_ids.len() != n_features {
            return Err(OmicsError::ShapeMismatch {
                axis: "feature",
                found: feature_ids.len(),
                expected: n_features,
            });
        }
        if sample_ids.len() != n_samples {
            return Err(OmicsError::ShapeMismatch {
                axis: "sample",
                found: sample_ids.len(),
                expected: n_samples,
            });
        }

        let mut seen = HashSet::with_capacity(n_samples);
        for id in &sample_ids {
            if !seen.insert(id.as_str()) {
                return Err(OmicsError::DuplicateSample(id.clone()));
            }
        }
        let mut seen = HashSet::with_capacity(n_features);
        for id in &feature_ids {
            if !seen.insert(id.as_str()) {
                return Err(OmicsError::DuplicateFeature(id.clone()));
            }
        }

        if let Some(((row, col), _)) = values.indexed_iter().find(|(_, v)| !v.is_finite()) {
            return Err(OmicsError::NonFiniteValue {
                feature: feature_ids[row].clone(),
                sample: sample_ids[col].clone(),
            });
        }

        Ok(Self {
            values,
            feature_ids,
            sample_ids,
        })
    }

    pub fn values(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    pub fn feature_ids(&self) -> &[String] {
        &self.feature_ids
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn n_features(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_samples(&self) -> usize {
        self.values.ncols()
    }

    pub fn is_non_negative(&self) -> bool {
        self.values.iter().all(|&v| v >= 0.0)
    }

    /// Square root of the sum of squares of all entries.
    pub fn frobenius_norm(&self) -> f64 {
        self.values.iter().map(|&v| v * v).sum::<f64>().sqrt()
    }

    /// Returns a matrix whose columns follow `order` (indices into the current columns).
    pub fn select_samples(&self, order: &[usize]) -> Self {
        Self {
            values: self.values.select(Axis(1), order),
            feature_ids: self.feature_ids.clone(),
            sample_ids: order.iter().map(|&i| self.sample_ids[i].clone()).collect(),
        }
    }

    /// Row view for a single feature.
    pub fn feature(&self, index: usize) -> ArrayView1<'_, f64> {
        self.values.row(index)
    }
}

/// The declared noise model of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoiseModel {
    /// Real-valued measurements (e.g. expression), modelled as Gaussian.
    Continuous,
    /// 0/1 indicators (e.g. mutation calls), modelled as Bernoulli.
    Binary,
    /// Discrete states (e.g. copy-number calls), modelled as multinomial.
    Categorical,
}

impl NoiseModel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Continuous => "continuous",
            Self::Binary => "binary",
            Self::Categorical => "categorical",
        }
    }
}

impl fmt::Display for NoiseModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NoiseModel {
    type Err = OmicsError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "continuous" | "gaussian" => Ok(Self::Continuous),
            "binary" | "bernoulli" => Ok(Self::Binary),
            "categorical" | "multinomial" => Ok(Self::Categorical),
            _ => Err(OmicsError::InvalidNoiseModel(tag.to_string())),
        }
    }
}

/// One named measurement modality together with its noise model.
#[derive(Debug, Clone, PartialEq)]
pub struct OmicBlock {
    name: String,
    noise_model: NoiseModel,
    matrix: OmicMatrix,
}

impl OmicBlock {
    pub fn new(name: impl Into<String>, noise_model: NoiseModel, matrix: OmicMatrix) -> Self {
        Self {
            name: name.into(),
            noise_model,
            matrix,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn noise_model(&self) -> NoiseModel {
        self.noise_model
    }

    pub fn matrix(&self) -> &OmicMatrix {
        &self.matrix
    }

    pub fn n_features(&self) -> usize {
        self.matrix.n_features()
    }

    /// Same name and noise model, different data.
    pub fn with_matrix(&self, matrix: OmicMatrix) -> Self {
        Self {
            name: self.name.clone(),
            noise_model: self.noise_model,
            matrix,
        }
    }
}

/// An ordered set of blocks sharing one ordered sample axis.
#[derive(Debug, Clone, PartialEq)]
pub struct OmicBlockSet {
    blocks: Vec<OmicBlock>,
}

impl OmicBlockSet {
    pub fn new(blocks: Vec<OmicBlock>) -> Result<Self, OmicsError> {
        let Some(first) = blocks.first() else {
            return Err(OmicsError::EmptyBlockSet);
        };

        let mut names = HashSet::with_capacity(blocks.len());
        for block in &blocks {
            if !names.insert(block.name()) {
                return Err(OmicsError::DuplicateBlockName(block.name().to_string()));
            }
            if block.matrix().sample_ids() != first.matrix().sample_ids() {
                return Err(OmicsError::SampleAxisMismatch {
                    block: block.name().to_string(),
                    reference: first.name().to_string(),
                });
            }
        }

        Ok(Self { blocks })
    }

    pub fn blocks(&self) -> &[OmicBlock] {
        &self.blocks
    }

    pub fn iter(&self) -> impl Iterator<Item = &OmicBlock> {
        self.blocks.iter()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&OmicBlock> {
        self.blocks.iter().find(|b| b.name() == name)
    }

    pub fn sample_ids(&self) -> &[String] {
        self.blocks[0].matrix().sample_ids()
    }

    pub fn n_samples(&self) -> usize {
        self.blocks[0].matrix().n_samples()
    }

    pub fn total_features(&self) -> usize {
        self.blocks.iter().map(OmicBlock::n_features).sum()
    }
}

/// Maps sample identifiers to a categorical label such as a cancer subtype.
#[derive(Debug, Clone, PartialEq)]
pub struct CovariateTable {
    entries: Vec<(String, String)>,
    index: HashMap<String, usize>,
}

impl CovariateTable {
    pub fn new(entries: Vec<(String, String)>) -> Result<Self, OmicsError> {
        let mut index = HashMap::with_capacity(entries.len());
        for (i, (sample, _)) in entries.iter().enumerate() {
            if index.insert(sample.clone(), i).is_some() {
                return Err(OmicsError::DuplicateSample(sample.clone()));
            }
        }
        Ok(Self { entries, index })
    }

    pub fn label(&self, sample: &str) -> Option<&str> {
        self.index
            .get(sample)
            .map(|&i| self.entries[i].1.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }
}

/// Which engine produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Mfa,
    JointNmf,
    MixedLikelihood,
}

impl EngineKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mfa => "mfa",
            Self::JointNmf => "joint_nmf",
            Self::MixedLikelihood => "mixed_likelihood",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Records which engine and hyperparameters produced an embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub engine: EngineKind,
    pub hyperparameters: BTreeMap<String, String>,
}

impl Provenance {
    pub fn new(engine: EngineKind) -> Self {
        Self {
            engine,
            hyperparameters: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.hyperparameters
            .insert(key.to_string(), value.to_string());
        self
    }
}

/// Per-sample coordinates in latent space: rows are samples, columns are dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    scores: Array2<f64>,
    sample_ids: Vec<String>,
    provenance: Provenance,
}

impl Embedding {
    pub fn new(
        scores: Array2<f64>,
        sample_ids: Vec<String>,
        provenance: Provenance,
    ) -> Result<Self, OmicsError> {
        if scores.nrows() != sample_ids.len() {
            return Err(OmicsError::ShapeMismatch {
                axis: "sample",
                found: sample_ids.len(),
                expected: scores.nrows(),
            });
        }
        Ok(Self {
            scores,
            sample_ids,
            provenance,
        })
    }

    pub fn scores(&self) -> ArrayView2<'_, f64> {
        self.scores.view()
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    pub fn n_samples(&self) -> usize {
        self.scores.nrows()
    }

    pub fn n_dims(&self) -> usize {
        self.scores.ncols()
    }
}

/// Loadings of one block: one row per feature (or feature level), one column per dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockLoadings {
    block: String,
    row_labels: Vec<String>,
    values: Array2<f64>,
}

impl BlockLoadings {
    pub fn new(
        block: impl Into<String>,
        row_labels: Vec<String>,
        values: Array2<f64>,
    ) -> Result<Self, OmicsError> {
        if row_labels.len() != values.nrows() {
            return Err(OmicsError::ShapeMismatch {
                axis: "feature",
                found: row_labels.len(),
                expected: values.nrows(),
            });
        }
        Ok(Self {
            block: block.into(),
            row_labels,
            values,
        })
    }

    pub fn block(&self) -> &str {
        &self.block
    }

    pub fn row_labels(&self) -> &[String] {
        &self.row_labels
    }

    pub fn values(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }
}

/// The per-block loadings produced by one engine run.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadingSet {
    blocks: Vec<BlockLoadings>,
}

impl LoadingSet {
    pub fn new(blocks: Vec<BlockLoadings>) -> Self {
        Self { blocks }
    }

    pub fn get(&self, block: &str) -> Option<&BlockLoadings> {
        self.blocks.iter().find(|b| b.block() == block)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlockLoadings> {
        self.blocks.iter()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// What every engine hands back: an embedding, its loadings and, for the
/// iterative engines, how the optimization ended.
#[derive(Debug, Clone)]
pub struct IntegrationResult {
    pub embedding: Embedding,
    pub loadings: LoadingSet,
    pub convergence: Option<ConvergenceReport>,
}

impl IntegrationResult {
    /// False only when an iterative engine exhausted its iteration budget.
    pub fn is_trustworthy(&self) -> bool {
        self.convergence
            .as_ref()
            .is_none_or(ConvergenceReport::converged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn ids(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{prefix}{i}")).collect()
    }

    #[test]
    fn matrix_rejects_duplicate_samples() {
        let err = OmicMatrix::new(
            array![[1.0, 2.0]],
            ids("g", 1),
            vec!["s".to_string(), "s".to_string()],
        )
        .unwrap_err();
        assert_eq!(err, OmicsError::DuplicateSample("s".to_string()));
    }

    #[test]
    fn matrix_rejects_non_finite_values() {
        let err = OmicMatrix::new(array![[1.0, f64::NAN]], ids("g", 1), ids("s", 2)).unwrap_err();
        assert!(matches!(err, OmicsError::NonFiniteValue { ref sample, .. } if sample == "s1"));
    }

    #[test]
    fn matrix_rejects_mismatched_identifiers() {
        let err = OmicMatrix::new(array![[1.0, 2.0]], ids("g", 2), ids("s", 2)).unwrap_err();
        assert!(matches!(
            err,
            OmicsError::ShapeMismatch {
                axis: "feature",
                found: 2,
                expected: 1
            }
        ));
    }

    #[test]
    fn noise_model_tags_parse_case_insensitively() {
        assert_eq!("Continuous".parse::<NoiseModel>(), Ok(NoiseModel::Continuous));
        assert_eq!("bernoulli".parse::<NoiseModel>(), Ok(NoiseModel::Binary));
        assert_eq!(" categorical ".parse::<NoiseModel>(), Ok(NoiseModel::Categorical));
        assert_eq!(
            "poisson".parse::<NoiseModel>(),
            Err(OmicsError::InvalidNoiseModel("poisson".to_string()))
        );
    }

    #[test]
    fn block_set_requires_shared_sample_axis() {
        let a = OmicMatrix::new(array![[1.0, 2.0]], ids("g", 1), ids("s", 2)).unwrap();
        let b = OmicMatrix::new(
            array![[1.0, 2.0]],
            ids("m", 1),
            vec!["s1".to_string(), "s0".to_string()],
        )
        .unwrap();
        let err = OmicBlockSet::new(vec![
            OmicBlock::new("expr", NoiseModel::Continuous, a),
            OmicBlock::new("mut", NoiseModel::Binary, b),
        ])
        .unwrap_err();
        assert!(matches!(err, OmicsError::SampleAxisMismatch { .. }));
    }

    #[test]
    fn block_set_rejects_duplicate_names() {
        let a = OmicMatrix::new(array![[1.0, 2.0]], ids("g", 1), ids("s", 2)).unwrap();
        let err = OmicBlockSet::new(vec![
            OmicBlock::new("expr", NoiseModel::Continuous, a.clone()),
            OmicBlock::new("expr", NoiseModel::Continuous, a),
        ])
        .unwrap_err();
        assert_eq!(err, OmicsError::DuplicateBlockName("expr".to_string()));
    }

    #[test]
    fn covariate_lookup() {
        let table = CovariateTable::new(vec![
            ("s0".to_string(), "LumA".to_string()),
            ("s1".to_string(), "Basal".to_string()),
        ])
        .unwrap();
        assert_eq!(table.label("s1"), Some("Basal"));
        assert_eq!(table.label("s9"), None);
    }

    #[test]
    fn provenance_records_hyperparameters() {
        let provenance = Provenance::new(EngineKind::JointNmf)
            .with("rank", 2)
            .with("tolerance", 1e-4);
        assert_eq!(provenance.hyperparameters["rank"], "2");
        assert_eq!(provenance.engine.to_string(), "joint_nmf");
    }
}
