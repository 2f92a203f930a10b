use crate::types::{CovariateTable, OmicBlock, OmicBlockSet, OmicsError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlignmentError {
    #[error("Block '{block}' holds a different sample set than block '{reference}' ({missing} samples differ).")]
    SampleSetMismatch {
        block: String,
        reference: String,
        missing: usize,
    },

    #[error("Sample '{0}' has no entry in the covariate table.")]
    MissingCovariate(String),

    #[error("No sample is shared by every block.")]
    EmptySampleAxis,

    #[error("Invalid block set: {0}")]
    Omics(#[from] OmicsError),
}

/// How to reconcile blocks whose sample sets differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleAxisPolicy {
    /// Every block must hold exactly the same samples.
    #[default]
    Strict,
    /// Keep only samples present in every block.
    Intersect,
}

/// Blocks on one ordered sample axis plus the label of every sample on it.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedCohort {
    pub blocks: OmicBlockSet,
    pub labels: Vec<String>,
}

/// Puts every block and the covariate table on the first block's sample order.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatrixAligner {
    policy: SampleAxisPolicy,
}

impl MatrixAligner {
    pub fn new(policy: SampleAxisPolicy) -> Self {
        Self { policy }
    }

    pub fn align(
        &self,
        blocks: Vec<OmicBlock>,
        covariates: &CovariateTable,
    ) -> Result<AlignedCohort, AlignmentError> {
        let Some(reference) = blocks.first() else {
            return Err(OmicsError::EmptyBlockSet.into());
        };
        let reference_name = reference.name().to_string();
        let axis = self.shared_axis(&blocks)?;
        if axis.is_empty() {
            return Err(AlignmentError::EmptySampleAxis);
        }

        let aligned: Vec<OmicBlock> = blocks
            .iter()
            .map(|block| {
                let positions: HashMap<&str, usize> = block
                    .matrix()
                    .sample_ids()
                    .iter()
                    .enumerate()
                    .map(|(i, id)| (id.as_str(), i))
                    .collect();
                let order: Vec<usize> = axis.iter().map(|id| positions[id.as_str()]).collect();
                block.with_matrix(block.matrix().select_samples(&order))
            })
            .collect();

        let labels = axis
            .iter()
            .map(|sample| {
                covariates
                    .label(sample)
                    .map(str::to_string)
                    .ok_or_else(|| AlignmentError::MissingCovariate(sample.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        log::info!(
            "Aligned {} blocks on {} samples (reference block '{}')",
            aligned.len(),
            axis.len(),
            reference_name
        );

        Ok(AlignedCohort {
            blocks: OmicBlockSet::new(aligned)?,
            labels,
        })
    }

    fn shared_axis(&self, blocks: &[OmicBlock]) -> Result<Vec<String>, AlignmentError> {
        let reference = &blocks[0];
        let reference_ids = reference.matrix().sample_ids();

        match self.policy {
            SampleAxisPolicy::Strict => {
                let expected: HashSet<&str> = reference_ids.iter().map(String::as_str).collect();
                for block in &blocks[1..] {
                    let found: HashSet<&str> =
                        block.matrix().sample_ids().iter().map(String::as_str).collect();
                    let missing = expected.symmetric_difference(&found).count();
                    if missing > 0 {
                        return Err(AlignmentError::SampleSetMismatch {
                            block: block.name().to_string(),
                            reference: reference.name().to_string(),
                            missing,
                        });
                    }
                }
                Ok(reference_ids.to_vec())
            }
            SampleAxisPolicy::Intersect => {
                let others: Vec<HashSet<&str>> = blocks[1..]
                    .iter()
                    .map(|b| b.matrix().sample_ids().iter().map(String::as_str).collect())
                    .collect();
                let axis: Vec<String> = reference_ids
                    .iter()
                    .filter(|id| others.iter().all(|set| set.contains(id.as_str())))
                    .cloned()
                    .collect();
                let dropped = reference_ids.len() - axis.len();
                if dropped > 0 {
                    log::warn!(
                        "Dropped {dropped} samples of block '{}' that are missing from other blocks",
                        reference.name()
                    );
                }
                Ok(axis)
            }
        }
    }
}
