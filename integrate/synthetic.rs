//! Seeded generator of small multi-omic cohorts with a planted two-group split.
//!
//! Samples `0..ceil(n/2)` belong to group `A` and the rest to group `B`. Each block
//! has a share of informative features whose distribution depends on the group;
//! the remaining features are pure noise:
//!
//! - expression (continuous): group means `+effect` / `-effect` plus standard normal noise;
//! - mutation (binary): calls with probability 0.8 in group `A` and 0.1 in group `B`;
//! - copy number (categorical, `-1/0/1`): gains in group `A`, losses in group `B`.
//!
//! Binary and copy-number features always have at least one non-zero entry.
//! Copy-number and expression rows can still sum to zero across samples, so
//! row-sum normalization of the raw blocks may fail with `DegenerateFeature`.
//! Use `prepare_for_nmf` with `SignPolicy::Split` to get normalized blocks.

use crate::types::{CovariateTable, NoiseModel, OmicBlock, OmicBlockSet, OmicMatrix, OmicsError};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

pub const EXPRESSION_BLOCK: &str = "expression";
pub const MUTATION_BLOCK: &str = "mutation";
pub const COPY_NUMBER_BLOCK: &str = "copy_number";

#[derive(Debug, Clone)]
pub struct SyntheticCohort {
    pub blocks: Vec<OmicBlock>,
    pub covariates: CovariateTable,
}

impl SyntheticCohort {
    pub fn block_set(&self) -> Result<OmicBlockSet, OmicsError> {
        OmicBlockSet::new(self.blocks.clone())
    }

    /// Labels in sample order.
    pub fn labels(&self) -> Vec<String> {
        self.covariates
            .entries()
            .iter()
            .map(|(_, label)| label.clone())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticCohortBuilder {
    n_samples: usize,
    seed: u64,
    expression_features: usize,
    mutation_features: usize,
    copy_number_features: usize,
    informative_fraction: f64,
    effect_size: f64,
}

impl SyntheticCohortBuilder {
    pub fn new(n_samples: usize) -> Self {
        Self {
            n_samples,
            seed: 42,
            expression_features: 30,
            mutation_features: 20,
            copy_number_features: 15,
            informative_fraction: 0.4,
            effect_size: 1.5,
        }
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_expression_features(mut self, n: usize) -> Self {
        self.expression_features = n;
        self
    }

    pub fn with_mutation_features(mut self, n: usize) -> Self {
        self.mutation_features = n;
        self
    }

    pub fn with_copy_number_features(mut self, n: usize) -> Self {
        self.copy_number_features = n;
        self
    }

    /// Share of each block's features that carry the group signal, clamped to `[0, 1]`.
    pub fn with_informative_fraction(mut self, fraction: f64) -> Self {
        self.informative_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn with_effect_size(mut self, effect: f64) -> Self {
        self.effect_size = effect;
        self
    }

    fn informative(&self, features: usize) -> usize {
        (features as f64 * self.informative_fraction).round() as usize
    }

    pub fn build(&self) -> Result<SyntheticCohort, OmicsError> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let n = self.n_samples;
        let group_a = n.div_ceil(2);
        let in_a = |i: usize| i < group_a;
        let sample_ids: Vec<String> = (1..=n).map(|i| format!("S{i:03}")).collect();

        let informative = self.informative(self.expression_features);
        let expression = Array2::from_shape_fn((self.expression_features, n), |(j, i)| {
            let shift = match (j < informative, in_a(i)) {
                (false, _) => 0.0,
                (true, true) => self.effect_size,
                (true, false) => -self.effect_size,
            };
            let noise: f64 = rng.sample(StandardNormal);
            shift + noise
        });

        let informative = self.informative(self.mutation_features);
        let mut mutation = Array2::from_shape_fn((self.mutation_features, n), |(j, i)| {
            let p = match (j < informative, in_a(i)) {
                (false, _) => 0.2,
                (true, true) => 0.8,
                (true, false) => 0.1,
            };
            if rng.gen_bool(p) { 1.0 } else { 0.0 }
        });
        ensure_nonzero_rows(&mut mutation, &mut rng);

        let informative = self.informative(self.copy_number_features);
        let mut copy_number = Array2::from_shape_fn((self.copy_number_features, n), |(j, i)| {
            if j < informative {
                match (in_a(i), rng.gen_bool(0.7)) {
                    (true, true) => 1.0,
                    (false, true) => -1.0,
                    (_, false) => 0.0,
                }
            } else {
                rng.gen_range(-1_i32..=1) as f64
            }
        });
        ensure_nonzero_rows(&mut copy_number, &mut rng);

        let blocks = vec![
            OmicBlock::new(
                EXPRESSION_BLOCK,
                NoiseModel::Continuous,
                OmicMatrix::new(expression, feature_ids("GENE", self.expression_features), sample_ids.clone())?,
            ),
            OmicBlock::new(
                MUTATION_BLOCK,
                NoiseModel::Binary,
                OmicMatrix::new(mutation, feature_ids("MUT", self.mutation_features), sample_ids.clone())?,
            ),
            OmicBlock::new(
                COPY_NUMBER_BLOCK,
                NoiseModel::Categorical,
                OmicMatrix::new(copy_number, feature_ids("CNV", self.copy_number_features), sample_ids.clone())?,
            ),
        ];

        let covariates = CovariateTable::new(
            sample_ids
                .into_iter()
                .enumerate()
                .map(|(i, id)| (id, if in_a(i) { "A" } else { "B" }.to_string()))
                .collect(),
        )?;

        log::debug!(
            "Generated synthetic cohort: {n} samples ({group_a} in group A), seed {}",
            self.seed
        );
        Ok(SyntheticCohort { blocks, covariates })
    }
}

fn feature_ids(prefix: &str, n: usize) -> Vec<String> {
    (1..=n).map(|j| format!("{prefix}{j:03}")).collect()
}

fn ensure_nonzero_rows(values: &mut Array2<f64>, rng: &mut StdRng) {
    let n = values.ncols();
    if n == 0 {
        return;
    }
    for mut row in values.rows_mut() {
        if row.iter().all(|&v| v == 0.0) {
            row[rng.gen_range(0..n)] = 1.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{BlockNormalizer, SignPolicy};

    #[test]
    fn same_seed_gives_same_cohort() {
        let a = SyntheticCohortBuilder::new(12).seed(3).build().unwrap();
        let b = SyntheticCohortBuilder::new(12).seed(3).build().unwrap();
        let c = SyntheticCohortBuilder::new(12).seed(4).build().unwrap();
        assert_eq!(a.blocks, b.blocks);
        assert_ne!(a.blocks, c.blocks);
    }

    #[test]
    fn blocks_have_requested_shapes_and_value_domains() {
        let cohort = SyntheticCohortBuilder::new(20)
            .with_expression_features(8)
            .with_mutation_features(6)
            .with_copy_number_features(5)
            .build()
            .unwrap();
        let set = cohort.block_set().unwrap();
        assert_eq!(set.n_samples(), 20);
        assert_eq!(set.get(EXPRESSION_BLOCK).unwrap().n_features(), 8);

        let mutation = set.get(MUTATION_BLOCK).unwrap().matrix();
        assert!(mutation.values().iter().all(|&v| v == 0.0 || v == 1.0));
        let cnv = set.get(COPY_NUMBER_BLOCK).unwrap().matrix();
        assert!(cnv.values().iter().all(|&v| v == -1.0 || v == 0.0 || v == 1.0));
        for j in 0..mutation.n_features() {
            assert!(mutation.feature(j).iter().any(|&v| v != 0.0));
        }
        for j in 0..cnv.n_features() {
            assert!(cnv.feature(j).iter().any(|&v| v != 0.0));
        }
    }

    #[test]
    fn labels_follow_the_planted_split() {
        let cohort = SyntheticCohortBuilder::new(7).build().unwrap();
        assert_eq!(cohort.labels(), ["A", "A", "A", "A", "B", "B", "B"]);
        assert_eq!(cohort.covariates.label("S001"), Some("A"));
        assert_eq!(cohort.covariates.label("S007"), Some("B"));
    }

    #[test]
    fn informative_expression_features_differ_by_group() {
        let cohort = SyntheticCohortBuilder::new(40).with_effect_size(3.0).build().unwrap();
        let expression = cohort.blocks[0].matrix();
        let first = expression.feature(0);
        let mean_a = first.iter().take(20).sum::<f64>() / 20.0;
        let mean_b = first.iter().skip(20).sum::<f64>() / 20.0;
        assert!(mean_a - mean_b > 3.0);
    }

    #[test]
    fn split_preparation_normalizes_every_generated_block() {
        let normalizer = BlockNormalizer::new(SignPolicy::Split);
        for seed in 0..10 {
            let cohort = SyntheticCohortBuilder::new(16).seed(seed).build().unwrap();
            let prepared = normalizer.prepare_for_nmf(&cohort.block_set().unwrap()).unwrap();
            assert_eq!(prepared.len(), 3);
            assert!(prepared.iter().all(|b| b.matrix().is_non_negative()));
        }
    }
}
