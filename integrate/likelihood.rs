//! Per-block likelihoods for the mixed latent model.
//!
//! Every block `b` contributes a log-likelihood `l_b(Z, B_b)` in which sample `i`
//! and loading row `r` interact through the linear predictor
//! `eta[i, r] = a[r] + z_i . B[r, :]`. The optimizer in `latent` only ever talks to
//! the [`LikelihoodStrategy`] trait; the three implementations here supply the
//! gradient in `Z`, the penalized loadings update and the objective itself.

use crate::types::{NoiseModel, OmicBlock};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use std::ops::Range;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LikelihoodError {
    #[error(
        "Block '{block}' is declared {noise_model} but feature '{feature}' holds {value} at sample '{sample}'; expected 0 or 1."
    )]
    IncompatibleBlock {
        block: String,
        noise_model: NoiseModel,
        feature: String,
        sample: String,
        value: f64,
    },
}

/// Intercepts and loadings of one block. `loadings` has one row per entry of
/// [`LikelihoodStrategy::loading_labels`] and one column per latent dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockParameters {
    pub intercepts: Array1<f64>,
    pub loadings: Array2<f64>,
}

impl BlockParameters {
    pub fn zeros(rows: usize, components: usize) -> Self {
        Self {
            intercepts: Array1::zeros(rows),
            loadings: Array2::zeros((rows, components)),
        }
    }

    /// Sum of absolute loadings. Intercepts are never penalized.
    pub fn l1_norm(&self) -> f64 {
        self.loadings.iter().map(|v| v.abs()).sum()
    }

    /// `eta = 1 a' + Z B'`, samples x rows.
    pub fn linear_predictor(&self, latent: ArrayView2<f64>) -> Array2<f64> {
        latent.dot(&self.loadings.t()) + &self.intercepts
    }
}

pub trait LikelihoodStrategy: Send + Sync {
    fn block_name(&self) -> &str;

    fn noise_model(&self) -> NoiseModel;

    /// Labels of the loading rows, in row order.
    fn loading_labels(&self) -> &[String];

    fn initial_parameters(&self, components: usize) -> BlockParameters {
        BlockParameters::zeros(self.loading_labels().len(), components)
    }

    fn log_likelihood(&self, latent: ArrayView2<f64>, parameters: &BlockParameters) -> f64;

    /// Gradient of [`Self::log_likelihood`] with respect to `Z` (samples x components).
    fn gradient_with_respect_to_latent(
        &self,
        latent: ArrayView2<f64>,
        parameters: &BlockParameters,
    ) -> Array2<f64>;

    /// Runs `steps` passes of penalized regression of the block on a fixed `Z`,
    /// starting from `parameters`. Each pass never lowers
    /// [`Self::penalized_log_likelihood`] at the same `l1`.
    fn fit_loadings_given_latent(
        &self,
        latent: ArrayView2<f64>,
        parameters: &BlockParameters,
        l1: f64,
        steps: usize,
    ) -> BlockParameters;

    fn penalized_log_likelihood(
        &self,
        latent: ArrayView2<f64>,
        parameters: &BlockParameters,
        l1: f64,
    ) -> f64 {
        self.log_likelihood(latent, parameters) - l1 * parameters.l1_norm()
    }
}

/// Builds the likelihood matching `noise_model` for a block.
pub fn strategy_for(
    block: &OmicBlock,
    noise_model: NoiseModel,
    standardize_continuous: bool,
) -> Result<Box<dyn LikelihoodStrategy>, LikelihoodError> {
    let strategy: Box<dyn LikelihoodStrategy> = match noise_model {
        NoiseModel::Continuous => Box::new(GaussianLikelihood::new(block, standardize_continuous)),
        NoiseModel::Binary => Box::new(BernoulliLikelihood::new(block)?),
        NoiseModel::Categorical => Box::new(MultinomialLikelihood::new(block)),
    };
    Ok(strategy)
}

pub fn soft_threshold(value: f64, threshold: f64) -> f64 {
    if value > threshold {
        value - threshold
    } else if value < -threshold {
        value + threshold
    } else {
        0.0
    }
}

fn logistic(eta: f64) -> f64 {
    if eta >= 0.0 {
        1.0 / (1.0 + (-eta).exp())
    } else {
        let e = eta.exp();
        e / (1.0 + e)
    }
}

/// `ln(1 + e^eta)` without overflow.
fn softplus(eta: f64) -> f64 {
    eta.max(0.0) + (-eta.abs()).exp().ln_1p()
}

/// `||[1 Z]||_F^2`, an upper bound on the largest eigenvalue of the design Gram matrix.
fn design_norm_squared(latent: ArrayView2<f64>) -> f64 {
    latent.nrows() as f64 + latent.iter().map(|v| v * v).sum::<f64>()
}

/// One proximal gradient ascent step on `(a, B)` given the residual `Y - E[Y]`.
fn proximal_step(
    parameters: &mut BlockParameters,
    latent: ArrayView2<f64>,
    residual: &Array2<f64>,
    step: f64,
    l1: f64,
) {
    parameters
        .intercepts
        .scaled_add(step, &residual.sum_axis(Axis(0)));
    let gradient = residual.t().dot(&latent);
    parameters.loadings.scaled_add(step, &gradient);
    let threshold = step * l1;
    parameters
        .loadings
        .mapv_inplace(|v| soft_threshold(v, threshold));
}

fn samples_by_features(block: &OmicBlock) -> Array2<f64> {
    block.matrix().values().t().to_owned()
}

/// Unit-variance Gaussian on (optionally standardized) continuous features.
///
/// The log-likelihood omits the `-n p log(2 pi) / 2` constant.
pub struct GaussianLikelihood {
    name: String,
    labels: Vec<String>,
    data: Array2<f64>,
}

impl GaussianLikelihood {
    pub fn new(block: &OmicBlock, standardize: bool) -> Self {
        let mut data = samples_by_features(block);
        if standardize {
            for (j, mut column) in data.axis_iter_mut(Axis(1)).enumerate() {
                let mean = column.mean().unwrap_or(0.0);
                column -= mean;
                let sd = column.std(0.0);
                if sd > 0.0 {
                    column /= sd;
                } else {
                    log::debug!(
                        "Feature '{}' of block '{}' is constant; left centered",
                        block.matrix().feature_ids()[j],
                        block.name()
                    );
                }
            }
        }
        Self {
            name: block.name().to_string(),
            labels: block.matrix().feature_ids().to_vec(),
            data,
        }
    }

    fn residual(&self, latent: ArrayView2<f64>, parameters: &BlockParameters) -> Array2<f64> {
        &self.data - &parameters.linear_predictor(latent)
    }
}

impl LikelihoodStrategy for GaussianLikelihood {
    fn block_name(&self) -> &str {
        &self.name
    }

    fn noise_model(&self) -> NoiseModel {
        NoiseModel::Continuous
    }

    fn loading_labels(&self) -> &[String] {
        &self.labels
    }

    fn log_likelihood(&self, latent: ArrayView2<f64>, parameters: &BlockParameters) -> f64 {
        -0.5 * self.residual(latent, parameters).iter().map(|r| r * r).sum::<f64>()
    }

    fn gradient_with_respect_to_latent(
        &self,
        latent: ArrayView2<f64>,
        parameters: &BlockParameters,
    ) -> Array2<f64> {
        self.residual(latent, parameters).dot(&parameters.loadings)
    }

    /// Coordinate-descent lasso, one feature at a time: the intercept is the mean
    /// residual and each loading is the soft-thresholded partial-residual projection.
    fn fit_loadings_given_latent(
        &self,
        latent: ArrayView2<f64>,
        parameters: &BlockParameters,
        l1: f64,
        steps: usize,
    ) -> BlockParameters {
        let mut next = parameters.clone();
        let n = latent.nrows() as f64;
        let column_norms: Vec<f64> = latent
            .axis_iter(Axis(1))
            .map(|z| z.dot(&z))
            .collect();

        for (j, y) in self.data.axis_iter(Axis(1)).enumerate() {
            let mut loadings = next.loadings.row(j).to_owned();
            let mut intercept = next.intercepts[j];
            let mut residual = &y - &latent.dot(&loadings) - intercept;

            for _ in 0..steps {
                let shift = residual.sum() / n;
                intercept += shift;
                residual -= shift;

                for (c, z) in latent.axis_iter(Axis(1)).enumerate() {
                    if column_norms[c] <= 0.0 {
                        continue;
                    }
                    let rho = z.dot(&residual) + column_norms[c] * loadings[c];
                    let updated = soft_threshold(rho, l1) / column_norms[c];
                    let delta = updated - loadings[c];
                    if delta != 0.0 {
                        residual.scaled_add(-delta, &z);
                        loadings[c] = updated;
                    }
                }
            }

            next.intercepts[j] = intercept;
            next.loadings.row_mut(j).assign(&loadings);
        }
        next
    }
}

/// Logistic model for 0/1 features.
pub struct BernoulliLikelihood {
    name: String,
    labels: Vec<String>,
    data: Array2<f64>,
}

impl BernoulliLikelihood {
    pub fn new(block: &OmicBlock) -> Result<Self, LikelihoodError> {
        let matrix = block.matrix();
        if let Some(((row, col), &value)) = matrix
            .values()
            .indexed_iter()
            .find(|(_, v)| **v != 0.0 && **v != 1.0)
        {
            return Err(LikelihoodError::IncompatibleBlock {
                block: block.name().to_string(),
                noise_model: NoiseModel::Binary,
                feature: matrix.feature_ids()[row].clone(),
                sample: matrix.sample_ids()[col].clone(),
                value,
            });
        }
        Ok(Self {
            name: block.name().to_string(),
            labels: matrix.feature_ids().to_vec(),
            data: samples_by_features(block),
        })
    }
}

impl LikelihoodStrategy for BernoulliLikelihood {
    fn block_name(&self) -> &str {
        &self.name
    }

    fn noise_model(&self) -> NoiseModel {
        NoiseModel::Binary
    }

    fn loading_labels(&self) -> &[String] {
        &self.labels
    }

    fn log_likelihood(&self, latent: ArrayView2<f64>, parameters: &BlockParameters) -> f64 {
        let eta = parameters.linear_predictor(latent);
        self.data
            .iter()
            .zip(eta.iter())
            .map(|(&y, &e)| y * e - softplus(e))
            .sum()
    }

    fn gradient_with_respect_to_latent(
        &self,
        latent: ArrayView2<f64>,
        parameters: &BlockParameters,
    ) -> Array2<f64> {
        let fitted = parameters.linear_predictor(latent).mapv(logistic);
        (&self.data - &fitted).dot(&parameters.loadings)
    }

    fn fit_loadings_given_latent(
        &self,
        latent: ArrayView2<f64>,
        parameters: &BlockParameters,
        l1: f64,
        steps: usize,
    ) -> BlockParameters {
        let step = 1.0 / (0.25 * design_norm_squared(latent));
        let mut next = parameters.clone();
        for _ in 0..steps {
            let fitted = next.linear_predictor(latent).mapv(logistic);
            let residual = &self.data - &fitted;
            proximal_step(&mut next, latent, &residual, step, l1);
        }
        next
    }
}

/// Softmax model for categorical features.
///
/// Each feature's distinct observed values are its levels, in ascending order. The
/// first level is the reference with a linear predictor fixed at zero; every other
/// level gets its own intercept and loading row, labeled `feature:level`.
pub struct MultinomialLikelihood {
    name: String,
    labels: Vec<String>,
    /// One-hot indicators of the non-reference levels, samples x rows.
    indicators: Array2<f64>,
    /// Rows belonging to each feature with two or more levels.
    groups: Vec<Range<usize>>,
}

impl MultinomialLikelihood {
    pub fn new(block: &OmicBlock) -> Self {
        let matrix = block.matrix();
        let n = matrix.n_samples();
        let mut labels = Vec::new();
        let mut groups = Vec::new();
        let mut columns: Vec<Array1<f64>> = Vec::new();

        for (j, feature) in matrix.feature_ids().iter().enumerate() {
            let values = matrix.feature(j);
            let mut levels: Vec<f64> = values.to_vec();
            levels.sort_by(f64::total_cmp);
            levels.dedup();
            if levels.len() < 2 {
                log::debug!(
                    "Categorical feature '{feature}' of block '{}' has a single level and carries no information",
                    block.name()
                );
                continue;
            }
            let start = labels.len();
            for level in &levels[1..] {
                labels.push(format!("{feature}:{level}"));
                columns.push(values.mapv(|v| if v == *level { 1.0 } else { 0.0 }));
            }
            groups.push(start..labels.len());
        }

        let mut indicators = Array2::zeros((n, labels.len()));
        for (r, column) in columns.iter().enumerate() {
            indicators.column_mut(r).assign(column);
        }

        Self {
            name: block.name().to_string(),
            labels,
            indicators,
            groups,
        }
    }

    /// Probabilities of the non-reference levels and the summed log-normalizers.
    fn softmax(&self, eta: &Array2<f64>) -> (Array2<f64>, f64) {
        let mut probabilities = Array2::zeros(eta.dim());
        let mut log_normalizer = 0.0;
        for (i, row) in eta.axis_iter(Axis(0)).enumerate() {
            for group in &self.groups {
                let slice = row.slice(ndarray::s![group.clone()]);
                let peak = slice.iter().copied().fold(0.0_f64, f64::max);
                let reference = (-peak).exp();
                let denominator = reference + slice.iter().map(|e| (e - peak).exp()).sum::<f64>();
                log_normalizer += peak + denominator.ln();
                for (offset, e) in slice.iter().enumerate() {
                    probabilities[[i, group.start + offset]] = (e - peak).exp() / denominator;
                }
            }
        }
        (probabilities, log_normalizer)
    }
}

impl LikelihoodStrategy for MultinomialLikelihood {
    fn block_name(&self) -> &str {
        &self.name
    }

    fn noise_model(&self) -> NoiseModel {
        NoiseModel::Categorical
    }

    fn loading_labels(&self) -> &[String] {
        &self.labels
    }

    fn log_likelihood(&self, latent: ArrayView2<f64>, parameters: &BlockParameters) -> f64 {
        let eta = parameters.linear_predictor(latent);
        let (_, log_normalizer) = self.softmax(&eta);
        let observed: f64 = self
            .indicators
            .iter()
            .zip(eta.iter())
            .map(|(y, e)| y * e)
            .sum();
        observed - log_normalizer
    }

    fn gradient_with_respect_to_latent(
        &self,
        latent: ArrayView2<f64>,
        parameters: &BlockParameters,
    ) -> Array2<f64> {
        let (probabilities, _) = self.softmax(&parameters.linear_predictor(latent));
        (&self.indicators - &probabilities).dot(&parameters.loadings)
    }

    fn fit_loadings_given_latent(
        &self,
        latent: ArrayView2<f64>,
        parameters: &BlockParameters,
        l1: f64,
        steps: usize,
    ) -> BlockParameters {
        let step = 1.0 / (0.5 * design_norm_squared(latent));
        let mut next = parameters.clone();
        for _ in 0..steps {
            let (probabilities, _) = self.softmax(&next.linear_predictor(latent));
            let residual = &self.indicators - &probabilities;
            proximal_step(&mut next, latent, &residual, step, l1);
        }
        next
    }
}
