//! # Embedding evaluation
//!
//! Scores two columns of an embedding's score matrix against known labels: a
//! sample is called the positive class iff it lies strictly on the positive side
//! of a line, and every disagreement with its label is a false positive or a false negative.
//!
//! The line can be supplied by the caller or found by [`EmbeddingEvaluator::search`],
//! a deterministic grid over normal directions and offsets that returns the first
//! separator with the fewest errors.

use itertools::Itertools;
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::f64::consts::TAU;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Class '{0}' does not occur among the labels.")]
    UnknownClass(String),

    #[error("The separator grid is empty; at least one angle is required.")]
    EmptyGrid,
}

/// The half-plane `a x + b y + c > 0` with `normal = [a, b]` and `offset = c`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearSeparator {
    pub normal: [f64; 2],
    pub offset: f64,
}

impl LinearSeparator {
    pub fn new(a: f64, b: f64, c: f64) -> Self {
        Self {
            normal: [a, b],
            offset: c,
        }
    }

    /// Points above (`above = true`) or below the line `y = slope x + intercept`.
    pub fn from_slope_intercept(slope: f64, intercept: f64, above: bool) -> Self {
        let sign = if above { 1.0 } else { -1.0 };
        Self::new(-slope * sign, sign, -intercept * sign)
    }

    /// Points right of (`right = true`) or left of the vertical line `x = x0`.
    pub fn vertical(x0: f64, right: bool) -> Self {
        let sign = if right { 1.0 } else { -1.0 };
        Self::new(sign, 0.0, -x0 * sign)
    }

    pub fn is_positive(&self, x: f64, y: f64) -> bool {
        self.normal[0] * x + self.normal[1] * y + self.offset > 0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeparatorEvaluation {
    pub separator: LinearSeparator,
    pub dims: (usize, usize),
    pub positive_class: String,
    pub false_positives: usize,
    pub false_negatives: usize,
    pub n_samples: usize,
}

impl SeparatorEvaluation {
    pub fn errors(&self) -> usize {
        self.false_positives + self.false_negatives
    }

    pub fn misclassification_rate(&self) -> f64 {
        if self.n_samples == 0 {
            0.0
        } else {
            self.errors() as f64 / self.n_samples as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridSearch {
    /// Number of evenly spaced normal directions over a full turn.
    pub angles: usize,
}

impl Default for GridSearch {
    fn default() -> Self {
        Self { angles: 360 }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EmbeddingEvaluator {
    grid: GridSearch,
}

impl EmbeddingEvaluator {
    pub fn new(grid: GridSearch) -> Self {
        Self { grid }
    }

    /// Counts errors of a given separator on embedding columns `dims`.
    pub fn evaluate(
        &self,
        scores: ArrayView2<f64>,
        labels: &[String],
        positive_class: &str,
        dims: (usize, usize),
        separator: &LinearSeparator,
    ) -> Result<SeparatorEvaluation, EvaluationError> {
        let points = checked_points(scores, labels, dims)?;
        let truth = positive_mask(labels, positive_class)?;
        let (false_positives, false_negatives) = count_errors(&points, &truth, separator);
        Ok(SeparatorEvaluation {
            separator: *separator,
            dims,
            positive_class: positive_class.to_string(),
            false_positives,
            false_negatives,
            n_samples: points.len(),
        })
    }

    /// Finds the separator with the fewest errors on the grid.
    pub fn search(
        &self,
        scores: ArrayView2<f64>,
        labels: &[String],
        positive_class: &str,
        dims: (usize, usize),
    ) -> Result<SeparatorEvaluation, EvaluationError> {
        if self.grid.angles == 0 {
            return Err(EvaluationError::EmptyGrid);
        }
        let points = checked_points(scores, labels, dims)?;
        let truth = positive_mask(labels, positive_class)?;

        let mut best: Option<(LinearSeparator, usize, usize)> = None;
        for separator in self.candidates(&points) {
            let (fp, fn_count) = count_errors(&points, &truth, &separator);
            let improves = best
                .as_ref()
                .is_none_or(|(_, bfp, bfn)| fp + fn_count < bfp + bfn);
            if improves {
                best = Some((separator, fp, fn_count));
                if fp + fn_count == 0 {
                    break;
                }
            }
        }

        let (separator, false_positives, false_negatives) = best.ok_or(EvaluationError::EmptyGrid)?;
        log::debug!(
            "Grid search for class '{positive_class}' on dims {dims:?}: {false_positives} FP, {false_negatives} FN"
        );
        Ok(SeparatorEvaluation {
            separator,
            dims,
            positive_class: positive_class.to_string(),
            false_positives,
            false_negatives,
            n_samples: points.len(),
        })
    }

    /// One-vs-rest grid search for every class, in sorted class order.
    pub fn evaluate_all_classes(
        &self,
        scores: ArrayView2<f64>,
        labels: &[String],
        dims: (usize, usize),
    ) -> Result<Vec<SeparatorEvaluation>, EvaluationError> {
        let classes: BTreeSet<&str> = labels.iter().map(String::as_str).collect();
        classes
            .into_iter()
            .map(|class| self.search(scores, labels, class, dims))
            .collect()
    }

    /// Candidate separators in iteration order: for each direction, every offset
    /// between consecutive distinct projections plus one beyond each end.
    fn candidates<'a>(&self, points: &'a [(f64, f64)]) -> impl Iterator<Item = LinearSeparator> + 'a {
        let angles = self.grid.angles;
        (0..angles).flat_map(move |index| {
            let theta = TAU * index as f64 / angles as f64;
            let (a, b) = (theta.cos(), theta.sin());
            let mut projections: Vec<f64> = points.iter().map(|&(x, y)| a * x + b * y).collect();
            projections.sort_by(f64::total_cmp);
            let lowest = projections.first().copied().unwrap_or(0.0);
            let highest = projections.last().copied().unwrap_or(0.0);
            let thresholds: Vec<f64> = std::iter::once(lowest - 1.0)
                .chain(
                    projections
                        .into_iter()
                        .dedup()
                        .tuple_windows()
                        .map(|(lo, hi)| 0.5 * (lo + hi)),
                )
                .chain(std::iter::once(highest + 1.0))
                .collect();
            thresholds
                .into_iter()
                .map(move |t| LinearSeparator::new(a, b, -t))
        })
    }
}

/// `(false positives, false negatives)` of `separator` against `truth`.
pub fn count_errors(points: &[(f64, f64)], truth: &[bool], separator: &LinearSeparator) -> (usize, usize) {
    points
        .iter()
        .zip(truth)
        .fold((0, 0), |(fp, fn_count), (&(x, y), &actual)| {
            match (separator.is_positive(x, y), actual) {
                (true, false) => (fp + 1, fn_count),
                (false, true) => (fp, fn_count + 1),
                _ => (fp, fn_count),
            }
        })
}

fn checked_points(
    scores: ArrayView2<f64>,
    labels: &[String],
    dims: (usize, usize),
) -> Result<Vec<(f64, f64)>, EvaluationError> {
    let n_dims = scores.ncols();
    if n_dims < 2 {
        return Err(EvaluationError::DimensionMismatch(format!(
            "embedding has {n_dims} dimension(s); at least 2 are needed"
        )));
    }
    if dims.0 >= n_dims || dims.1 >= n_dims || dims.0 == dims.1 {
        return Err(EvaluationError::DimensionMismatch(format!(
            "dimensions {dims:?} are not two distinct columns of a {n_dims}-dimensional embedding"
        )));
    }
    if labels.len() != scores.nrows() {
        return Err(EvaluationError::DimensionMismatch(format!(
            "{} labels for {} samples",
            labels.len(),
            scores.nrows()
        )));
    }
    Ok(project(scores, dims))
}

fn project(scores: ArrayView2<f64>, dims: (usize, usize)) -> Vec<(f64, f64)> {
    scores
        .rows()
        .into_iter()
        .map(|row| (row[dims.0], row[dims.1]))
        .collect()
}

fn positive_mask(labels: &[String], positive_class: &str) -> Result<Vec<bool>, EvaluationError> {
    let mask: Vec<bool> = labels.iter().map(|l| l == positive_class).collect();
    if mask.iter().any(|&m| m) {
        Ok(mask)
    } else {
        Err(EvaluationError::UnknownClass(positive_class.to_string()))
    }
}
