//! Permutation-invariant scores for recovered topic models.
//!
//! Topic indices are not identifiable: a perfect recovery may come back
//! with its rows in any order. Every score here is therefore invariant
//! under relabeling — best-match alignment for the similarity/divergence
//! scores, cluster agreement for the adjusted Rand index.
//!
//! A failure while scoring one condition is a [`MetricComputationError`];
//! callers record the condition as skipped and keep going, never aborting
//! the batch.

use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rand::Rng;
use thiserror::Error;

use crate::{
    learner::{IncrementalLearner, LearnerError},
    sampler::GroundTruth,
    state::TopicModelState,
    vocab::{Document, Vectorizer},
};

/// Regularizer added to both distributions before a KL comparison.
const KL_EPSILON: f64 = 1e-10;

/// Pairwise-divergence statistics sample at most this many unordered pairs.
const MAX_SAMPLED_PAIRS: usize = 100;

#[derive(Debug, Error)]
/// A metric that could not be computed for one condition.
pub enum MetricComputationError {
    #[error("metric needs at least {required} rows, got {found}")]
    NotEnoughRows { required: usize, found: usize },

    #[error("assignment vectors have different lengths: {left} vs {right}")]
    AssignmentLengthMismatch { left: usize, right: usize },

    #[error("metric produced a non-finite value")]
    NonFinite,

    #[error(transparent)]
    Inference(#[from] LearnerError),
}

/// The five scores of one evaluated study condition.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Scores {
    /// Mean pairwise KL divergence over ground-truth θ rows — how distinct
    /// the document mixtures are from each other.
    pub avg_kl_divergence_theta: f64,
    /// Mean pairwise KL divergence over ground-truth φ rows.
    pub avg_kl_divergence_phi: f64,
    /// Mean over ground-truth topics of the best cosine match among
    /// estimated topics.
    pub avg_max_cosine_similarity: f64,
    /// Mean over ground-truth topics of the closest estimated topic by KL.
    pub avg_min_kl_divergence: f64,
    /// Adjusted Rand index between arg-max document assignments under θ
    /// and θ̂.
    pub adjusted_rand_index: f64,
}

/// ε-regularized KL divergence between two nonnegative vectors.
///
/// Both sides are normalized, shifted by [`KL_EPSILON`] and renormalized,
/// so zero entries on either side cannot blow up the logarithm.
fn kl_divergence(p: ArrayView1<f64>, q: ArrayView1<f64>) -> f64 {
    let p_total: f64 = p.sum();
    let q_total: f64 = q.sum();
    let n = p.len() as f64;
    // After adding ε to each normalized entry the mass is 1 + nε.
    let p_norm = 1.0 + n * KL_EPSILON;
    let q_norm = 1.0 + n * KL_EPSILON;
    p.iter()
        .zip(q.iter())
        .map(|(&pi, &qi)| {
            let pi = (pi / p_total + KL_EPSILON) / p_norm;
            let qi = (qi / q_total + KL_EPSILON) / q_norm;
            pi * (pi / qi).ln()
        })
        .sum()
}

fn cosine_similarity(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    let dot = a.dot(&b);
    let norms = a.dot(&a).sqrt() * b.dot(&b).sqrt();
    if norms == 0.0 {
        0.0
    } else {
        dot / norms
    }
}

fn comb2(n: u64) -> u64 {
    n * n.saturating_sub(1) / 2
}

/// Permutation-invariant comparisons between ground truth and estimate.
pub struct EvaluationEngine;

impl EvaluationEngine {
    /// Mean ε-regularized KL divergence over up to [`MAX_SAMPLED_PAIRS`]
    /// unordered row pairs, sampled without replacement when more exist.
    ///
    /// This is a self-consistency statistic of a single matrix (how far
    /// apart its rows are), not a truth-vs-estimate comparison.
    pub fn average_kl_divergence<R: Rng>(
        rows: ArrayView2<f64>,
        rng: &mut R,
    ) -> Result<f64, MetricComputationError> {
        let m = rows.nrows();
        if m < 2 {
            return Err(MetricComputationError::NotEnoughRows {
                required: 2,
                found: m,
            });
        }
        let mut pairs = Vec::with_capacity(m * (m - 1) / 2);
        for i in 0..m {
            for j in (i + 1)..m {
                pairs.push((i, j));
            }
        }
        let chosen: Vec<(usize, usize)> = if pairs.len() > MAX_SAMPLED_PAIRS {
            rand::seq::index::sample(rng, pairs.len(), MAX_SAMPLED_PAIRS)
                .iter()
                .map(|idx| pairs[idx])
                .collect()
        } else {
            pairs
        };
        let total: f64 = chosen
            .iter()
            .map(|&(i, j)| kl_divergence(rows.row(i), rows.row(j)))
            .sum();
        finite(total / chosen.len() as f64)
    }

    /// For each ground-truth topic row, the best cosine match among the
    /// estimated rows, averaged. Robust to `K ≠ K̂`.
    pub fn average_max_cosine_similarity(
        phi: ArrayView2<f64>,
        phi_hat: ArrayView2<f64>,
    ) -> Result<f64, MetricComputationError> {
        require_rows(phi, phi_hat)?;
        let total: f64 = phi
            .axis_iter(Axis(0))
            .map(|p| {
                phi_hat
                    .axis_iter(Axis(0))
                    .map(|q| cosine_similarity(p, q))
                    .fold(f64::NEG_INFINITY, f64::max)
            })
            .sum();
        finite(total / phi.nrows() as f64)
    }

    /// For each ground-truth topic row, the closest estimated row by
    /// ε-regularized KL divergence, averaged. The shape-sensitive
    /// counterpart to the cosine score.
    pub fn average_min_kl_divergence(
        phi: ArrayView2<f64>,
        phi_hat: ArrayView2<f64>,
    ) -> Result<f64, MetricComputationError> {
        require_rows(phi, phi_hat)?;
        let total: f64 = phi
            .axis_iter(Axis(0))
            .map(|p| {
                phi_hat
                    .axis_iter(Axis(0))
                    .map(|q| kl_divergence(p, q))
                    .fold(f64::INFINITY, f64::min)
            })
            .sum();
        finite(total / phi.nrows() as f64)
    }

    /// Arg-max topic assignment per θ row.
    pub fn argmax_assignments(theta: ArrayView2<f64>) -> Vec<usize> {
        theta
            .axis_iter(Axis(0))
            .map(|row| {
                row.iter()
                    .enumerate()
                    .max_by(|(_, a), (_, b)| a.total_cmp(b))
                    .map(|(i, _)| i)
                    .unwrap_or(0)
            })
            .collect()
    }

    /// Adjusted Rand index between two label sequences of equal length.
    ///
    /// Chance-corrected cluster agreement, invariant to any relabeling of
    /// either side. Degenerate partitions (everything in one cluster on
    /// both sides, or a single document) score 1.
    pub fn adjusted_rand_index(
        left: &[usize],
        right: &[usize],
    ) -> Result<f64, MetricComputationError> {
        if left.len() != right.len() {
            return Err(MetricComputationError::AssignmentLengthMismatch {
                left: left.len(),
                right: right.len(),
            });
        }
        let n = left.len() as u64;
        if n == 0 {
            return Err(MetricComputationError::NotEnoughRows {
                required: 1,
                found: 0,
            });
        }

        let k_left = left.iter().max().map(|&m| m + 1).unwrap_or(0);
        let k_right = right.iter().max().map(|&m| m + 1).unwrap_or(0);
        let mut contingency = vec![vec![0u64; k_right]; k_left];
        for (&a, &b) in left.iter().zip(right.iter()) {
            contingency[a][b] += 1;
        }

        let sum_cells: u64 = contingency
            .iter()
            .flat_map(|row| row.iter())
            .map(|&c| comb2(c))
            .sum();
        let sum_left: u64 = contingency.iter().map(|row| comb2(row.iter().sum())).sum();
        let sum_right: u64 = (0..k_right)
            .map(|j| comb2(contingency.iter().map(|row| row[j]).sum()))
            .sum();

        let pairs = comb2(n);
        if pairs == 0 {
            return Ok(1.0);
        }
        let expected = sum_left as f64 * sum_right as f64 / pairs as f64;
        let max_index = (sum_left + sum_right) as f64 / 2.0;
        if (max_index - expected).abs() < f64::EPSILON {
            return Ok(1.0);
        }
        finite((sum_cells as f64 - expected) / (max_index - expected))
    }

    /// Scores a recovered model against its ground truth.
    ///
    /// θ̂ is inferred from the documents through the fitted state, φ̂ is the
    /// state's topic-word weight matrix (cosine and KL both normalize per
    /// row, so the unnormalized weights compare correctly).
    pub fn evaluate<R: Rng>(
        truth: &GroundTruth,
        state: &TopicModelState,
        documents: &[Document],
        vectorizer: &Vectorizer,
        rng: &mut R,
    ) -> Result<Scores, MetricComputationError> {
        let counts = vectorizer.vectorize(documents);
        let theta_hat = IncrementalLearner::infer(state, &counts)?;
        let phi_hat: &Array2<f64> = state.components();

        let avg_kl_divergence_theta = Self::average_kl_divergence(truth.theta.view(), rng)?;
        let avg_kl_divergence_phi = Self::average_kl_divergence(truth.phi.view(), rng)?;
        let avg_max_cosine_similarity =
            Self::average_max_cosine_similarity(truth.phi.view(), phi_hat.view())?;
        let avg_min_kl_divergence =
            Self::average_min_kl_divergence(truth.phi.view(), phi_hat.view())?;
        let adjusted_rand_index = Self::adjusted_rand_index(
            &Self::argmax_assignments(truth.theta.view()),
            &Self::argmax_assignments(theta_hat.view()),
        )?;

        Ok(Scores {
            avg_kl_divergence_theta,
            avg_kl_divergence_phi,
            avg_max_cosine_similarity,
            avg_min_kl_divergence,
            adjusted_rand_index,
        })
    }
}

fn require_rows(
    phi: ArrayView2<f64>,
    phi_hat: ArrayView2<f64>,
) -> Result<(), MetricComputationError> {
    let found = phi.nrows().min(phi_hat.nrows());
    if found == 0 {
        return Err(MetricComputationError::NotEnoughRows { required: 1, found });
    }
    Ok(())
}

fn finite(value: f64) -> Result<f64, MetricComputationError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(MetricComputationError::NonFinite)
    }
}
