//! One online variational-Bayes mini-batch step.
//!
//! [`IncrementalLearner::update`] consumes a state and a count-vector batch
//! and returns the successor state: per-document topic responsibilities γ
//! are re-estimated against the cached `exp(E[log β])`, the resulting
//! sufficient statistics are blended into λ with the learning rate
//! `ρ = (offset + iteration)^(-decay)`, and the iteration counter moves up
//! by exactly one. Because ρ ∈ (0, 1), each step is a convex blend of old
//! and new statistics and repeated updates settle instead of oscillating.
//!
//! [`IncrementalLearner::infer`] is the read-only counterpart used by the
//! evaluation engine: it recovers document-topic mixtures θ̂ from a count
//! matrix without touching the persisted state.

use ndarray::{Array1, Array2, Axis};
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Gamma};
use thiserror::Error;

use crate::{
    math::dirichlet_expectation,
    state::{TopicModelState, EPS, MEAN_CHANGE_TOL},
    vocab::VocabularyMismatchError,
};

#[derive(Debug, Error)]
/// Errors surfaced by the incremental update or the inference step.
pub enum LearnerError {
    #[error(transparent)]
    Vocabulary(#[from] VocabularyMismatchError),

    #[error("cannot infer document-topic mixtures from an unfitted model")]
    NotFitted,
}

/// The outcome of fitting γ for a single document.
struct DocFit {
    /// `exp(E[log θ_d])` at convergence.
    exp_doc_topic: Array1<f64>,
    /// γ_d at convergence.
    gamma: Array1<f64>,
}

/// Iterates the variational γ update for one document until the mean
/// absolute change drops below tolerance or the iteration cap is hit.
///
/// `exp_topic_word` is the `K × n` column selection of the exp-dirichlet
/// cache for the document's observed word ids, `counts` the matching
/// occurrence counts.
fn fit_document(
    exp_topic_word: &Array2<f64>,
    counts: &[f64],
    gamma_init: Array1<f64>,
    doc_topic_prior: f64,
    max_iter: usize,
) -> DocFit {
    let k = exp_topic_word.nrows();
    let n = counts.len();
    let mut gamma = gamma_init;
    let mut exp_doc_topic = dirichlet_expectation(gamma.view()).mapv(f64::exp);

    for _ in 0..max_iter {
        let last = gamma.clone();

        // norm_phi[j] = Σ_k exp_doc_topic[k] · exp_topic_word[k, j]
        let mut norm_phi = vec![EPS; n];
        for (j, slot) in norm_phi.iter_mut().enumerate() {
            for t in 0..k {
                *slot += exp_doc_topic[t] * exp_topic_word[[t, j]];
            }
        }

        for t in 0..k {
            let mut acc = 0.0;
            for j in 0..n {
                acc += counts[j] / norm_phi[j] * exp_topic_word[[t, j]];
            }
            gamma[t] = doc_topic_prior + exp_doc_topic[t] * acc;
        }
        exp_doc_topic = dirichlet_expectation(gamma.view()).mapv(f64::exp);

        let mean_change = gamma
            .iter()
            .zip(last.iter())
            .map(|(a, b)| (a - b).abs())
            .sum::<f64>()
            / k as f64;
        if mean_change < MEAN_CHANGE_TOL {
            break;
        }
    }

    DocFit {
        exp_doc_topic,
        gamma,
    }
}

/// Pulls the observed word ids and counts out of one count-vector row.
fn observed_words(row: ndarray::ArrayView1<f64>) -> (Vec<usize>, Vec<f64>) {
    let mut ids = Vec::new();
    let mut counts = Vec::new();
    for (w, &c) in row.iter().enumerate() {
        if c > 0.0 {
            ids.push(w);
            counts.push(c);
        }
    }
    (ids, counts)
}

fn draw_gamma_init(k: usize, rng: &mut ChaCha20Rng) -> Array1<f64> {
    let gamma = Gamma::new(100.0, 0.01).expect("valid gamma shape and scale");
    Array1::from_iter((0..k).map(|_| gamma.sample(rng)))
}

/// The single mini-batch update over a vectorized document batch.
pub struct IncrementalLearner;

impl IncrementalLearner {
    /// Performs one online variational-Bayes step and returns the
    /// successor state.
    ///
    /// `K` and the vocabulary width are invariant across calls; the first
    /// batch a fresh state sees fixes the width. An empty batch is a no-op
    /// apart from the iteration increment.
    ///
    /// # Errors
    /// [`LearnerError::Vocabulary`] if the batch width differs from the
    /// width the state was fit with.
    pub fn update(
        mut state: TopicModelState,
        batch: &Array2<f64>,
    ) -> Result<TopicModelState, LearnerError> {
        if batch.nrows() == 0 {
            state.batch_iteration += 1;
            return Ok(state);
        }
        if state.components.ncols() == 0 {
            state.initialize_components(batch.ncols());
        }
        let v = state.components.ncols();
        if batch.ncols() != v {
            return Err(VocabularyMismatchError {
                expected: v,
                found: batch.ncols(),
            }
            .into());
        }

        let k = state.n_topics;
        let rho = state.learning_rate();
        let mut sstats = Array2::<f64>::zeros((k, v));

        for row in batch.axis_iter(Axis(0)) {
            let (ids, counts) = observed_words(row);
            let gamma_init = draw_gamma_init(k, &mut state.rng);
            if ids.is_empty() {
                continue;
            }
            let exp_topic_word = state.exp_dirichlet_component.select(Axis(1), &ids);
            let fit = fit_document(
                &exp_topic_word,
                &counts,
                gamma_init,
                state.doc_topic_prior,
                state.max_doc_update_iter,
            );

            let mut norm_phi = vec![EPS; ids.len()];
            for (j, slot) in norm_phi.iter_mut().enumerate() {
                for t in 0..k {
                    *slot += fit.exp_doc_topic[t] * exp_topic_word[[t, j]];
                }
            }
            for t in 0..k {
                for (j, &w) in ids.iter().enumerate() {
                    sstats[[t, w]] += fit.exp_doc_topic[t] * counts[j] / norm_phi[j];
                }
            }
        }
        sstats *= &state.exp_dirichlet_component;

        // Convex blend of old and new sufficient statistics, with the
        // batch grossed up to the corpus scale.
        let doc_ratio = state.total_samples / batch.nrows() as f64;
        let eta = state.topic_word_prior;
        state.components = state.components.mapv(|old| old * (1.0 - rho))
            + sstats.mapv(|s| rho * (eta + doc_ratio * s));
        state.refresh_exp_cache();
        state.batch_iteration += 1;
        Ok(state)
    }

    /// Recovers the document-topic mixtures θ̂ for a count matrix.
    ///
    /// Runs the same γ iteration as [`update`](Self::update) against the
    /// current topic-word cache and returns row-normalized γ. The state is
    /// not mutated; the generator is cloned for the γ initializations so
    /// the persisted draw sequence stays untouched.
    ///
    /// # Errors
    /// [`LearnerError::NotFitted`] before the first batch,
    /// [`LearnerError::Vocabulary`] on a width mismatch.
    pub fn infer(
        state: &TopicModelState,
        counts: &Array2<f64>,
    ) -> Result<Array2<f64>, LearnerError> {
        let v = state.n_features().ok_or(LearnerError::NotFitted)?;
        if counts.ncols() != v {
            return Err(VocabularyMismatchError {
                expected: v,
                found: counts.ncols(),
            }
            .into());
        }

        let k = state.n_topics;
        let mut rng = state.rng.clone();
        let mut theta = Array2::<f64>::zeros((counts.nrows(), k));
        for (d, row) in counts.axis_iter(Axis(0)).enumerate() {
            let (ids, cnts) = observed_words(row);
            let gamma_init = draw_gamma_init(k, &mut rng);
            let gamma = if ids.is_empty() {
                // A document with no in-vocabulary words carries no
                // evidence; γ collapses to the symmetric prior.
                Array1::from_elem(k, state.doc_topic_prior)
            } else {
                let exp_topic_word = state.exp_dirichlet_component.select(Axis(1), &ids);
                fit_document(
                    &exp_topic_word,
                    &cnts,
                    gamma_init,
                    state.doc_topic_prior,
                    state.max_doc_update_iter,
                )
                .gamma
            };
            let total = gamma.sum();
            for t in 0..k {
                theta[[d, t]] = gamma[t] / total;
            }
        }
        Ok(theta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::StateCodec,
        sampler::GenerativeSampler,
        state::ModelConfig,
        vocab::{Vectorizer, Vocabulary},
    };
    use rand::SeedableRng;

    fn batch(seed: u64, n_docs: usize, vocab_size: usize) -> Array2<f64> {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let alpha = vec![0.1; 3];
        let beta = vec![0.1; vocab_size];
        let corpus = GenerativeSampler::sample(n_docs, 3, 20, &alpha, &beta, &mut rng).unwrap();
        Vectorizer::new(Vocabulary::indexed(vocab_size)).vectorize(&corpus.documents)
    }

    #[test]
    fn iteration_counter_increases_by_one_per_update() {
        let mut state = TopicModelState::new(ModelConfig::new(3));
        let counts = batch(1, 4, 25);
        for expected in 1..=5 {
            state = IncrementalLearner::update(state, &counts).unwrap();
            assert_eq!(state.batch_iteration(), expected);
        }
    }

    #[test]
    fn topic_and_vocabulary_dimensions_are_invariant() {
        let state = TopicModelState::new(ModelConfig::new(3));
        let counts = batch(2, 4, 25);
        let state = IncrementalLearner::update(state, &counts).unwrap();
        assert_eq!(state.components().shape(), &[3, 25]);
        let state = IncrementalLearner::update(state, &counts).unwrap();
        assert_eq!(state.components().shape(), &[3, 25]);
        assert!(state.components().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn empty_batch_only_increments_the_counter() {
        let state = TopicModelState::new(ModelConfig::new(3));
        let state = IncrementalLearner::update(state, &batch(3, 4, 25)).unwrap();
        let before = state.components().clone();
        let empty = Array2::<f64>::zeros((0, 25));
        let state = IncrementalLearner::update(state, &empty).unwrap();
        assert_eq!(state.batch_iteration(), 2);
        assert_eq!(state.components(), &before);
    }

    #[test]
    fn mismatched_vocabulary_width_is_rejected() {
        let state = TopicModelState::new(ModelConfig::new(3));
        let state = IncrementalLearner::update(state, &batch(4, 4, 25)).unwrap();
        let wrong = Array2::<f64>::zeros((2, 26));
        assert!(matches!(
            IncrementalLearner::update(state, &wrong),
            Err(LearnerError::Vocabulary(_))
        ));
    }

    #[test]
    fn resumption_across_the_codec_boundary_is_exact() {
        let first = batch(5, 3, 25);
        let second = batch(6, 3, 25);

        let in_process = {
            let state = TopicModelState::new(ModelConfig::with_seed(3, 11));
            let state = IncrementalLearner::update(state, &first).unwrap();
            IncrementalLearner::update(state, &second).unwrap()
        };

        let across_boundary = {
            let state = TopicModelState::new(ModelConfig::with_seed(3, 11));
            let state = IncrementalLearner::update(state, &first).unwrap();
            let blob = StateCodec::encode(&state).unwrap();
            let state = StateCodec::decode(&blob, ModelConfig::with_seed(3, 11)).unwrap();
            let state = IncrementalLearner::update(state, &second).unwrap();
            let blob = StateCodec::encode(&state).unwrap();
            StateCodec::decode(&blob, ModelConfig::with_seed(3, 11)).unwrap()
        };

        assert_eq!(in_process, across_boundary);
    }

    #[test]
    fn infer_returns_row_normalized_mixtures() {
        let state = TopicModelState::new(ModelConfig::new(3));
        let counts = batch(7, 6, 25);
        let state = IncrementalLearner::update(state, &counts).unwrap();
        let theta = IncrementalLearner::infer(&state, &counts).unwrap();
        assert_eq!(theta.shape(), &[6, 3]);
        for row in theta.axis_iter(Axis(0)) {
            assert!((row.sum() - 1.0).abs() < 1e-9);
            assert!(row.iter().all(|&p| p >= 0.0));
        }
    }

    #[test]
    fn infer_requires_a_fitted_model() {
        let state = TopicModelState::new(ModelConfig::new(3));
        let counts = Array2::<f64>::zeros((1, 25));
        assert!(matches!(
            IncrementalLearner::infer(&state, &counts),
            Err(LearnerError::NotFitted)
        ));
    }

    #[test]
    fn infer_does_not_mutate_the_state() {
        let state = TopicModelState::new(ModelConfig::new(3));
        let counts = batch(8, 4, 25);
        let state = IncrementalLearner::update(state, &counts).unwrap();
        let snapshot = state.clone();
        let _ = IncrementalLearner::infer(&state, &counts).unwrap();
        assert_eq!(state, snapshot);
    }
}
