//! The serializable snapshot of an online variational-Bayes LDA learner.
//!
//! [`TopicModelState`] carries everything an update step depends on: the
//! unnormalized topic-word weights λ, their cached `exp(E[log β])`
//! companion, the Dirichlet priors, the learning-rate schedule, the batch
//! iteration counter and the learner's own pseudo-random generator. The
//! invariant the whole system rests on: encoding a state, decoding it and
//! resuming training is bit-identical to never having paused, which is why
//! the generator lives *inside* the state rather than being reseeded at
//! the boundary.

use ndarray::Array2;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Gamma};

use crate::math::dirichlet_expectation_2d;

/// E-step convergence tolerance on the mean absolute γ change.
pub(crate) const MEAN_CHANGE_TOL: f64 = 1e-3;

/// Floor added to φ normalizers to avoid division by zero.
pub(crate) const EPS: f64 = 1e-100;

/// Configuration for a freshly initialized model state.
///
/// `seed` feeds the state-owned generator; it defaults to 42 so that a
/// study re-run from scratch recovers the same model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelConfig {
    pub n_topics: usize,
    pub seed: u64,
}

impl ModelConfig {
    pub fn new(n_topics: usize) -> Self {
        Self { n_topics, seed: 42 }
    }

    pub fn with_seed(n_topics: usize, seed: u64) -> Self {
        Self { n_topics, seed }
    }
}

/// The complete internal state of the incremental learner.
///
/// The topic count `K` and, once the first batch has been seen, the
/// vocabulary width `V` are invariant across updates. The iteration
/// counter increases by exactly one per update.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicModelState {
    pub(crate) n_topics: usize,
    pub(crate) doc_topic_prior: f64,
    pub(crate) topic_word_prior: f64,
    pub(crate) learning_decay: f64,
    pub(crate) learning_offset: f64,
    pub(crate) max_doc_update_iter: usize,
    pub(crate) total_samples: f64,
    pub(crate) batch_iteration: u64,
    /// λ, the unnormalized topic-word weights, `K × V`. `K × 0` until the
    /// first batch fixes the vocabulary width.
    pub(crate) components: Array2<f64>,
    /// Cached `exp(E[log β])`, always the same shape as `components`.
    pub(crate) exp_dirichlet_component: Array2<f64>,
    pub(crate) rng: ChaCha20Rng,
}

impl TopicModelState {
    /// A fresh state for `config.n_topics` topics with default
    /// hyperparameters: symmetric priors `1/K`, decay 0.7, offset 10, a
    /// single mini-batch per update (online mode) and an E-step cap of
    /// 100 inner iterations.
    pub fn new(config: ModelConfig) -> Self {
        let k = config.n_topics;
        let prior = 1.0 / k as f64;
        Self {
            n_topics: k,
            doc_topic_prior: prior,
            topic_word_prior: prior,
            learning_decay: 0.7,
            learning_offset: 10.0,
            max_doc_update_iter: 100,
            total_samples: 1e6,
            batch_iteration: 0,
            components: Array2::zeros((k, 0)),
            exp_dirichlet_component: Array2::zeros((k, 0)),
            rng: ChaCha20Rng::seed_from_u64(config.seed),
        }
    }

    pub fn n_topics(&self) -> usize {
        self.n_topics
    }

    /// The vocabulary width the model was fit with, or `None` before the
    /// first batch.
    pub fn n_features(&self) -> Option<usize> {
        match self.components.ncols() {
            0 => None,
            v => Some(v),
        }
    }

    pub fn batch_iteration(&self) -> u64 {
        self.batch_iteration
    }

    /// The unnormalized topic-word weight matrix λ (`K × V`).
    ///
    /// Rows are per-topic word weights; the evaluation metrics normalize
    /// them where a distribution is required.
    pub fn components(&self) -> &Array2<f64> {
        &self.components
    }

    pub fn doc_topic_prior(&self) -> f64 {
        self.doc_topic_prior
    }

    /// The learning rate `ρ = (offset + iteration)^(-decay)` the *next*
    /// update will blend with. Always in (0, 1] for offset ≥ 1.
    pub fn learning_rate(&self) -> f64 {
        (self.learning_offset + self.batch_iteration as f64).powf(-self.learning_decay)
    }

    /// Fixes the vocabulary width on first contact with data: draws λ from
    /// `Gamma(100, 1/100)` with the state-owned generator and fills the
    /// exp-dirichlet cache.
    pub(crate) fn initialize_components(&mut self, n_features: usize) {
        let gamma = Gamma::new(100.0, 0.01).expect("valid gamma shape and scale");
        let draws: Vec<f64> = (0..self.n_topics * n_features)
            .map(|_| gamma.sample(&mut self.rng))
            .collect();
        self.components = Array2::from_shape_vec((self.n_topics, n_features), draws)
            .expect("draw count matches component shape");
        self.refresh_exp_cache();
    }

    /// Recomputes `exp(E[log β])` from λ.
    pub(crate) fn refresh_exp_cache(&mut self) {
        self.exp_dirichlet_component =
            dirichlet_expectation_2d(self.components.view()).mapv(f64::exp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_has_default_hyperparameters() {
        let state = TopicModelState::new(ModelConfig::new(5));
        assert_eq!(state.n_topics(), 5);
        assert_eq!(state.batch_iteration(), 0);
        assert_eq!(state.n_features(), None);
        assert!((state.doc_topic_prior - 0.2).abs() < 1e-12);
        assert!((state.topic_word_prior - 0.2).abs() < 1e-12);
        assert!((state.learning_decay - 0.7).abs() < 1e-12);
        assert!((state.learning_offset - 10.0).abs() < 1e-12);
    }

    #[test]
    fn same_seed_means_same_state() {
        let a = TopicModelState::new(ModelConfig::with_seed(3, 7));
        let b = TopicModelState::new(ModelConfig::with_seed(3, 7));
        assert_eq!(a, b);
        let c = TopicModelState::new(ModelConfig::with_seed(3, 8));
        assert_ne!(a, c);
    }

    #[test]
    fn initialization_fixes_the_vocabulary_width() {
        let mut state = TopicModelState::new(ModelConfig::new(4));
        state.initialize_components(11);
        assert_eq!(state.n_features(), Some(11));
        assert_eq!(state.components.shape(), &[4, 11]);
        assert_eq!(state.exp_dirichlet_component.shape(), &[4, 11]);
        assert!(state.components.iter().all(|&v| v > 0.0));
        assert!(state.exp_dirichlet_component.iter().all(|&v| v > 0.0));
    }

    #[test]
    fn learning_rate_is_a_convex_weight() {
        let mut state = TopicModelState::new(ModelConfig::new(2));
        let first = state.learning_rate();
        assert!(first > 0.0 && first < 1.0);
        state.batch_iteration = 100;
        assert!(state.learning_rate() < first);
    }
}
