//! # fedlda-core: resumable federated topic-model training
//!
//! This crate holds the synchronous, side-effect-free core of a federated,
//! incremental LDA training study: many participants each hold a single
//! private document, and a coordinator builds one shared topic model by
//! handing the serialized model state from participant to participant. No
//! raw documents ever leave a participant; only the encoded sufficient
//! statistics travel.
//!
//! The crate is organized leaf-first:
//!
//! - [`vocab`] — fixed vocabularies, token documents and count
//!   vectorization.
//! - [`state`] — [`TopicModelState`], the complete snapshot of an online
//!   variational-Bayes learner, including its pseudo-random generator.
//! - [`codec`] — [`StateCodec`], the lossless text encoding of a state.
//!   Pausing training, shipping the blob elsewhere and resuming produces
//!   bit-identical results to never having paused.
//! - [`learner`] — [`IncrementalLearner`], one online mini-batch update
//!   and the inference (transform) step.
//! - [`sampler`] — [`GenerativeSampler`], synthetic corpora with known
//!   ground-truth θ and φ drawn from the LDA generative process.
//! - [`metrics`] — [`EvaluationEngine`], permutation-invariant scores
//!   comparing a recovered model against the ground truth.
//!
//! Everything here is deterministic given the seeds involved: the sampler
//! is driven by a caller-owned generator scoped to one replication, while
//! the learner owns a generator that lives inside its serialized state.
//!
//! [`TopicModelState`]: state::TopicModelState
//! [`StateCodec`]: codec::StateCodec
//! [`IncrementalLearner`]: learner::IncrementalLearner
//! [`GenerativeSampler`]: sampler::GenerativeSampler
//! [`EvaluationEngine`]: metrics::EvaluationEngine

pub mod codec;
pub mod learner;
pub(crate) mod math;
pub mod metrics;
pub mod sampler;
pub mod state;
pub mod vocab;

pub use self::{
    codec::{MalformedStateError, StateCodec, NOT_INITIALIZED},
    learner::{IncrementalLearner, LearnerError},
    metrics::{EvaluationEngine, MetricComputationError, Scores},
    sampler::{GenerativeSampler, GroundTruth, SamplerError, SyntheticCorpus},
    state::{ModelConfig, TopicModelState},
    vocab::{Document, Vectorizer, Vocabulary, VocabularyMismatchError},
};
