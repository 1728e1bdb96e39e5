//! Lossless text encoding of a [`TopicModelState`].
//!
//! # Wire format
//!
//! ```text
//! {
//!     "model_params": {
//!         "n_topics": 5,
//!         "doc_topic_prior": 0.2,
//!         "topic_word_prior": 0.2,
//!         "learning_decay": 0.7,
//!         "learning_offset": 10.0,
//!         "max_doc_update_iter": 100,
//!         "total_samples": 1000000.0,
//!         "batch_iteration": 3,
//!         "components": [[...], ...],              // K x V, row-major
//!         "exp_dirichlet_component": [[...], ...]  // same shape
//!     },
//!     "random_state": {
//!         "algorithm": "chacha20",
//!         "seed": [...],          // 32 bytes
//!         "word_pos": [hi, lo],   // u128 split into u64 halves, big end first
//!         "stream": 0
//!     }
//! }
//! ```
//!
//! or the literal sentinel [`NOT_INITIALIZED`], which decodes to a fresh
//! state for a caller-supplied topic count.
//!
//! The generator is `ChaCha20` and `random_state` is its *complete*
//! internal state: seed, word position and stream id. Restoring those
//! three values reproduces the exact draw sequence of an uninterrupted
//! run. Reseeding from some derived scalar would not — every draw after
//! the boundary would diverge — so the codec deliberately refuses any
//! other `algorithm` tag instead of approximating.

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use ndarray::Array2;

use crate::state::{ModelConfig, TopicModelState};

/// The sentinel a run record holds before its first training turn.
pub const NOT_INITIALIZED: &str = "not initialized";

#[derive(Debug, Error)]
/// A state blob that cannot be decoded.
///
/// Decoding is all-or-nothing: the caller must treat this as unrecoverable
/// for the participant turn it occurred in, since the blob itself is
/// presumed corrupt.
pub enum MalformedStateError {
    #[error("state blob is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("component matrix rows have inconsistent widths")]
    RaggedMatrix,

    #[error("component matrix has {rows} rows for {n_topics} topics")]
    TopicCountMismatch { rows: usize, n_topics: usize },

    #[error("components and exp_dirichlet_component have different shapes")]
    ShapeMismatch,

    #[error("unsupported random state algorithm {0:?}")]
    UnknownAlgorithm(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct WireModel {
    model_params: WireParams,
    random_state: WireRandomState,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireParams {
    n_topics: usize,
    doc_topic_prior: f64,
    topic_word_prior: f64,
    learning_decay: f64,
    learning_offset: f64,
    max_doc_update_iter: usize,
    total_samples: f64,
    batch_iteration: u64,
    components: Vec<Vec<f64>>,
    exp_dirichlet_component: Vec<Vec<f64>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireRandomState {
    algorithm: String,
    seed: [u8; 32],
    word_pos: [u64; 2],
    stream: u64,
}

const CHACHA20: &str = "chacha20";

impl WireRandomState {
    fn capture(rng: &ChaCha20Rng) -> Self {
        let word_pos = rng.get_word_pos();
        Self {
            algorithm: CHACHA20.to_string(),
            seed: rng.get_seed(),
            word_pos: [(word_pos >> 64) as u64, word_pos as u64],
            stream: rng.get_stream(),
        }
    }

    fn restore(&self) -> Result<ChaCha20Rng, MalformedStateError> {
        if self.algorithm != CHACHA20 {
            return Err(MalformedStateError::UnknownAlgorithm(self.algorithm.clone()));
        }
        let mut rng = ChaCha20Rng::from_seed(self.seed);
        rng.set_stream(self.stream);
        rng.set_word_pos(((self.word_pos[0] as u128) << 64) | self.word_pos[1] as u128);
        Ok(rng)
    }
}

fn to_nested(matrix: &Array2<f64>) -> Vec<Vec<f64>> {
    matrix.outer_iter().map(|row| row.to_vec()).collect()
}

fn from_nested(
    nested: Vec<Vec<f64>>,
    n_topics: usize,
) -> Result<Array2<f64>, MalformedStateError> {
    if nested.len() != n_topics {
        return Err(MalformedStateError::TopicCountMismatch {
            rows: nested.len(),
            n_topics,
        });
    }
    let width = nested.first().map(Vec::len).unwrap_or(0);
    if nested.iter().any(|row| row.len() != width) {
        return Err(MalformedStateError::RaggedMatrix);
    }
    let data: Vec<f64> = nested.into_iter().flatten().collect();
    Array2::from_shape_vec((n_topics, width), data)
        .map_err(|_| MalformedStateError::RaggedMatrix)
}

/// Total, lossless round-trip codec for [`TopicModelState`].
pub struct StateCodec;

impl StateCodec {
    /// Serializes the full state, generator included, to a JSON blob.
    pub fn encode(state: &TopicModelState) -> Result<String, MalformedStateError> {
        let wire = WireModel {
            model_params: WireParams {
                n_topics: state.n_topics,
                doc_topic_prior: state.doc_topic_prior,
                topic_word_prior: state.topic_word_prior,
                learning_decay: state.learning_decay,
                learning_offset: state.learning_offset,
                max_doc_update_iter: state.max_doc_update_iter,
                total_samples: state.total_samples,
                batch_iteration: state.batch_iteration,
                components: to_nested(&state.components),
                exp_dirichlet_component: to_nested(&state.exp_dirichlet_component),
            },
            random_state: WireRandomState::capture(&state.rng),
        };
        Ok(serde_json::to_string(&wire)?)
    }

    /// Decodes a blob back into a state.
    ///
    /// The sentinel [`NOT_INITIALIZED`] yields a fresh state built from
    /// `config`; anything else must be a complete wire model.
    pub fn decode(blob: &str, config: ModelConfig) -> Result<TopicModelState, MalformedStateError> {
        if blob.trim() == NOT_INITIALIZED {
            return Ok(TopicModelState::new(config));
        }
        let wire: WireModel = serde_json::from_str(blob)?;
        let params = wire.model_params;
        let components = from_nested(params.components, params.n_topics)?;
        let exp_dirichlet_component =
            from_nested(params.exp_dirichlet_component, params.n_topics)?;
        if components.shape() != exp_dirichlet_component.shape() {
            return Err(MalformedStateError::ShapeMismatch);
        }
        Ok(TopicModelState {
            n_topics: params.n_topics,
            doc_topic_prior: params.doc_topic_prior,
            topic_word_prior: params.topic_word_prior,
            learning_decay: params.learning_decay,
            learning_offset: params.learning_offset,
            max_doc_update_iter: params.max_doc_update_iter,
            total_samples: params.total_samples,
            batch_iteration: params.batch_iteration,
            components,
            exp_dirichlet_component,
            rng: wire.random_state.restore()?,
        })
    }
}
