//! Synthetic corpora from the LDA generative process.
//!
//! For each of `K` topics a word distribution `φ_k ~ Dirichlet(β)` is
//! drawn, for each of `M` documents a topic mixture `θ_i ~ Dirichlet(α)`.
//! A document is then `N` words: a multinomial draw splits `N` over the
//! topics according to `θ_i`, each topic contributes a multinomial draw of
//! word indices from `φ_k`, and the concatenation is shuffled uniformly so
//! no positional trace of the topic blocks survives for the learner to
//! exploit. Tokens are the stringified word indices, so they compose
//! directly with [`Vocabulary::indexed`](crate::vocab::Vocabulary::indexed).
//!
//! Everything is drawn from the caller-owned generator, so a fixed seed
//! reproduces the corpus byte for byte — replications are indexed by seed.

use ndarray::{Array2, Axis};
use rand::{distributions::WeightedIndex, prelude::Distribution, seq::SliceRandom, Rng};
use rand_distr::Dirichlet;
use thiserror::Error;

use crate::vocab::Document;

#[derive(Debug, Error)]
/// Errors raised while validating the generative parameters.
pub enum SamplerError {
    #[error("alpha prior has {found} entries for {expected} topics")]
    AlphaLength { expected: usize, found: usize },

    #[error("beta prior is empty")]
    EmptyBeta,

    #[error("topic count must be at least 1")]
    NoTopics,

    #[error("invalid dirichlet prior: {0}")]
    InvalidPrior(String),
}

/// The known θ and φ behind a synthetic corpus; generated once per
/// condition and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct GroundTruth {
    /// `M × K`, rows sum to 1.
    pub theta: Array2<f64>,
    /// `K × V`, rows sum to 1.
    pub phi: Array2<f64>,
}

/// A generated corpus together with its ground truth.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticCorpus {
    pub documents: Vec<Document>,
    pub truth: GroundTruth,
}

/// Draws `rows` independent Dirichlet vectors over `prior` and stacks them.
///
/// A single-entry prior degenerates to the point mass `[1.0]`, which the
/// Dirichlet in `rand_distr` cannot represent.
fn dirichlet_rows<R: Rng>(
    prior: &[f64],
    rows: usize,
    rng: &mut R,
) -> Result<Array2<f64>, SamplerError> {
    let dim = prior.len();
    let mut out = Array2::<f64>::zeros((rows, dim));
    if dim == 1 {
        out.fill(1.0);
        return Ok(out);
    }
    let dirichlet =
        Dirichlet::new(prior).map_err(|e| SamplerError::InvalidPrior(e.to_string()))?;
    for mut row in out.axis_iter_mut(Axis(0)) {
        let draw = dirichlet.sample(rng);
        for (slot, v) in row.iter_mut().zip(draw) {
            *slot = v;
        }
    }
    // Guard against floating-point row sums drifting off 1.
    for mut row in out.axis_iter_mut(Axis(0)) {
        let total = row.sum();
        row.mapv_inplace(|v| v / total);
    }
    Ok(out)
}

/// Draws a multinomial count vector: `n` categorical draws over `weights`,
/// tallied per category.
fn multinomial_counts<R: Rng>(
    n: usize,
    weights: ndarray::ArrayView1<f64>,
    rng: &mut R,
) -> Result<Vec<usize>, SamplerError> {
    let index = WeightedIndex::new(weights.iter().cloned())
        .map_err(|e| SamplerError::InvalidPrior(e.to_string()))?;
    let mut counts = vec![0usize; weights.len()];
    for _ in 0..n {
        counts[index.sample(rng)] += 1;
    }
    Ok(counts)
}

/// The LDA generative process over a caller-owned random source.
pub struct GenerativeSampler;

impl GenerativeSampler {
    /// Generates `n_docs` documents of exactly `n_words` tokens each, plus
    /// the θ and φ they were drawn from.
    ///
    /// `alpha` must have one entry per topic; `beta`'s length is the
    /// vocabulary size.
    pub fn sample<R: Rng>(
        n_docs: usize,
        n_topics: usize,
        n_words: usize,
        alpha: &[f64],
        beta: &[f64],
        rng: &mut R,
    ) -> Result<SyntheticCorpus, SamplerError> {
        if n_topics == 0 {
            return Err(SamplerError::NoTopics);
        }
        if alpha.len() != n_topics {
            return Err(SamplerError::AlphaLength {
                expected: n_topics,
                found: alpha.len(),
            });
        }
        if beta.is_empty() {
            return Err(SamplerError::EmptyBeta);
        }

        let phi = dirichlet_rows(beta, n_topics, rng)?;
        let theta = dirichlet_rows(alpha, n_docs, rng)?;

        let mut documents = Vec::with_capacity(n_docs);
        for theta_i in theta.axis_iter(Axis(0)) {
            // Split the document's word budget over the topics in one go.
            let words_per_topic = multinomial_counts(n_words, theta_i, rng)?;

            let mut tokens: Vec<String> = Vec::with_capacity(n_words);
            for (topic, &count) in words_per_topic.iter().enumerate() {
                if count == 0 {
                    continue;
                }
                let word_counts = multinomial_counts(count, phi.row(topic), rng)?;
                for (word, &occurrences) in word_counts.iter().enumerate() {
                    for _ in 0..occurrences {
                        tokens.push(word.to_string());
                    }
                }
            }
            // Remove the residual topic-block ordering signal.
            tokens.shuffle(rng);
            documents.push(Document::from_tokens(tokens));
        }

        Ok(SyntheticCorpus {
            documents,
            truth: GroundTruth { theta, phi },
        })
    }
}
