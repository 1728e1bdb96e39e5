//! The study orchestrator.
//!
//! One condition runs as: generate a synthetic corpus with known ground
//! truth, initialize the study's run records, walk every simulated
//! participant through a claim → decode → update → encode → commit turn,
//! then score the final model against the truth stored in the study
//! description.
//!
//! Participant turns are strictly sequential within a condition, so the
//! trained model is a single chain of incremental updates and the final
//! iteration counter equals the number of successful turns. Failures of a
//! single turn are isolated: a participant that hits a malformed blob or a
//! learner rejection is recorded and skipped, the pass continues. Only
//! storage failures abort the whole condition, there is no model left
//! worth scoring without a working store.

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use fedlda_core::{
    learner::LearnerError,
    metrics::MetricComputationError,
    sampler::{GroundTruth, SamplerError, SyntheticCorpus},
    state::ModelConfig,
    vocab::{Document, Vectorizer, Vocabulary},
    EvaluationEngine, GenerativeSampler, IncrementalLearner, MalformedStateError, StateCodec,
};
use ndarray::Array2;

use crate::{
    report::ConditionOutcome,
    settings::ConditionParams,
    storage::{RunRecordStore, RunUpdate, StorageError},
};

/// Claim attempts per turn before the participant gives up.
const MAX_CLAIM_ATTEMPTS: usize = 3;

/// Where a condition currently stands.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StudyPhase {
    /// No run records exist yet.
    Uninitialized,
    /// Run records exist and participants may claim.
    Ready,
    /// The training pass finished and the model was scored.
    Complete,
}

#[derive(Debug, Error)]
/// Why a single participant turn did not commit an update.
pub enum TurnError {
    /// Every slot is held or already updated by this participant.
    #[error("no run available")]
    NoRunAvailable,

    /// The claim went stale on every attempt.
    #[error("claim went stale {0} times")]
    ClaimExhausted(usize),

    /// The stored blob did not decode. The slot stays held so the blob
    /// can be inspected instead of being trained over.
    #[error("stored model is malformed: {0}")]
    Malformed(#[from] MalformedStateError),

    /// The learner rejected the batch. The slot is released untouched.
    #[error("model update failed: {0}")]
    Learner(#[from] LearnerError),

    /// The store itself failed; aborts the whole condition.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// One recorded turn failure.
#[derive(Debug)]
pub struct TurnFailure {
    pub participant_id: String,
    pub error: TurnError,
}

/// The outcome of one full training pass over all participants.
#[derive(Debug, Default)]
pub struct PassReport {
    /// Turns that committed an update.
    pub committed: usize,
    /// Turns that failed without aborting the pass.
    pub failures: Vec<TurnFailure>,
}

/// The study description blob: everything the evaluation needs to score
/// the trained model, persisted next to the run records.
#[derive(Debug, Serialize, Deserialize)]
struct StudyDescription {
    params: ConditionParams,
    documents: Vec<String>,
    theta: Vec<Vec<f64>>,
    phi: Vec<Vec<f64>>,
}

impl StudyDescription {
    fn from_corpus(params: &ConditionParams, corpus: &SyntheticCorpus) -> Self {
        Self {
            params: params.clone(),
            documents: corpus.documents.iter().map(Document::to_text).collect(),
            theta: to_nested(&corpus.truth.theta),
            phi: to_nested(&corpus.truth.phi),
        }
    }

    fn documents(&self) -> Vec<Document> {
        self.documents
            .iter()
            .map(|text| Document::from_text(text))
            .collect()
    }

    fn truth(&self) -> Option<GroundTruth> {
        Some(GroundTruth {
            theta: from_nested(&self.theta)?,
            phi: from_nested(&self.phi)?,
        })
    }
}

fn to_nested(matrix: &Array2<f64>) -> Vec<Vec<f64>> {
    matrix.outer_iter().map(|row| row.to_vec()).collect()
}

fn from_nested(rows: &[Vec<f64>]) -> Option<Array2<f64>> {
    let ncols = rows.first().map(Vec::len)?;
    let mut flat = Vec::with_capacity(rows.len() * ncols);
    for row in rows {
        if row.len() != ncols {
            return None;
        }
        flat.extend_from_slice(row);
    }
    Array2::from_shape_vec((rows.len(), ncols), flat).ok()
}

/// Drives one condition at a time over a [`RunRecordStore`].
pub struct StudyOrchestrator<S> {
    store: S,
    phase: StudyPhase,
}

impl<S> StudyOrchestrator<S>
where
    S: RunRecordStore,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            phase: StudyPhase::Uninitialized,
        }
    }

    /// The phase of the most recently driven condition.
    pub fn phase(&self) -> StudyPhase {
        self.phase
    }

    /// Runs one condition end to end and returns its outcome.
    ///
    /// A condition that cannot be set up, trained or scored is reported
    /// as skipped rather than failing the whole grid.
    pub async fn run_condition(&mut self, params: &ConditionParams) -> ConditionOutcome {
        self.phase = StudyPhase::Uninitialized;
        info!(study_id = %params.study_id, "starting condition");

        let corpus = match self.generate_corpus(params) {
            Ok(corpus) => corpus,
            Err(e) => return skipped(params, format!("corpus generation failed: {}", e)),
        };

        if let Err(e) = self.initialize(params, &corpus).await {
            return skipped(params, format!("study initialization failed: {}", e));
        }
        self.phase = StudyPhase::Ready;

        let report = match self.training_pass(params).await {
            Ok(report) => report,
            Err(e) => return skipped(params, format!("training pass aborted: {}", e)),
        };
        for failure in &report.failures {
            warn!(
                study_id = %params.study_id,
                participant_id = %failure.participant_id,
                error = %failure.error,
                "participant turn failed",
            );
        }

        let scores = match self.evaluate(params).await {
            Ok(scores) => scores,
            Err(e) => return skipped(params, format!("evaluation failed: {}", e)),
        };
        self.phase = StudyPhase::Complete;
        info!(
            study_id = %params.study_id,
            committed = report.committed,
            failed = report.failures.len(),
            adjusted_rand_index = scores.adjusted_rand_index,
            "condition complete",
        );
        ConditionOutcome::Scored {
            params: params.clone(),
            scores,
        }
    }

    fn generate_corpus(&self, params: &ConditionParams) -> Result<SyntheticCorpus, SamplerError> {
        let mut rng = ChaCha20Rng::seed_from_u64(params.seed);
        GenerativeSampler::sample(
            params.n_participants,
            params.n_topics,
            params.n_words,
            &params.alpha(),
            &params.beta(),
            &mut rng,
        )
    }

    async fn initialize(
        &mut self,
        params: &ConditionParams,
        corpus: &SyntheticCorpus,
    ) -> Result<(), StorageError> {
        let description = serde_json::to_string(&StudyDescription::from_corpus(params, corpus))?;
        self.store
            .initialize_study(&params.study_id, &description, params.runs_per_study)
            .await
    }

    /// Walks every participant through one turn, in order.
    async fn training_pass(&mut self, params: &ConditionParams) -> Result<PassReport, StorageError> {
        let description = self.fetch_description(params).await?;
        let documents = description.documents();
        let vectorizer = Vectorizer::new(Vocabulary::indexed(params.vocab_size));
        let config = ModelConfig::with_seed(params.n_topics, params.model_seed);

        let mut report = PassReport::default();
        for (index, document) in documents.iter().enumerate() {
            let participant_id = format!("participant-{}", index);
            match self
                .participant_turn(params, &participant_id, document, &vectorizer, config)
                .await
            {
                Ok(()) => report.committed += 1,
                Err(TurnError::Storage(e)) => return Err(e),
                Err(error) => report.failures.push(TurnFailure {
                    participant_id,
                    error,
                }),
            }
        }
        Ok(report)
    }

    /// One participant's turn: claim a run, fold the private document into
    /// the model, commit the successor state.
    ///
    /// A stale commit means someone rotated the check value under us; the
    /// update is discarded and the turn re-claims, re-applying the
    /// document to the freshly fetched state.
    async fn participant_turn(
        &mut self,
        params: &ConditionParams,
        participant_id: &str,
        document: &Document,
        vectorizer: &Vectorizer,
        config: ModelConfig,
    ) -> Result<(), TurnError> {
        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let claimed = self
                .store
                .claim_run(&params.study_id, participant_id)
                .await?
                .ok_or(TurnError::NoRunAvailable)?;

            // A blob that does not decode is left claimed on purpose:
            // releasing it would hand the corruption to the next
            // participant.
            let state = StateCodec::decode(&claimed.model, config)?;

            let batch = vectorizer.vectorize(std::slice::from_ref(document));
            let updated = match IncrementalLearner::update(state, &batch) {
                Ok(updated) => updated,
                Err(e) => {
                    self.store
                        .release_run(&params.study_id, &claimed.run_id)
                        .await?;
                    return Err(e.into());
                }
            };
            let blob = StateCodec::encode(&updated)?;

            let commit = self
                .store
                .commit_run(
                    &params.study_id,
                    participant_id,
                    RunUpdate {
                        run_id: claimed.run_id.clone(),
                        check_value: claimed.check_value,
                        model: blob,
                    },
                )
                .await?;
            match commit.into_inner() {
                Ok(()) => {
                    debug!(
                        study_id = %params.study_id,
                        participant_id,
                        run_id = %claimed.run_id,
                        "turn committed",
                    );
                    return Ok(());
                }
                Err(stale) => {
                    debug!(
                        study_id = %params.study_id,
                        participant_id,
                        error = %stale,
                        "commit rejected, re-claiming",
                    );
                }
            }
        }
        Err(TurnError::ClaimExhausted(MAX_CLAIM_ATTEMPTS))
    }

    /// Scores the first run's model against the ground truth persisted in
    /// the study description.
    async fn evaluate(
        &mut self,
        params: &ConditionParams,
    ) -> Result<fedlda_core::Scores, EvaluationError> {
        let description = self.fetch_description(params).await?;
        let truth = description
            .truth()
            .ok_or(EvaluationError::CorruptDescription)?;
        let documents = description.documents();

        let models = self.store.run_models(&params.study_id).await?;
        let blob = models.first().ok_or(EvaluationError::NoRuns)?;
        let config = ModelConfig::with_seed(params.n_topics, params.model_seed);
        let state = StateCodec::decode(blob, config)?;

        let vectorizer = Vectorizer::new(Vocabulary::indexed(params.vocab_size));
        let mut rng = ChaCha20Rng::seed_from_u64(params.seed);
        let scores =
            EvaluationEngine::evaluate(&truth, &state, &documents, &vectorizer, &mut rng)?;
        Ok(scores)
    }

    async fn fetch_description(
        &mut self,
        params: &ConditionParams,
    ) -> Result<StudyDescription, StorageError> {
        let blob = self
            .store
            .study_description(&params.study_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("study {} has no description", params.study_id))?;
        Ok(serde_json::from_str(&blob)?)
    }
}

#[derive(Debug, Error)]
enum EvaluationError {
    #[error("study has no run records")]
    NoRuns,

    #[error("study description does not hold a well-formed ground truth")]
    CorruptDescription,

    #[error("final model is malformed: {0}")]
    Malformed(#[from] MalformedStateError),

    #[error(transparent)]
    Metric(#[from] MetricComputationError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

fn skipped(params: &ConditionParams, reason: String) -> ConditionOutcome {
    warn!(study_id = %params.study_id, reason = %reason, "condition skipped");
    ConditionOutcome::Skipped {
        params: params.clone(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;
    use fedlda_core::codec::NOT_INITIALIZED;

    fn tiny_condition() -> ConditionParams {
        ConditionParams {
            study_id: "10_3_8_0".into(),
            n_words: 10,
            n_topics: 3,
            n_participants: 8,
            vocab_size: 30,
            replication: 0,
            seed: 11,
            prior_weight: 0.1,
            model_seed: 42,
            runs_per_study: 1,
        }
    }

    #[tokio::test]
    async fn a_condition_trains_and_scores() {
        let mut orchestrator = StudyOrchestrator::new(InMemoryStore::new());
        let params = tiny_condition();
        let outcome = orchestrator.run_condition(&params).await;
        assert_eq!(orchestrator.phase(), StudyPhase::Complete);
        match outcome {
            ConditionOutcome::Scored { scores, .. } => {
                assert!(scores.adjusted_rand_index <= 1.0 + 1e-12);
                assert!(scores.avg_max_cosine_similarity >= -1.0);
                assert!(scores.avg_min_kl_divergence >= 0.0);
            }
            ConditionOutcome::Skipped { reason, .. } => panic!("skipped: {}", reason),
        }
    }

    #[tokio::test]
    async fn every_participant_updates_the_chain_once() {
        let mut store = InMemoryStore::new();
        let mut orchestrator = StudyOrchestrator::new(store.clone());
        let params = tiny_condition();
        orchestrator.run_condition(&params).await;

        let models = store.run_models(&params.study_id).await.unwrap();
        assert_eq!(models.len(), 1);
        let config = ModelConfig::with_seed(params.n_topics, params.model_seed);
        let state = StateCodec::decode(&models[0], config).unwrap();
        assert_eq!(state.batch_iteration(), params.n_participants as u64);
    }

    #[tokio::test]
    async fn a_malformed_blob_stops_the_single_chain() {
        let mut store = InMemoryStore::new();
        let mut orchestrator = StudyOrchestrator::new(store.clone());
        let mut params = tiny_condition();
        params.study_id = "sabotaged".into();

        let corpus = orchestrator.generate_corpus(&params).unwrap();
        orchestrator.initialize(&params, &corpus).await.unwrap();

        // A saboteur commits garbage into the only slot.
        let claimed = store
            .claim_run(&params.study_id, "saboteur")
            .await
            .unwrap()
            .unwrap();
        store
            .commit_run(
                &params.study_id,
                "saboteur",
                RunUpdate {
                    run_id: claimed.run_id,
                    check_value: claimed.check_value,
                    model: "{ not json".into(),
                },
            )
            .await
            .unwrap()
            .into_inner()
            .unwrap();

        let report = orchestrator.training_pass(&params).await.unwrap();
        // The first turn hits the garbage and leaves the slot held, so
        // every later participant finds no run available.
        assert_eq!(report.committed, 0);
        assert_eq!(report.failures.len(), params.n_participants);
        assert!(matches!(report.failures[0].error, TurnError::Malformed(_)));
        assert!(report.failures[1..]
            .iter()
            .all(|f| matches!(f.error, TurnError::NoRunAvailable)));
    }

    #[tokio::test]
    async fn a_second_run_keeps_training_past_a_poisoned_slot() {
        let mut store = InMemoryStore::new();
        let mut orchestrator = StudyOrchestrator::new(store.clone());
        let mut params = tiny_condition();
        params.study_id = "two_runs".into();
        params.runs_per_study = 2;

        let corpus = orchestrator.generate_corpus(&params).unwrap();
        orchestrator.initialize(&params, &corpus).await.unwrap();

        let claimed = store
            .claim_run(&params.study_id, "saboteur")
            .await
            .unwrap()
            .unwrap();
        store
            .commit_run(
                &params.study_id,
                "saboteur",
                RunUpdate {
                    run_id: claimed.run_id,
                    check_value: claimed.check_value,
                    model: "garbage".into(),
                },
            )
            .await
            .unwrap()
            .into_inner()
            .unwrap();

        let report = orchestrator.training_pass(&params).await.unwrap();
        // One participant trips over the poisoned slot, the rest chain on
        // the healthy one.
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.committed, params.n_participants - 1);

        let models = store.run_models(&params.study_id).await.unwrap();
        let healthy: Vec<_> = models
            .iter()
            .filter(|m| m.as_str() != "garbage")
            .collect();
        assert_eq!(healthy.len(), 1);
        assert_ne!(healthy[0].as_str(), NOT_INITIALIZED);
    }

    #[tokio::test]
    async fn an_unwritable_store_skips_the_condition() {
        // A store whose study vanished between setup and training.
        let mut store = InMemoryStore::new();
        let mut orchestrator = StudyOrchestrator::new(store.clone());
        let params = tiny_condition();
        let corpus = orchestrator.generate_corpus(&params).unwrap();
        orchestrator.initialize(&params, &corpus).await.unwrap();
        store.delete_study(&params.study_id).await.unwrap();

        assert!(orchestrator.training_pass(&params).await.is_err());
    }
}
