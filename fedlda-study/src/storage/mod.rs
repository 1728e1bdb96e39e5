//! Run-record storage.
//!
//! A run record is the persisted association of a study and a model blob,
//! guarded by a one-time check value. The claim/commit contract:
//!
//! - `claim_run` hands out the first slot the participant has not yet
//!   updated and that nobody else holds, rotating the check value and
//!   marking the slot in flight. `None` means no runs are available for
//!   that participant.
//! - `commit_run` applies an update only if the presented check value
//!   still matches; anything else is a stale claim. A successful commit
//!   rotates the check value again, so a duplicate of an already accepted
//!   commit can never apply twice.
//! - `release_run` returns a slot without updating it, for callers whose
//!   transport timed out after claiming.
//!
//! Storage failures that are not part of the claim protocol (I/O,
//! connectivity) travel as the opaque [`StorageError`].

use async_trait::async_trait;
use thiserror::Error;

mod in_memory;

pub use in_memory::InMemoryStore;

/// The error type for storage operations that are not part of the claim
/// protocol.
pub type StorageError = anyhow::Error;

/// The result of a storage operation.
pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error, Clone, Eq, PartialEq)]
#[error("check value no longer matches; the claim is stale and must be re-acquired")]
/// A commit presented a check value the slot no longer carries.
///
/// Safe to retry: re-claim the slot and apply the update to the freshly
/// fetched state.
pub struct StaleClaimError;

/// A successfully claimed run slot.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ClaimedRun {
    pub run_id: String,
    pub check_value: String,
    /// The current serialized model, or the "not initialized" sentinel.
    pub model: String,
}

/// The payload of a commit.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RunUpdate {
    pub run_id: String,
    pub check_value: String,
    pub model: String,
}

/// The domain outcome of a commit, wrapped so that protocol rejections are
/// data rather than storage failures.
#[derive(Debug)]
pub struct RunCommit(pub(crate) Result<(), StaleClaimError>);

impl RunCommit {
    pub fn into_inner(self) -> Result<(), StaleClaimError> {
        self.0
    }
}

#[async_trait]
/// An abstract run-record store.
pub trait RunRecordStore
where
    Self: Clone + Send + Sync + 'static,
{
    /// Creates a study with `n_runs` fresh slots, every model set to the
    /// "not initialized" sentinel.
    ///
    /// # Behavior
    /// Explicit overwrite semantics: an existing study with the same id is
    /// deleted and recreated, never merged.
    async fn initialize_study(
        &mut self,
        study_id: &str,
        description: &str,
        n_runs: usize,
    ) -> StorageResult<()>;

    /// Deletes a study and all its run records. Returns whether the study
    /// existed.
    async fn delete_study(&mut self, study_id: &str) -> StorageResult<bool>;

    /// Returns the study's description blob, or `None` for an unknown
    /// study.
    async fn study_description(&mut self, study_id: &str) -> StorageResult<Option<String>>;

    /// Claims the next slot available to `participant_id`.
    ///
    /// # Behavior
    /// - Returns `Ok(None)` when every slot is either held by someone else
    ///   or already updated by this participant ("no runs available").
    /// - A returned claim has a freshly rotated check value and the slot
    ///   is held until `commit_run` or `release_run`.
    async fn claim_run(
        &mut self,
        study_id: &str,
        participant_id: &str,
    ) -> StorageResult<Option<ClaimedRun>>;

    /// Commits an update to a claimed slot.
    ///
    /// # Behavior
    /// - Check-value mismatch, an unheld slot or a participant that
    ///   already updated this slot yields `Ok(RunCommit(Err(_)))`.
    /// - On success the model is replaced, the update is recorded against
    ///   the participant and the check value rotates.
    async fn commit_run(
        &mut self,
        study_id: &str,
        participant_id: &str,
        update: RunUpdate,
    ) -> StorageResult<RunCommit>;

    /// Releases a held slot without updating it.
    async fn release_run(&mut self, study_id: &str, run_id: &str) -> StorageResult<()>;

    /// The current model blobs of all runs of a study, in creation order.
    async fn run_models(&mut self, study_id: &str) -> StorageResult<Vec<String>>;
}
