//! In-memory run-record store.
//!
//! Stands in for the external relational store during simulation runs and
//! tests. One tokio mutex over the whole study map is enough here: the
//! orchestrator claims strictly sequentially within a condition, and
//! conditions use distinct study ids.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use fedlda_core::codec::NOT_INITIALIZED;

use super::{ClaimedRun, RunCommit, RunRecordStore, RunUpdate, StaleClaimError, StorageResult};

#[derive(Debug)]
struct RunSlot {
    id: String,
    model: String,
    check_value: String,
    held: bool,
    updated_by: HashSet<String>,
}

impl RunSlot {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            model: NOT_INITIALIZED.to_string(),
            check_value: Uuid::new_v4().to_string(),
            held: false,
            updated_by: HashSet::new(),
        }
    }
}

#[derive(Debug)]
struct StudyRecord {
    description: String,
    runs: Vec<RunSlot>,
}

/// A shared, clonable in-memory [`RunRecordStore`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    studies: Arc<Mutex<HashMap<String, StudyRecord>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunRecordStore for InMemoryStore {
    async fn initialize_study(
        &mut self,
        study_id: &str,
        description: &str,
        n_runs: usize,
    ) -> StorageResult<()> {
        let mut studies = self.studies.lock().await;
        if studies.remove(study_id).is_some() {
            debug!(study_id, "existing study deleted before recreation");
        }
        studies.insert(
            study_id.to_string(),
            StudyRecord {
                description: description.to_string(),
                runs: (0..n_runs).map(|_| RunSlot::new()).collect(),
            },
        );
        Ok(())
    }

    async fn delete_study(&mut self, study_id: &str) -> StorageResult<bool> {
        Ok(self.studies.lock().await.remove(study_id).is_some())
    }

    async fn study_description(&mut self, study_id: &str) -> StorageResult<Option<String>> {
        Ok(self
            .studies
            .lock()
            .await
            .get(study_id)
            .map(|study| study.description.clone()))
    }

    async fn claim_run(
        &mut self,
        study_id: &str,
        participant_id: &str,
    ) -> StorageResult<Option<ClaimedRun>> {
        let mut studies = self.studies.lock().await;
        let study = studies
            .get_mut(study_id)
            .ok_or_else(|| anyhow!("unknown study {}", study_id))?;
        for slot in &mut study.runs {
            if slot.held || slot.updated_by.contains(participant_id) {
                continue;
            }
            slot.held = true;
            slot.check_value = Uuid::new_v4().to_string();
            debug!(study_id, participant_id, run_id = %slot.id, "run claimed");
            return Ok(Some(ClaimedRun {
                run_id: slot.id.clone(),
                check_value: slot.check_value.clone(),
                model: slot.model.clone(),
            }));
        }
        Ok(None)
    }

    async fn commit_run(
        &mut self,
        study_id: &str,
        participant_id: &str,
        update: RunUpdate,
    ) -> StorageResult<RunCommit> {
        let mut studies = self.studies.lock().await;
        let study = studies
            .get_mut(study_id)
            .ok_or_else(|| anyhow!("unknown study {}", study_id))?;
        let slot = study
            .runs
            .iter_mut()
            .find(|slot| slot.id == update.run_id)
            .ok_or_else(|| anyhow!("unknown run {} in study {}", update.run_id, study_id))?;

        if !slot.held
            || slot.check_value != update.check_value
            || slot.updated_by.contains(participant_id)
        {
            return Ok(RunCommit(Err(StaleClaimError)));
        }

        slot.model = update.model;
        slot.updated_by.insert(participant_id.to_string());
        slot.check_value = Uuid::new_v4().to_string();
        slot.held = false;
        debug!(study_id, participant_id, run_id = %slot.id, "run committed");
        Ok(RunCommit(Ok(())))
    }

    async fn release_run(&mut self, study_id: &str, run_id: &str) -> StorageResult<()> {
        let mut studies = self.studies.lock().await;
        let study = studies
            .get_mut(study_id)
            .ok_or_else(|| anyhow!("unknown study {}", study_id))?;
        let slot = study
            .runs
            .iter_mut()
            .find(|slot| slot.id == run_id)
            .ok_or_else(|| anyhow!("unknown run {} in study {}", run_id, study_id))?;
        slot.held = false;
        Ok(())
    }

    async fn run_models(&mut self, study_id: &str) -> StorageResult<Vec<String>> {
        let studies = self.studies.lock().await;
        let study = studies
            .get(study_id)
            .ok_or_else(|| anyhow!("unknown study {}", study_id))?;
        Ok(study.runs.iter().map(|slot| slot.model.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn initialize_is_an_overwrite() {
        let mut store = InMemoryStore::new();
        store.initialize_study("s", "first", 2).await.unwrap();
        let claimed = store.claim_run("s", "p0").await.unwrap().unwrap();
        store
            .commit_run(
                "s",
                "p0",
                RunUpdate {
                    run_id: claimed.run_id,
                    check_value: claimed.check_value,
                    model: "updated".into(),
                },
            )
            .await
            .unwrap()
            .into_inner()
            .unwrap();

        store.initialize_study("s", "second", 2).await.unwrap();
        assert_eq!(
            store.study_description("s").await.unwrap().unwrap(),
            "second"
        );
        let models = store.run_models("s").await.unwrap();
        assert_eq!(models, vec![NOT_INITIALIZED.to_string(); 2]);
    }

    #[tokio::test]
    async fn stale_check_value_is_rejected() {
        let mut store = InMemoryStore::new();
        store.initialize_study("s", "", 1).await.unwrap();
        let claimed = store.claim_run("s", "p0").await.unwrap().unwrap();
        let outcome = store
            .commit_run(
                "s",
                "p0",
                RunUpdate {
                    run_id: claimed.run_id.clone(),
                    check_value: "wrong".into(),
                    model: "m".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.into_inner(), Err(StaleClaimError));
        // The slot is still held by the original claim and can be
        // committed with the right value.
        let outcome = store
            .commit_run(
                "s",
                "p0",
                RunUpdate {
                    run_id: claimed.run_id,
                    check_value: claimed.check_value,
                    model: "m".into(),
                },
            )
            .await
            .unwrap();
        assert!(outcome.into_inner().is_ok());
    }

    #[tokio::test]
    async fn duplicate_commit_cannot_apply_twice() {
        let mut store = InMemoryStore::new();
        store.initialize_study("s", "", 1).await.unwrap();
        let claimed = store.claim_run("s", "p0").await.unwrap().unwrap();
        let update = RunUpdate {
            run_id: claimed.run_id,
            check_value: claimed.check_value,
            model: "m1".into(),
        };
        assert!(store
            .commit_run("s", "p0", update.clone())
            .await
            .unwrap()
            .into_inner()
            .is_ok());
        assert_eq!(
            store
                .commit_run("s", "p0", update)
                .await
                .unwrap()
                .into_inner(),
            Err(StaleClaimError)
        );
    }

    #[tokio::test]
    async fn a_participant_gets_each_slot_at_most_once() {
        let mut store = InMemoryStore::new();
        store.initialize_study("s", "", 1).await.unwrap();
        let claimed = store.claim_run("s", "p0").await.unwrap().unwrap();
        store
            .commit_run(
                "s",
                "p0",
                RunUpdate {
                    run_id: claimed.run_id,
                    check_value: claimed.check_value,
                    model: "m".into(),
                },
            )
            .await
            .unwrap()
            .into_inner()
            .unwrap();
        // p0 exhausted its slot, p1 sees the chained model.
        assert!(store.claim_run("s", "p0").await.unwrap().is_none());
        let next = store.claim_run("s", "p1").await.unwrap().unwrap();
        assert_eq!(next.model, "m");
    }

    #[tokio::test]
    async fn a_held_slot_is_skipped_until_released() {
        let mut store = InMemoryStore::new();
        store.initialize_study("s", "", 2).await.unwrap();
        let first = store.claim_run("s", "p0").await.unwrap().unwrap();
        let second = store.claim_run("s", "p1").await.unwrap().unwrap();
        assert_ne!(first.run_id, second.run_id);
        assert!(store.claim_run("s", "p2").await.unwrap().is_none());

        store.release_run("s", &first.run_id).await.unwrap();
        let reclaimed = store.claim_run("s", "p2").await.unwrap().unwrap();
        assert_eq!(reclaimed.run_id, first.run_id);
    }
}
