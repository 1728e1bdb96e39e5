//! # fedlda-study: the coordinator side of the simulation study
//!
//! This crate drives the federated training loop over the pure numerics of
//! `fedlda-core`. A study condition is one cell of the parameter grid
//! (words per document × topics × participants), replicated with
//! independently derived seeds. For each replication the orchestrator
//! generates a synthetic corpus with known ground truth, initializes the
//! study's run records, walks every simulated participant through one
//! claim → decode → update → encode → commit turn, and finally scores the
//! recovered model.
//!
//! The run-record store is abstracted behind [`RunRecordStore`]; the
//! in-memory implementation here stands in for the external relational
//! store the production deployment uses. Participants within one condition
//! run strictly sequentially — the training is a single logical chain of
//! incremental updates — while separate conditions share no mutable state.
//!
//! [`RunRecordStore`]: storage::RunRecordStore

pub mod orchestrator;
pub mod report;
pub mod settings;
pub mod storage;

pub use self::{
    orchestrator::{PassReport, StudyOrchestrator, StudyPhase, TurnError, TurnFailure},
    report::{write_csv, ConditionOutcome},
    settings::{ConditionParams, Settings, SettingsError, StudySettings},
    storage::{ClaimedRun, InMemoryStore, RunRecordStore, RunUpdate, StaleClaimError},
};
