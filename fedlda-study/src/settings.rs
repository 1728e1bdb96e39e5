//! Loading, validation and enumeration of study settings.
//!
//! Values defined in the configuration file can be overridden by
//! `FEDLDA__`-prefixed environment variables, e.g.
//! `FEDLDA__STUDY__VOCAB_SIZE=200`. With no file at all, the defaults
//! reproduce the published study grid.

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    path::{Path, PathBuf},
};

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationErrors};

#[derive(Debug, Error)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Clone, Deserialize, Validate)]
/// The combined settings.
pub struct Settings {
    #[serde(default)]
    #[validate]
    pub study: StudySettings,
    #[serde(default)]
    pub log: LoggingSettings,
    #[serde(default)]
    pub output: OutputSettings,
}

impl Settings {
    /// Loads and validates the settings, merging an optional configuration
    /// file with environment overrides.
    pub fn new(path: Option<&Path>) -> Result<Self, SettingsError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let config = builder
            .add_source(Environment::with_prefix("fedlda").separator("__"))
            .build()?;
        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Enumerates the full condition grid: the cross product of word,
    /// topic and participant counts, each replicated with its own seed.
    pub fn conditions(&self) -> Vec<ConditionParams> {
        let study = &self.study;
        let mut conditions = Vec::new();
        for &n_words in &study.word_counts {
            for &n_topics in &study.topic_counts {
                for &n_participants in &study.participant_counts {
                    for replication in 0..study.replications {
                        let study_id =
                            format!("{}_{}_{}_{}", n_words, n_topics, n_participants, replication);
                        let seed = derive_seed(&study_id);
                        conditions.push(ConditionParams {
                            study_id,
                            n_words,
                            n_topics,
                            n_participants,
                            vocab_size: study.vocab_size,
                            replication,
                            seed,
                            prior_weight: study.prior_weight,
                            model_seed: study.model_seed,
                            runs_per_study: study.runs_per_study,
                        });
                    }
                }
            }
        }
        conditions
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            study: StudySettings::default(),
            log: LoggingSettings::default(),
            output: OutputSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
/// The study grid and model parameters.
pub struct StudySettings {
    /// Words per generated document, one grid axis.
    #[serde(default = "default_word_counts")]
    #[validate(length(min = 1))]
    pub word_counts: Vec<usize>,
    /// Topic counts, one grid axis.
    #[serde(default = "default_topic_counts")]
    #[validate(length(min = 1))]
    pub topic_counts: Vec<usize>,
    /// Participant counts, one grid axis.
    #[serde(default = "default_participant_counts")]
    #[validate(length(min = 1))]
    pub participant_counts: Vec<usize>,
    /// Fixed vocabulary size for every condition.
    #[serde(default = "default_vocab_size")]
    #[validate(range(min = 1))]
    pub vocab_size: usize,
    /// Replications per grid cell, each with an independently derived
    /// seed.
    #[serde(default = "default_replications")]
    #[validate(range(min = 1))]
    pub replications: usize,
    /// Symmetric Dirichlet weight for both α and β; 0.1 gives the sparse
    /// mixtures the study targets.
    #[serde(default = "default_prior_weight")]
    pub prior_weight: f64,
    /// Seed for the learner's own generator on first initialization.
    #[serde(default = "default_model_seed")]
    pub model_seed: u64,
    /// Run records per study; the single-run default chains every
    /// participant through one shared model.
    #[serde(default = "default_runs_per_study")]
    #[validate(range(min = 1))]
    pub runs_per_study: usize,
}

fn default_word_counts() -> Vec<usize> {
    vec![50, 100]
}

fn default_topic_counts() -> Vec<usize> {
    vec![5, 10]
}

fn default_participant_counts() -> Vec<usize> {
    vec![50, 200, 500]
}

fn default_vocab_size() -> usize {
    500
}

fn default_replications() -> usize {
    10
}

fn default_prior_weight() -> f64 {
    0.1
}

fn default_model_seed() -> u64 {
    42
}

fn default_runs_per_study() -> usize {
    1
}

impl Default for StudySettings {
    fn default() -> Self {
        Self {
            word_counts: default_word_counts(),
            topic_counts: default_topic_counts(),
            participant_counts: default_participant_counts(),
            vocab_size: default_vocab_size(),
            replications: default_replications(),
            prior_weight: default_prior_weight(),
            model_seed: default_model_seed(),
            runs_per_study: default_runs_per_study(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A tracing `EnvFilter` directive, e.g. `info` or
    /// `fedlda_study=debug,info`.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
/// Output settings.
pub struct OutputSettings {
    /// Where the metrics CSV is appended.
    #[serde(default = "default_metrics_path")]
    pub metrics_path: PathBuf,
}

fn default_metrics_path() -> PathBuf {
    PathBuf::from("results.csv")
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            metrics_path: default_metrics_path(),
        }
    }
}

/// One fully resolved study condition: a grid cell plus its replication
/// index and derived seed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConditionParams {
    pub study_id: String,
    pub n_words: usize,
    pub n_topics: usize,
    pub n_participants: usize,
    pub vocab_size: usize,
    pub replication: usize,
    pub seed: u64,
    pub prior_weight: f64,
    pub model_seed: u64,
    pub runs_per_study: usize,
}

impl ConditionParams {
    /// The symmetric document-topic prior vector α.
    pub fn alpha(&self) -> Vec<f64> {
        vec![self.prior_weight; self.n_topics]
    }

    /// The symmetric topic-word prior vector β.
    pub fn beta(&self) -> Vec<f64> {
        vec![self.prior_weight; self.vocab_size]
    }
}

/// Derives a replication seed from a study id.
///
/// `DefaultHasher` is SipHash with fixed keys, so unlike the original
/// Python `hash()` this is stable across runs and platforms. Truncated to
/// 32 bits to match the seed range the study ids were published with.
pub fn derive_seed(study_id: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    study_id.hash(&mut hasher);
    (hasher.finish() as u32) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_grid_has_the_published_shape() {
        let settings = Settings::default();
        let conditions = settings.conditions();
        // 2 word counts x 2 topic counts x 3 participant counts x 10 reps
        assert_eq!(conditions.len(), 120);
        assert_eq!(conditions[0].study_id, "50_5_50_0");
        assert!(conditions.iter().all(|c| c.vocab_size == 500));
    }

    #[test]
    fn seeds_are_stable_and_distinct_per_replication() {
        assert_eq!(derive_seed("50_5_50_0"), derive_seed("50_5_50_0"));
        assert_ne!(derive_seed("50_5_50_0"), derive_seed("50_5_50_1"));
        assert!(derive_seed("50_5_50_0") <= u32::MAX as u64);
    }

    #[test]
    fn alpha_and_beta_are_symmetric_priors() {
        let settings = Settings::default();
        let condition = &settings.conditions()[0];
        assert_eq!(condition.alpha(), vec![0.1; 5]);
        assert_eq!(condition.beta().len(), 500);
    }

    #[test]
    fn empty_grid_axis_fails_validation() {
        let mut settings = Settings::default();
        settings.study.word_counts.clear();
        assert!(settings.validate().is_err());
    }
}
