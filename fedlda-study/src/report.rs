//! Metrics export.
//!
//! Scored conditions are appended to a flat CSV, one row per replication,
//! with the column names the downstream analysis notebooks expect.
//! Skipped conditions carry no scores and are omitted from the file; they
//! are reported through the log instead.

use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::Path,
};

use tracing::info;

use fedlda_core::Scores;

use crate::settings::ConditionParams;

const CSV_HEADER: &str = "n_participants,n_topics,n_words,vocabulary_size,\
avg_kl_divergence_theta_topic_distribution,\
avg_kl_divergence_phi_word_distribution,\
avg_max_cosine_similarity_phi_vs_phi_hat,\
avg_min_kl_divergence_phi_vs_phi_hat,\
adjusted_rand_index_theta_vs_theta_hat";

/// What became of one condition.
#[derive(Debug)]
pub enum ConditionOutcome {
    /// The condition trained and was scored.
    Scored {
        params: ConditionParams,
        scores: Scores,
    },
    /// The condition could not be completed.
    Skipped {
        params: ConditionParams,
        reason: String,
    },
}

/// Appends the scored outcomes to the CSV at `path`, writing the header
/// first if the file is empty or does not exist yet.
pub fn write_csv(path: &Path, outcomes: &[ConditionOutcome]) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if file.metadata()?.len() == 0 {
        writeln!(file, "{}", CSV_HEADER)?;
    }

    let mut written = 0usize;
    for outcome in outcomes {
        if let ConditionOutcome::Scored { params, scores } = outcome {
            writeln!(
                file,
                "{},{},{},{},{},{},{},{},{}",
                params.n_participants,
                params.n_topics,
                params.n_words,
                params.vocab_size,
                scores.avg_kl_divergence_theta,
                scores.avg_kl_divergence_phi,
                scores.avg_max_cosine_similarity,
                scores.avg_min_kl_divergence,
                scores.adjusted_rand_index,
            )?;
            written += 1;
        }
    }
    info!(path = %path.display(), rows = written, "metrics written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(study_id: &str) -> ConditionParams {
        ConditionParams {
            study_id: study_id.into(),
            n_words: 50,
            n_topics: 5,
            n_participants: 50,
            vocab_size: 500,
            replication: 0,
            seed: 1,
            prior_weight: 0.1,
            model_seed: 42,
            runs_per_study: 1,
        }
    }

    fn scores() -> Scores {
        Scores {
            avg_kl_divergence_theta: 1.5,
            avg_kl_divergence_phi: 2.5,
            avg_max_cosine_similarity: 0.75,
            avg_min_kl_divergence: 0.25,
            adjusted_rand_index: 0.5,
        }
    }

    #[test]
    fn header_is_written_once_and_rows_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");

        let first = vec![ConditionOutcome::Scored {
            params: params("a"),
            scores: scores(),
        }];
        write_csv(&path, &first).unwrap();
        let second = vec![ConditionOutcome::Scored {
            params: params("b"),
            scores: scores(),
        }];
        write_csv(&path, &second).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("n_participants,n_topics,n_words,vocabulary_size,"));
        assert_eq!(lines[1], "50,5,50,500,1.5,2.5,0.75,0.25,0.5");
        assert_eq!(lines[1], lines[2]);
    }

    #[test]
    fn skipped_conditions_leave_no_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");

        let outcomes = vec![
            ConditionOutcome::Skipped {
                params: params("a"),
                reason: "corpus generation failed".into(),
            },
            ConditionOutcome::Scored {
                params: params("b"),
                scores: scores(),
            },
        ];
        write_csv(&path, &outcomes).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
