use std::{path::PathBuf, process};

use structopt::StructOpt;
use tracing::warn;
use tracing_subscriber::{filter::EnvFilter, FmtSubscriber};

use fedlda_study::{
    report::{write_csv, ConditionOutcome},
    settings::Settings,
    storage::InMemoryStore,
    StudyOrchestrator,
};

#[derive(Debug, StructOpt)]
#[structopt(name = "simulate", about = "Runs the federated topic-model study grid.")]
struct Opt {
    /// Path to the configuration file. Defaults apply when omitted.
    #[structopt(short, parse(from_os_str))]
    config_path: Option<PathBuf>,

    /// Where to append the metrics CSV; overrides the configured path.
    #[structopt(short, parse(from_os_str))]
    output_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();
    let settings = Settings::new(opt.config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("{}", e);
        process::exit(1);
    });

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(&settings.log.filter))
        .with_ansi(true)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let conditions = settings.conditions();
    let mut orchestrator = StudyOrchestrator::new(InMemoryStore::new());
    let mut outcomes = Vec::with_capacity(conditions.len());
    for params in &conditions {
        outcomes.push(orchestrator.run_condition(params).await);
    }

    let skipped = outcomes
        .iter()
        .filter(|o| matches!(o, ConditionOutcome::Skipped { .. }))
        .count();
    if skipped > 0 {
        warn!(skipped, total = conditions.len(), "some conditions were skipped");
    }

    let path = opt
        .output_path
        .unwrap_or_else(|| settings.output.metrics_path.clone());
    if let Err(e) = write_csv(&path, &outcomes) {
        eprintln!("failed to write {}: {}", path.display(), e);
        process::exit(1);
    }
}
