use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod judge;
mod keywords;
mod models;
mod orchestrator;
mod reconciler;
mod registry;
mod store;
mod tracking;

use crate::config::Config;
use crate::judge::OpenAiJudge;
use crate::orchestrator::Orchestrator;
use crate::reconciler::Reconciler;
use crate::registry::RunRegistry;
use crate::store::RecordStore;
use crate::tracking::MlflowTracking;

/// Background evaluation service for RAG chat responses
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "ragmon.toml")]
    config: PathBuf,

    /// Override the record directory from the config file
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Verbose output - debug-level logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = if args.config.exists() {
        Config::from_file(&args.config)?
    } else {
        info!(path = %args.config.display(), "No config file found, using defaults");
        Config::default()
    };

    let data_dir = args
        .data_dir
        .unwrap_or_else(|| PathBuf::from(&config.data_dir));

    let tracking = MlflowTracking::new(&config.tracking_uri)?;
    let registry = RunRegistry::new(&config.registry_uri)?;
    let model = OpenAiJudge::new(config.judge.clone());

    let orchestrator = Orchestrator::new(
        tracking,
        model,
        registry,
        &config.evaluators_dir,
        Duration::from_secs(config.judge.timeout_secs),
        config.keyword_top_n,
    );
    let reconciler = Reconciler::new(
        RecordStore::new(&data_dir),
        orchestrator,
        Duration::from_secs(config.sweep_interval_secs),
        config.remove_completed,
    );

    info!(
        data_dir = %data_dir.display(),
        tracking_uri = %config.tracking_uri,
        interval_secs = config.sweep_interval_secs,
        "Starting reconciler"
    );
    reconciler.run().await
}
