//! Quasar admin CLI
//!
//! Maintenance entry point: seed revisions, run backfill sweeps, remove
//! datasets, sweep expired leases, collect metrics and clean runner
//! scratch directories. Exit code 0 on success; failures are logged and
//! surface as a non-zero exit.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use quasar::config::OrchestratorConfig;
use quasar::graph::{GraphSpecification, ProcessingGraph};
use quasar::job::Priority;
use quasar::maintenance::{backfill_datasets, clean_directory};
use quasar::metrics::{collect_cache_metrics, collect_queue_metrics};
use quasar::orchestrator::Orchestrator;
use quasar::{CacheStore, Queue};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "quasar", version, about = "Dataset artifact orchestration maintenance")]
struct Cli {
    /// Path to the queue database
    #[arg(long, global = true, default_value = "quasar-queue.db")]
    queue_db: String,

    /// Path to the cache database
    #[arg(long, global = true, default_value = "quasar-cache.db")]
    cache_db: String,

    /// Processing graph specification (TOML); the built-in graph is used
    /// when omitted
    #[arg(long, global = true)]
    graph: Option<PathBuf>,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand)]
enum Action {
    /// Reconcile queue and cache for the datasets listed in a file
    /// (one `dataset,revision` per line)
    Backfill {
        datasets_file: PathBuf,
    },
    /// Seed the root jobs for a dataset at a revision
    SetRevision {
        dataset: String,
        revision: String,
        #[arg(long, default_value = "normal")]
        priority: Priority,
    },
    /// Delete a dataset's jobs, locks and cache entries
    Remove {
        dataset: String,
    },
    /// Return expired started jobs to waiting
    SweepLeases,
    /// Log job counts by type and status
    CollectQueueMetrics,
    /// Log cache entry counts by kind, status and error code
    CollectCacheMetrics,
    /// Delete glob matches older than the given age in seconds
    CleanDirectory {
        pattern: String,
        expired_seconds: u64,
    },
}

fn init_logging() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("quasar=info"));
    let fmt_layer = fmt::layer().with_target(true).compact();
    tracing_subscriber::registry().with(env_filter).with(fmt_layer).init();
}

fn load_graph(path: Option<&PathBuf>) -> Result<ProcessingGraph> {
    let specification = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read graph specification {:?}", path))?;
            GraphSpecification::from_toml(&text)
                .with_context(|| format!("Invalid graph specification {:?}", path))?
        }
        None => GraphSpecification::default(),
    };
    Ok(ProcessingGraph::new(specification)?)
}

fn read_datasets_file(path: &PathBuf) -> Result<Vec<(String, String)>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read datasets file {:?}", path))?;
    let mut datasets = Vec::new();
    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (dataset, revision) = line
            .split_once(',')
            .with_context(|| format!("Line {} is not `dataset,revision`", number + 1))?;
        datasets.push((dataset.trim().to_string(), revision.trim().to_string()));
    }
    Ok(datasets)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    // the directory sweep needs no stores
    if let Action::CleanDirectory { pattern, expired_seconds } = &cli.action {
        clean_directory(pattern, Duration::from_secs(*expired_seconds))?;
        return Ok(());
    }

    let graph = Arc::new(load_graph(cli.graph.as_ref())?);
    let queue = Queue::open(&cli.queue_db).await?;
    let cache = CacheStore::open(&cli.cache_db).await?;
    let config = OrchestratorConfig::default();
    let orchestrator = Orchestrator::new(graph, queue.clone(), cache.clone(), config.clone());

    match cli.action {
        Action::Backfill { datasets_file } => {
            let datasets = read_datasets_file(&datasets_file)?;
            info!(datasets = datasets.len(), "starting backfill sweep");
            backfill_datasets(&orchestrator, datasets).await?;
        }
        Action::SetRevision { dataset, revision, priority } => {
            orchestrator.set_revision(&dataset, &revision, priority).await?;
        }
        Action::Remove { dataset } => {
            orchestrator.remove_dataset(&dataset).await?;
        }
        Action::SweepLeases => {
            let swept = queue.sweep_expired_leases(config.lease_ttl()).await?;
            info!(swept, "lease sweep finished");
        }
        Action::CollectQueueMetrics => {
            collect_queue_metrics(&queue).await?;
        }
        Action::CollectCacheMetrics => {
            collect_cache_metrics(&cache).await?;
        }
        Action::CleanDirectory { .. } => unreachable!("handled above"),
    }
    Ok(())
}
