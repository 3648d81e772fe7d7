//! Quasar: failure-tolerant orchestration of derived dataset artifacts
//!
//! # Overview
//!
//! Quasar keeps a family of precomputed artifacts (config and split name
//! lists, parquet conversions and metadata, size and info aggregates,
//! validity flags, URL counts, search indices, statistics) consistent with
//! each dataset's upstream revision. The core is a job orchestration
//! engine over a directed acyclic processing graph: given the graph, a
//! persistent job queue and a persistent result cache, it computes the
//! minimum set of jobs to bring a dataset up to date, enqueues them with
//! the right priorities and difficulties, consumes their results and
//! cascades further work as parents complete.
//!
//! # Components
//!
//! - **[`graph::ProcessingGraph`]**: the validated DAG of artifact kinds
//! - **[`cache::CacheStore`]**: durable artifact results with failed-run
//!   accounting
//! - **[`queue::Queue`]**: durable jobs with priority, leases and named
//!   locks
//! - **[`state::DatasetState`]**: the recomputed dataset/configs/splits
//!   tree
//! - **[`planner::DatasetBackfillPlan`]** / **[`planner::AfterJobPlan`]**:
//!   minimal queue edits
//! - **[`orchestrator::Orchestrator`]**: the facade services and workers
//!   use
//! - **[`worker::Worker`]**: claim, heartbeat, compute, publish
//!
//! # Example
//!
//! ```no_run
//! use quasar::config::OrchestratorConfig;
//! use quasar::graph::{GraphSpecification, ProcessingGraph};
//! use quasar::job::Priority;
//! use quasar::orchestrator::Orchestrator;
//! use quasar::{cache::CacheStore, queue::Queue};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let graph = Arc::new(ProcessingGraph::new(GraphSpecification::default())?);
//!     let queue = Queue::open("quasar-queue.db").await?;
//!     let cache = CacheStore::open("quasar-cache.db").await?;
//!     let orchestrator =
//!         Orchestrator::new(graph, queue, cache, OrchestratorConfig::default());
//!
//!     orchestrator.set_revision("user/dataset", "abc123", Priority::Normal).await?;
//!     orchestrator.backfill_dataset("user/dataset", "abc123").await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod graph;
pub mod job;
pub mod maintenance;
pub mod metrics;
pub mod orchestrator;
pub mod planner;
pub mod queue;
pub mod state;
pub mod worker;

pub use cache::CacheStore;
pub use config::OrchestratorConfig;
pub use error::{CacheError, GraphError, OrchestratorError, QueueError};
pub use graph::{Artifact, GraphSpecification, InputType, ProcessingGraph, ProcessingStep};
pub use job::{JobInfo, JobOutput, JobParams, JobResult, JobStatus, NewJob, Priority};
pub use orchestrator::Orchestrator;
pub use planner::{AfterJobPlan, DatasetBackfillPlan};
pub use queue::Queue;
pub use state::DatasetState;
pub use worker::{JobRunner, Worker, WorkerConfig};

/// Microseconds since the Unix epoch; the crate's single clock
pub(crate) fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}
