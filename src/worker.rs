//! Worker loop: claim, heartbeat, compute, publish
//!
//! A worker process registers one runner per job type it can compute,
//! claims eligible jobs from the queue, keeps the lease alive with a
//! background heartbeat while the runner works, and publishes the result
//! through the orchestrator. Runner failures become normal error outputs,
//! so `failed_runs` accounting stays uniform; a lost lease just means the
//! job runs again somewhere else and the idempotent upsert absorbs it.

use crate::config::JOB_RUNNER_CRASHED_ERROR_CODE;
use crate::error::OrchestratorError;
use crate::job::{JobInfo, JobOutput, JobResult};
use crate::orchestrator::Orchestrator;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Computes one kind of artifact
///
/// Runners must be idempotent: the queue guarantees at-least-once
/// execution, not exactly-once.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// The job type (= step name = cache kind) this runner computes
    fn job_type(&self) -> &str;

    /// Version recorded in the cache; bump to force recomputation
    fn job_runner_version(&self) -> u32 {
        1
    }

    /// Compute the output for one job
    ///
    /// Expected failures should be returned as an error [`JobOutput`]
    /// (non-OK http status plus an error code); an `Err` here is treated as
    /// a crash.
    async fn compute(&self, job_info: &JobInfo) -> anyhow::Result<JobOutput>;
}

/// Configuration of one worker process
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity recorded as the lease owner
    pub worker_id: String,
    /// How long to sleep when the queue has nothing eligible
    pub empty_queue_sleep: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", std::process::id()),
            empty_queue_sleep: Duration::from_secs(5),
        }
    }
}

/// Claims jobs and routes them to registered runners
pub struct Worker {
    orchestrator: Orchestrator,
    runners: HashMap<String, Arc<dyn JobRunner>>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(orchestrator: Orchestrator, config: WorkerConfig) -> Self {
        Self { orchestrator, runners: HashMap::new(), config }
    }

    /// Register a runner; the worker only claims job types it can compute
    pub fn register(mut self, runner: Arc<dyn JobRunner>) -> Self {
        self.runners.insert(runner.job_type().to_string(), runner);
        self
    }

    /// Claim and process one job
    ///
    /// Returns false when the queue had nothing eligible.
    pub async fn process_next(&self) -> Result<bool, OrchestratorError> {
        let job_types: Vec<&str> = self.runners.keys().map(String::as_str).collect();
        let job_info = match self
            .orchestrator
            .queue()
            .start_job(Some(&job_types), None, &self.config.worker_id)
            .await
        {
            Ok(job_info) => job_info,
            Err(err) if err.is_empty_queue() => return Ok(false),
            Err(err) => return Err(err.into()),
        };

        // the claim filter guarantees a matching runner
        let Some(runner) = self.runners.get(&job_info.job_type).cloned() else {
            warn!(job_type = %job_info.job_type, "claimed a job with no registered runner");
            self.orchestrator.queue().finish_job(job_info.job_id).await?;
            return Ok(true);
        };

        debug!(job_id = job_info.job_id, job_type = %job_info.job_type, "computing");
        let heartbeat = self.spawn_heartbeat(job_info.job_id);
        let outcome = runner.compute(&job_info).await;
        heartbeat.abort();

        let job_result = match outcome {
            Ok(output) => JobResult {
                job_info,
                job_runner_version: runner.job_runner_version(),
                is_success: output.is_success(),
                output: Some(output),
            },
            Err(err) => {
                error!(job_id = job_info.job_id, error = %err, "runner crashed");
                JobResult {
                    job_info,
                    job_runner_version: runner.job_runner_version(),
                    is_success: false,
                    output: Some(JobOutput::error(500, JOB_RUNNER_CRASHED_ERROR_CODE, None)),
                }
            }
        };
        self.orchestrator.finish_job(&job_result).await?;
        Ok(true)
    }

    /// Process until the queue has nothing left for this worker
    pub async fn run_until_idle(&self) -> Result<u64, OrchestratorError> {
        let mut processed = 0;
        while self.process_next().await? {
            processed += 1;
        }
        Ok(processed)
    }

    /// Loop forever, idling on an empty queue
    pub async fn run(&self) -> Result<(), OrchestratorError> {
        info!(worker_id = %self.config.worker_id, runners = self.runners.len(), "worker loop started");
        loop {
            if !self.process_next().await? {
                tokio::time::sleep(self.config.empty_queue_sleep).await;
            }
        }
    }

    fn spawn_heartbeat(&self, job_id: i64) -> tokio::task::JoinHandle<()> {
        let queue = self.orchestrator.queue().clone();
        let interval = self.orchestrator.config().heartbeat_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick fires immediately; skip it
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = queue.heartbeat(job_id).await {
                    // the lease was swept or the dataset removed; the
                    // orchestrator will sort it out at finish time
                    warn!(job_id, error = %err, "heartbeat failed");
                    break;
                }
            }
        })
    }
}
