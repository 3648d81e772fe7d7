//! Top-level facade over graph, queue and cache
//!
//! Service processes call `set_revision` and `backfill_dataset`; workers
//! call `finish_job`. Every operation recomputes from current state, so
//! concurrent invocations converge instead of conflicting.

use crate::cache::CacheStore;
use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::graph::ProcessingGraph;
use crate::job::{JobParams, JobResult, JobStatus, NewJob, Priority};
use crate::planner::{AfterJobPlan, DatasetBackfillPlan};
use crate::queue::Queue;
use crate::state::DatasetState;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Facade owning the shared stores and the process-wide graph
#[derive(Clone)]
pub struct Orchestrator {
    graph: Arc<ProcessingGraph>,
    queue: Queue,
    cache: CacheStore,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        graph: Arc<ProcessingGraph>,
        queue: Queue,
        cache: CacheStore,
        config: OrchestratorConfig,
    ) -> Self {
        Self { graph, queue, cache, config }
    }

    pub fn graph(&self) -> &ProcessingGraph {
        &self.graph
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Seed the root steps for a fresh or advanced revision
    ///
    /// Keeps at most one pending root job per step at the target revision,
    /// deletes WAITING roots left over from other revisions or duplicated,
    /// and creates the missing ones. STARTED rows are never deleted here;
    /// lease accounting and `finish_job` handle them. Does not wait.
    pub async fn set_revision(
        &self,
        dataset: &str,
        revision: &str,
        priority: Priority,
    ) -> Result<(), OrchestratorError> {
        let first_steps = self.graph.first_steps();
        let root_types: Vec<&str> = first_steps.iter().map(|step| step.name.as_str()).collect();
        let pending = self.queue.get_pending_jobs(Some(dataset), Some(&root_types)).await?;

        let mut jobs_to_create: Vec<NewJob> = Vec::new();
        let mut jobs_to_delete: Vec<i64> = Vec::new();
        for step in &first_steps {
            let mut kept = false;
            for row in pending.iter().filter(|row| row.job_type == step.name) {
                if row.revision == revision {
                    if kept && row.status == JobStatus::Waiting {
                        jobs_to_delete.push(row.job_id);
                    } else {
                        kept = true;
                    }
                } else if row.status == JobStatus::Waiting {
                    jobs_to_delete.push(row.job_id);
                }
            }
            if !kept {
                jobs_to_create.push(NewJob {
                    job_type: step.name.clone(),
                    params: JobParams::dataset_level(dataset, revision),
                    priority,
                    difficulty: step.difficulty,
                });
            }
        }

        self.queue.delete_jobs_by_ids(&jobs_to_delete).await?;
        self.queue.create_jobs(&jobs_to_create).await?;
        info!(
            dataset,
            revision,
            created = jobs_to_create.len(),
            deleted = jobs_to_delete.len(),
            "revision set"
        );
        Ok(())
    }

    /// Consume one job result: persist the output, cascade to children,
    /// release the queue row
    pub async fn finish_job(&self, job_result: &JobResult) -> Result<(), OrchestratorError> {
        let job_info = &job_result.job_info;
        let Some(output) = &job_result.output else {
            // crashed runner with nothing to store; the artifact will be
            // classified as empty again on the next backfill pass
            warn!(job_id = job_info.job_id, job_type = %job_info.job_type, "job ended without output");
            self.queue.finish_job(job_info.job_id).await?;
            return Ok(());
        };
        if !job_result.is_success {
            warn!(
                job_id = job_info.job_id,
                job_type = %job_info.job_type,
                http_status = output.http_status,
                "runner reported failure, storing its error output"
            );
        }

        let metadata = self
            .cache
            .upsert(&job_info.job_type, &job_info.params, output, job_result.job_runner_version)
            .await?;

        let plan = AfterJobPlan::new(
            &self.graph,
            &self.config,
            &self.queue,
            &self.cache,
            job_info,
            metadata.failed_runs,
        )
        .await?;
        let response = plan.as_response();
        plan.run(&self.queue).await?;

        self.queue.finish_job(job_info.job_id).await?;
        info!(
            job_id = job_info.job_id,
            job_type = %job_info.job_type,
            dataset = %job_info.params.dataset,
            tasks = ?response,
            "job finished"
        );
        Ok(())
    }

    /// Compute the reconciliation plan for a dataset without executing it
    pub async fn plan_backfill(
        &self,
        dataset: &str,
        revision: &str,
    ) -> Result<DatasetBackfillPlan, OrchestratorError> {
        let state =
            DatasetState::load(&self.graph, &self.queue, &self.cache, dataset, revision).await?;
        Ok(DatasetBackfillPlan::new(&self.graph, &self.config, &state))
    }

    /// Reconcile a dataset's queue with its cache and the graph
    ///
    /// Returns the executed plan summary, e.g. `["CreateJobs,9"]`.
    pub async fn backfill_dataset(
        &self,
        dataset: &str,
        revision: &str,
    ) -> Result<Vec<String>, OrchestratorError> {
        let plan = self.plan_backfill(dataset, revision).await?;
        let response = plan.as_response();
        plan.run(&self.queue).await?;
        if !response.is_empty() {
            info!(dataset, revision, tasks = ?response, "backfill executed");
        }
        Ok(response)
    }

    /// Drop every trace of a dataset: queue rows, branch locks, cache rows
    ///
    /// An in-flight runner is not preempted; its late upsert is overwritten
    /// or removed by the next call.
    pub async fn remove_dataset(&self, dataset: &str) -> Result<(), OrchestratorError> {
        let jobs = self.queue.delete_dataset_jobs(dataset).await?;
        let locks = self.queue.delete_dataset_locks(dataset).await?;
        let entries = self.cache.delete_dataset(dataset).await?;
        info!(dataset, jobs, locks, entries, "dataset removed");
        Ok(())
    }

    /// Whether any pending job exists whose type is one of the given steps
    /// or any of their ancestors
    pub async fn has_pending_ancestor_jobs(
        &self,
        dataset: &str,
        step_names: &[&str],
    ) -> Result<bool, OrchestratorError> {
        let mut job_types: BTreeSet<String> = BTreeSet::new();
        for name in step_names {
            let step = self.graph.step(name)?;
            job_types.insert(step.name.clone());
            for ancestor in self.graph.ancestors(name)? {
                job_types.insert(ancestor.name.clone());
            }
        }
        let job_types: Vec<&str> = job_types.iter().map(String::as_str).collect();
        Ok(self.queue.has_pending_jobs_of_types(dataset, &job_types).await?)
    }
}
