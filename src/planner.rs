//! Planners: reconcile graph, cache and queue into minimal queue edits
//!
//! The backfill planner diffs a whole dataset tree against the graph; the
//! after-job planner cascades from one finished job to its children,
//! fanning out across newly discovered configs or splits. Both produce a
//! task list (`CreateJobs,<n>` / `DeleteJobs,<n>`) that executes against
//! the queue; both are safe to re-run, stale reads included, because every
//! pass recomputes from scratch.

use crate::cache::CacheStore;
use crate::config::{OrchestratorConfig, CONFIG_INFO_KIND, CONFIG_SPLIT_NAMES_KINDS};
use crate::error::OrchestratorError;
use crate::graph::{InputType, ProcessingGraph, ProcessingStep};
use crate::job::{JobInfo, JobParams, JobStatus, NewJob, Priority};
use crate::queue::{PendingJob, Queue};
use crate::state::{classify, ArtifactState, CacheClassification, DatasetState};
use std::collections::HashSet;
use tracing::{debug, warn};

/// One queue edit of a plan
#[derive(Debug, Clone, PartialEq)]
pub enum Task {
    CreateJobs(Vec<NewJob>),
    DeleteJobs(Vec<i64>),
}

impl Task {
    /// Tag rendered into plan summaries, e.g. `CreateJobs,9`
    pub fn as_tag(&self) -> String {
        match self {
            Task::CreateJobs(jobs) => format!("CreateJobs,{}", jobs.len()),
            Task::DeleteJobs(job_ids) => format!("DeleteJobs,{}", job_ids.len()),
        }
    }

    async fn run(&self, queue: &Queue) -> Result<(), OrchestratorError> {
        match self {
            Task::CreateJobs(jobs) => {
                queue.create_jobs(jobs).await?;
            }
            Task::DeleteJobs(job_ids) => {
                queue.delete_jobs_by_ids(job_ids).await?;
            }
        }
        Ok(())
    }
}

fn tasks_of(jobs_to_create: Vec<NewJob>, jobs_to_delete: Vec<i64>) -> Vec<Task> {
    let mut tasks = Vec::new();
    if !jobs_to_create.is_empty() {
        tasks.push(Task::CreateJobs(jobs_to_create));
    }
    if !jobs_to_delete.is_empty() {
        tasks.push(Task::DeleteJobs(jobs_to_delete));
    }
    tasks
}

async fn run_tasks(tasks: &[Task], queue: &Queue) -> Result<(), OrchestratorError> {
    for task in tasks {
        task.run(queue).await?;
    }
    Ok(())
}

/// Artifact ids bucketed by classification
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStatus {
    pub up_to_date: Vec<String>,
    pub cache_is_empty: Vec<String>,
    pub cache_has_different_git_revision: Vec<String>,
    pub cache_is_outdated_by_parent: Vec<String>,
    pub cache_is_job_runner_obsolete: Vec<String>,
    pub cache_is_error_to_retry: Vec<String>,
}

impl CacheStatus {
    fn record(&mut self, classification: CacheClassification, artifact_id: String) {
        match classification {
            CacheClassification::UpToDate => self.up_to_date.push(artifact_id),
            CacheClassification::Empty => self.cache_is_empty.push(artifact_id),
            CacheClassification::DifferentRevision => {
                self.cache_has_different_git_revision.push(artifact_id)
            }
            CacheClassification::OutdatedByParent => {
                self.cache_is_outdated_by_parent.push(artifact_id)
            }
            CacheClassification::JobRunnerObsolete => {
                self.cache_is_job_runner_obsolete.push(artifact_id)
            }
            CacheClassification::ErrorToRetry => self.cache_is_error_to_retry.push(artifact_id),
        }
    }

    fn sort(&mut self) {
        self.up_to_date.sort();
        self.cache_is_empty.sort();
        self.cache_has_different_git_revision.sort();
        self.cache_is_outdated_by_parent.sort();
        self.cache_is_job_runner_obsolete.sort();
        self.cache_is_error_to_retry.sort();
    }
}

/// Artifact ids with a pending job
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueStatus {
    pub in_process: Vec<String>,
}

/// Reconciliation plan for one dataset at one revision
#[derive(Debug, Clone)]
pub struct DatasetBackfillPlan {
    pub cache_status: CacheStatus,
    pub queue_status: QueueStatus,
    tasks: Vec<Task>,
}

impl DatasetBackfillPlan {
    /// Diff an assembled dataset tree against the graph
    ///
    /// Every artifact that is not up to date gets exactly one pending job;
    /// jobs of up-to-date artifacts, duplicate rows, and rows matching no
    /// artifact of the tree (obsolete revisions, configs, splits or types)
    /// are deleted. Pure: execution happens in [`run`](Self::run).
    pub fn new(
        graph: &ProcessingGraph,
        config: &OrchestratorConfig,
        dataset_state: &DatasetState,
    ) -> Self {
        let mut cache_status = CacheStatus::default();
        let mut queue_status = QueueStatus::default();
        let mut jobs_to_create: Vec<NewJob> = Vec::new();
        let mut jobs_to_delete: Vec<i64> = Vec::new();
        let mut matched_rows: HashSet<i64> = HashSet::new();

        for artifact in dataset_state.all_artifact_states() {
            // the step came out of this graph, so the lookup cannot miss
            let parent_steps = graph.parents(&artifact.step.name).unwrap_or_default();
            let parent_states: Vec<&ArtifactState> = parent_steps
                .iter()
                .flat_map(|parent| {
                    dataset_state.artifact_states_for_step(
                        *parent,
                        artifact.artifact.config.as_deref(),
                        artifact.artifact.split.as_deref(),
                    )
                })
                .collect();
            let classification =
                classify(artifact, &parent_states, &dataset_state.revision, config);
            cache_status.record(classification, artifact.id());

            let rows = &artifact.job_state.pending;
            matched_rows.extend(rows.iter().map(|row| row.job_id));
            if artifact.job_state.is_in_process() {
                queue_status.in_process.push(artifact.id());
            }

            if classification == CacheClassification::UpToDate {
                jobs_to_delete.extend(rows.iter().map(|row| row.job_id));
            } else if rows.is_empty() {
                let failed_runs = artifact
                    .cache_state
                    .metadata
                    .as_ref()
                    .map(|metadata| metadata.failed_runs)
                    .unwrap_or(0);
                jobs_to_create.push(NewJob {
                    job_type: artifact.step.name.clone(),
                    params: JobParams {
                        dataset: dataset_state.dataset.clone(),
                        revision: dataset_state.revision.clone(),
                        config: artifact.artifact.config.clone(),
                        split: artifact.artifact.split.clone(),
                    },
                    priority: Priority::Normal,
                    difficulty: compute_difficulty(
                        config,
                        artifact.step.difficulty,
                        0,
                        failed_runs,
                    ),
                });
            } else {
                jobs_to_delete.extend(excess_rows(rows));
            }
        }

        // rows the tree did not claim: obsolete revision, config, split or
        // job type
        for row in &dataset_state.pending_jobs {
            if !matched_rows.contains(&row.job_id) {
                jobs_to_delete.push(row.job_id);
            }
        }

        cache_status.sort();
        queue_status.in_process.sort();

        debug!(
            dataset = %dataset_state.dataset,
            create = jobs_to_create.len(),
            delete = jobs_to_delete.len(),
            "backfill plan computed"
        );

        Self { cache_status, queue_status, tasks: tasks_of(jobs_to_create, jobs_to_delete) }
    }

    /// Plan summary, creations first
    pub fn as_response(&self) -> Vec<String> {
        self.tasks.iter().map(Task::as_tag).collect()
    }

    /// Whether the plan changes anything
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Execute the plan against the queue
    pub async fn run(&self, queue: &Queue) -> Result<(), OrchestratorError> {
        run_tasks(&self.tasks, queue).await
    }
}

/// Post-completion cascade for one finished job
#[derive(Debug, Clone)]
pub struct AfterJobPlan {
    tasks: Vec<Task>,
}

impl AfterJobPlan {
    /// Plan the children of a finished job
    ///
    /// Same-scope children inherit the finished job's coordinates; a child
    /// one level up takes the coarser coordinates; a more specific child
    /// fans out across the names enumerated from the cache (the entry the
    /// finished job just wrote included). For every expected child exactly
    /// one pending row is kept; duplicate twins and same-coordinate rows
    /// left over from older revisions are deleted. Pending children at
    /// other coordinates are not touched, the backfill planner owns those.
    pub async fn new(
        graph: &ProcessingGraph,
        config: &OrchestratorConfig,
        queue: &Queue,
        cache: &CacheStore,
        job_info: &JobInfo,
        failed_runs: u32,
    ) -> Result<Self, OrchestratorError> {
        let step = graph.step(&job_info.job_type)?;
        let children = graph.children(&step.name)?;
        if children.is_empty() {
            return Ok(Self { tasks: Vec::new() });
        }
        let params = &job_info.params;

        // the bonus applies only when the info aggregate is present and
        // reports a big dataset; anything missing means "not big"
        let is_big = if children.iter().any(|child| child.bonus_difficulty_if_dataset_is_big > 0) {
            dataset_size(cache, &params.dataset, params.config.as_deref())
                .await
                .map(|size| size >= graph.min_bytes_for_bonus_difficulty())
                .unwrap_or(false)
        } else {
            false
        };

        let child_types: Vec<&str> = children.iter().map(|child| child.name.as_str()).collect();
        let mut planner = ChildPlanner {
            config,
            params,
            priority: job_info.priority,
            failed_runs,
            is_big,
            remaining: queue.get_pending_jobs(Some(params.dataset.as_str()), Some(&child_types)).await?,
            jobs_to_create: Vec::new(),
            jobs_to_delete: Vec::new(),
        };

        let mut config_names: Option<Vec<String>> = None;
        let mut split_names: Option<Vec<String>> = None;
        for child in children {
            match (step.input_type, child.input_type) {
                (parent, child_input) if parent == child_input => {
                    planner.plan(child, params.config.clone(), params.split.clone());
                }
                (_, InputType::Dataset) => {
                    planner.plan(child, None, None);
                }
                (InputType::Split, InputType::Config) => {
                    planner.plan(child, params.config.clone(), None);
                }
                (InputType::Dataset, InputType::Config) => {
                    // configs are enumerated from the output the finished
                    // step just wrote
                    if config_names.is_none() {
                        config_names = Some(
                            cache
                                .fetch_names(
                                    &params.dataset,
                                    None,
                                    &[step.cache_kind()],
                                    "config_names",
                                    "config",
                                )
                                .await,
                        );
                    }
                    for name in config_names.clone().unwrap_or_default() {
                        planner.plan(child, Some(name), None);
                    }
                }
                (InputType::Config, InputType::Split) => {
                    if split_names.is_none() {
                        split_names = Some(
                            cache
                                .fetch_names(
                                    &params.dataset,
                                    params.config.as_deref(),
                                    CONFIG_SPLIT_NAMES_KINDS,
                                    "splits",
                                    "split",
                                )
                                .await,
                        );
                    }
                    for name in split_names.clone().unwrap_or_default() {
                        planner.plan(child, params.config.clone(), Some(name));
                    }
                }
                (parent_input, child_input) => {
                    // rejected at graph construction; left as a guard for
                    // graphs built by other means
                    warn!(
                        parent = %step.name,
                        child = %child.name,
                        %parent_input, %child_input,
                        "unsupported fan-out, skipping child"
                    );
                }
            }
        }

        Ok(Self { tasks: tasks_of(planner.jobs_to_create, planner.jobs_to_delete) })
    }

    /// Plan summary, creations first
    pub fn as_response(&self) -> Vec<String> {
        self.tasks.iter().map(Task::as_tag).collect()
    }

    /// The jobs the plan would create
    pub fn jobs_to_create(&self) -> &[NewJob] {
        self.tasks
            .iter()
            .find_map(|task| match task {
                Task::CreateJobs(jobs) => Some(jobs.as_slice()),
                Task::DeleteJobs(_) => None,
            })
            .unwrap_or(&[])
    }

    /// Execute the plan against the queue
    pub async fn run(&self, queue: &Queue) -> Result<(), OrchestratorError> {
        run_tasks(&self.tasks, queue).await
    }
}

struct ChildPlanner<'a> {
    config: &'a OrchestratorConfig,
    params: &'a JobParams,
    priority: Priority,
    failed_runs: u32,
    is_big: bool,
    remaining: Vec<PendingJob>,
    jobs_to_create: Vec<NewJob>,
    jobs_to_delete: Vec<i64>,
}

impl ChildPlanner<'_> {
    /// Keep exactly one pending row for the expected child, or create one
    ///
    /// Rows of the same child at the same coordinates that are duplicates
    /// or carry another revision go to the delete set.
    fn plan(&mut self, child: &ProcessingStep, config: Option<String>, split: Option<String>) {
        let mut kept = false;
        let mut index = 0;
        while index < self.remaining.len() {
            let row = &self.remaining[index];
            let same_coordinates = row.job_type == child.name
                && row.config.as_deref() == config.as_deref()
                && row.split.as_deref() == split.as_deref();
            if !same_coordinates {
                index += 1;
                continue;
            }
            let row = self.remaining.remove(index);
            if !kept && row.revision == self.params.revision {
                kept = true;
            } else {
                self.jobs_to_delete.push(row.job_id);
            }
        }
        if kept {
            return;
        }
        let bonus = if self.is_big { child.bonus_difficulty_if_dataset_is_big } else { 0 };
        self.jobs_to_create.push(NewJob {
            job_type: child.name.clone(),
            params: JobParams {
                dataset: self.params.dataset.clone(),
                revision: self.params.revision.clone(),
                config,
                split,
            },
            priority: self.priority,
            difficulty: compute_difficulty(self.config, child.difficulty, bonus, self.failed_runs),
        });
    }
}

/// `min(max, base + bonus + failed_runs * penalty)`
fn compute_difficulty(
    config: &OrchestratorConfig,
    base: u32,
    bonus: u32,
    failed_runs: u32,
) -> u32 {
    (base + bonus + failed_runs * config.difficulty_bonus_by_failed_runs)
        .min(config.default_difficulty_max)
}

/// Duplicate rows of one artifact: everything but the best row, preferring
/// a running job over a waiting one, then the oldest
fn excess_rows(rows: &[PendingJob]) -> Vec<i64> {
    if rows.len() <= 1 {
        return Vec::new();
    }
    let mut sorted: Vec<&PendingJob> = rows.iter().collect();
    sorted.sort_by_key(|row| {
        let status_rank = match row.status {
            JobStatus::Started => 0,
            JobStatus::Waiting => 1,
        };
        (status_rank, row.created_at, row.job_id)
    });
    sorted.iter().skip(1).map(|row| row.job_id).collect()
}

/// `content.dataset_info.dataset_size` of the config's info aggregate
async fn dataset_size(cache: &CacheStore, dataset: &str, config: Option<&str>) -> Option<u64> {
    let entry = cache.get(CONFIG_INFO_KIND, dataset, config, None).await.ok()?;
    if !entry.metadata.is_success() {
        return None;
    }
    entry.content.get("dataset_info")?.get("dataset_size")?.as_u64()
}
