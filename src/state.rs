//! Derived state of a dataset's artifacts
//!
//! Recomputed from scratch on every planning pass and never persisted:
//! given the dataset's pending jobs and cache rows, build the
//! dataset → configs → splits tree with one `ArtifactState` per
//! `(step, input)`. Config and split names are enumerated from the cache,
//! deliberately even when the source entry belongs to another revision, so
//! fan-out stays responsive while upstream catches up.

use crate::cache::{CacheEntryMetadata, CacheEntrySnapshot, CacheStore};
use crate::config::{OrchestratorConfig, CONFIG_SPLIT_NAMES_KINDS, DATASET_CONFIG_NAMES_KINDS};
use crate::error::OrchestratorError;
use crate::graph::{Artifact, InputType, ProcessingGraph, ProcessingStep};
use crate::queue::{PendingJob, Queue};
use std::collections::BTreeMap;

/// Queue-side state of one artifact
#[derive(Debug, Clone, Default)]
pub struct JobState {
    /// Pending rows matching the artifact, oldest first
    pub pending: Vec<PendingJob>,
}

impl JobState {
    /// Whether any WAITING or STARTED job exists for the artifact
    pub fn is_in_process(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Cache-side state of one artifact
#[derive(Debug, Clone)]
pub struct CacheState {
    /// Metadata of the cache row, if any
    pub metadata: Option<CacheEntryMetadata>,
    /// The version the step's runner is at now
    pub step_job_runner_version: u32,
}

impl CacheState {
    pub fn is_empty(&self) -> bool {
        self.metadata.is_none()
    }

    pub fn is_success(&self) -> bool {
        self.metadata.as_ref().map(CacheEntryMetadata::is_success).unwrap_or(false)
    }

    /// Transient error below the failure budget
    pub fn is_error_to_retry(&self, config: &OrchestratorConfig) -> bool {
        let Some(metadata) = &self.metadata else {
            return false;
        };
        metadata.http_status >= 400
            && metadata
                .error_code
                .as_deref()
                .map(|code| config.is_error_code_to_retry(code))
                .unwrap_or(false)
            && metadata.failed_runs < config.max_failed_runs
    }

    /// Strictly older than another entry; false when either side is missing
    pub fn is_older_than(&self, other: &CacheState) -> bool {
        match (&self.metadata, &other.metadata) {
            (Some(mine), Some(theirs)) => mine.updated_at < theirs.updated_at,
            _ => false,
        }
    }

    /// Missing entries count as different; so do entries from any other
    /// revision
    pub fn is_git_revision_different_from(&self, revision: &str) -> bool {
        self.metadata
            .as_ref()
            .map(|metadata| metadata.dataset_git_revision != revision)
            .unwrap_or(true)
    }

    /// An entry written by an older runner (or with no recorded version)
    pub fn is_job_runner_obsolete(&self) -> bool {
        let Some(metadata) = &self.metadata else {
            return false;
        };
        match metadata.job_runner_version {
            None => true,
            Some(version) => version < self.step_job_runner_version,
        }
    }
}

/// Why an artifact does (or does not) need a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheClassification {
    UpToDate,
    Empty,
    DifferentRevision,
    OutdatedByParent,
    JobRunnerObsolete,
    ErrorToRetry,
}

/// Classify one artifact against the current revision and its parents
///
/// First match wins, in this order: empty, different revision, outdated by
/// parent, obsolete runner, retryable error. Everything else is up to date;
/// in particular a permanent error at the current revision stays where it
/// is instead of looping through the queue.
pub fn classify(
    artifact: &ArtifactState,
    parents: &[&ArtifactState],
    revision: &str,
    config: &OrchestratorConfig,
) -> CacheClassification {
    let cache = &artifact.cache_state;
    if cache.is_empty() {
        CacheClassification::Empty
    } else if cache.is_git_revision_different_from(revision) {
        CacheClassification::DifferentRevision
    } else if parents.iter().any(|parent| cache.is_older_than(&parent.cache_state)) {
        CacheClassification::OutdatedByParent
    } else if cache.is_job_runner_obsolete() {
        CacheClassification::JobRunnerObsolete
    } else if cache.is_error_to_retry(config) {
        CacheClassification::ErrorToRetry
    } else {
        CacheClassification::UpToDate
    }
}

/// The full derived state of one artifact
#[derive(Debug, Clone)]
pub struct ArtifactState {
    pub step: ProcessingStep,
    pub artifact: Artifact,
    pub job_state: JobState,
    pub cache_state: CacheState,
}

impl ArtifactState {
    /// Canonical artifact id
    pub fn id(&self) -> String {
        self.artifact.id()
    }

    fn build(
        step: &ProcessingStep,
        dataset: &str,
        revision: &str,
        config: Option<&str>,
        split: Option<&str>,
        pending_jobs: &[PendingJob],
        cache_entries: &[CacheEntrySnapshot],
    ) -> Self {
        let pending = pending_jobs
            .iter()
            .filter(|job| {
                job.job_type == step.name
                    && job.revision == revision
                    && job.config.as_deref() == config
                    && job.split.as_deref() == split
            })
            .cloned()
            .collect();
        let metadata = cache_entries
            .iter()
            .find(|entry| {
                entry.kind == step.name
                    && entry.config.as_deref() == config
                    && entry.split.as_deref() == split
            })
            .map(|entry| entry.metadata.clone());
        Self {
            step: step.clone(),
            artifact: Artifact::new(&step.name, dataset, revision, config, split),
            job_state: JobState { pending },
            cache_state: CacheState {
                metadata,
                step_job_runner_version: step.job_runner_version,
            },
        }
    }
}

/// State of one split of one config
#[derive(Debug, Clone)]
pub struct SplitState {
    pub split: String,
    pub artifact_states: Vec<ArtifactState>,
}

/// State of one config, with its discovered splits
#[derive(Debug, Clone)]
pub struct ConfigState {
    pub config: String,
    pub split_names: Vec<String>,
    pub artifact_states: Vec<ArtifactState>,
    pub split_states: Vec<SplitState>,
}

/// State of a whole dataset at one revision
#[derive(Debug, Clone)]
pub struct DatasetState {
    pub dataset: String,
    pub revision: String,
    pub config_names: Vec<String>,
    pub artifact_states: Vec<ArtifactState>,
    pub config_states: Vec<ConfigState>,
    /// The raw pending snapshot the tree was assembled from (all revisions)
    pub pending_jobs: Vec<PendingJob>,
}

impl DatasetState {
    /// Read the dataset's snapshots and enumerations, then assemble
    pub async fn load(
        graph: &ProcessingGraph,
        queue: &Queue,
        cache: &CacheStore,
        dataset: &str,
        revision: &str,
    ) -> Result<Self, OrchestratorError> {
        let pending_jobs = queue.get_pending_jobs(Some(dataset), None).await?;
        let cache_entries = cache.entries_for_dataset(dataset).await?;
        let config_names = cache
            .fetch_names(dataset, None, DATASET_CONFIG_NAMES_KINDS, "config_names", "config")
            .await;
        let mut split_names_by_config = BTreeMap::new();
        for config in &config_names {
            let split_names = cache
                .fetch_names(dataset, Some(config), CONFIG_SPLIT_NAMES_KINDS, "splits", "split")
                .await;
            split_names_by_config.insert(config.clone(), split_names);
        }
        Ok(Self::assemble(
            graph,
            dataset,
            revision,
            pending_jobs,
            cache_entries,
            config_names,
            split_names_by_config,
        ))
    }

    /// Pure assembly from snapshots
    pub fn assemble(
        graph: &ProcessingGraph,
        dataset: &str,
        revision: &str,
        pending_jobs: Vec<PendingJob>,
        cache_entries: Vec<CacheEntrySnapshot>,
        config_names: Vec<String>,
        split_names_by_config: BTreeMap<String, Vec<String>>,
    ) -> Self {
        let artifact_states = graph
            .steps_for_input_type(InputType::Dataset)
            .into_iter()
            .map(|step| {
                ArtifactState::build(step, dataset, revision, None, None, &pending_jobs, &cache_entries)
            })
            .collect();

        let config_states = config_names
            .iter()
            .map(|config| {
                let split_names = split_names_by_config.get(config).cloned().unwrap_or_default();
                let config_artifacts = graph
                    .steps_for_input_type(InputType::Config)
                    .into_iter()
                    .map(|step| {
                        ArtifactState::build(
                            step,
                            dataset,
                            revision,
                            Some(config),
                            None,
                            &pending_jobs,
                            &cache_entries,
                        )
                    })
                    .collect();
                let split_states = split_names
                    .iter()
                    .map(|split| SplitState {
                        split: split.clone(),
                        artifact_states: graph
                            .steps_for_input_type(InputType::Split)
                            .into_iter()
                            .map(|step| {
                                ArtifactState::build(
                                    step,
                                    dataset,
                                    revision,
                                    Some(config),
                                    Some(split),
                                    &pending_jobs,
                                    &cache_entries,
                                )
                            })
                            .collect(),
                    })
                    .collect();
                ConfigState {
                    config: config.clone(),
                    split_names,
                    artifact_states: config_artifacts,
                    split_states,
                }
            })
            .collect();

        Self {
            dataset: dataset.to_string(),
            revision: revision.to_string(),
            config_names,
            artifact_states,
            config_states,
            pending_jobs,
        }
    }

    /// Every artifact state in the tree
    pub fn all_artifact_states(&self) -> Vec<&ArtifactState> {
        let mut all: Vec<&ArtifactState> = self.artifact_states.iter().collect();
        for config_state in &self.config_states {
            all.extend(config_state.artifact_states.iter());
            for split_state in &config_state.split_states {
                all.extend(split_state.artifact_states.iter());
            }
        }
        all
    }

    /// Artifact states of one step, scoped to the coordinates of a
    /// dependent artifact
    ///
    /// A dataset-scoped step yields its single artifact; a config-scoped
    /// step yields the named config's artifact or, from a dataset-scoped
    /// dependent, every config's; a split-scoped step widens the same way.
    pub fn artifact_states_for_step(
        &self,
        step: &ProcessingStep,
        config: Option<&str>,
        split: Option<&str>,
    ) -> Vec<&ArtifactState> {
        match step.input_type {
            InputType::Dataset => self
                .artifact_states
                .iter()
                .filter(|state| state.step.name == step.name)
                .collect(),
            InputType::Config => self
                .config_states
                .iter()
                .filter(|state| config.is_none() || config == Some(state.config.as_str()))
                .flat_map(|state| state.artifact_states.iter())
                .filter(|state| state.step.name == step.name)
                .collect(),
            InputType::Split => self
                .config_states
                .iter()
                .filter(|state| config.is_none() || config == Some(state.config.as_str()))
                .flat_map(|state| state.split_states.iter())
                .filter(|state| split.is_none() || split == Some(state.split.as_str()))
                .flat_map(|state| state.artifact_states.iter())
                .filter(|state| state.step.name == step.name)
                .collect(),
        }
    }
}
