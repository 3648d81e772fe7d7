//! Job data types shared by the queue, the planners and the workers

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Scheduling priority of a job
///
/// Selection prefers higher priorities; within a priority band the queue
/// picks the lowest difficulty, then the oldest job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    /// Rank used by the selection ORDER BY (lower rank is served first)
    pub(crate) fn rank(self) -> i64 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            _ => Err(anyhow::anyhow!("Invalid priority: {}", s)),
        }
    }
}

/// Queue status of a job
///
/// Finished jobs are deleted rather than kept in a terminal state; the
/// cache row is the durable record of the outcome.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be picked up by a worker
    Waiting,
    /// Claimed by a worker and holding a lease
    Started,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Waiting => write!(f, "waiting"),
            JobStatus::Started => write!(f, "started"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "waiting" => Ok(JobStatus::Waiting),
            "started" => Ok(JobStatus::Started),
            _ => Err(anyhow::anyhow!("Invalid job status: {}", s)),
        }
    }
}

/// Coordinates of the input a job runs on
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct JobParams {
    pub dataset: String,
    /// Upstream git revision the job is scoped to
    pub revision: String,
    pub config: Option<String>,
    pub split: Option<String>,
}

impl JobParams {
    /// Dataset-scoped coordinates
    pub fn dataset_level(dataset: &str, revision: &str) -> Self {
        Self {
            dataset: dataset.to_string(),
            revision: revision.to_string(),
            config: None,
            split: None,
        }
    }

    /// Config-scoped coordinates
    pub fn config_level(dataset: &str, revision: &str, config: &str) -> Self {
        Self {
            dataset: dataset.to_string(),
            revision: revision.to_string(),
            config: Some(config.to_string()),
            split: None,
        }
    }

    /// Split-scoped coordinates
    pub fn split_level(dataset: &str, revision: &str, config: &str, split: &str) -> Self {
        Self {
            dataset: dataset.to_string(),
            revision: revision.to_string(),
            config: Some(config.to_string()),
            split: Some(split.to_string()),
        }
    }
}

/// A claimed job, as handed to a worker by `Queue::start_job`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobInfo {
    pub job_id: i64,
    pub job_type: String,
    pub params: JobParams,
    pub priority: Priority,
    pub difficulty: u32,
}

/// A job to be enqueued (no id yet, always starts WAITING)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewJob {
    pub job_type: String,
    pub params: JobParams,
    pub priority: Priority,
    pub difficulty: u32,
}

impl NewJob {
    /// Identity used for duplicate collapse among WAITING rows
    pub(crate) fn unicity_id(&self) -> String {
        unicity_id(
            &self.job_type,
            &self.params.dataset,
            &self.params.revision,
            self.params.config.as_deref(),
            self.params.split.as_deref(),
        )
    }
}

/// Canonical duplicate-detection key for a job
pub(crate) fn unicity_id(
    job_type: &str,
    dataset: &str,
    revision: &str,
    config: Option<&str>,
    split: Option<&str>,
) -> String {
    format!(
        "{},{},{},{},{}",
        job_type,
        dataset,
        revision,
        config.unwrap_or(""),
        split.unwrap_or("")
    )
}

/// The output a runner computed for a job
///
/// Errors are outputs too: an `http_status >= 400` row is stored like any
/// success so that `failed_runs` accounting stays uniform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobOutput {
    pub content: Value,
    pub http_status: u16,
    pub error_code: Option<String>,
    pub details: Option<Value>,
    pub progress: Option<f64>,
}

impl JobOutput {
    /// A successful output with full progress
    pub fn success(content: Value) -> Self {
        Self {
            content,
            http_status: 200,
            error_code: None,
            details: None,
            progress: Some(1.0),
        }
    }

    /// An error output
    pub fn error(http_status: u16, error_code: &str, details: Option<Value>) -> Self {
        Self {
            content: Value::Object(Default::default()),
            http_status,
            error_code: Some(error_code.to_string()),
            details,
            progress: None,
        }
    }

    /// Whether the output reports success
    pub fn is_success(&self) -> bool {
        self.http_status < 400
    }
}

/// What a worker reports back when a job ends
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobResult {
    pub job_info: JobInfo,
    pub job_runner_version: u32,
    pub is_success: bool,
    /// `None` when the runner died before producing anything; the queue row
    /// is then released without touching the cache
    pub output: Option<JobOutput>,
}
