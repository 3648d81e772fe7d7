//! Error types for the orchestration core

use thiserror::Error;

/// Errors raised while constructing or querying a processing graph
///
/// All of these are fatal at startup: a process must not run against a
/// specification it could not validate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// The specification contains no steps
    #[error("processing graph specification is empty")]
    EmptySpecification,

    /// A step references a parent that is not part of the specification
    #[error("step '{step}' is triggered by unknown step '{parent}'")]
    UnknownParent { step: String, parent: String },

    /// The triggered-by edges contain a cycle
    #[error("processing graph contains a cycle involving '{0}'")]
    Cycle(String),

    /// A root step (no parents) must take a dataset input
    #[error("root step '{0}' must have a dataset input type")]
    RootNotDatasetScoped(String),

    /// A dataset-scoped parent cannot trigger a split-scoped child directly:
    /// split names cannot be enumerated from a dataset-level output
    #[error("step '{child}' (split input) cannot be triggered directly by '{parent}' (dataset input)")]
    UnsupportedEdge { child: String, parent: String },

    /// A name that does not resolve to any step
    #[error("unknown processing step '{0}'")]
    UnknownStep(String),
}

/// Errors raised by the cache store
#[derive(Debug, Error)]
pub enum CacheError {
    /// The requested entry does not exist. Normal control flow, never an
    /// incident.
    #[error("cache entry does not exist")]
    DoesNotExist,

    /// Underlying database failure
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// The stored payload could not be encoded or decoded
    #[error("invalid cache payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl CacheError {
    /// Whether this error is the benign cache-miss signal
    pub fn is_does_not_exist(&self) -> bool {
        matches!(self, CacheError::DoesNotExist)
    }
}

/// Errors raised by the job queue
#[derive(Debug, Error)]
pub enum QueueError {
    /// No waiting job matched the eligibility filters. Workers idle-wait on
    /// this.
    #[error("no eligible waiting job in the queue")]
    EmptyQueue,

    /// The named lock could not be acquired before the retry schedule ran
    /// out
    #[error("lock '{key}' could not be acquired, retry schedule exhausted")]
    LockTimeout { key: String },

    /// The job does not exist (already finished, swept, or deleted)
    #[error("job {0} does not exist")]
    JobNotFound(i64),

    /// Underlying database failure
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl QueueError {
    /// Whether this error is the expected empty-queue signal
    pub fn is_empty_queue(&self) -> bool {
        matches!(self, QueueError::EmptyQueue)
    }

    /// Whether a caller should retry later instead of surfacing a failure
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::EmptyQueue | QueueError::LockTimeout { .. })
    }
}

/// Top-level error for orchestrator operations
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}
