//! Configuration for the orchestration core
//!
//! Groups the tunables that steer retry classification, difficulty
//! computation and lease accounting. Defaults match the production
//! deployment; everything is overridable from the CLI or embedding
//! services.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Cache kinds that enumerate a dataset's config names, in lookup order.
pub const DATASET_CONFIG_NAMES_KINDS: &[&str] = &["dataset-config-names"];

/// Cache kinds that enumerate a config's split names, in lookup order.
///
/// The order is part of the contract: `fetch_names` prefers the first kind
/// with a successful entry. Pinned by tests, do not reorder casually.
pub const CONFIG_SPLIT_NAMES_KINDS: &[&str] =
    &["config-split-names-from-info", "config-split-names-from-streaming"];

/// Cache kind holding the per-config info aggregate (carries dataset_size).
pub const CONFIG_INFO_KIND: &str = "config-info";

/// Error code reported when a runner dies without producing an output.
pub const JOB_RUNNER_CRASHED_ERROR_CODE: &str = "JobRunnerCrashedError";

/// Default base difficulty for a step that does not declare one.
pub const DEFAULT_DIFFICULTY: u32 = 50;

/// Ceiling for any computed difficulty.
pub const DEFAULT_DIFFICULTY_MAX: u32 = 100;

/// Datasets whose info aggregate reports at least this many bytes receive
/// the per-step bonus difficulty.
pub const DEFAULT_MIN_BYTES_FOR_BONUS_DIFFICULTY: u64 = 3_000_000_000;

fn default_max_failed_runs() -> u32 {
    3
}

fn default_difficulty_bonus_by_failed_runs() -> u32 {
    20
}

fn default_difficulty_max() -> u32 {
    DEFAULT_DIFFICULTY_MAX
}

fn default_error_codes_to_retry() -> Vec<String> {
    [
        "CreateCommitError",
        "ExternalServerError",
        "JobRunnerCrashedError",
        "LockedDatasetTimeoutError",
        "PreviousStepFormatError",
    ]
    .iter()
    .map(|code| code.to_string())
    .collect()
}

fn default_lease_ttl_seconds() -> u64 {
    600
}

fn default_heartbeat_interval_seconds() -> u64 {
    60
}

/// Tunables for planners, classification and lease accounting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Consecutive same-revision failures after which an error entry stops
    /// being retried
    #[serde(default = "default_max_failed_runs")]
    pub max_failed_runs: u32,

    /// Error codes considered transient
    #[serde(default = "default_error_codes_to_retry")]
    pub error_codes_to_retry: Vec<String>,

    /// Additive difficulty penalty per recorded failed run, to steer
    /// retries towards off-peak workers
    #[serde(default = "default_difficulty_bonus_by_failed_runs")]
    pub difficulty_bonus_by_failed_runs: u32,

    /// Ceiling for computed difficulties
    #[serde(default = "default_difficulty_max")]
    pub default_difficulty_max: u32,

    /// How long a started job may go without a heartbeat before its lease
    /// expires. Must exceed twice the heartbeat interval.
    #[serde(default = "default_lease_ttl_seconds")]
    pub lease_ttl_seconds: u64,

    /// How often workers refresh their lease
    #[serde(default = "default_heartbeat_interval_seconds")]
    pub heartbeat_interval_seconds: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_failed_runs: default_max_failed_runs(),
            error_codes_to_retry: default_error_codes_to_retry(),
            difficulty_bonus_by_failed_runs: default_difficulty_bonus_by_failed_runs(),
            default_difficulty_max: default_difficulty_max(),
            lease_ttl_seconds: default_lease_ttl_seconds(),
            heartbeat_interval_seconds: default_heartbeat_interval_seconds(),
        }
    }
}

impl OrchestratorConfig {
    /// Lease TTL as a duration
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_seconds)
    }

    /// Heartbeat interval as a duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    /// Whether an error code warrants a retry
    pub fn is_error_code_to_retry(&self, error_code: &str) -> bool {
        self.error_codes_to_retry.iter().any(|code| code == error_code)
    }
}
