//! Persistent cache of computed artifact results
//!
//! One row per `(kind, dataset, config, split)`, holding the opaque JSON
//! payload a runner produced together with the metadata the planners need:
//! http status, error code, runner version, upstream git revision, update
//! time, progress and the count of consecutive failed runs. Writes are
//! single-key atomic upserts; readers never see a partial row.

use crate::error::CacheError;
use crate::job::{JobOutput, JobParams};
use crate::now_micros;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, warn};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cache_responses (
    kind TEXT NOT NULL,
    dataset TEXT NOT NULL,
    config TEXT NOT NULL DEFAULT '',
    split TEXT NOT NULL DEFAULT '',
    content TEXT NOT NULL,
    http_status INTEGER NOT NULL,
    error_code TEXT,
    details TEXT,
    progress REAL,
    job_runner_version INTEGER,
    dataset_git_revision TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    failed_runs INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (kind, dataset, config, split)
);
CREATE INDEX IF NOT EXISTS idx_cache_responses_dataset ON cache_responses (dataset);
";

/// Metadata of a cache entry, without its payload
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntryMetadata {
    pub http_status: u16,
    pub error_code: Option<String>,
    pub job_runner_version: Option<u32>,
    pub dataset_git_revision: String,
    /// Microseconds since the Unix epoch; strictly increasing per key
    pub updated_at: i64,
    pub progress: Option<f64>,
    pub failed_runs: u32,
}

impl CacheEntryMetadata {
    /// Whether the entry records a success
    pub fn is_success(&self) -> bool {
        self.http_status < 400
    }
}

/// A full cache entry, payload included
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub kind: String,
    pub dataset: String,
    pub config: Option<String>,
    pub split: Option<String>,
    pub content: Value,
    pub details: Option<Value>,
    pub metadata: CacheEntryMetadata,
}

/// Metadata-only row used by state assembly
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntrySnapshot {
    pub kind: String,
    pub config: Option<String>,
    pub split: Option<String>,
    pub metadata: CacheEntryMetadata,
}

/// One counter emitted by cache metrics collection
#[derive(Debug, Clone, PartialEq)]
pub struct CacheCount {
    pub kind: String,
    pub http_status: u16,
    pub error_code: Option<String>,
    pub count: u64,
}

/// SQLite-backed cache store
#[derive(Clone)]
pub struct CacheStore {
    pool: SqlitePool,
}

fn optional_key(value: Option<&str>) -> &str {
    // SQLite treats NULLs as distinct in unique constraints, so absent
    // config/split are stored as the empty string
    value.unwrap_or("")
}

fn key_to_optional(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn row_to_metadata(row: &SqliteRow) -> Result<CacheEntryMetadata, CacheError> {
    Ok(CacheEntryMetadata {
        http_status: row.try_get::<i64, _>("http_status")? as u16,
        error_code: row.try_get("error_code")?,
        job_runner_version: row
            .try_get::<Option<i64>, _>("job_runner_version")?
            .map(|version| version as u32),
        dataset_git_revision: row.try_get("dataset_git_revision")?,
        updated_at: row.try_get("updated_at")?,
        progress: row.try_get("progress")?,
        failed_runs: row.try_get::<i64, _>("failed_runs")? as u32,
    })
}

fn row_to_entry(row: &SqliteRow) -> Result<CacheEntry, CacheError> {
    let content: String = row.try_get("content")?;
    let details: Option<String> = row.try_get("details")?;
    Ok(CacheEntry {
        kind: row.try_get("kind")?,
        dataset: row.try_get("dataset")?,
        config: key_to_optional(row.try_get("config")?),
        split: key_to_optional(row.try_get("split")?),
        content: serde_json::from_str(&content)?,
        details: details.map(|text| serde_json::from_str(&text)).transpose()?,
        metadata: row_to_metadata(row)?,
    })
}

impl CacheStore {
    /// Open or create the cache database at the specified path
    pub async fn open(path: &str) -> Result<Self, CacheError> {
        let db_url = if path.starts_with("sqlite://") {
            path.to_string()
        } else {
            format!("sqlite://{}", path)
        };

        // WAL mode keeps concurrent planner reads off the writers' backs
        let options = SqliteConnectOptions::from_str(&db_url)
            .map_err(CacheError::Database)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;

        Ok(Self { pool })
    }

    /// Atomically replace or insert the entry for one key
    ///
    /// An error written over an existing entry at the same revision
    /// continues the `failed_runs` count; a success or a revision change
    /// resets it to zero. Returns the stored metadata.
    pub async fn upsert(
        &self,
        kind: &str,
        params: &JobParams,
        output: &JobOutput,
        job_runner_version: u32,
    ) -> Result<CacheEntryMetadata, CacheError> {
        let mut tx = self.pool.begin().await?;

        let previous = sqlx::query(
            "SELECT http_status, dataset_git_revision, updated_at, failed_runs
             FROM cache_responses
             WHERE kind = ? AND dataset = ? AND config = ? AND split = ?",
        )
        .bind(kind)
        .bind(&params.dataset)
        .bind(optional_key(params.config.as_deref()))
        .bind(optional_key(params.split.as_deref()))
        .fetch_optional(&mut *tx)
        .await?;

        let mut failed_runs: u32 = 0;
        let mut updated_at = now_micros();
        if let Some(row) = &previous {
            let previous_revision: String = row.try_get("dataset_git_revision")?;
            let previous_updated_at: i64 = row.try_get("updated_at")?;
            if previous_revision == params.revision && output.http_status >= 400 {
                failed_runs = row.try_get::<i64, _>("failed_runs")? as u32 + 1;
            }
            // keep updated_at strictly increasing per key
            updated_at = updated_at.max(previous_updated_at + 1);
        }

        let content = serde_json::to_string(&output.content)?;
        let details = output
            .details
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            "INSERT INTO cache_responses
                 (kind, dataset, config, split, content, http_status, error_code, details,
                  progress, job_runner_version, dataset_git_revision, updated_at, failed_runs)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (kind, dataset, config, split) DO UPDATE SET
                 content = excluded.content,
                 http_status = excluded.http_status,
                 error_code = excluded.error_code,
                 details = excluded.details,
                 progress = excluded.progress,
                 job_runner_version = excluded.job_runner_version,
                 dataset_git_revision = excluded.dataset_git_revision,
                 updated_at = excluded.updated_at,
                 failed_runs = excluded.failed_runs",
        )
        .bind(kind)
        .bind(&params.dataset)
        .bind(optional_key(params.config.as_deref()))
        .bind(optional_key(params.split.as_deref()))
        .bind(&content)
        .bind(output.http_status as i64)
        .bind(&output.error_code)
        .bind(&details)
        .bind(output.progress)
        .bind(job_runner_version as i64)
        .bind(&params.revision)
        .bind(updated_at)
        .bind(failed_runs as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(kind, dataset = %params.dataset, http_status = output.http_status, failed_runs, "cache upsert");

        Ok(CacheEntryMetadata {
            http_status: output.http_status,
            error_code: output.error_code.clone(),
            job_runner_version: Some(job_runner_version),
            dataset_git_revision: params.revision.clone(),
            updated_at,
            progress: output.progress,
            failed_runs,
        })
    }

    /// Get the entry for one key, or `CacheError::DoesNotExist`
    pub async fn get(
        &self,
        kind: &str,
        dataset: &str,
        config: Option<&str>,
        split: Option<&str>,
    ) -> Result<CacheEntry, CacheError> {
        let row = sqlx::query(
            "SELECT * FROM cache_responses
             WHERE kind = ? AND dataset = ? AND config = ? AND split = ?",
        )
        .bind(kind)
        .bind(dataset)
        .bind(optional_key(config))
        .bind(optional_key(split))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_entry(&row),
            None => Err(CacheError::DoesNotExist),
        }
    }

    /// Best entry among the given kinds for one input
    ///
    /// The first successful entry wins, in `kinds` order. With no success,
    /// the error entry with the highest http status wins, ties again broken
    /// by `kinds` order.
    pub async fn get_best(
        &self,
        kinds: &[&str],
        dataset: &str,
        config: Option<&str>,
        split: Option<&str>,
    ) -> Result<CacheEntry, CacheError> {
        let mut best_error: Option<CacheEntry> = None;
        for kind in kinds {
            match self.get(kind, dataset, config, split).await {
                Ok(entry) if entry.metadata.is_success() => return Ok(entry),
                Ok(entry) => {
                    let beats_current = best_error
                        .as_ref()
                        .map(|best| entry.metadata.http_status > best.metadata.http_status)
                        .unwrap_or(true);
                    if beats_current {
                        best_error = Some(entry);
                    }
                }
                Err(CacheError::DoesNotExist) => continue,
                Err(err) => return Err(err),
            }
        }
        best_error.ok_or(CacheError::DoesNotExist)
    }

    /// Extract an ordered, deduplicated list of names from the best response
    ///
    /// Reads `content[names_field][*][name_field]` of the best entry among
    /// `kinds`. Every failure (missing entry, error entry, malformed
    /// content) collapses to an empty list: fan-out must stay safe while
    /// upstream catches up.
    pub async fn fetch_names(
        &self,
        dataset: &str,
        config: Option<&str>,
        kinds: &[&str],
        names_field: &str,
        name_field: &str,
    ) -> Vec<String> {
        let entry = match self.get_best(kinds, dataset, config, None).await {
            Ok(entry) if entry.metadata.is_success() => entry,
            Ok(_) | Err(CacheError::DoesNotExist) => return Vec::new(),
            Err(err) => {
                warn!(dataset, names_field, error = %err, "name enumeration failed, returning no names");
                return Vec::new();
            }
        };

        let Some(items) = entry.content.get(names_field).and_then(Value::as_array) else {
            return Vec::new();
        };

        let mut names: Vec<String> = Vec::with_capacity(items.len());
        for item in items {
            let Some(name) = item.get(name_field).and_then(Value::as_str) else {
                // one malformed item invalidates the whole enumeration
                return Vec::new();
            };
            if !names.iter().any(|seen| seen == name) {
                names.push(name.to_string());
            }
        }
        names
    }

    /// Whether any entry exists for the dataset
    pub async fn has_some(&self, dataset: &str) -> Result<bool, CacheError> {
        let row = sqlx::query("SELECT 1 FROM cache_responses WHERE dataset = ? LIMIT 1")
            .bind(dataset)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Delete every entry of the dataset, returning how many were removed
    pub async fn delete_dataset(&self, dataset: &str) -> Result<u64, CacheError> {
        let result = sqlx::query("DELETE FROM cache_responses WHERE dataset = ?")
            .bind(dataset)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Metadata of every entry of the dataset, for state assembly
    pub async fn entries_for_dataset(
        &self,
        dataset: &str,
    ) -> Result<Vec<CacheEntrySnapshot>, CacheError> {
        let rows = sqlx::query(
            "SELECT kind, config, split, http_status, error_code, details, progress,
                    job_runner_version, dataset_git_revision, updated_at, failed_runs
             FROM cache_responses WHERE dataset = ?
             ORDER BY kind, config, split",
        )
        .bind(dataset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(CacheEntrySnapshot {
                    kind: row.try_get("kind")?,
                    config: key_to_optional(row.try_get("config")?),
                    split: key_to_optional(row.try_get("split")?),
                    metadata: row_to_metadata(row)?,
                })
            })
            .collect()
    }

    /// Entry counts grouped by kind, status and error code
    pub async fn count_entries(&self) -> Result<Vec<CacheCount>, CacheError> {
        let rows = sqlx::query(
            "SELECT kind, http_status, error_code, COUNT(*) as count
             FROM cache_responses
             GROUP BY kind, http_status, error_code
             ORDER BY kind, http_status, error_code",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(CacheCount {
                    kind: row.try_get("kind")?,
                    http_status: row.try_get::<i64, _>("http_status")? as u16,
                    error_code: row.try_get("error_code")?,
                    count: row.try_get::<i64, _>("count")? as u64,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::NamedTempFile;

    async fn open_store() -> (CacheStore, NamedTempFile) {
        let tmp = NamedTempFile::new().unwrap();
        let store = CacheStore::open(tmp.path().to_str().unwrap()).await.unwrap();
        (store, tmp)
    }

    fn params() -> JobParams {
        JobParams::dataset_level("dataset", "revision")
    }

    #[tokio::test]
    async fn test_upsert_get_round_trip() {
        let (store, _tmp) = open_store().await;
        let output = JobOutput::success(json!({"config_names": [{"config": "config1"}]}));

        store.upsert("dataset-config-names", &params(), &output, 2).await.unwrap();

        let entry = store.get("dataset-config-names", "dataset", None, None).await.unwrap();
        assert_eq!(entry.content, output.content);
        assert_eq!(entry.metadata.http_status, 200);
        assert_eq!(entry.metadata.job_runner_version, Some(2));
        assert_eq!(entry.metadata.dataset_git_revision, "revision");
        assert_eq!(entry.metadata.progress, Some(1.0));
        assert_eq!(entry.metadata.failed_runs, 0);
    }

    #[tokio::test]
    async fn test_get_miss_is_does_not_exist() {
        let (store, _tmp) = open_store().await;
        let err = store.get("dataset-size", "dataset", None, None).await.unwrap_err();
        assert!(err.is_does_not_exist());
    }

    #[tokio::test]
    async fn test_double_upsert_is_idempotent_and_monotonic() {
        let (store, _tmp) = open_store().await;
        let output = JobOutput::success(json!({"size": 12}));

        let first = store.upsert("dataset-size", &params(), &output, 1).await.unwrap();
        let second = store.upsert("dataset-size", &params(), &output, 1).await.unwrap();
        assert_eq!(second.failed_runs, 0);
        assert!(second.updated_at > first.updated_at);

        let entry = store.get("dataset-size", "dataset", None, None).await.unwrap();
        assert_eq!(entry.content, output.content);
    }

    #[tokio::test]
    async fn test_failed_runs_accounting() {
        let (store, _tmp) = open_store().await;
        let success = JobOutput::success(json!({}));
        let error = JobOutput::error(500, "ExternalServerError", None);
        let second_revision = JobParams::dataset_level("dataset", "revision2");

        // success, then two errors at the same revision, then a revision
        // change, then a success: 0, 1, 2, 0, 0
        assert_eq!(store.upsert("kind", &params(), &success, 1).await.unwrap().failed_runs, 0);
        assert_eq!(store.upsert("kind", &params(), &error, 1).await.unwrap().failed_runs, 1);
        assert_eq!(store.upsert("kind", &params(), &error, 1).await.unwrap().failed_runs, 2);
        assert_eq!(
            store.upsert("kind", &second_revision, &error, 1).await.unwrap().failed_runs,
            0
        );
        assert_eq!(
            store.upsert("kind", &second_revision, &success, 1).await.unwrap().failed_runs,
            0
        );
    }

    #[tokio::test]
    async fn test_get_best_prefers_first_success_in_kind_order() {
        let (store, _tmp) = open_store().await;
        let success = JobOutput::success(json!({"from": "streaming"}));
        let other_success = JobOutput::success(json!({"from": "info"}));

        store
            .upsert("config-split-names-from-streaming", &params(), &success, 1)
            .await
            .unwrap();
        store
            .upsert("config-split-names-from-info", &params(), &other_success, 1)
            .await
            .unwrap();

        let best = store
            .get_best(
                &["config-split-names-from-info", "config-split-names-from-streaming"],
                "dataset",
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(best.kind, "config-split-names-from-info");
    }

    #[tokio::test]
    async fn test_get_best_falls_back_to_highest_status_error() {
        let (store, _tmp) = open_store().await;
        store
            .upsert("kind-a", &params(), &JobOutput::error(404, "NotFound", None), 1)
            .await
            .unwrap();
        store
            .upsert("kind-b", &params(), &JobOutput::error(500, "ExternalServerError", None), 1)
            .await
            .unwrap();

        let best = store.get_best(&["kind-a", "kind-b"], "dataset", None, None).await.unwrap();
        assert_eq!(best.kind, "kind-b");

        // ties break by argument order
        store
            .upsert("kind-c", &params(), &JobOutput::error(500, "ExternalServerError", None), 1)
            .await
            .unwrap();
        let best = store.get_best(&["kind-c", "kind-b"], "dataset", None, None).await.unwrap();
        assert_eq!(best.kind, "kind-c");

        let err = store.get_best(&["kind-z"], "dataset", None, None).await.unwrap_err();
        assert!(err.is_does_not_exist());
    }

    #[tokio::test]
    async fn test_fetch_names_deduplicates_and_preserves_order() {
        let (store, _tmp) = open_store().await;
        let output = JobOutput::success(json!({
            "splits": [
                {"split": "train"},
                {"split": "test"},
                {"split": "train"},
            ]
        }));
        store
            .upsert(
                "config-split-names-from-info",
                &JobParams::config_level("dataset", "revision", "config1"),
                &output,
                1,
            )
            .await
            .unwrap();

        let names = store
            .fetch_names(
                "dataset",
                Some("config1"),
                &["config-split-names-from-info", "config-split-names-from-streaming"],
                "splits",
                "split",
            )
            .await;
        assert_eq!(names, vec!["train", "test"]);
    }

    #[tokio::test]
    async fn test_fetch_names_is_safe_on_missing_or_malformed_content() {
        let (store, _tmp) = open_store().await;

        // no entry at all
        let names = store
            .fetch_names("dataset", None, &["dataset-config-names"], "config_names", "config")
            .await;
        assert!(names.is_empty());

        // entry without the expected field
        store
            .upsert(
                "dataset-config-names",
                &params(),
                &JobOutput::success(json!({"something": "else"})),
                1,
            )
            .await
            .unwrap();
        let names = store
            .fetch_names("dataset", None, &["dataset-config-names"], "config_names", "config")
            .await;
        assert!(names.is_empty());

        // one malformed item drops the whole enumeration
        store
            .upsert(
                "dataset-config-names",
                &params(),
                &JobOutput::success(json!({"config_names": [{"config": "ok"}, {"config": 3}]})),
                1,
            )
            .await
            .unwrap();
        let names = store
            .fetch_names("dataset", None, &["dataset-config-names"], "config_names", "config")
            .await;
        assert!(names.is_empty());

        // error entries enumerate nothing
        store
            .upsert(
                "dataset-config-names",
                &params(),
                &JobOutput::error(500, "ExternalServerError", None),
                1,
            )
            .await
            .unwrap();
        let names = store
            .fetch_names("dataset", None, &["dataset-config-names"], "config_names", "config")
            .await;
        assert!(names.is_empty());
    }

    #[tokio::test]
    async fn test_has_some_and_delete_dataset() {
        let (store, _tmp) = open_store().await;
        assert!(!store.has_some("dataset").await.unwrap());

        store
            .upsert("dataset-size", &params(), &JobOutput::success(json!({})), 1)
            .await
            .unwrap();
        store
            .upsert(
                "config-size",
                &JobParams::config_level("dataset", "revision", "config1"),
                &JobOutput::success(json!({})),
                1,
            )
            .await
            .unwrap();
        assert!(store.has_some("dataset").await.unwrap());

        assert_eq!(store.delete_dataset("dataset").await.unwrap(), 2);
        assert!(!store.has_some("dataset").await.unwrap());
    }

    #[tokio::test]
    async fn test_entries_for_dataset_returns_metadata_snapshots() {
        let (store, _tmp) = open_store().await;
        store
            .upsert("dataset-size", &params(), &JobOutput::success(json!({})), 3)
            .await
            .unwrap();
        store
            .upsert(
                "split-first-rows-from-parquet",
                &JobParams::split_level("dataset", "revision", "config1", "train"),
                &JobOutput::error(500, "ExternalServerError", None),
                1,
            )
            .await
            .unwrap();
        store
            .upsert("dataset-size", &JobParams::dataset_level("other", "revision"),
                &JobOutput::success(json!({})), 1)
            .await
            .unwrap();

        let snapshots = store.entries_for_dataset("dataset").await.unwrap();
        assert_eq!(snapshots.len(), 2);
        let split_entry = snapshots
            .iter()
            .find(|snapshot| snapshot.kind == "split-first-rows-from-parquet")
            .unwrap();
        assert_eq!(split_entry.config.as_deref(), Some("config1"));
        assert_eq!(split_entry.split.as_deref(), Some("train"));
        assert!(!split_entry.metadata.is_success());
    }

    #[tokio::test]
    async fn test_count_entries() {
        let (store, _tmp) = open_store().await;
        store
            .upsert("dataset-size", &params(), &JobOutput::success(json!({})), 1)
            .await
            .unwrap();
        store
            .upsert("dataset-size", &JobParams::dataset_level("other", "revision"),
                &JobOutput::success(json!({})), 1)
            .await
            .unwrap();
        store
            .upsert("dataset-info", &params(), &JobOutput::error(500, "ExternalServerError", None), 1)
            .await
            .unwrap();

        let counts = store.count_entries().await.unwrap();
        assert_eq!(counts.len(), 2);
        let sizes = counts.iter().find(|count| count.kind == "dataset-size").unwrap();
        assert_eq!(sizes.count, 2);
        assert_eq!(sizes.http_status, 200);
    }
}
