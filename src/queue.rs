//! Persistent job queue
//!
//! Jobs are identified by `(type, dataset, revision, config, split)` and
//! live as WAITING or STARTED rows; finishing a job deletes its row (the
//! cache is the durable record of the outcome). Claiming is atomic and
//! enforces one STARTED job per `(type, dataset)`; crashed workers are
//! recovered by lease expiry, so execution is at-least-once and outputs
//! must be idempotent upserts.

use crate::error::QueueError;
use crate::job::{unicity_id, JobInfo, JobParams, JobStatus, NewJob, Priority};
use crate::now_micros;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    job_id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_type TEXT NOT NULL,
    dataset TEXT NOT NULL,
    revision TEXT NOT NULL,
    config TEXT,
    split TEXT,
    unicity_id TEXT NOT NULL,
    priority TEXT NOT NULL,
    difficulty INTEGER NOT NULL,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    started_at INTEGER,
    last_heartbeat INTEGER,
    owner TEXT
);
CREATE INDEX IF NOT EXISTS idx_jobs_dataset ON jobs (dataset);
CREATE INDEX IF NOT EXISTS idx_jobs_status_type ON jobs (status, job_type);
CREATE INDEX IF NOT EXISTS idx_jobs_unicity ON jobs (unicity_id, status);

CREATE TABLE IF NOT EXISTS locks (
    key TEXT PRIMARY KEY,
    owner TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
";

/// One pending (WAITING or STARTED) queue row
#[derive(Debug, Clone, PartialEq)]
pub struct PendingJob {
    pub job_id: i64,
    pub job_type: String,
    pub dataset: String,
    pub revision: String,
    pub config: Option<String>,
    pub split: Option<String>,
    pub priority: Priority,
    pub difficulty: u32,
    pub status: JobStatus,
    pub created_at: i64,
}

impl PendingJob {
    /// Duplicate-detection key of this row
    pub fn unicity_id(&self) -> String {
        unicity_id(
            &self.job_type,
            &self.dataset,
            &self.revision,
            self.config.as_deref(),
            self.split.as_deref(),
        )
    }
}

/// One counter emitted by queue metrics collection
#[derive(Debug, Clone, PartialEq)]
pub struct QueueCount {
    pub job_type: String,
    pub status: JobStatus,
    pub count: u64,
}

/// A held git-branch lock; must be released explicitly
///
/// Dropping the guard without calling [`release`](Self::release) leaves the
/// lock to be taken over by a later owner through `remove_dataset` or
/// operator cleanup.
#[derive(Debug)]
pub struct GitBranchLock {
    pool: SqlitePool,
    key: String,
    owner: String,
}

impl GitBranchLock {
    /// The lock key, `dataset/branch`
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lock if this guard still owns it
    pub async fn release(self) -> Result<(), QueueError> {
        let result = sqlx::query("UPDATE locks SET owner = NULL, updated_at = ? WHERE key = ? AND owner = ?")
            .bind(now_micros())
            .bind(&self.key)
            .bind(&self.owner)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            warn!(key = %self.key, owner = %self.owner, "lock was not held at release time");
        }
        Ok(())
    }
}

fn row_to_pending_job(row: &SqliteRow) -> Result<PendingJob, QueueError> {
    let priority: String = row.try_get("priority")?;
    let status: String = row.try_get("status")?;
    Ok(PendingJob {
        job_id: row.try_get("job_id")?,
        job_type: row.try_get("job_type")?,
        dataset: row.try_get("dataset")?,
        revision: row.try_get("revision")?,
        config: row.try_get("config")?,
        split: row.try_get("split")?,
        priority: Priority::from_str(&priority).unwrap_or(Priority::Normal),
        difficulty: row.try_get::<i64, _>("difficulty")? as u32,
        status: JobStatus::from_str(&status).unwrap_or(JobStatus::Waiting),
        created_at: row.try_get("created_at")?,
    })
}

/// SQLite-backed job queue
#[derive(Clone)]
pub struct Queue {
    pool: SqlitePool,
}

impl Queue {
    /// Open or create the queue database at the specified path
    pub async fn open(path: &str) -> Result<Self, QueueError> {
        let db_url = if path.starts_with("sqlite://") {
            path.to_string()
        } else {
            format!("sqlite://{}", path)
        };

        let options = SqliteConnectOptions::from_str(&db_url)
            .map_err(QueueError::Database)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;

        Ok(Self { pool })
    }

    /// Enqueue one WAITING job unless an identical WAITING row exists
    ///
    /// Returns the created job id, or `None` for the idempotent no-op.
    pub async fn add_job(&self, job: &NewJob) -> Result<Option<i64>, QueueError> {
        let mut tx = self.pool.begin().await?;
        let created = insert_if_absent(&mut tx, job).await?;
        tx.commit().await?;
        Ok(created)
    }

    /// Enqueue a batch, collapsing duplicates within the batch and against
    /// existing WAITING rows. Returns how many rows were created.
    pub async fn create_jobs(&self, jobs: &[NewJob]) -> Result<u64, QueueError> {
        let mut tx = self.pool.begin().await?;
        let mut seen: HashSet<String> = HashSet::new();
        let mut created = 0;
        for job in jobs {
            if !seen.insert(job.unicity_id()) {
                continue;
            }
            if insert_if_absent(&mut tx, job).await?.is_some() {
                created += 1;
            }
        }
        tx.commit().await?;
        debug!(requested = jobs.len(), created, "create_jobs");
        Ok(created)
    }

    /// Delete jobs by id regardless of status
    pub async fn delete_jobs_by_ids(&self, job_ids: &[i64]) -> Result<u64, QueueError> {
        if job_ids.is_empty() {
            return Ok(0);
        }
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("DELETE FROM jobs WHERE job_id IN (");
        let mut separated = builder.separated(", ");
        for job_id in job_ids {
            separated.push_bind(job_id);
        }
        builder.push(")");
        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Delete every job of the dataset regardless of status
    pub async fn delete_dataset_jobs(&self, dataset: &str) -> Result<u64, QueueError> {
        let result = sqlx::query("DELETE FROM jobs WHERE dataset = ?")
            .bind(dataset)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Delete the dataset's branch locks
    pub async fn delete_dataset_locks(&self, dataset: &str) -> Result<u64, QueueError> {
        let result = sqlx::query("DELETE FROM locks WHERE key = ? OR key LIKE ?")
            .bind(dataset)
            .bind(format!("{}/%", dataset))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Snapshot of pending (WAITING or STARTED) jobs, oldest first
    pub async fn get_pending_jobs(
        &self,
        dataset: Option<&str>,
        job_types: Option<&[&str]>,
    ) -> Result<Vec<PendingJob>, QueueError> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT job_id, job_type, dataset, revision, config, split, priority, difficulty,
                    status, created_at
             FROM jobs WHERE 1 = 1",
        );
        if let Some(dataset) = dataset {
            builder.push(" AND dataset = ");
            builder.push_bind(dataset);
        }
        if let Some(job_types) = job_types {
            if job_types.is_empty() {
                return Ok(Vec::new());
            }
            builder.push(" AND job_type IN (");
            let mut separated = builder.separated(", ");
            for job_type in job_types {
                separated.push_bind(*job_type);
            }
            builder.push(")");
        }
        builder.push(" ORDER BY created_at ASC, job_id ASC");

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_pending_job).collect()
    }

    /// Whether any pending job of the given types exists for the dataset
    pub async fn has_pending_jobs_of_types(
        &self,
        dataset: &str,
        job_types: &[&str],
    ) -> Result<bool, QueueError> {
        if job_types.is_empty() {
            return Ok(false);
        }
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT 1 FROM jobs WHERE dataset = ");
        builder.push_bind(dataset);
        builder.push(" AND job_type IN (");
        let mut separated = builder.separated(", ");
        for job_type in job_types {
            separated.push_bind(*job_type);
        }
        builder.push(") LIMIT 1");
        let row = builder.build().fetch_optional(&self.pool).await?;
        Ok(row.is_some())
    }

    /// Atomically claim one WAITING job and mark it STARTED
    ///
    /// Eligibility: optional type allow/deny lists, and no STARTED job with
    /// the same `(type, dataset)`. Selection: highest priority, then lowest
    /// difficulty, then oldest. The claim also deletes any other WAITING
    /// duplicate of the claimed key. `EmptyQueueError` when nothing is
    /// eligible.
    pub async fn start_job(
        &self,
        job_types_only: Option<&[&str]>,
        job_types_blocked: Option<&[&str]>,
        owner: &str,
    ) -> Result<JobInfo, QueueError> {
        let now = now_micros();
        let mut tx = self.pool.begin().await?;

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE jobs SET status = 'started', started_at = ");
        builder.push_bind(now);
        builder.push(", last_heartbeat = ");
        builder.push_bind(now);
        builder.push(", owner = ");
        builder.push_bind(owner);
        builder.push(
            " WHERE job_id = (
                 SELECT j.job_id FROM jobs j
                 WHERE j.status = 'waiting'",
        );
        if let Some(only) = job_types_only {
            if only.is_empty() {
                return Err(QueueError::EmptyQueue);
            }
            builder.push(" AND j.job_type IN (");
            let mut separated = builder.separated(", ");
            for job_type in only {
                separated.push_bind(*job_type);
            }
            builder.push(")");
        }
        if let Some(blocked) = job_types_blocked {
            if !blocked.is_empty() {
                builder.push(" AND j.job_type NOT IN (");
                let mut separated = builder.separated(", ");
                for job_type in blocked {
                    separated.push_bind(*job_type);
                }
                builder.push(")");
            }
        }
        builder.push(
            " AND NOT EXISTS (
                     SELECT 1 FROM jobs started
                     WHERE started.status = 'started'
                       AND started.job_type = j.job_type
                       AND started.dataset = j.dataset
                 )
                 ORDER BY CASE j.priority WHEN 'high' THEN 0 WHEN 'normal' THEN 1 ELSE 2 END ASC,
                          j.difficulty ASC, j.created_at ASC, j.job_id ASC
                 LIMIT 1
             )
             RETURNING job_id, job_type, dataset, revision, config, split, priority, difficulty,
                       unicity_id",
        );

        let row = builder.build().fetch_optional(&mut *tx).await?;
        let Some(row) = row else {
            return Err(QueueError::EmptyQueue);
        };

        let priority: String = row.try_get("priority")?;
        let unicity: String = row.try_get("unicity_id")?;
        let job_info = JobInfo {
            job_id: row.try_get("job_id")?,
            job_type: row.try_get("job_type")?,
            params: JobParams {
                dataset: row.try_get("dataset")?,
                revision: row.try_get("revision")?,
                config: row.try_get("config")?,
                split: row.try_get("split")?,
            },
            priority: Priority::from_str(&priority).unwrap_or(Priority::Normal),
            difficulty: row.try_get::<i64, _>("difficulty")? as u32,
        };

        // the claimed row is STARTED now; clear any lingering WAITING twins
        sqlx::query("DELETE FROM jobs WHERE unicity_id = ? AND status = 'waiting'")
            .bind(&unicity)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(job_id = job_info.job_id, job_type = %job_info.job_type, owner, "job started");
        Ok(job_info)
    }

    /// Delete a finished job's row. Returns false if the row was already
    /// gone (swept lease or removed dataset), which callers tolerate.
    pub async fn finish_job(&self, job_id: i64) -> Result<bool, QueueError> {
        let result = sqlx::query("DELETE FROM jobs WHERE job_id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            warn!(job_id, "finish_job: job row was already gone");
            return Ok(false);
        }
        Ok(true)
    }

    /// Refresh the lease of a STARTED job
    pub async fn heartbeat(&self, job_id: i64) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE jobs SET last_heartbeat = ? WHERE job_id = ? AND status = 'started'",
        )
        .bind(now_micros())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::JobNotFound(job_id));
        }
        Ok(())
    }

    /// Return every STARTED job whose lease expired to WAITING
    ///
    /// The fresh `created_at` re-ranks recovered jobs fairly among their
    /// WAITING peers. At-least-once: the original worker may still finish
    /// and upsert; that is harmless by idempotence.
    pub async fn sweep_expired_leases(&self, ttl: Duration) -> Result<u64, QueueError> {
        let cutoff = now_micros() - ttl.as_micros() as i64;
        let result = sqlx::query(
            "UPDATE jobs
             SET status = 'waiting', started_at = NULL, last_heartbeat = NULL, owner = NULL,
                 created_at = ?
             WHERE status = 'started' AND last_heartbeat < ?",
        )
        .bind(now_micros())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        let swept = result.rows_affected();
        if swept > 0 {
            info!(swept, "expired leases returned to waiting");
        }
        Ok(swept)
    }

    /// Job counts grouped by type and status
    pub async fn count_jobs(&self) -> Result<Vec<QueueCount>, QueueError> {
        let rows = sqlx::query(
            "SELECT job_type, status, COUNT(*) as count
             FROM jobs GROUP BY job_type, status ORDER BY job_type, status",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status")?;
                Ok(QueueCount {
                    job_type: row.try_get("job_type")?,
                    status: JobStatus::from_str(&status).unwrap_or(JobStatus::Waiting),
                    count: row.try_get::<i64, _>("count")? as u64,
                })
            })
            .collect()
    }

    /// Acquire the cooperative lock runners hold while pushing to a shared
    /// branch
    ///
    /// Retries through the `sleeps` schedule (with jitter) and surfaces
    /// `QueueError::LockTimeout` once it is exhausted. The lock persists
    /// across processes; the owner is typically the job id.
    pub async fn lock_git_branch(
        &self,
        dataset: &str,
        branch: &str,
        owner: &str,
        sleeps: &[Duration],
    ) -> Result<GitBranchLock, QueueError> {
        let key = format!("{}/{}", dataset, branch);
        for sleep in sleeps {
            if self.try_acquire_lock(&key, owner).await? {
                debug!(key, owner, "lock acquired");
                return Ok(GitBranchLock {
                    pool: self.pool.clone(),
                    key,
                    owner: owner.to_string(),
                });
            }
            tokio::time::sleep(jittered(*sleep)).await;
        }
        Err(QueueError::LockTimeout { key })
    }

    async fn try_acquire_lock(&self, key: &str, owner: &str) -> Result<bool, QueueError> {
        let now = now_micros();
        let result = sqlx::query(
            "INSERT INTO locks (key, owner, created_at, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT (key) DO UPDATE SET owner = excluded.owner, updated_at = excluded.updated_at
             WHERE locks.owner IS NULL OR locks.owner = excluded.owner",
        )
        .bind(key)
        .bind(owner)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Spread lock retries so contending workers do not wake in lockstep
fn jittered(duration: Duration) -> Duration {
    duration.mul_f64(1.0 + rand::random::<f64>() * 0.5)
}

async fn insert_if_absent(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    job: &NewJob,
) -> Result<Option<i64>, QueueError> {
    let unicity = job.unicity_id();
    let existing = sqlx::query("SELECT 1 FROM jobs WHERE unicity_id = ? AND status = 'waiting' LIMIT 1")
        .bind(&unicity)
        .fetch_optional(&mut **tx)
        .await?;
    if existing.is_some() {
        return Ok(None);
    }
    let result = sqlx::query(
        "INSERT INTO jobs (job_type, dataset, revision, config, split, unicity_id, priority,
                           difficulty, status, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'waiting', ?)",
    )
    .bind(&job.job_type)
    .bind(&job.params.dataset)
    .bind(&job.params.revision)
    .bind(&job.params.config)
    .bind(&job.params.split)
    .bind(&unicity)
    .bind(job.priority.to_string())
    .bind(job.difficulty as i64)
    .bind(now_micros())
    .execute(&mut **tx)
    .await?;
    Ok(Some(result.last_insert_rowid()))
}
