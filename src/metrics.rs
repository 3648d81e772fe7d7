//! Periodic metrics collection for the queue and the cache
//!
//! Run from the maintenance CLI; each counter is emitted as one structured
//! log event so the log pipeline can scrape them.

use crate::cache::{CacheCount, CacheStore};
use crate::error::{CacheError, QueueError};
use crate::queue::{Queue, QueueCount};
use tracing::info;

/// Collect and log job counts by type and status
pub async fn collect_queue_metrics(queue: &Queue) -> Result<Vec<QueueCount>, QueueError> {
    let counts = queue.count_jobs().await?;
    for count in &counts {
        info!(
            job_type = %count.job_type,
            status = %count.status,
            count = count.count,
            "queue metric"
        );
    }
    info!(counters = counts.len(), "queue metrics collected");
    Ok(counts)
}

/// Collect and log cache entry counts by kind, status and error code
pub async fn collect_cache_metrics(cache: &CacheStore) -> Result<Vec<CacheCount>, CacheError> {
    let counts = cache.count_entries().await?;
    for count in &counts {
        info!(
            kind = %count.kind,
            http_status = count.http_status,
            error_code = count.error_code.as_deref().unwrap_or("None"),
            count = count.count,
            "cache metric"
        );
    }
    info!(counters = counts.len(), "cache metrics collected");
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobOutput, JobParams, NewJob, Priority};
    use serde_json::json;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_collect_queue_metrics() {
        let tmp = NamedTempFile::new().unwrap();
        let queue = Queue::open(tmp.path().to_str().unwrap()).await.unwrap();
        queue
            .add_job(&NewJob {
                job_type: "dataset-size".to_string(),
                params: JobParams::dataset_level("dataset", "revision"),
                priority: Priority::Normal,
                difficulty: 50,
            })
            .await
            .unwrap();

        let counts = collect_queue_metrics(&queue).await.unwrap();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0].count, 1);
    }

    #[tokio::test]
    async fn test_collect_cache_metrics() {
        let tmp = NamedTempFile::new().unwrap();
        let cache = CacheStore::open(tmp.path().to_str().unwrap()).await.unwrap();
        cache
            .upsert(
                "dataset-size",
                &JobParams::dataset_level("dataset", "revision"),
                &JobOutput::success(json!({})),
                1,
            )
            .await
            .unwrap();

        let counts = collect_cache_metrics(&cache).await.unwrap();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0].kind, "dataset-size");
    }
}
