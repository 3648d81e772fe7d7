//! Maintenance sweeps run from the admin CLI
//!
//! The backfill sweep reconciles a fleet of datasets and keeps going when
//! individual datasets fail; directory cleaning is plain filesystem
//! housekeeping for runner scratch space.

use crate::error::OrchestratorError;
use crate::orchestrator::Orchestrator;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

const LOG_EVERY: u64 = 100;

/// Outcome of a fleet backfill sweep
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackfillReport {
    pub analyzed: u64,
    pub backfilled: u64,
    pub errors: u64,
}

/// Run the backfill planner over every supplied `(dataset, revision)`
///
/// One dataset's failure is logged and skipped; the sweep itself only
/// fails on the caller's side of the iterator.
pub async fn backfill_datasets<I>(
    orchestrator: &Orchestrator,
    datasets: I,
) -> Result<BackfillReport, OrchestratorError>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut report = BackfillReport::default();
    for (dataset, revision) in datasets {
        match orchestrator.backfill_dataset(&dataset, &revision).await {
            Ok(tasks) => {
                report.analyzed += 1;
                if !tasks.is_empty() {
                    report.backfilled += 1;
                }
            }
            Err(err) => {
                report.errors += 1;
                warn!(dataset = %dataset, error = %err, "backfill failed for dataset");
            }
        }
        if (report.analyzed + report.errors) % LOG_EVERY == 0 {
            info!(
                analyzed = report.analyzed,
                backfilled = report.backfilled,
                errors = report.errors,
                "backfill sweep progress"
            );
        }
    }
    info!(
        analyzed = report.analyzed,
        backfilled = report.backfilled,
        errors = report.errors,
        "backfill sweep finished"
    );
    Ok(report)
}

/// Delete glob matches older than the given age
///
/// Unreadable entries are skipped with a warning; the sweep never aborts
/// half way.
pub fn clean_directory(pattern: &str, expired_after: Duration) -> anyhow::Result<u64> {
    let now = SystemTime::now();
    let mut deleted = 0;
    let mut errors = 0;
    for entry in glob::glob(pattern)? {
        let path = match entry {
            Ok(path) => path,
            Err(err) => {
                errors += 1;
                warn!(error = %err, "unreadable glob entry");
                continue;
            }
        };
        let expired = std::fs::metadata(&path)
            .and_then(|metadata| metadata.modified())
            .map(|modified| {
                now.duration_since(modified).map(|age| age > expired_after).unwrap_or(false)
            })
            .unwrap_or(false);
        if !expired {
            continue;
        }
        let removal = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        match removal {
            Ok(()) => deleted += 1,
            Err(err) => {
                errors += 1;
                warn!(path = %path.display(), error = %err, "could not delete entry");
            }
        }
    }
    info!(pattern, deleted, errors, "directory cleaned");
    Ok(deleted)
}
