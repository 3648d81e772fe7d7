//! End-to-end: a worker fleet drains the production graph and the backfill
//! planner then has nothing left to do

use async_trait::async_trait;
use quasar::cache::CacheStore;
use quasar::config::OrchestratorConfig;
use quasar::graph::{GraphSpecification, ProcessingGraph};
use quasar::job::{JobInfo, JobOutput, Priority};
use quasar::orchestrator::Orchestrator;
use quasar::queue::Queue;
use quasar::worker::{JobRunner, Worker, WorkerConfig};
use serde_json::json;
use std::sync::Arc;
use tempfile::NamedTempFile;

const DATASET: &str = "dataset";
const REVISION: &str = "revision";

/// Produces a canned success output for one step of the graph
struct StubRunner {
    job_type: String,
}

#[async_trait]
impl JobRunner for StubRunner {
    fn job_type(&self) -> &str {
        &self.job_type
    }

    async fn compute(&self, _job_info: &JobInfo) -> anyhow::Result<JobOutput> {
        let content = match self.job_type.as_str() {
            "dataset-config-names" => json!({
                "config_names": [{"config": "config1"}, {"config": "config2"}]
            }),
            "config-split-names-from-info" | "config-split-names-from-streaming" => json!({
                "splits": [{"split": "train"}, {"split": "test"}]
            }),
            "config-info" => json!({"dataset_info": {"dataset_size": 100}}),
            _ => json!({}),
        };
        Ok(JobOutput::success(content))
    }
}

#[tokio::test]
async fn test_worker_drains_the_production_graph_and_backfill_converges() {
    let queue_tmp = NamedTempFile::new().unwrap();
    let cache_tmp = NamedTempFile::new().unwrap();
    let queue = Queue::open(queue_tmp.path().to_str().unwrap()).await.unwrap();
    let cache = CacheStore::open(cache_tmp.path().to_str().unwrap()).await.unwrap();
    let graph = Arc::new(ProcessingGraph::new(GraphSpecification::default()).unwrap());
    let orchestrator =
        Orchestrator::new(graph.clone(), queue, cache, OrchestratorConfig::default());

    let mut worker = Worker::new(orchestrator.clone(), WorkerConfig::default());
    for step in graph.topological_steps() {
        worker = worker.register(Arc::new(StubRunner { job_type: step.name.clone() }));
    }

    orchestrator.backfill_dataset(DATASET, REVISION).await.unwrap();
    let processed = worker.run_until_idle().await.unwrap();
    // at least one run per artifact: 9 dataset + 10 config x 2 configs
    // + 8 split x 2 configs x 2 splits; cascades may re-run fan-in steps
    assert!(processed >= 9 + 20 + 32, "processed only {processed} jobs");

    // every artifact landed in the cache
    let total: u64 = orchestrator.cache().count_entries().await.unwrap().iter().map(|count| count.count).sum();
    assert_eq!(total, 9 + 20 + 32);

    // nothing pending anywhere in the graph
    assert!(!orchestrator
        .has_pending_ancestor_jobs(DATASET, &["dataset-hub-cache"])
        .await
        .unwrap());

    // the reconciliation pass finds a fully up-to-date dataset
    let plan = orchestrator.plan_backfill(DATASET, REVISION).await.unwrap();
    assert!(plan.as_response().is_empty(), "unexpected plan {:?}", plan.as_response());
    assert_eq!(plan.cache_status.up_to_date.len(), 9 + 20 + 32);
    assert!(plan.cache_status.cache_is_empty.is_empty());
    assert!(plan.cache_status.cache_is_outdated_by_parent.is_empty());
}

#[tokio::test]
async fn test_new_revision_invalidates_the_drained_dataset() {
    let queue_tmp = NamedTempFile::new().unwrap();
    let cache_tmp = NamedTempFile::new().unwrap();
    let queue = Queue::open(queue_tmp.path().to_str().unwrap()).await.unwrap();
    let cache = CacheStore::open(cache_tmp.path().to_str().unwrap()).await.unwrap();
    let graph = Arc::new(ProcessingGraph::new(GraphSpecification::default()).unwrap());
    let orchestrator =
        Orchestrator::new(graph.clone(), queue, cache, OrchestratorConfig::default());

    let mut worker = Worker::new(orchestrator.clone(), WorkerConfig::default());
    for step in graph.topological_steps() {
        worker = worker.register(Arc::new(StubRunner { job_type: step.name.clone() }));
    }

    orchestrator.backfill_dataset(DATASET, REVISION).await.unwrap();
    worker.run_until_idle().await.unwrap();

    // everything is classified against the new revision now; the names
    // discovered at the old revision still drive the fan-out
    let plan = orchestrator.plan_backfill(DATASET, "revision2").await.unwrap();
    assert_eq!(plan.cache_status.cache_has_different_git_revision.len(), 9 + 20 + 32);
    assert_eq!(plan.as_response(), vec![format!("CreateJobs,{}", 9 + 20 + 32)]);

    orchestrator.set_revision(DATASET, "revision2", Priority::High).await.unwrap();
    let pending = orchestrator.queue().get_pending_jobs(Some(DATASET), None).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].job_type, "dataset-config-names");
    assert_eq!(pending[0].revision, "revision2");
}
