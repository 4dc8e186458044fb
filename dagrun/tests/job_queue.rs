//! Queued execution through the manager on both queue backends.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dagrun::database::{init_pool, run_migrations};
use dagrun::graph::Node;
use dagrun::job::{Backoff, Job, JobId, JobState, RetryPolicy};
use dagrun::manager::{
    JobQueueManager, ManagerConfig, ManagerEvent, SubmitOptions, WorkerPoolConfig,
};
use dagrun::module::{ModuleRegistry, ModuleResolver};
use dagrun::queue::{AttemptOutcome, CancelOutcome, MemoryQueue, QueueBackend, SqliteQueue};
use dagrun::runner::{PipelineRunner, RunConfig};
use dagrun::scheduler::{MemoryScheduleStore, ScheduleStore, SqliteScheduleStore};
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

fn manager_with(
    registry: &Arc<ModuleRegistry>,
    queue: Arc<dyn QueueBackend>,
    schedules: Arc<dyn ScheduleStore>,
) -> JobQueueManager {
    let runner = Arc::new(PipelineRunner::new(ModuleResolver::new(registry.clone())));
    let config = ManagerConfig {
        workers: WorkerPoolConfig {
            max_workers: 2,
            poll_interval_ms: 10,
            ..Default::default()
        },
        ..Default::default()
    };
    JobQueueManager::new(queue, schedules, runner, config)
}

fn memory_manager(registry: &Arc<ModuleRegistry>) -> JobQueueManager {
    manager_with(
        registry,
        Arc::new(MemoryQueue::new()),
        Arc::new(MemoryScheduleStore::new()),
    )
}

async fn sqlite_backends(dir: &TempDir) -> (Arc<SqliteQueue>, Arc<SqliteScheduleStore>) {
    let url = format!("sqlite:{}", dir.path().join("dagrun.db").display());
    let pool = init_pool(&url).await.unwrap();
    run_migrations(&pool).await.unwrap();
    (
        Arc::new(SqliteQueue::new(pool.clone())),
        Arc::new(SqliteScheduleStore::new(pool)),
    )
}

fn always_failing(registry: &ModuleRegistry, calls: Arc<AtomicUsize>) {
    registry.register("flaky", move || {
        let calls = calls.clone();
        vec![Node::new("fetch", &[], move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("upstream unavailable")
        })]
    });
}

async fn assert_three_attempts_then_failed(manager: &JobQueueManager, calls: &AtomicUsize) {
    manager.start().await.unwrap();
    let config = RunConfig::builder("flaky").target("fetch").build().unwrap();
    let id = manager
        .submit(config, Some(RetryPolicy::new(3, Backoff::None)))
        .await
        .unwrap();

    let job = timeout(WAIT, manager.wait(&id)).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let error = job.last_error.unwrap();
    assert!(error.contains("fetch"), "{error}");
    assert!(error.contains("upstream unavailable"), "{error}");

    let status = manager.status(&id).await.unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.max_attempts, 3);
    manager.shutdown().await;
}

#[tokio::test]
async fn retries_exhaust_after_max_attempts_in_memory() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = Arc::new(ModuleRegistry::new());
    always_failing(&registry, calls.clone());

    let manager = memory_manager(&registry);
    assert_three_attempts_then_failed(&manager, &calls).await;
}

#[tokio::test]
async fn retries_exhaust_after_max_attempts_in_sqlite() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = Arc::new(ModuleRegistry::new());
    always_failing(&registry, calls.clone());

    let dir = TempDir::new().unwrap();
    let (queue, schedules) = sqlite_backends(&dir).await;
    let manager = manager_with(&registry, queue, schedules);
    assert_three_attempts_then_failed(&manager, &calls).await;
}

#[tokio::test]
async fn non_retriable_error_fails_on_first_attempt() {
    let registry = Arc::new(ModuleRegistry::new());
    registry.register("m", || vec![Node::new("x", &[], |_| Ok(json!(1)))]);
    let manager = memory_manager(&registry);
    manager.start().await.unwrap();

    // Unknown target: a property of the config, not worth retrying.
    let config = RunConfig::builder("m").target("y").build().unwrap();
    let id = manager
        .submit(config, Some(RetryPolicy::new(5, Backoff::None)))
        .await
        .unwrap();
    let job = timeout(WAIT, manager.wait(&id)).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn cancelling_running_job_lets_current_node_finish() {
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let downstream = Arc::new(AtomicUsize::new(0));

    let registry = Arc::new(ModuleRegistry::new());
    {
        let (started, release, downstream) =
            (started.clone(), release.clone(), downstream.clone());
        registry.register("slow", move || {
            let (started, release) = (started.clone(), release.clone());
            let downstream = downstream.clone();
            vec![
                Node::new_async("first", &[], move |_| {
                    let (started, release) = (started.clone(), release.clone());
                    async move {
                        started.notify_one();
                        release.notified().await;
                        Ok(json!(1))
                    }
                }),
                Node::new("second", &["first"], move |_| {
                    downstream.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(2))
                }),
            ]
        });
    }

    let manager = memory_manager(&registry);
    manager.start().await.unwrap();
    let config = RunConfig::builder("slow").target("second").build().unwrap();
    let id = manager.submit(config, None).await.unwrap();

    timeout(WAIT, started.notified()).await.unwrap();
    assert!(manager.cancel(id.clone()).await.unwrap());
    // Cooperative: still running until the node returns.
    assert_eq!(manager.status(&id).await.unwrap().state, JobState::Running);

    release.notify_one();
    let job = timeout(WAIT, manager.wait(&id)).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Cancelled);
    assert_eq!(job.attempts, 1);
    assert_eq!(downstream.load(Ordering::SeqCst), 0);
    manager.shutdown().await;
}

#[tokio::test]
async fn timeout_cancels_at_next_node_boundary() {
    let registry = Arc::new(ModuleRegistry::new());
    let downstream = Arc::new(AtomicUsize::new(0));
    {
        let downstream = downstream.clone();
        registry.register("sleepy", move || {
            let downstream = downstream.clone();
            vec![
                Node::new_async("nap", &[], |_| async {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Ok(json!("rested"))
                }),
                Node::new("after", &["nap"], move |_| {
                    downstream.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(true))
                }),
            ]
        });
    }

    let manager = memory_manager(&registry);
    manager.start().await.unwrap();
    let config = RunConfig::builder("sleepy").target("after").build().unwrap();
    let id = manager
        .submit_with(
            config,
            SubmitOptions {
                retry: Some(RetryPolicy::none()),
                timeout: Some(Duration::from_millis(50)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let job = timeout(WAIT, manager.wait(&id)).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(job.last_error.unwrap().contains("timed out"));
    assert_eq!(downstream.load(Ordering::SeqCst), 0);
    manager.shutdown().await;
}

#[tokio::test]
async fn higher_priority_jobs_run_first() {
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let registry = Arc::new(ModuleRegistry::new());
    {
        let order = order.clone();
        registry.register("tag", move || {
            let order = order.clone();
            vec![Node::new("record", &["label"], move |args| {
                order.lock().push(args.str("label")?.to_string());
                Ok(json!(null))
            })]
        });
    }

    let runner = Arc::new(PipelineRunner::new(ModuleResolver::new(registry.clone())));
    let config = ManagerConfig {
        workers: WorkerPoolConfig {
            max_workers: 1,
            poll_interval_ms: 10,
            ..Default::default()
        },
        ..Default::default()
    };
    let manager = JobQueueManager::new(
        Arc::new(MemoryQueue::new()),
        Arc::new(MemoryScheduleStore::new()),
        runner,
        config,
    );

    let mut ids = Vec::new();
    for (label, priority) in [("low-1", 0), ("high", 10), ("low-2", 0)] {
        let config = RunConfig::builder("tag")
            .target("record")
            .input("label", json!(label))
            .build()
            .unwrap();
        let options = SubmitOptions {
            priority,
            ..Default::default()
        };
        ids.push(manager.submit_with(config, options).await.unwrap());
    }

    manager.start().await.unwrap();
    for id in &ids {
        timeout(WAIT, manager.wait(id)).await.unwrap().unwrap();
    }
    assert_eq!(*order.lock(), ["high", "low-1", "low-2"]);
    manager.shutdown().await;
}

#[tokio::test]
async fn job_left_running_by_crash_is_rerun_on_start() {
    let registry = Arc::new(ModuleRegistry::new());
    registry.register("m", || vec![Node::new("x", &[], |_| Ok(json!(7)))]);

    let dir = TempDir::new().unwrap();
    let (queue, schedules) = sqlite_backends(&dir).await;

    // A previous process claimed the job and died.
    let config = RunConfig::builder("m").target("x").build().unwrap();
    let job = Job::new(config, RetryPolicy::default());
    queue.push(job.clone()).await.unwrap();
    let claimed = queue.claim_next(Utc::now()).await.unwrap().unwrap();
    assert_eq!(claimed.state, JobState::Running);

    let manager = manager_with(&registry, queue, schedules);
    manager.start().await.unwrap();
    let finished = timeout(WAIT, manager.wait(&job.id)).await.unwrap().unwrap();
    assert_eq!(finished.state, JobState::Succeeded);
    assert_eq!(finished.attempts, 2);
    assert_eq!(finished.result.unwrap().outputs, json!({ "x": 7 }));
    manager.shutdown().await;
}

/// Memory queue whose attempt results can never be stored.
#[derive(Default)]
struct UnwritableQueue {
    inner: MemoryQueue,
}

#[async_trait]
impl QueueBackend for UnwritableQueue {
    fn name(&self) -> &'static str {
        "unwritable"
    }

    async fn push(&self, job: Job) -> dagrun::Result<()> {
        self.inner.push(job).await
    }

    async fn get(&self, id: &JobId) -> dagrun::Result<Option<Job>> {
        self.inner.get(id).await
    }

    async fn list(&self, state: Option<JobState>) -> dagrun::Result<Vec<Job>> {
        self.inner.list(state).await
    }

    async fn count(&self, state: JobState) -> dagrun::Result<usize> {
        self.inner.count(state).await
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> dagrun::Result<Option<Job>> {
        self.inner.claim_next(now).await
    }

    async fn finish_attempt(&self, _id: &JobId, _outcome: AttemptOutcome) -> dagrun::Result<Job> {
        Err(dagrun::Error::queue("disk unavailable"))
    }

    async fn request_cancel(&self, id: &JobId) -> dagrun::Result<CancelOutcome> {
        self.inner.request_cancel(id).await
    }

    async fn recover(&self) -> dagrun::Result<usize> {
        self.inner.recover().await
    }

    async fn purge_finished_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> dagrun::Result<usize> {
        self.inner.purge_finished_before(cutoff, limit).await
    }
}

#[tokio::test]
async fn unrecorded_outcome_is_reported_to_waiters() {
    let release = Arc::new(Notify::new());
    let registry = Arc::new(ModuleRegistry::new());
    {
        let release = release.clone();
        registry.register("m", move || {
            let release = release.clone();
            vec![Node::new_async("x", &[], move |_| {
                let release = release.clone();
                async move {
                    release.notified().await;
                    Ok(json!(1))
                }
            })]
        });
    }
    let queue = Arc::new(UnwritableQueue::default());
    let manager = manager_with(&registry, queue, Arc::new(MemoryScheduleStore::new()));
    let mut events = manager.subscribe();
    manager.start().await.unwrap();

    let config = RunConfig::builder("m").target("x").build().unwrap();
    let id = manager.submit(config, None).await.unwrap();

    // The waiter subscribes on its first poll, before the node is released.
    let (waited, ()) = tokio::join!(timeout(WAIT, manager.wait(&id)), async {
        release.notify_one();
    });
    let err = waited.unwrap().unwrap_err();
    assert!(err.to_string().contains("disk unavailable"), "{err}");

    let reported = timeout(WAIT, async {
        loop {
            if let Ok(ManagerEvent::JobRecordFailed {
                job_id, attempt, ..
            }) = events.recv().await
            {
                return (job_id, attempt);
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(reported, (id.clone(), 1));

    // Left running for recovery on the next start.
    assert_eq!(manager.status(&id).await.unwrap().state, JobState::Running);
    manager.shutdown().await;
}
