//! Worker pool executing claimed jobs through the pipeline runner.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ManagerCore, ManagerEvent};
use crate::Error;
use crate::job::{Job, JobResult, JobState, StatusEvent};
use crate::queue::AttemptOutcome;

/// Configuration for a worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Number of concurrent workers. Each runs one job at a time.
    pub max_workers: usize,
    /// Default per-job timeout in seconds; a job's own timeout wins.
    ///
    /// On expiry the job's cancellation token fires and the run stops at
    /// the next node boundary.
    pub job_timeout_secs: u64,
    /// Poll interval in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            job_timeout_secs: 3600, // 1 hour
            poll_interval_ms: 100,
        }
    }
}

/// How a run ended, from the worker's point of view.
enum RunEnd {
    Completed,
    TimedOut(Duration),
    /// The pool is stopping; the job is left for recovery.
    Interrupted,
}

/// A fixed pool of workers pulling from the manager's queue.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    active_workers: Arc<AtomicUsize>,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self {
            config,
            active_workers: Arc::new(AtomicUsize::new(0)),
            cancellation_token: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Spawn the workers.
    pub(crate) fn start(&self, core: Arc<ManagerCore>) {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let default_timeout = Duration::from_secs(self.config.job_timeout_secs);

        info!(
            "Starting worker pool with {} workers on {} queue",
            self.config.max_workers,
            core.queue.name()
        );

        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            warn!("Worker pool already stopped");
            return;
        };

        for i in 0..self.config.max_workers {
            let core = core.clone();
            let token = self.cancellation_token.clone();
            let active = self.active_workers.clone();

            join_set.spawn(async move {
                debug!("Worker {} started", i);

                loop {
                    if token.is_cancelled() {
                        break;
                    }

                    match core.queue.claim_next(Utc::now()).await {
                        Ok(Some(job)) => {
                            active.fetch_add(1, Ordering::SeqCst);
                            process_job(&core, job, default_timeout, &token, i).await;
                            active.fetch_sub(1, Ordering::SeqCst);
                            // Look for more work straight away.
                            continue;
                        }
                        Ok(None) => {}
                        Err(e) => error!("Worker {} failed to claim a job: {}", i, e),
                    }

                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = core.notifier.notified() => {}
                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                }

                debug!("Worker {} shutting down", i);
            });
        }
    }

    /// Stop the workers and wait for them to exit.
    ///
    /// Running jobs observe the stop at their next node boundary and are
    /// left `RUNNING` for [`recover`](crate::queue::QueueBackend::recover).
    pub async fn stop(&self) {
        info!("Stopping worker pool");
        self.cancellation_token.cancel();

        let join_set = self.tasks.lock().take();
        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }

        info!("Worker pool stopped");
    }

    /// Workers currently executing a job.
    pub fn active_count(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }
}

async fn process_job(
    core: &ManagerCore,
    job: Job,
    default_timeout: Duration,
    pool_token: &CancellationToken,
    worker: usize,
) {
    let job_id = job.id.clone();
    debug!(
        "Worker {} processing job {} (attempt {}/{})",
        worker, job_id, job.attempts, job.retry.max_attempts
    );
    core.emit(ManagerEvent::JobStarted {
        job_id: job_id.clone(),
        attempt: job.attempts,
    });

    // Child of the pool token, so stopping the pool reaches running jobs.
    let job_token = pool_token.child_token();
    core.running.insert(job_id.clone(), job_token.clone());

    // A cancel that landed between the claim and the registration above
    // never saw the token.
    if let Ok(Some(current)) = core.queue.get(&job_id).await
        && current.cancel_requested
    {
        job_token.cancel();
    }

    let timeout = job.timeout.unwrap_or(default_timeout);
    let started = Instant::now();
    let run = core.runner.run(&job.config, &job_token);
    tokio::pin!(run);

    let mut end = RunEnd::Completed;
    let result = tokio::select! {
        result = &mut run => result,
        _ = tokio::time::sleep(timeout) => {
            warn!("Job {} exceeded its {:?} timeout, cancelling", job_id, timeout);
            end = RunEnd::TimedOut(timeout);
            job_token.cancel();
            run.await
        }
    };
    let elapsed = started.elapsed();
    core.running.remove(&job_id);

    if matches!(end, RunEnd::Completed)
        && matches!(result, Err(Error::Cancelled))
        && pool_token.is_cancelled()
    {
        end = RunEnd::Interrupted;
    }

    let outcome = match (end, result) {
        (RunEnd::Interrupted, _) => {
            let flagged = matches!(
                core.queue.get(&job_id).await,
                Ok(Some(current)) if current.cancel_requested
            );
            if !flagged {
                info!("Job {} interrupted by shutdown; left for recovery", job_id);
                return;
            }
            // Cancelled by the caller as well; record it now.
            AttemptOutcome::Failed {
                error: Error::Cancelled.to_string(),
            }
        }
        (RunEnd::Completed, Ok(outputs)) => {
            AttemptOutcome::Succeeded(JobResult::new(&outputs, elapsed))
        }
        (RunEnd::TimedOut(timeout), _) => {
            retry_or_fail(&job, format!("Job timed out after {:?}", timeout), true)
        }
        (RunEnd::Completed, Err(e)) => retry_or_fail(&job, e.to_string(), e.is_retriable()),
    };

    match core.queue.finish_attempt(&job_id, outcome).await {
        Ok(finished) => report(core, &finished, elapsed),
        Err(e) => {
            error!("Failed to record attempt of job {}: {}", job_id, e);
            core.emit(ManagerEvent::JobRecordFailed {
                job_id: job_id.clone(),
                attempt: job.attempts,
                error: e.to_string(),
            });
        }
    }
}

fn retry_or_fail(job: &Job, error: String, retriable: bool) -> AttemptOutcome {
    if retriable && job.retry.allows_retry(job.attempts) {
        let delay = job.retry.delay_for(job.attempts);
        let available_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        AttemptOutcome::Retry {
            error,
            available_at,
        }
    } else {
        AttemptOutcome::Failed { error }
    }
}

fn report(core: &ManagerCore, job: &Job, elapsed: Duration) {
    match job.state {
        JobState::Succeeded => info!("Job {} completed in {:.2}s", job.id, elapsed.as_secs_f64()),
        JobState::Pending => {
            warn!(
                "Job {} failed (attempt {}/{}), retrying at {}: {}",
                job.id,
                job.attempts,
                job.retry.max_attempts,
                job.available_at,
                job.last_error.as_deref().unwrap_or_default()
            );
            core.emit(ManagerEvent::JobRetryScheduled {
                job_id: job.id.clone(),
                attempt: job.attempts,
                available_at: job.available_at,
                error: job.last_error.clone().unwrap_or_default(),
            });
            return;
        }
        JobState::Failed => warn!(
            "Job {} failed after {} attempts: {}",
            job.id,
            job.attempts,
            job.last_error.as_deref().unwrap_or_default()
        ),
        JobState::Cancelled => info!("Job {} cancelled", job.id),
        JobState::Running => return,
    }
    core.emit(ManagerEvent::JobFinished(StatusEvent::from_job(job)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Backoff, RetryPolicy};
    use crate::runner::RunConfig;

    fn job(max_attempts: u32, attempts: u32) -> Job {
        let config = RunConfig::builder("p").target("x").build().unwrap();
        let mut job = Job::new(config, RetryPolicy::new(max_attempts, Backoff::Fixed { delay_ms: 500 }));
        job.attempts = attempts;
        job
    }

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.job_timeout_secs, 3600);
    }

    #[test]
    fn test_retry_or_fail() {
        let before = Utc::now();
        match retry_or_fail(&job(3, 1), "boom".into(), true) {
            AttemptOutcome::Retry { error, available_at } => {
                assert_eq!(error, "boom");
                assert!(available_at >= before + chrono::Duration::milliseconds(500));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(matches!(
            retry_or_fail(&job(3, 3), "boom".into(), true),
            AttemptOutcome::Failed { .. }
        ));
        assert!(matches!(
            retry_or_fail(&job(3, 1), "bad config".into(), false),
            AttemptOutcome::Failed { .. }
        ));
    }

    #[test]
    fn test_new_pool_is_running() {
        let pool = WorkerPool::new(WorkerPoolConfig::default());
        assert!(pool.is_running());
        assert_eq!(pool.active_count(), 0);
    }
}
