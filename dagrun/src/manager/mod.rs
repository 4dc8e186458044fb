//! Job Queue Manager: the facade over queue and scheduler backends.
//!
//! The manager owns a [`WorkerPool`] pulling from a [`QueueBackend`], a
//! [`SchedulerService`] firing schedules from a [`ScheduleStore`] back into
//! the queue, and a [`JobPurgeService`] enforcing the retention window.
//! Callers see the same `submit`/`schedule`/`cancel`/`status` contract
//! whichever backends are configured.

mod purge;
mod worker_pool;

pub use purge::{JobPurgeService, PurgeConfig};
pub use worker_pool::{WorkerPool, WorkerPoolConfig};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::job::{Job, JobId, JobState, JobStatus, RetryPolicy, ScheduleId, StatusEvent};
use crate::queue::{CancelOutcome, JobQueueConfig, QueueBackend, QueueDepthStatus};
use crate::runner::{PipelineRunner, RunConfig};
use crate::scheduler::{
    JobSink, MissedFirePolicy, Schedule, ScheduleStore, SchedulerConfig, SchedulerService,
    Trigger,
};
use crate::{Error, Result};

/// Events emitted by the manager.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    JobSubmitted {
        job_id: JobId,
        schedule_id: Option<ScheduleId>,
    },
    JobStarted {
        job_id: JobId,
        attempt: u32,
    },
    /// An attempt failed and the job went back to the queue.
    JobRetryScheduled {
        job_id: JobId,
        attempt: u32,
        available_at: DateTime<Utc>,
        error: String,
    },
    /// Sent once per job, on reaching a terminal state.
    JobFinished(StatusEvent),
    /// The end of an attempt could not be stored. The job stays `RUNNING`
    /// until the next `start` recovers it.
    JobRecordFailed {
        job_id: JobId,
        attempt: u32,
        error: String,
    },
    ScheduleFired {
        schedule_id: ScheduleId,
        job_id: JobId,
    },
    ScheduleCancelled {
        schedule_id: ScheduleId,
    },
}

/// What `cancel` applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelTarget {
    Job(JobId),
    Schedule(ScheduleId),
}

impl From<JobId> for CancelTarget {
    fn from(id: JobId) -> Self {
        Self::Job(id)
    }
}

impl From<ScheduleId> for CancelTarget {
    fn from(id: ScheduleId) -> Self {
        Self::Schedule(id)
    }
}

/// Per-submission options.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Falls back to the manager's default policy.
    pub retry: Option<RetryPolicy>,
    pub priority: i32,
    /// Falls back to the worker pool's default timeout.
    pub timeout: Option<Duration>,
}

/// Job counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl JobStats {
    pub fn total(&self) -> usize {
        self.pending + self.running + self.succeeded + self.failed + self.cancelled
    }
}

/// Configuration for the manager and its services.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub queue: JobQueueConfig,
    pub workers: WorkerPoolConfig,
    pub scheduler: SchedulerConfig,
    pub purge: PurgeConfig,
    /// Applied to submissions that carry no retry policy.
    pub default_retry: RetryPolicy,
}

/// State shared by the manager, its workers and the scheduler.
pub(crate) struct ManagerCore {
    pub(crate) queue: Arc<dyn QueueBackend>,
    pub(crate) runner: Arc<PipelineRunner>,
    /// Wakes idle workers on submission.
    pub(crate) notifier: Arc<Notify>,
    events: broadcast::Sender<ManagerEvent>,
    /// Cancellation tokens of running jobs.
    pub(crate) running: DashMap<JobId, CancellationToken>,
}

impl ManagerCore {
    pub(crate) fn emit(&self, event: ManagerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl JobSink for ManagerCore {
    async fn submit_job(&self, job: Job) -> Result<JobId> {
        let job_id = job.id.clone();
        let schedule_id = job.schedule_id.clone();
        self.queue.push(job).await?;
        self.notifier.notify_one();

        debug!("Job {} enqueued on {} queue", job_id, self.queue.name());
        self.emit(ManagerEvent::JobSubmitted {
            job_id: job_id.clone(),
            schedule_id: schedule_id.clone(),
        });
        if let Some(schedule_id) = schedule_id {
            self.emit(ManagerEvent::ScheduleFired {
                schedule_id,
                job_id: job_id.clone(),
            });
        }
        Ok(job_id)
    }
}

/// Uniform submit/schedule/cancel/status over the configured backends.
pub struct JobQueueManager {
    core: Arc<ManagerCore>,
    scheduler: Arc<SchedulerService>,
    workers: WorkerPool,
    purge: Arc<JobPurgeService>,
    config: ManagerConfig,
    cancellation_token: CancellationToken,
    purge_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl JobQueueManager {
    pub fn new(
        queue: Arc<dyn QueueBackend>,
        schedules: Arc<dyn ScheduleStore>,
        runner: Arc<PipelineRunner>,
        config: ManagerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let core = Arc::new(ManagerCore {
            queue: queue.clone(),
            runner,
            notifier: Arc::new(Notify::new()),
            events,
            running: DashMap::new(),
        });
        let scheduler = Arc::new(SchedulerService::new(
            schedules,
            core.clone(),
            config.scheduler.clone(),
        ));

        Self {
            scheduler,
            workers: WorkerPool::new(config.workers.clone()),
            purge: Arc::new(JobPurgeService::new(config.purge.clone(), queue)),
            core,
            config,
            cancellation_token: CancellationToken::new(),
            purge_task: parking_lot::Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    pub fn runner(&self) -> &Arc<PipelineRunner> {
        &self.core.runner
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Enqueue a job in `PENDING`. Never waits for execution.
    pub async fn submit(&self, config: RunConfig, retry: Option<RetryPolicy>) -> Result<JobId> {
        self.submit_with(
            config,
            SubmitOptions {
                retry,
                ..Default::default()
            },
        )
        .await
    }

    #[instrument(
        skip(self, config, options),
        fields(module = %config.main_module().module_name())
    )]
    pub async fn submit_with(&self, config: RunConfig, options: SubmitOptions) -> Result<JobId> {
        let retry = options
            .retry
            .unwrap_or_else(|| self.config.default_retry.clone());
        retry.validate()?;

        let job = Job::new(config, retry)
            .with_priority(options.priority)
            .with_timeout(options.timeout);
        self.core.submit_job(job).await
    }

    /// Register a schedule that submits a fresh job from `template` at every
    /// firing.
    ///
    /// The trigger is validated here; an invalid one fails with
    /// [`Error::Schedule`] and nothing is stored.
    pub async fn schedule(
        &self,
        template: RunConfig,
        trigger: Trigger,
        missed_fire_policy: MissedFirePolicy,
        retry: Option<RetryPolicy>,
    ) -> Result<ScheduleId> {
        let retry = retry.unwrap_or_else(|| self.config.default_retry.clone());
        let schedule = Schedule::new(template, trigger, missed_fire_policy, retry, Utc::now())?;
        self.scheduler.add(&schedule).await?;
        Ok(schedule.id)
    }

    /// Cancel a job or a schedule. Returns whether the request had any effect.
    ///
    /// A pending job is cancelled immediately. A running job is flagged and
    /// its token fired; it stops at the next node boundary and ends
    /// `CANCELLED` when the attempt returns. A cancelled schedule fires no
    /// further jobs; jobs it already submitted are unaffected.
    pub async fn cancel(&self, target: impl Into<CancelTarget>) -> Result<bool> {
        match target.into() {
            CancelTarget::Job(id) => {
                let outcome = self.core.queue.request_cancel(&id).await?;
                match outcome {
                    CancelOutcome::Cancelled => {
                        info!("Job {} cancelled before running", id);
                        if let Some(job) = self.core.queue.get(&id).await? {
                            self.core
                                .emit(ManagerEvent::JobFinished(StatusEvent::from_job(&job)));
                        }
                    }
                    CancelOutcome::Requested => {
                        info!("Cancellation requested for running job {}", id);
                        if let Some(token) = self.core.running.get(&id) {
                            token.cancel();
                        }
                    }
                    CancelOutcome::AlreadyFinished => {
                        debug!("Job {} already finished, nothing to cancel", id)
                    }
                    CancelOutcome::NotFound => debug!("Job {} not found", id),
                }
                Ok(outcome.accepted())
            }
            CancelTarget::Schedule(id) => {
                let removed = self.scheduler.remove(&id).await?;
                if removed {
                    self.core
                        .emit(ManagerEvent::ScheduleCancelled { schedule_id: id });
                }
                Ok(removed)
            }
        }
    }

    pub async fn status(&self, id: &JobId) -> Result<JobStatus> {
        self.job(id).await.map(|job| job.status())
    }

    pub async fn job(&self, id: &JobId) -> Result<Job> {
        self.core
            .queue
            .get(id)
            .await?
            .ok_or_else(|| Error::not_found("Job", id.as_str()))
    }

    pub async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<Job>> {
        self.core.queue.list(state).await
    }

    pub async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        self.scheduler.store().list().await
    }

    pub async fn stats(&self) -> Result<JobStats> {
        let queue = &self.core.queue;
        Ok(JobStats {
            pending: queue.count(JobState::Pending).await?,
            running: queue.count(JobState::Running).await?,
            succeeded: queue.count(JobState::Succeeded).await?,
            failed: queue.count(JobState::Failed).await?,
            cancelled: queue.count(JobState::Cancelled).await?,
        })
    }

    pub async fn depth_status(&self) -> Result<QueueDepthStatus> {
        let depth = self.core.queue.count(JobState::Pending).await?;
        let status = QueueDepthStatus::from_depth(depth, &self.config.queue);
        if status != QueueDepthStatus::Normal {
            warn!("Queue depth {} is {:?}", depth, status);
        }
        Ok(status)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.core.events.subscribe()
    }

    /// Wait until a job reaches a terminal state and return it.
    pub async fn wait(&self, id: &JobId) -> Result<Job> {
        let mut events = self.subscribe();
        loop {
            let job = self.job(id).await?;
            if job.state.is_terminal() {
                return Ok(job);
            }
            match events.recv().await {
                Ok(ManagerEvent::JobFinished(event)) if &event.job_id == id => {}
                Ok(ManagerEvent::JobRecordFailed { job_id, error, .. }) if &job_id == id => {
                    return Err(Error::queue(format!(
                        "failed to record outcome of job {}: {}",
                        id, error
                    )));
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::queue("event channel closed"));
                }
            }
        }
    }

    /// Recover state left by a previous process, then start the workers,
    /// the scheduler loop and the purge service.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Job queue manager already started");
            return Ok(());
        }
        info!("Starting job queue manager");

        let recovered = self.core.queue.recover().await?;
        if recovered > 0 {
            info!("Recovered {} jobs from a previous run", recovered);
        }
        let replayed = self.scheduler.recover_at(Utc::now()).await?;
        if !replayed.is_empty() {
            info!("Replayed {} missed schedule firings", replayed.len());
        }

        self.workers.start(self.core.clone());
        self.scheduler.start();
        *self.purge_task.lock() = Some(
            self.purge
                .start_background_task(self.cancellation_token.clone()),
        );

        info!("Job queue manager started");
        Ok(())
    }

    /// Stop the scheduler, the workers and the purge service.
    ///
    /// Jobs interrupted mid-run stay `RUNNING` and are recovered by the next
    /// `start`.
    pub async fn shutdown(&self) {
        info!("Stopping job queue manager");
        self.scheduler.stop().await;
        self.workers.stop().await;

        self.cancellation_token.cancel();
        let purge_task = self.purge_task.lock().take();
        if let Some(handle) = purge_task
            && let Err(e) = handle.await
        {
            warn!("Purge task ended abnormally: {}", e);
        }
        info!("Job queue manager stopped");
    }

    /// Workers currently executing a job.
    pub fn active_workers(&self) -> usize {
        self.workers.active_count()
    }
}
