//! The scheduler loop.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{MissedFirePolicy, Schedule, ScheduleStore};
use crate::Result;
use crate::job::{Job, JobId, ScheduleId};

/// Receives the jobs a schedule fires.
#[async_trait]
pub trait JobSink: Send + Sync {
    async fn submit_job(&self, job: Job) -> Result<JobId>;
}

/// Configuration for the scheduler loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Tick interval in milliseconds.
    pub tick_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
        }
    }
}

/// A firing performed by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Firing {
    pub schedule_id: ScheduleId,
    pub job_id: JobId,
    pub at: DateTime<Utc>,
}

/// Fires due schedules into a [`JobSink`].
pub struct SchedulerService {
    store: Arc<dyn ScheduleStore>,
    sink: Arc<dyn JobSink>,
    config: SchedulerConfig,
    notify: Notify,
    cancellation_token: CancellationToken,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SchedulerService {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        sink: Arc<dyn JobSink>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            sink,
            config,
            notify: Notify::new(),
            cancellation_token: CancellationToken::new(),
            task: parking_lot::Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<dyn ScheduleStore> {
        &self.store
    }

    /// Persist a new schedule and wake the loop.
    pub async fn add(&self, schedule: &Schedule) -> Result<()> {
        self.store.save(schedule).await?;
        info!(
            "Added schedule {} ({:?}), next firing at {:?}",
            schedule.id, schedule.trigger, schedule.next_fire_at
        );
        self.notify.notify_one();
        Ok(())
    }

    /// Remove a schedule. Jobs it already submitted are unaffected.
    pub async fn remove(&self, id: &ScheduleId) -> Result<bool> {
        let removed = self.store.remove(id).await?;
        if removed {
            info!("Removed schedule {}", id);
        }
        Ok(removed)
    }

    /// Fire every schedule due at `now`, once each.
    ///
    /// A schedule whose submission fails keeps its `next_fire_at` and is
    /// retried on the next tick.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<Vec<Firing>> {
        let mut firings = Vec::new();
        for mut schedule in self.store.due(now).await? {
            match self.fire(&mut schedule, now).await {
                Ok(firing) => firings.push(firing),
                Err(e) => error!("Failed to fire schedule {}: {}", schedule.id, e),
            }
        }
        Ok(firings)
    }

    /// Apply each schedule's missed-fire policy for firings missed while
    /// the process was down.
    pub async fn recover_at(&self, now: DateTime<Utc>) -> Result<Vec<Firing>> {
        let mut replayed = Vec::new();
        for mut schedule in self.store.due(now).await? {
            match schedule.missed_fire_policy {
                MissedFirePolicy::CatchUp => {
                    info!(
                        "Replaying missed firing of schedule {} (was due {:?})",
                        schedule.id, schedule.next_fire_at
                    );
                    match self.fire(&mut schedule, now).await {
                        Ok(firing) => replayed.push(firing),
                        Err(e) => error!("Failed to replay schedule {}: {}", schedule.id, e),
                    }
                }
                MissedFirePolicy::FireFromNow => {
                    info!(
                        "Dropping missed firing of schedule {} (was due {:?})",
                        schedule.id, schedule.next_fire_at
                    );
                    schedule.advance(now, false)?;
                    if !self.store.update(&schedule).await? {
                        debug!("Schedule {} removed during recovery", schedule.id);
                    }
                }
            }
        }
        Ok(replayed)
    }

    async fn fire(&self, schedule: &mut Schedule, now: DateTime<Utc>) -> Result<Firing> {
        let job_id = self.sink.submit_job(schedule.make_job()).await?;
        schedule.advance(now, true)?;
        if !self.store.update(schedule).await? {
            // Cancelled while the job was being submitted; stays removed.
            info!(
                "Schedule {} was removed while firing job {}",
                schedule.id, job_id
            );
        }
        debug!(
            "Schedule {} fired job {}, next firing at {:?}",
            schedule.id, job_id, schedule.next_fire_at
        );
        Ok(Firing {
            schedule_id: schedule.id.clone(),
            job_id,
            at: now,
        })
    }

    /// Start the tick loop.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            warn!("Scheduler already started");
            return;
        }

        let service = Arc::clone(self);
        let token = self.cancellation_token.clone();
        let tick = Duration::from_millis(self.config.tick_interval_ms.max(1));
        info!("Starting scheduler with {:?} tick interval", tick);

        *task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = service.notify.notified() => {}
                    _ = tokio::time::sleep(tick) => {}
                }
                if let Err(e) = service.tick_at(Utc::now()).await {
                    warn!("Scheduler tick failed: {}", e);
                }
            }
            debug!("Scheduler loop stopped");
        }));
    }

    /// Stop the tick loop and wait for it to exit.
    pub async fn stop(&self) {
        self.cancellation_token.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            error!("Scheduler task panicked: {}", e);
        }
        info!("Scheduler stopped");
    }
}
