//! In-process queue backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::HashMap;
use tracing::info;

use super::{AttemptOutcome, CancelOutcome, QueueBackend, apply_outcome};
use crate::job::{Job, JobId, JobState};
use crate::{Error, Result};

#[derive(Default)]
struct Inner {
    /// Job plus its insertion sequence.
    jobs: HashMap<JobId, (u64, Job)>,
    next_seq: u64,
}

/// Queue backend held entirely in memory.
///
/// Nothing survives a restart, so `recover` only matters for tests that
/// simulate a crash.
#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn push(&self, job: Job) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.jobs.contains_key(&job.id) {
            return Err(Error::queue(format!("job {} already exists", job.id)));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.jobs.insert(job.id.clone(), (seq, job));
        Ok(())
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        Ok(self.inner.lock().jobs.get(id).map(|(_, job)| job.clone()))
    }

    async fn list(&self, state: Option<JobState>) -> Result<Vec<Job>> {
        let inner = self.inner.lock();
        let mut jobs: Vec<&(u64, Job)> = inner
            .jobs
            .values()
            .filter(|(_, job)| state.is_none_or(|s| job.state == s))
            .collect();
        jobs.sort_by_key(|(seq, _)| *seq);
        Ok(jobs.into_iter().map(|(_, job)| job.clone()).collect())
    }

    async fn count(&self, state: JobState) -> Result<usize> {
        Ok(self
            .inner
            .lock()
            .jobs
            .values()
            .filter(|(_, job)| job.state == state)
            .count())
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>> {
        let mut inner = self.inner.lock();
        let next = inner
            .jobs
            .values()
            .filter(|(_, job)| job.state == JobState::Pending && job.available_at <= now)
            .max_by_key(|(seq, job)| (job.priority, Reverse(*seq)))
            .map(|(_, job)| job.id.clone());

        let Some(id) = next else {
            return Ok(None);
        };
        let Some((_, job)) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.transition_to(JobState::Running, now)?;
        job.attempts += 1;
        job.started_at = Some(now);
        job.completed_at = None;
        Ok(Some(job.clone()))
    }

    async fn finish_attempt(&self, id: &JobId, outcome: AttemptOutcome) -> Result<Job> {
        let mut inner = self.inner.lock();
        let (_, job) = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| Error::not_found("job", id.as_str()))?;
        if job.state != JobState::Running {
            return Err(Error::InvalidStateTransition {
                from: job.state.to_string(),
                to: outcome.target_state().to_string(),
            });
        }
        apply_outcome(job, outcome, Utc::now())?;
        Ok(job.clone())
    }

    async fn request_cancel(&self, id: &JobId) -> Result<CancelOutcome> {
        let mut inner = self.inner.lock();
        let Some((_, job)) = inner.jobs.get_mut(id) else {
            return Ok(CancelOutcome::NotFound);
        };
        let now = Utc::now();
        Ok(match job.state {
            JobState::Pending => {
                job.transition_to(JobState::Cancelled, now)?;
                CancelOutcome::Cancelled
            }
            JobState::Running => {
                job.cancel_requested = true;
                job.updated_at = now;
                CancelOutcome::Requested
            }
            _ => CancelOutcome::AlreadyFinished,
        })
    }

    async fn recover(&self) -> Result<usize> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let mut reset = 0;
        for (_, job) in inner.jobs.values_mut() {
            if job.state != JobState::Running {
                continue;
            }
            if job.cancel_requested {
                job.transition_to(JobState::Cancelled, now)?;
            } else {
                job.transition_to(JobState::Pending, now)?;
                job.available_at = now;
                reset += 1;
            }
        }
        if reset > 0 {
            info!("Reset {} running jobs to pending", reset);
        }
        Ok(reset)
    }

    async fn purge_finished_before(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<usize> {
        let mut inner = self.inner.lock();
        let expired: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|(_, job)| {
                job.state.is_terminal() && job.completed_at.is_some_and(|t| t < cutoff)
            })
            .map(|(_, job)| job.id.clone())
            .take(limit)
            .collect();
        for id in &expired {
            inner.jobs.remove(id);
        }
        Ok(expired.len())
    }
}
