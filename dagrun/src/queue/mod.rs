//! Queue backends.
//!
//! A backend stores jobs and hands the next eligible pending job to exactly
//! one caller of [`QueueBackend::claim_next`]. Jobs left `RUNNING` by a crashed
//! process are returned to `PENDING` by [`QueueBackend::recover`], so
//! delivery is at-least-once.
//!
//! Ordering: higher `priority` first, then insertion order.

mod memory;
mod sqlite;

pub use memory::MemoryQueue;
pub use sqlite::SqliteQueue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::job::{Job, JobId, JobResult, JobState};

/// Configuration for queue depth reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobQueueConfig {
    /// Warning threshold for pending jobs.
    pub warning_threshold: usize,
    /// Critical threshold for pending jobs.
    pub critical_threshold: usize,
    /// Poll interval in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            warning_threshold: 100,
            critical_threshold: 500,
            poll_interval_ms: 100,
        }
    }
}

/// Status of queue depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueDepthStatus {
    Normal,
    Warning,
    Critical,
}

impl QueueDepthStatus {
    pub fn from_depth(depth: usize, config: &JobQueueConfig) -> Self {
        if depth >= config.critical_threshold {
            Self::Critical
        } else if depth >= config.warning_threshold {
            Self::Warning
        } else {
            Self::Normal
        }
    }
}

/// How an attempt ended, as decided by the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Succeeded(JobResult),
    /// Failed with attempts left; claimable again from `available_at`.
    Retry {
        error: String,
        available_at: DateTime<Utc>,
    },
    /// Failed with no attempts left, or with a non-retriable error.
    Failed { error: String },
}

impl AttemptOutcome {
    /// State the job moves to unless a cancellation was requested.
    pub fn target_state(&self) -> JobState {
        match self {
            Self::Succeeded(_) => JobState::Succeeded,
            Self::Retry { .. } => JobState::Pending,
            Self::Failed { .. } => JobState::Failed,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Succeeded(_) => None,
            Self::Retry { error, .. } | Self::Failed { error } => Some(error),
        }
    }
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelOutcome {
    /// The job was pending and is now cancelled.
    Cancelled,
    /// The job is running; it becomes cancelled when the attempt ends.
    Requested,
    AlreadyFinished,
    NotFound,
}

impl CancelOutcome {
    /// Whether the request had any effect.
    pub fn accepted(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Requested)
    }
}

/// Storage and dispatch of jobs.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// Store a new job.
    async fn push(&self, job: Job) -> Result<()>;

    async fn get(&self, id: &JobId) -> Result<Option<Job>>;

    /// Jobs in insertion order, optionally filtered by state.
    async fn list(&self, state: Option<JobState>) -> Result<Vec<Job>>;

    async fn count(&self, state: JobState) -> Result<usize>;

    /// Atomically claim the next pending job available at `now`.
    ///
    /// The claimed job is `RUNNING`, its attempt counter incremented.
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>>;

    /// Atomically record the end of the current attempt of a running job.
    ///
    /// A pending cancellation request wins over `outcome`: the job ends
    /// `CANCELLED`, though a successful result is still stored.
    async fn finish_attempt(&self, id: &JobId, outcome: AttemptOutcome) -> Result<Job>;

    /// Cancel a pending job, or flag a running one.
    async fn request_cancel(&self, id: &JobId) -> Result<CancelOutcome>;

    /// Return jobs left running by a previous process to `PENDING`.
    async fn recover(&self) -> Result<usize>;

    /// Delete up to `limit` terminal jobs completed before `cutoff`.
    async fn purge_finished_before(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<usize>;
}

/// Apply `outcome` to a running job in place.
pub(crate) fn apply_outcome(
    job: &mut Job,
    outcome: AttemptOutcome,
    now: DateTime<Utc>,
) -> Result<()> {
    let mut target = outcome.target_state();
    if job.cancel_requested {
        target = JobState::Cancelled;
    }
    job.transition_to(target, now)?;

    match outcome {
        AttemptOutcome::Succeeded(result) => {
            job.result = Some(result);
            job.last_error = None;
        }
        AttemptOutcome::Retry {
            error,
            available_at,
        } => {
            job.last_error = Some(error);
            job.available_at = available_at;
        }
        AttemptOutcome::Failed { error } => {
            job.last_error = Some(error);
        }
    }

    Ok(())
}
