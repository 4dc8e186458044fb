//! Job model: identity, state machine and persisted record.

mod retry;

pub use retry::{Backoff, RetryPolicy};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::runner::{RunConfig, RunConfigRecord, RunOutputs};
use crate::{Error, Result};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

id_type!(
    /// Unique job identifier, generated at submission.
    JobId
);
id_type!(
    /// Unique schedule identifier.
    ScheduleId
);

/// Job lifecycle states.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Waiting for a worker.
    Pending,
    /// Claimed by a worker.
    Running,
    Succeeded,
    /// Failed with no attempts left.
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::from_str(s).ok()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine allows `self -> next`.
    ///
    /// `Running -> Pending` covers both a retry and crash recovery.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Pending)
                | (Failed, Pending)
        )
    }

    /// Check a transition, returning `InvalidStateTransition` when refused.
    pub fn ensure_transition(&self, next: JobState) -> Result<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(Error::InvalidStateTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

/// Result reference of a successful attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub outputs: Value,
    pub duration_ms: u64,
}

impl JobResult {
    pub fn new(outputs: &RunOutputs, duration: Duration) -> Self {
        Self {
            outputs: outputs.to_json(),
            duration_ms: duration.as_millis() as u64,
        }
    }
}

/// A queued unit of work.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub config: RunConfig,
    pub retry: RetryPolicy,
    pub state: JobState,
    /// Attempts started so far.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub result: Option<JobResult>,
    /// Higher runs first; ties go to the earlier submission.
    pub priority: i32,
    /// Not claimable before this instant. Used for retry backoff.
    pub available_at: DateTime<Utc>,
    pub schedule_id: Option<ScheduleId>,
    pub timeout: Option<Duration>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a pending job with a fresh id.
    pub fn new(config: RunConfig, retry: RetryPolicy) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            config,
            retry,
            state: JobState::Pending,
            attempts: 0,
            last_error: None,
            result: None,
            priority: 0,
            available_at: now,
            schedule_id: None,
            timeout: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_schedule(mut self, schedule_id: ScheduleId) -> Self {
        self.schedule_id = Some(schedule_id);
        self
    }

    /// Move to `next`, stamping `updated_at` and, for terminal states,
    /// `completed_at`.
    pub fn transition_to(&mut self, next: JobState, now: DateTime<Utc>) -> Result<()> {
        self.state.ensure_transition(next)?;
        self.state = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            id: self.id.clone(),
            state: self.state,
            attempts: self.attempts,
            max_attempts: self.retry.max_attempts,
            last_error: self.last_error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }

    /// Wall time of the latest attempt, if it has finished.
    pub fn duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        let completed = self.completed_at?;
        (completed - started).to_std().ok()
    }

    pub fn to_record(&self) -> Result<JobRecord> {
        Ok(JobRecord {
            id: self.id.to_string(),
            run_config: serde_json::to_string(&self.config.to_record())?,
            state: self.state.as_str().to_string(),
            attempts: i64::from(self.attempts),
            max_attempts: i64::from(self.retry.max_attempts),
            backoff: serde_json::to_string(&self.retry.backoff)?,
            last_error: self.last_error.clone(),
            result: self.result.as_ref().map(serde_json::to_string).transpose()?,
            priority: i64::from(self.priority),
            available_at: format_ts(self.available_at),
            schedule_id: self.schedule_id.as_ref().map(ToString::to_string),
            timeout_ms: self.timeout.map(|t| t.as_millis() as i64),
            cancel_requested: self.cancel_requested,
            created_at: format_ts(self.created_at),
            updated_at: format_ts(self.updated_at),
            started_at: self.started_at.map(format_ts),
            completed_at: self.completed_at.map(format_ts),
        })
    }

    pub fn from_record(record: JobRecord) -> Result<Self> {
        let config: RunConfigRecord = serde_json::from_str(&record.run_config)?;
        let state = JobState::parse(&record.state)
            .ok_or_else(|| Error::validation(format!("unknown job state '{}'", record.state)))?;
        Ok(Self {
            id: JobId::from(record.id),
            config: config.into_run_config()?,
            retry: RetryPolicy {
                max_attempts: to_u32(record.max_attempts, "max_attempts")?,
                backoff: serde_json::from_str(&record.backoff)?,
            },
            state,
            attempts: to_u32(record.attempts, "attempts")?,
            last_error: record.last_error,
            result: record
                .result
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            priority: i32::try_from(record.priority)
                .map_err(|_| Error::validation("priority out of range"))?,
            available_at: parse_ts(&record.available_at)?,
            schedule_id: record.schedule_id.map(ScheduleId::from),
            timeout: record
                .timeout_ms
                .map(|ms| Duration::from_millis(ms.max(0) as u64)),
            cancel_requested: record.cancel_requested,
            created_at: parse_ts(&record.created_at)?,
            updated_at: parse_ts(&record.updated_at)?,
            started_at: record.started_at.as_deref().map(parse_ts).transpose()?,
            completed_at: record.completed_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

/// Snapshot returned by `status()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: JobId,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Set when the latest attempt failed.
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Durable job record.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    /// JSON-serialized run configuration.
    pub run_config: String,
    pub state: String,
    pub attempts: i64,
    pub max_attempts: i64,
    /// JSON-serialized backoff.
    pub backoff: String,
    pub last_error: Option<String>,
    /// JSON-serialized result.
    pub result: Option<String>,
    pub priority: i64,
    pub available_at: String,
    pub schedule_id: Option<String>,
    pub timeout_ms: Option<i64>,
    pub cancel_requested: bool,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

/// Emitted once when a job reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub job_id: JobId,
    pub state: JobState,
    pub attempts: u32,
    pub duration_ms: Option<u64>,
    /// Output summary on success.
    pub outputs: Option<Value>,
    pub error: Option<String>,
}

impl StatusEvent {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            state: job.state,
            attempts: job.attempts,
            duration_ms: job.duration().map(|d| d.as_millis() as u64),
            outputs: match job.state {
                JobState::Succeeded => job.result.as_ref().map(|r| r.outputs.clone()),
                _ => None,
            },
            error: job.last_error.clone(),
        }
    }
}

/// Fixed-width RFC 3339 in UTC, so stored timestamps sort lexicographically.
pub(crate) fn format_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::validation(format!("invalid timestamp '{}': {}", s, e)))
}

fn to_u32(value: i64, field: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::validation(format!("{} out of range", field)))
}
