//! SQLite queue backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info};

use super::{AttemptOutcome, CancelOutcome, QueueBackend};
use crate::database::retry::retry_on_sqlite_busy;
use crate::job::{Job, JobId, JobRecord, JobState, format_ts};
use crate::{Error, Result};

/// Durable queue backend on the `jobs` table.
///
/// Every state change is a single conditional statement, so concurrent
/// workers (or processes sharing the database) never claim the same job
/// twice and never lose a cancellation request.
#[derive(Clone)]
pub struct SqliteQueue {
    pool: SqlitePool,
}

impl SqliteQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn state_of(&self, id: &JobId) -> Result<Option<JobState>> {
        let state: Option<String> = sqlx::query_scalar("SELECT state FROM jobs WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        state
            .map(|s| {
                JobState::parse(&s)
                    .ok_or_else(|| Error::validation(format!("unknown job state '{}'", s)))
            })
            .transpose()
    }
}

#[async_trait]
impl QueueBackend for SqliteQueue {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn push(&self, job: Job) -> Result<()> {
        let record = job.to_record()?;
        retry_on_sqlite_busy("push_job", || async {
            sqlx::query(
                r#"
                INSERT INTO jobs (
                    id, run_config, state, attempts, max_attempts, backoff,
                    last_error, result, priority, available_at, schedule_id,
                    timeout_ms, cancel_requested, created_at, updated_at,
                    started_at, completed_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&record.id)
            .bind(&record.run_config)
            .bind(&record.state)
            .bind(record.attempts)
            .bind(record.max_attempts)
            .bind(&record.backoff)
            .bind(&record.last_error)
            .bind(&record.result)
            .bind(record.priority)
            .bind(&record.available_at)
            .bind(&record.schedule_id)
            .bind(record.timeout_ms)
            .bind(record.cancel_requested)
            .bind(&record.created_at)
            .bind(&record.updated_at)
            .bind(&record.started_at)
            .bind(&record.completed_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .map(Job::from_record)
            .transpose()
    }

    async fn list(&self, state: Option<JobState>) -> Result<Vec<Job>> {
        let records = match state {
            Some(state) => {
                sqlx::query_as::<_, JobRecord>(
                    "SELECT * FROM jobs WHERE state = ? ORDER BY rowid",
                )
                .bind(state.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs ORDER BY rowid")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        records.into_iter().map(Job::from_record).collect()
    }

    async fn count(&self, state: JobState) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE state = ?")
            .bind(state.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>> {
        let now = format_ts(now);
        let record = retry_on_sqlite_busy("claim_next_job", || async {
            let record = sqlx::query_as::<_, JobRecord>(
                r#"
                UPDATE jobs
                SET state = 'RUNNING',
                    attempts = attempts + 1,
                    started_at = ?,
                    completed_at = NULL,
                    updated_at = ?
                WHERE id = (
                    SELECT id FROM jobs
                    WHERE state = 'PENDING' AND available_at <= ?
                    ORDER BY priority DESC, rowid ASC
                    LIMIT 1
                )
                AND state = 'PENDING'
                RETURNING *
                "#,
            )
            .bind(&now)
            .bind(&now)
            .bind(&now)
            .fetch_optional(&self.pool)
            .await?;
            Ok(record)
        })
        .await?;

        if let Some(record) = &record {
            debug!("Claimed job {} (attempt {})", record.id, record.attempts);
        }
        record.map(Job::from_record).transpose()
    }

    async fn finish_attempt(&self, id: &JobId, outcome: AttemptOutcome) -> Result<Job> {
        let now = format_ts(Utc::now());
        let target = outcome.target_state();
        let error = outcome.error().map(str::to_string);
        let (result, available_at) = match &outcome {
            AttemptOutcome::Succeeded(result) => (Some(serde_json::to_string(result)?), None),
            AttemptOutcome::Retry { available_at, .. } => (None, Some(format_ts(*available_at))),
            AttemptOutcome::Failed { .. } => (None, None),
        };

        let record = retry_on_sqlite_busy("finish_attempt", || async {
            let record = sqlx::query_as::<_, JobRecord>(
                r#"
                UPDATE jobs
                SET state = CASE WHEN cancel_requested = 1 THEN 'CANCELLED' ELSE ? END,
                    result = COALESCE(?, result),
                    last_error = ?,
                    available_at = COALESCE(?, available_at),
                    completed_at = CASE
                        WHEN cancel_requested = 1 OR ? = 1 THEN ?
                        ELSE completed_at
                    END,
                    updated_at = ?
                WHERE id = ? AND state = 'RUNNING'
                RETURNING *
                "#,
            )
            .bind(target.as_str())
            .bind(&result)
            .bind(&error)
            .bind(&available_at)
            .bind(target.is_terminal())
            .bind(&now)
            .bind(&now)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
            Ok(record)
        })
        .await?;

        match record {
            Some(record) => Job::from_record(record),
            None => match self.state_of(id).await? {
                Some(state) => Err(Error::InvalidStateTransition {
                    from: state.to_string(),
                    to: target.to_string(),
                }),
                None => Err(Error::not_found("job", id.as_str())),
            },
        }
    }

    async fn request_cancel(&self, id: &JobId) -> Result<CancelOutcome> {
        // A job can move between PENDING and RUNNING while we look; retry
        // until one of the conditional updates lands or the job is final.
        loop {
            let now = format_ts(Utc::now());
            let cancelled = retry_on_sqlite_busy("cancel_pending_job", || async {
                let done = sqlx::query(
                    "UPDATE jobs SET state = 'CANCELLED', completed_at = ?, updated_at = ? WHERE id = ? AND state = 'PENDING'",
                )
                .bind(&now)
                .bind(&now)
                .bind(id.as_str())
                .execute(&self.pool)
                .await?;
                Ok(done.rows_affected())
            })
            .await?;
            if cancelled > 0 {
                return Ok(CancelOutcome::Cancelled);
            }

            let flagged = retry_on_sqlite_busy("flag_running_job", || async {
                let done = sqlx::query(
                    "UPDATE jobs SET cancel_requested = 1, updated_at = ? WHERE id = ? AND state = 'RUNNING'",
                )
                .bind(&now)
                .bind(id.as_str())
                .execute(&self.pool)
                .await?;
                Ok(done.rows_affected())
            })
            .await?;
            if flagged > 0 {
                return Ok(CancelOutcome::Requested);
            }

            match self.state_of(id).await? {
                None => return Ok(CancelOutcome::NotFound),
                Some(state) if state.is_terminal() => return Ok(CancelOutcome::AlreadyFinished),
                Some(_) => continue,
            }
        }
    }

    async fn recover(&self) -> Result<usize> {
        let now = format_ts(Utc::now());
        let (cancelled, reset) = retry_on_sqlite_busy("recover_jobs", || async {
            let mut tx = self.pool.begin().await?;
            let cancelled = sqlx::query(
                "UPDATE jobs SET state = 'CANCELLED', completed_at = ?, updated_at = ? WHERE state = 'RUNNING' AND cancel_requested = 1",
            )
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            let reset = sqlx::query(
                "UPDATE jobs SET state = 'PENDING', available_at = ?, updated_at = ? WHERE state = 'RUNNING'",
            )
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            tx.commit().await?;
            Ok((cancelled, reset))
        })
        .await?;

        if cancelled > 0 {
            info!("Cancelled {} jobs that were flagged before shutdown", cancelled);
        }
        if reset > 0 {
            info!("Reset {} running jobs to pending", reset);
        }
        Ok(reset as usize)
    }

    async fn purge_finished_before(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<usize> {
        let cutoff = format_ts(cutoff);
        let deleted = retry_on_sqlite_busy("purge_jobs", || async {
            let done = sqlx::query(
                r#"
                DELETE FROM jobs WHERE id IN (
                    SELECT id FROM jobs
                    WHERE state IN ('SUCCEEDED', 'FAILED', 'CANCELLED')
                    AND completed_at < ?
                    ORDER BY completed_at
                    LIMIT ?
                )
                "#,
            )
            .bind(&cutoff)
            .bind(limit as i64)
            .execute(&self.pool)
            .await?;
            Ok(done.rows_affected())
        })
        .await?;
        Ok(deleted as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{init_pool, run_migrations};
    use crate::job::{JobResult, RetryPolicy};
    use crate::runner::RunConfig;
    use serde_json::json;
    use tempfile::TempDir;

    async fn queue() -> (TempDir, SqliteQueue) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite:{}", dir.path().join("queue.db").display());
        let pool = init_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();
        (dir, SqliteQueue::new(pool))
    }

    fn job(priority: i32) -> Job {
        let config = RunConfig::builder("p").target("x").build().unwrap();
        Job::new(config, RetryPolicy::default()).with_priority(priority)
    }

    #[tokio::test]
    async fn test_push_get_round_trip() {
        let (_dir, queue) = queue().await;
        let job = job(3).with_timeout(Some(std::time::Duration::from_secs(5)));
        queue.push(job.clone()).await.unwrap();

        let stored = queue.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.to_record().unwrap(), job.to_record().unwrap());
        assert!(queue.push(job).await.is_err());
    }

    #[tokio::test]
    async fn test_claim_order_and_finish() {
        let (_dir, queue) = queue().await;
        let low = job(0);
        let high = job(9);
        queue.push(low.clone()).await.unwrap();
        queue.push(high.clone()).await.unwrap();

        let now = Utc::now() + chrono::Duration::seconds(1);
        let first = queue.claim_next(now).await.unwrap().unwrap();
        assert_eq!(first.id, high.id);
        assert_eq!(first.attempts, 1);
        assert_eq!(first.state, JobState::Running);

        let retry_at = now + chrono::Duration::minutes(5);
        let retried = queue
            .finish_attempt(
                &first.id,
                AttemptOutcome::Retry {
                    error: "flaky".into(),
                    available_at: retry_at,
                },
            )
            .await
            .unwrap();
        assert_eq!(retried.state, JobState::Pending);
        assert_eq!(retried.last_error.as_deref(), Some("flaky"));

        // The retried job is gated, so the low priority one goes next.
        let second = queue.claim_next(now).await.unwrap().unwrap();
        assert_eq!(second.id, low.id);
        let done = queue
            .finish_attempt(
                &second.id,
                AttemptOutcome::Succeeded(JobResult {
                    outputs: json!({ "x": 1 }),
                    duration_ms: 2,
                }),
            )
            .await
            .unwrap();
        assert_eq!(done.state, JobState::Succeeded);
        assert!(done.completed_at.is_some());

        assert!(matches!(
            queue
                .finish_attempt(&second.id, AttemptOutcome::Failed { error: "x".into() })
                .await,
            Err(Error::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_and_recover() {
        let (_dir, queue) = queue().await;
        let a = job(0);
        let b = job(0);
        let c = job(0);
        for j in [&a, &b, &c] {
            queue.push(j.clone()).await.unwrap();
        }

        assert_eq!(queue.request_cancel(&a.id).await.unwrap(), CancelOutcome::Cancelled);
        let running_b = queue.claim_next(Utc::now()).await.unwrap().unwrap();
        assert_eq!(running_b.id, b.id);
        let running_c = queue.claim_next(Utc::now()).await.unwrap().unwrap();
        assert_eq!(running_c.id, c.id);
        assert_eq!(queue.request_cancel(&b.id).await.unwrap(), CancelOutcome::Requested);

        // Simulated crash: b was flagged, c was not.
        assert_eq!(queue.recover().await.unwrap(), 1);
        assert_eq!(
            queue.get(&b.id).await.unwrap().unwrap().state,
            JobState::Cancelled
        );
        let c_again = queue.get(&c.id).await.unwrap().unwrap();
        assert_eq!(c_again.state, JobState::Pending);
        assert_eq!(c_again.attempts, 1);

        assert_eq!(queue.count(JobState::Cancelled).await.unwrap(), 2);
        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(queue.purge_finished_before(cutoff, 1).await.unwrap(), 1);
        assert_eq!(queue.purge_finished_before(cutoff, 10).await.unwrap(), 1);
        assert_eq!(queue.list(None).await.unwrap().len(), 1);
    }
}
