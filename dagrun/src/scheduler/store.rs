//! Schedule model and persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use std::collections::BTreeMap;

use super::{MissedFirePolicy, Trigger};
use crate::database::retry::retry_on_sqlite_busy;
use crate::job::{Job, RetryPolicy, ScheduleId, format_ts, parse_ts};
use crate::runner::{RunConfig, RunConfigRecord};
use crate::{Error, Result};

/// A registered trigger and the run configuration it submits.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub id: ScheduleId,
    /// Cloned into every fired job, never modified.
    pub template: RunConfig,
    pub trigger: Trigger,
    pub missed_fire_policy: MissedFirePolicy,
    pub retry: RetryPolicy,
    pub priority: i32,
    /// `None` once a one-shot schedule has fired.
    pub next_fire_at: Option<DateTime<Utc>>,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub fire_count: u64,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    /// Validate `trigger` and compute the first firing relative to `now`.
    pub fn new(
        template: RunConfig,
        trigger: Trigger,
        missed_fire_policy: MissedFirePolicy,
        retry: RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        trigger.validate()?;
        retry.validate()?;
        let next_fire_at = trigger.first_fire(now)?;
        Ok(Self {
            id: ScheduleId::new(),
            template,
            trigger,
            missed_fire_policy,
            retry,
            priority: 0,
            next_fire_at,
            last_fired_at: None,
            fire_count: 0,
            enabled: next_fire_at.is_some(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Whether a firing is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_fire_at.is_some_and(|t| t <= now)
    }

    /// A fresh job from the template.
    pub fn make_job(&self) -> Job {
        Job::new(self.template.clone(), self.retry.clone())
            .with_priority(self.priority)
            .with_schedule(self.id.clone())
    }

    /// Record a firing (or a dropped firing) at `now` and move
    /// `next_fire_at` past it.
    pub(crate) fn advance(&mut self, now: DateTime<Utc>, fired: bool) -> Result<()> {
        if fired {
            self.last_fired_at = Some(now);
            self.fire_count += 1;
        }
        self.next_fire_at = if self.trigger.is_one_shot() {
            None
        } else {
            self.trigger.next_after(now, self.created_at)?
        };
        if self.next_fire_at.is_none() {
            self.enabled = false;
        }
        self.updated_at = now;
        Ok(())
    }

    pub fn to_record(&self) -> Result<ScheduleRecord> {
        Ok(ScheduleRecord {
            id: self.id.to_string(),
            template: serde_json::to_string(&self.template.to_record())?,
            trigger_spec: serde_json::to_string(&self.trigger)?,
            missed_fire_policy: self.missed_fire_policy.to_string(),
            retry_policy: serde_json::to_string(&self.retry)?,
            priority: i64::from(self.priority),
            next_fire_at: self.next_fire_at.map(format_ts),
            last_fired_at: self.last_fired_at.map(format_ts),
            fire_count: self.fire_count as i64,
            enabled: self.enabled,
            created_at: format_ts(self.created_at),
            updated_at: format_ts(self.updated_at),
        })
    }

    pub fn from_record(record: ScheduleRecord) -> Result<Self> {
        let template: RunConfigRecord = serde_json::from_str(&record.template)?;
        Ok(Self {
            id: ScheduleId::from(record.id),
            template: template.into_run_config()?,
            trigger: serde_json::from_str(&record.trigger_spec)?,
            missed_fire_policy: record.missed_fire_policy.parse().map_err(|_| {
                Error::validation(format!(
                    "unknown missed fire policy '{}'",
                    record.missed_fire_policy
                ))
            })?,
            retry: serde_json::from_str(&record.retry_policy)?,
            priority: i32::try_from(record.priority)
                .map_err(|_| Error::validation("priority out of range"))?,
            next_fire_at: record.next_fire_at.as_deref().map(parse_ts).transpose()?,
            last_fired_at: record.last_fired_at.as_deref().map(parse_ts).transpose()?,
            fire_count: record.fire_count.max(0) as u64,
            enabled: record.enabled,
            created_at: parse_ts(&record.created_at)?,
            updated_at: parse_ts(&record.updated_at)?,
        })
    }
}

/// Durable schedule record.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub id: String,
    pub template: String,
    pub trigger_spec: String,
    pub missed_fire_policy: String,
    pub retry_policy: String,
    pub priority: i64,
    pub next_fire_at: Option<String>,
    pub last_fired_at: Option<String>,
    pub fire_count: i64,
    pub enabled: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Persistence of schedules.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Insert or replace.
    async fn save(&self, schedule: &Schedule) -> Result<()>;
    /// Write the firing state of an existing schedule. Never inserts;
    /// returns false if the schedule is gone.
    async fn update(&self, schedule: &Schedule) -> Result<bool>;
    async fn get(&self, id: &ScheduleId) -> Result<Option<Schedule>>;
    async fn list(&self) -> Result<Vec<Schedule>>;
    /// Returns true if the schedule existed.
    async fn remove(&self, id: &ScheduleId) -> Result<bool>;
    /// Enabled schedules whose next firing is at or before `now`.
    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>>;
}

/// In-memory schedule store.
#[derive(Default)]
pub struct MemoryScheduleStore {
    schedules: Mutex<BTreeMap<ScheduleId, Schedule>>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn save(&self, schedule: &Schedule) -> Result<()> {
        self.schedules
            .lock()
            .insert(schedule.id.clone(), schedule.clone());
        Ok(())
    }

    async fn update(&self, schedule: &Schedule) -> Result<bool> {
        match self.schedules.lock().get_mut(&schedule.id) {
            Some(stored) => {
                *stored = schedule.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get(&self, id: &ScheduleId) -> Result<Option<Schedule>> {
        Ok(self.schedules.lock().get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<Schedule>> {
        let mut schedules: Vec<Schedule> = self.schedules.lock().values().cloned().collect();
        schedules.sort_by_key(|s| s.created_at);
        Ok(schedules)
    }

    async fn remove(&self, id: &ScheduleId) -> Result<bool> {
        Ok(self.schedules.lock().remove(id).is_some())
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
        let mut due: Vec<Schedule> = self
            .schedules
            .lock()
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_fire_at);
        Ok(due)
    }
}

/// Schedule store on the `schedules` table.
#[derive(Clone)]
pub struct SqliteScheduleStore {
    pool: SqlitePool,
}

impl SqliteScheduleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScheduleStore for SqliteScheduleStore {
    async fn save(&self, schedule: &Schedule) -> Result<()> {
        let record = schedule.to_record()?;
        retry_on_sqlite_busy("save_schedule", || async {
            sqlx::query(
                r#"
                INSERT INTO schedules (
                    id, template, trigger_spec, missed_fire_policy, retry_policy,
                    priority, next_fire_at, last_fired_at, fire_count, enabled,
                    created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    template = excluded.template,
                    trigger_spec = excluded.trigger_spec,
                    missed_fire_policy = excluded.missed_fire_policy,
                    retry_policy = excluded.retry_policy,
                    priority = excluded.priority,
                    next_fire_at = excluded.next_fire_at,
                    last_fired_at = excluded.last_fired_at,
                    fire_count = excluded.fire_count,
                    enabled = excluded.enabled,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&record.id)
            .bind(&record.template)
            .bind(&record.trigger_spec)
            .bind(&record.missed_fire_policy)
            .bind(&record.retry_policy)
            .bind(record.priority)
            .bind(&record.next_fire_at)
            .bind(&record.last_fired_at)
            .bind(record.fire_count)
            .bind(record.enabled)
            .bind(&record.created_at)
            .bind(&record.updated_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn update(&self, schedule: &Schedule) -> Result<bool> {
        let record = schedule.to_record()?;
        let updated = retry_on_sqlite_busy("update_schedule", || async {
            let done = sqlx::query(
                r#"
                UPDATE schedules SET
                    next_fire_at = ?,
                    last_fired_at = ?,
                    fire_count = ?,
                    enabled = ?,
                    updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(&record.next_fire_at)
            .bind(&record.last_fired_at)
            .bind(record.fire_count)
            .bind(record.enabled)
            .bind(&record.updated_at)
            .bind(&record.id)
            .execute(&self.pool)
            .await?;
            Ok(done.rows_affected())
        })
        .await?;
        Ok(updated > 0)
    }

    async fn get(&self, id: &ScheduleId) -> Result<Option<Schedule>> {
        sqlx::query_as::<_, ScheduleRecord>("SELECT * FROM schedules WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .map(Schedule::from_record)
            .transpose()
    }

    async fn list(&self) -> Result<Vec<Schedule>> {
        sqlx::query_as::<_, ScheduleRecord>("SELECT * FROM schedules ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Schedule::from_record)
            .collect()
    }

    async fn remove(&self, id: &ScheduleId) -> Result<bool> {
        let deleted = retry_on_sqlite_busy("remove_schedule", || async {
            let done = sqlx::query("DELETE FROM schedules WHERE id = ?")
                .bind(id.as_str())
                .execute(&self.pool)
                .await?;
            Ok(done.rows_affected())
        })
        .await?;
        Ok(deleted > 0)
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
        sqlx::query_as::<_, ScheduleRecord>(
            r#"
            SELECT * FROM schedules
            WHERE enabled = 1 AND next_fire_at IS NOT NULL AND next_fire_at <= ?
            ORDER BY next_fire_at, id
            "#,
        )
        .bind(format_ts(now))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Schedule::from_record)
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{init_pool, run_migrations};
    use chrono::TimeZone;
    use serde_json::json;

    fn template() -> RunConfig {
        RunConfig::builder("report")
            .target("total")
            .input("region", json!("eu"))
            .build()
            .unwrap()
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_new_schedule_computes_first_fire() {
        let schedule = Schedule::new(
            template(),
            Trigger::every(60),
            MissedFirePolicy::FireFromNow,
            RetryPolicy::default(),
            t(0),
        )
        .unwrap();
        assert_eq!(schedule.next_fire_at, Some(t(60)));
        assert!(!schedule.is_due(t(59)));
        assert!(schedule.is_due(t(60)));

        let err = Schedule::new(
            template(),
            Trigger::every(0),
            MissedFirePolicy::CatchUp,
            RetryPolicy::default(),
            t(0),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Schedule(_)));
    }

    #[test]
    fn test_one_shot_disables_after_advance() {
        let mut schedule = Schedule::new(
            template(),
            Trigger::once(t(10)),
            MissedFirePolicy::CatchUp,
            RetryPolicy::default(),
            t(0),
        )
        .unwrap();
        schedule.advance(t(10), true).unwrap();
        assert!(!schedule.enabled);
        assert_eq!(schedule.next_fire_at, None);
        assert_eq!(schedule.fire_count, 1);
    }

    #[test]
    fn test_make_job_clones_template() {
        let schedule = Schedule::new(
            template(),
            Trigger::every(5),
            MissedFirePolicy::CatchUp,
            RetryPolicy::none(),
            t(0),
        )
        .unwrap()
        .with_priority(4);
        let a = schedule.make_job();
        let b = schedule.make_job();
        assert_ne!(a.id, b.id);
        assert_eq!(a.priority, 4);
        assert_eq!(a.schedule_id.as_ref(), Some(&schedule.id));
        assert_eq!(a.config.targets(), schedule.template.targets());
    }

    #[tokio::test]
    async fn test_sqlite_store_round_trip_and_due() {
        let dir = tempfile::TempDir::new().unwrap();
        let url = format!("sqlite:{}", dir.path().join("schedules.db").display());
        let pool = init_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let store = SqliteScheduleStore::new(pool);

        let mut schedule = Schedule::new(
            template(),
            Trigger::Cron {
                expression: "0 */5 * * * *".to_string(),
                timezone: Some("Europe/Berlin".to_string()),
            },
            MissedFirePolicy::CatchUp,
            RetryPolicy::default(),
            t(0),
        )
        .unwrap();
        store.save(&schedule).await.unwrap();

        let loaded = store.get(&schedule.id).await.unwrap().unwrap();
        assert_eq!(loaded.to_record().unwrap(), schedule.to_record().unwrap());

        let next = schedule.next_fire_at.unwrap();
        assert!(store.due(next - chrono::Duration::seconds(1)).await.unwrap().is_empty());
        assert_eq!(store.due(next).await.unwrap().len(), 1);

        schedule.advance(next, true).unwrap();
        store.save(&schedule).await.unwrap();
        assert!(store.due(next).await.unwrap().is_empty());
        assert_eq!(store.get(&schedule.id).await.unwrap().unwrap().fire_count, 1);

        assert!(store.remove(&schedule.id).await.unwrap());
        assert!(!store.remove(&schedule.id).await.unwrap());
        assert!(!store.update(&schedule).await.unwrap());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_due_order() {
        let store = MemoryScheduleStore::new();
        let late = Schedule::new(
            template(),
            Trigger::once(t(20)),
            MissedFirePolicy::CatchUp,
            RetryPolicy::default(),
            t(0),
        )
        .unwrap();
        let early = Schedule::new(
            template(),
            Trigger::once(t(10)),
            MissedFirePolicy::CatchUp,
            RetryPolicy::default(),
            t(0),
        )
        .unwrap();
        store.save(&late).await.unwrap();
        store.save(&early).await.unwrap();

        let due: Vec<ScheduleId> = store
            .due(t(30))
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(due, vec![early.id, late.id]);
    }

    #[tokio::test]
    async fn test_memory_update_never_inserts() {
        let store = MemoryScheduleStore::new();
        let mut schedule = Schedule::new(
            template(),
            Trigger::every(10),
            MissedFirePolicy::CatchUp,
            RetryPolicy::default(),
            t(0),
        )
        .unwrap();
        assert!(!store.update(&schedule).await.unwrap());
        assert!(store.get(&schedule.id).await.unwrap().is_none());

        store.save(&schedule).await.unwrap();
        schedule.advance(t(10), true).unwrap();
        assert!(store.update(&schedule).await.unwrap());
        assert_eq!(store.get(&schedule.id).await.unwrap().unwrap().fire_count, 1);
    }
}
