//! Periodic removal of finished jobs past their retention window.

use chrono::{NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::queue::QueueBackend;

/// Configuration for job purging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeConfig {
    /// Hours to retain finished jobs. 0 keeps them forever.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u32,

    /// Time window for purging (e.g. "02:00-05:00", UTC). Any time if `None`.
    #[serde(default)]
    pub time_window: Option<String>,

    /// Jobs deleted per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Seconds between purge checks.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

fn default_retention_hours() -> u32 {
    24 * 7
}

fn default_batch_size() -> u32 {
    100
}

fn default_check_interval_secs() -> u64 {
    3600
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            retention_hours: default_retention_hours(),
            time_window: None,
            batch_size: default_batch_size(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

impl PurgeConfig {
    pub fn with_retention_hours(mut self, hours: u32) -> Self {
        self.retention_hours = hours;
        self
    }

    pub fn with_time_window(mut self, window: Option<String>) -> Self {
        self.time_window = window;
        self
    }

    pub fn with_batch_size(mut self, size: u32) -> Self {
        self.batch_size = size;
        self
    }
}

#[derive(Debug, Clone)]
struct TimeWindow {
    start: NaiveTime,
    end: NaiveTime,
}

impl TimeWindow {
    fn parse(window: &str) -> Option<Self> {
        let (start, end) = window.split_once('-')?;
        let start = NaiveTime::parse_from_str(start.trim(), "%H:%M").ok()?;
        let end = NaiveTime::parse_from_str(end.trim(), "%H:%M").ok()?;
        Some(Self { start, end })
    }

    fn is_within(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time < self.end
        } else {
            // Overnight, e.g. 23:00-02:00
            time >= self.start || time < self.end
        }
    }
}

/// Deletes terminal jobs older than the retention window.
pub struct JobPurgeService {
    config: PurgeConfig,
    queue: Arc<dyn QueueBackend>,
    time_window: Option<TimeWindow>,
}

impl JobPurgeService {
    pub fn new(config: PurgeConfig, queue: Arc<dyn QueueBackend>) -> Self {
        let time_window = config.time_window.as_deref().and_then(TimeWindow::parse);
        if config.time_window.is_some() && time_window.is_none() {
            warn!(
                "Invalid time window format: {:?}. Expected format: HH:MM-HH:MM",
                config.time_window
            );
        }

        Self {
            config,
            queue,
            time_window,
        }
    }

    pub fn is_purge_allowed(&self) -> bool {
        self.time_window
            .as_ref()
            .is_none_or(|w| w.is_within(Utc::now().time()))
    }

    /// Run one purge pass. Returns the number of jobs deleted.
    pub async fn run_purge(&self) -> Result<u64> {
        if self.config.retention_hours == 0 {
            debug!("Job purging disabled (retention_hours = 0)");
            return Ok(0);
        }
        if !self.is_purge_allowed() {
            debug!("Purge not allowed outside time window");
            return Ok(0);
        }

        let cutoff = Utc::now() - chrono::Duration::hours(i64::from(self.config.retention_hours));
        let batch = self.config.batch_size.max(1) as usize;
        let mut total_deleted: u64 = 0;

        loop {
            let deleted = self.queue.purge_finished_before(cutoff, batch).await?;
            total_deleted += deleted as u64;
            if deleted < batch {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        if total_deleted > 0 {
            info!(
                "Purged {} finished jobs (retention: {}h)",
                total_deleted, self.config.retention_hours
            );
        } else {
            debug!("No jobs to purge");
        }
        Ok(total_deleted)
    }

    /// Run purge passes every `check_interval_secs` until `cancellation_token`
    /// fires.
    pub fn start_background_task(
        self: &Arc<Self>,
        cancellation_token: CancellationToken,
    ) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut check_interval =
                interval(Duration::from_secs(service.config.check_interval_secs.max(1)));

            info!(
                "Job purge service started (retention: {}h, interval: {}s)",
                service.config.retention_hours, service.config.check_interval_secs
            );

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        info!("Job purge service shutting down");
                        break;
                    }
                    _ = check_interval.tick() => {
                        if let Err(e) = service.run_purge().await {
                            error!("Purge cycle failed: {}", e);
                        }
                    }
                }
            }
        })
    }

    pub fn config(&self) -> &PurgeConfig {
        &self.config
    }
}
