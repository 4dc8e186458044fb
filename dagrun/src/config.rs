//! Process configuration and per-pipeline defaults.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;

use crate::manager::{ManagerConfig, PurgeConfig, WorkerPoolConfig};
use crate::module::ModuleReference;
use crate::queue::JobQueueConfig;
use crate::runner::{ExecutionMode, RunConfig};
use crate::scheduler::SchedulerConfig;
use crate::{Error, Result};

/// Which queue and schedule store implementation to run on.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process; jobs and schedules are lost on exit.
    Memory,
    /// Durable, in the SQLite database at `database_url`.
    #[default]
    Sqlite,
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub database_url: String,
    pub log_dir: String,
    pub backend: BackendKind,
    pub queue: JobQueueConfig,
    pub workers: WorkerPoolConfig,
    pub scheduler: SchedulerConfig,
    pub purge: PurgeConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:dagrun.db?mode=rwc".to_string(),
            log_dir: "logs".to_string(),
            backend: BackendKind::default(),
            queue: JobQueueConfig::default(),
            workers: WorkerPoolConfig::default(),
            scheduler: SchedulerConfig::default(),
            purge: PurgeConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Load `.env` if present, then apply environment overrides to the
    /// defaults.
    ///
    /// Supported env vars:
    /// - `DAGRUN_DATABASE_URL`
    /// - `DAGRUN_LOG_DIR`
    /// - `DAGRUN_BACKEND` (`memory` or `sqlite`)
    /// - `DAGRUN_MAX_WORKERS`
    /// - `DAGRUN_JOB_TIMEOUT_SECS`
    /// - `DAGRUN_RETENTION_HOURS`
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(url) = get("DAGRUN_DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(dir) = get("DAGRUN_LOG_DIR") {
            config.log_dir = dir;
        }
        if let Some(backend) = get("DAGRUN_BACKEND") {
            config.backend = parse_var("DAGRUN_BACKEND", &backend)?;
        }
        if let Some(workers) = get("DAGRUN_MAX_WORKERS") {
            config.workers.max_workers = parse_var("DAGRUN_MAX_WORKERS", &workers)?;
            if config.workers.max_workers == 0 {
                return Err(Error::config("DAGRUN_MAX_WORKERS must be at least 1"));
            }
        }
        if let Some(timeout) = get("DAGRUN_JOB_TIMEOUT_SECS") {
            config.workers.job_timeout_secs = parse_var("DAGRUN_JOB_TIMEOUT_SECS", &timeout)?;
        }
        if let Some(hours) = get("DAGRUN_RETENTION_HOURS") {
            config.purge.retention_hours = parse_var("DAGRUN_RETENTION_HOURS", &hours)?;
        }

        Ok(config)
    }

    /// Manager settings derived from this configuration.
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            queue: self.queue.clone(),
            workers: self.workers.clone(),
            scheduler: self.scheduler.clone(),
            purge: self.purge.clone(),
            ..Default::default()
        }
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::config(format!("Invalid {} '{}': {}", key, value, e)))
}

/// Default run parameters for a named pipeline, as supplied by an outer
/// configuration layer. Taken as already validated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineDefaults {
    pub module: String,
    pub targets: Vec<String>,
    pub inputs: Map<String, Value>,
    pub additional_modules: Vec<String>,
    pub reload: bool,
    pub mode: ExecutionMode,
}

impl PipelineDefaults {
    pub fn to_run_config(&self) -> Result<RunConfig> {
        let mut builder = RunConfig::builder(self.module.as_str())
            .targets(self.targets.iter().cloned())
            .inputs(self.inputs.clone())
            .reload(self.reload)
            .mode(self.mode);
        for module in &self.additional_modules {
            builder = builder.additional_module(ModuleReference::name(module.as_str()));
        }
        builder.build()
    }
}
