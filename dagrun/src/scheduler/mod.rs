//! Scheduler backends: triggers, schedule storage and the firing loop.

mod service;
mod store;
mod trigger;

pub use service::{Firing, JobSink, SchedulerConfig, SchedulerService};
pub use store::{
    MemoryScheduleStore, Schedule, ScheduleRecord, ScheduleStore, SqliteScheduleStore,
};
pub use trigger::{MissedFirePolicy, Trigger};
