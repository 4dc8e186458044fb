//! dagrun library crate.
//!
//! Composes pipelines from named modules into one DAG and runs them
//! immediately, through a job queue, or on a schedule.

pub mod config;
pub mod database;
pub mod error;
pub mod graph;
pub mod job;
pub mod logging;
pub mod manager;
pub mod module;
pub mod queue;
pub mod runner;
pub mod scheduler;

pub use error::{Error, Result};
