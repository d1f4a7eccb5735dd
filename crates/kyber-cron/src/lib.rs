//! Kyber Cron — custom async job scheduler with JSON persistence.
//!
//! This crate contains:
//! - **types**: `CronJob`, `CronSchedule`, `CronPayload`, and store types
//! - **service**: `CronService` — the timer loop, persistence, and dispatch

pub mod service;
pub mod types;

pub use service::{CronService, OnJobFn};
pub use types::{CronJob, CronPayload, CronSchedule, CronStore, JobStatus, ScheduleKind};
