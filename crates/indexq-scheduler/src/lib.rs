//! Background job scheduler for the indexq daemon.
//!
//! Runs the periodic queue jobs either on a fixed delay (the next run starts
//! a set time after the previous one finished) or on a cron schedule via
//! `tokio-cron-scheduler` with timezone support.
//!
//! # Features
//!
//! - Fixed-delay loops driven by tokio timers
//! - Cron scheduling with timezone-aware expressions via chrono-tz
//! - Graceful shutdown via CancellationToken and TaskTracker
//! - Job status observability via JobRegistry
//! - Overlap policy (skip/concurrent) for job execution
//! - Jitter and per-run timeouts
//!
//! # Example
//!
//! ```ignore
//! use indexq_scheduler::{
//!     JitterConfig, JobSchedule, OverlapPolicy, SchedulerConfig, SchedulerService, TimeoutConfig,
//! };
//!
//! let scheduler = SchedulerService::new(SchedulerConfig::default()).await?;
//!
//! scheduler.register_job(
//!     "process_queue",
//!     JobSchedule::fixed_delay_ms(5_000),
//!     OverlapPolicy::Skip,
//!     JitterConfig::none(),
//!     TimeoutConfig::new(300),
//!     || async { drain().await },
//! ).await?;
//!
//! let status = scheduler.registry().get_status("process_queue");
//!
//! scheduler.start().await?;
//! ```

mod config;
mod error;
mod jitter;
mod overlap;
mod registry;
mod scheduler;
mod timeout;

#[cfg(feature = "jobs")]
pub mod jobs;

pub use config::SchedulerConfig;
pub use error::SchedulerError;
pub use jitter::{with_jitter, JitterConfig};
pub use overlap::{OverlapGuard, OverlapPolicy, RunGuard};
pub use registry::{JobOutput, JobRegistry, JobResult, JobStatus};
pub use scheduler::{validate_cron_expression, JobSchedule, SchedulerService};
pub use timeout::TimeoutConfig;

#[cfg(feature = "jobs")]
pub use jobs::{
    create_process_queue_job, create_reindex_next_entity_job, ProcessQueueJobConfig,
    ReindexJobConfig, PROCESS_QUEUE_JOB, REINDEX_NEXT_ENTITY_JOB,
};
