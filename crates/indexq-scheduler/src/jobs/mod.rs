//! The two queue jobs.
//!
//! - **process_queue**: drains one batch of queue entries per tick
//! - **reindex_next_entity**: advances one enqueueing session by one batch
//!   per tick
//!
//! Both default to fixed-delay schedules and skip ticks that would overlap a
//! run still in progress.

pub mod enqueueing;
pub mod queue;

pub use enqueueing::{create_reindex_next_entity_job, ReindexJobConfig, REINDEX_NEXT_ENTITY_JOB};
pub use queue::{create_process_queue_job, ProcessQueueJobConfig, PROCESS_QUEUE_JOB};
