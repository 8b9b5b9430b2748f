//! Error types for the scheduler crate.

use thiserror::Error;
use tokio_cron_scheduler::JobSchedulerError;

/// Errors that can occur during scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Error from the underlying tokio-cron-scheduler
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Invalid cron expression
    #[error("Invalid cron expression: {0}")]
    InvalidCron(String),

    /// Invalid timezone string
    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    /// Fixed delay of zero would spin
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// A job with this name is already registered
    #[error("Job already registered: {0}")]
    DuplicateJob(String),

    /// Scheduler is already running
    #[error("Scheduler is already running")]
    AlreadyRunning,

    /// Scheduler is not running
    #[error("Scheduler is not running")]
    NotRunning,
}

impl From<JobSchedulerError> for SchedulerError {
    fn from(err: JobSchedulerError) -> Self {
        SchedulerError::Scheduler(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SchedulerError::InvalidCron("bad expression".to_string());
        assert!(err.to_string().contains("Invalid cron expression"));

        let err = SchedulerError::DuplicateJob("process_queue".to_string());
        assert_eq!(err.to_string(), "Job already registered: process_queue");

        let err = SchedulerError::InvalidSchedule("zero delay".to_string());
        assert!(err.to_string().contains("zero delay"));

        assert!(SchedulerError::AlreadyRunning
            .to_string()
            .contains("already running"));
        assert!(SchedulerError::NotRunning.to_string().contains("not running"));
    }
}
