//! Job registry for tracking job metadata and execution status.
//!
//! The daemon's `status` command reads from here: last start time, duration,
//! outcome, run/error/skip counts and whatever counters the last run
//! reported.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result of a job execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobResult {
    /// Job completed successfully
    Success,
    /// Job failed with an error message
    Failed(String),
    /// Tick dropped (e.g., previous run still active)
    Skipped(String),
}

/// Counters a job reports back to the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOutput {
    pub metadata: HashMap<String, String>,
}

impl JobOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }

    pub fn with_items_processed(self, count: usize) -> Self {
        self.with_metadata("items_processed", count)
    }
}

/// Status of a registered job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_name: String,
    /// Human-readable schedule, e.g. `every 5000ms` or `cron 0 * * * * * (UTC)`
    pub schedule: String,
    /// When the job last started
    pub last_run: Option<DateTime<Utc>>,
    pub last_duration_ms: Option<u64>,
    pub last_result: Option<JobResult>,
    /// Earliest time the next tick can fire
    pub next_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub error_count: u64,
    /// Ticks dropped by the overlap guard
    pub skip_count: u64,
    pub is_running: bool,
    #[serde(default)]
    pub last_run_metadata: HashMap<String, String>,
}

impl JobStatus {
    pub fn new(job_name: String, schedule: String) -> Self {
        Self {
            job_name,
            schedule,
            last_run: None,
            last_duration_ms: None,
            last_result: None,
            next_run: None,
            run_count: 0,
            error_count: 0,
            skip_count: 0,
            is_running: false,
            last_run_metadata: HashMap::new(),
        }
    }
}

/// Thread-safe registry of job status.
///
/// # Example
///
/// ```
/// use indexq_scheduler::{JobOutput, JobRegistry, JobResult};
///
/// let registry = JobRegistry::new();
/// registry.register("process_queue", "every 5000ms");
///
/// registry.record_start("process_queue");
/// assert!(registry.is_running("process_queue"));
///
/// registry.record_complete("process_queue", JobResult::Success, 12, JobOutput::new());
/// assert!(!registry.is_running("process_queue"));
/// ```
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, JobStatus>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }

    // A panicking job cannot leave a status map half-written, so poisoning
    // is ignored.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, JobStatus>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, JobStatus>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a job, replacing any previous entry with the same name.
    pub fn register(&self, job_name: &str, schedule: &str) {
        self.write().insert(
            job_name.to_string(),
            JobStatus::new(job_name.to_string(), schedule.to_string()),
        );
    }

    pub fn record_start(&self, job_name: &str) {
        if let Some(status) = self.write().get_mut(job_name) {
            status.is_running = true;
            status.last_run = Some(Utc::now());
        }
    }

    pub fn record_complete(
        &self,
        job_name: &str,
        result: JobResult,
        duration_ms: u64,
        output: JobOutput,
    ) {
        if let Some(status) = self.write().get_mut(job_name) {
            status.is_running = false;
            status.last_duration_ms = Some(duration_ms);
            status.run_count += 1;
            if matches!(result, JobResult::Failed(_)) {
                status.error_count += 1;
            }
            status.last_result = Some(result);
            status.last_run_metadata = output.metadata;
        }
    }

    /// Record a dropped tick. Does not count as a run.
    pub fn record_skipped(&self, job_name: &str, reason: &str) {
        if let Some(status) = self.write().get_mut(job_name) {
            status.skip_count += 1;
            status.last_result = Some(JobResult::Skipped(reason.to_string()));
        }
    }

    pub fn set_next_run(&self, job_name: &str, next: DateTime<Utc>) {
        if let Some(status) = self.write().get_mut(job_name) {
            status.next_run = Some(next);
        }
    }

    pub fn get_status(&self, job_name: &str) -> Option<JobStatus> {
        self.read().get(job_name).cloned()
    }

    /// All jobs, sorted by name.
    pub fn get_all_status(&self) -> Vec<JobStatus> {
        let mut all: Vec<JobStatus> = self.read().values().cloned().collect();
        all.sort_by(|a, b| a.job_name.cmp(&b.job_name));
        all
    }

    pub fn is_running(&self, job_name: &str) -> bool {
        self.read()
            .get(job_name)
            .map(|s| s.is_running)
            .unwrap_or(false)
    }

    pub fn is_registered(&self, job_name: &str) -> bool {
        self.read().contains_key(job_name)
    }

    pub fn job_count(&self) -> usize {
        self.read().len()
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}
