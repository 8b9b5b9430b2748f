//! Scheduler service.
//!
//! Fixed-delay jobs run in their own tokio task: sleep, run, sleep again, so
//! the delay is measured from the end of the previous run. Cron jobs are
//! handed to tokio-cron-scheduler. Both go through the same run wrapper
//! (overlap guard, jitter, timeout, registry bookkeeping) and a failed run
//! never stops later ticks.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use chrono_tz::Tz;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::jitter::with_jitter;
use crate::overlap::OverlapGuard;
use crate::registry::{JobOutput, JobRegistry, JobResult};
use crate::{JitterConfig, OverlapPolicy, SchedulerConfig, SchedulerError, TimeoutConfig};

/// Validate a 6-field cron expression (sec min hour day-of-month month day-of-week).
///
/// ```
/// use indexq_scheduler::validate_cron_expression;
///
/// assert!(validate_cron_expression("*/5 * * * * *").is_ok());
/// assert!(validate_cron_expression("every five seconds").is_err());
/// ```
pub fn validate_cron_expression(expr: &str) -> Result<(), SchedulerError> {
    Job::new_async(expr, |_uuid, _lock| Box::pin(async {}))
        .map(|_| ())
        .map_err(|e| SchedulerError::InvalidCron(format!("'{}': {}", expr, e)))
}

/// When a job runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobSchedule {
    /// Run, then wait this long before the next run
    FixedDelay(Duration),
    /// Run on a cron schedule, in `timezone` or the scheduler default
    Cron {
        expr: String,
        timezone: Option<String>,
    },
}

impl JobSchedule {
    pub fn fixed_delay_ms(millis: u64) -> Self {
        JobSchedule::FixedDelay(Duration::from_millis(millis))
    }

    pub fn cron(expr: impl Into<String>, timezone: Option<String>) -> Self {
        JobSchedule::Cron {
            expr: expr.into(),
            timezone,
        }
    }

    fn describe(&self, tz: Option<&Tz>) -> String {
        match (self, tz) {
            (JobSchedule::FixedDelay(delay), _) => format!("every {}ms", delay.as_millis()),
            (JobSchedule::Cron { expr, .. }, Some(tz)) => format!("cron {} ({})", expr, tz.name()),
            (JobSchedule::Cron { expr, .. }, None) => format!("cron {}", expr),
        }
    }
}

type PendingLoop = Box<dyn FnOnce(&TaskTracker, CancellationToken) + Send>;

/// Shared per-job run wrapper.
struct JobRunner {
    name: String,
    guard: OverlapGuard,
    registry: Arc<JobRegistry>,
    jitter: JitterConfig,
    timeout: TimeoutConfig,
}

impl JobRunner {
    async fn run<F, Fut>(&self, job_fn: &F)
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<JobOutput, String>>,
    {
        let Some(_run) = self.guard.try_acquire() else {
            debug!(job = %self.name, "Previous run still active, skipping tick");
            self.registry
                .record_skipped(&self.name, "previous run still active");
            return;
        };

        with_jitter(&self.jitter, async {
            self.registry.record_start(&self.name);
            let start = Instant::now();

            let result = self.timeout.run(job_fn()).await;
            let duration_ms = start.elapsed().as_millis() as u64;

            match result {
                Ok(output) => {
                    debug!(job = %self.name, duration_ms = duration_ms, "Job completed");
                    self.registry
                        .record_complete(&self.name, JobResult::Success, duration_ms, output);
                }
                Err(error) => {
                    warn!(job = %self.name, duration_ms, error = %error, "Job failed");
                    self.registry.record_complete(
                        &self.name,
                        JobResult::Failed(error),
                        duration_ms,
                        JobOutput::new(),
                    );
                }
            }
        })
        .await;
    }
}

async fn run_fixed_delay<F, Fut>(
    runner: Arc<JobRunner>,
    delay: Duration,
    token: CancellationToken,
    job_fn: F,
) where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JobOutput, String>> + Send + 'static,
{
    let step = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
    info!(job = %runner.name, delay_ms = delay.as_millis() as u64, "Fixed-delay job started");

    loop {
        runner.registry.set_next_run(&runner.name, Utc::now() + step);
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        runner.run(&job_fn).await;
    }

    info!(job = %runner.name, "Fixed-delay job stopped");
}

/// Owns the cron scheduler, the fixed-delay tasks and the job registry.
pub struct SchedulerService {
    scheduler: JobScheduler,
    config: SchedulerConfig,
    registry: Arc<JobRegistry>,
    shutdown_token: CancellationToken,
    tracker: TaskTracker,
    pending: Mutex<Vec<PendingLoop>>,
    is_running: AtomicBool,
}

impl SchedulerService {
    /// Create a scheduler. Nothing runs until [`start`](Self::start).
    pub async fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.parse_timezone()?;
        let scheduler = JobScheduler::new().await?;

        Ok(Self {
            scheduler,
            config,
            registry: Arc::new(JobRegistry::new()),
            shutdown_token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            pending: Mutex::new(Vec::new()),
            is_running: AtomicBool::new(false),
        })
    }

    /// Start the cron scheduler and every registered fixed-delay loop.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::AlreadyRunning` if called twice.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let pending = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if self.is_running.swap(true, Ordering::SeqCst) {
                return Err(SchedulerError::AlreadyRunning);
            }
            std::mem::take(&mut *pending)
        };

        self.scheduler.start().await?;
        for spawn in pending {
            spawn(&self.tracker, self.shutdown_token.clone());
        }

        info!(jobs = self.registry.job_count(), "Scheduler started");
        Ok(())
    }

    /// Stop all jobs.
    ///
    /// Cancels the fixed-delay loops, waits up to the configured shutdown
    /// timeout for in-flight runs, then stops the cron scheduler.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::NotRunning` if the scheduler was not started.
    pub async fn shutdown(&mut self) -> Result<(), SchedulerError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }

        info!("Initiating scheduler shutdown");
        self.shutdown_token.cancel();
        self.tracker.close();

        if tokio::time::timeout(self.config.shutdown_timeout(), self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                timeout_secs = self.config.shutdown_timeout_secs,
                "Jobs still running at shutdown deadline"
            );
        }

        if let Err(e) = self.scheduler.shutdown().await {
            warn!(error = %e, "Error during cron scheduler shutdown");
        }

        self.is_running.store(false, Ordering::SeqCst);
        info!("Scheduler shutdown complete");
        Ok(())
    }

    /// Token cancelled at shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> Arc<JobRegistry> {
        self.registry.clone()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Register a job.
    ///
    /// `job_fn` is called once per tick. Its error string is logged and
    /// recorded in the registry; the schedule keeps going either way.
    /// Jobs registered after [`start`](Self::start) begin immediately.
    ///
    /// # Errors
    ///
    /// Invalid cron expression or timezone, a zero fixed delay, or a name
    /// that is already registered.
    pub async fn register_job<F, Fut>(
        &self,
        name: &str,
        schedule: JobSchedule,
        overlap: OverlapPolicy,
        jitter: JitterConfig,
        timeout: TimeoutConfig,
        job_fn: F,
    ) -> Result<(), SchedulerError>
    where
        F: Fn() -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<JobOutput, String>> + Send + 'static,
    {
        if self.registry.is_registered(name) {
            return Err(SchedulerError::DuplicateJob(name.to_string()));
        }

        let runner = Arc::new(JobRunner {
            name: name.to_string(),
            guard: OverlapGuard::new(overlap),
            registry: self.registry.clone(),
            jitter,
            timeout,
        });

        match &schedule {
            JobSchedule::FixedDelay(delay) => {
                if delay.is_zero() {
                    return Err(SchedulerError::InvalidSchedule(format!(
                        "job {} has a zero fixed delay",
                        name
                    )));
                }
                let delay = *delay;
                self.registry.register(name, &schedule.describe(None));

                let spawn: PendingLoop =
                    Box::new(move |tracker: &TaskTracker, token: CancellationToken| {
                        tracker.spawn(run_fixed_delay(runner, delay, token, job_fn));
                    });

                let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
                if self.is_running() {
                    drop(pending);
                    spawn(&self.tracker, self.shutdown_token.clone());
                } else {
                    pending.push(spawn);
                }
            }
            JobSchedule::Cron { expr, timezone } => {
                let tz = match timezone {
                    Some(tz) => Self::parse_timezone(tz)?,
                    None => self.config.parse_timezone()?,
                };
                validate_cron_expression(expr)?;

                let job = Job::new_async_tz(expr.as_str(), tz, move |_uuid, _lock| {
                    let runner = runner.clone();
                    let job_fn = job_fn.clone();
                    Box::pin(async move {
                        runner.run(&job_fn).await;
                    })
                })
                .map_err(|e| SchedulerError::InvalidCron(e.to_string()))?;

                let uuid: uuid::Uuid = self.scheduler.add(job).await?;
                self.registry.register(name, &schedule.describe(Some(&tz)));
                debug!(job = %name, uuid = %uuid, "Cron job added");
            }
        }

        info!(job = %name, schedule = %schedule.describe(None), "Job registered");
        Ok(())
    }

    /// Parse an IANA timezone name.
    pub fn parse_timezone(tz_str: &str) -> Result<Tz, SchedulerError> {
        tz_str
            .parse()
            .map_err(|_| SchedulerError::InvalidTimezone(tz_str.to_string()))
    }
}
