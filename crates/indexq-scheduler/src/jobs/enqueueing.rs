//! Session advancement job.
//!
//! Each tick advances the least recently advanced reindex session by one
//! batch. Loading and the version-checked commit are blocking RocksDB work,
//! so the tick runs them on the blocking pool.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use indexq_indexing::{EnqueueOutcome, IndexingQueueManager};
use indexq_types::JobsSettings;

use crate::{
    JitterConfig, JobOutput, JobSchedule, OverlapPolicy, SchedulerError, SchedulerService,
    TimeoutConfig,
};

/// Registry name of the session advancement job.
pub const REINDEX_NEXT_ENTITY_JOB: &str = "reindex_next_entity";

/// Configuration for the session advancement job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReindexJobConfig {
    /// Delay between the end of one tick and the start of the next (default: 1000)
    pub delay_ms: u64,

    /// Cron expression used instead of the fixed delay when set
    #[serde(default)]
    pub cron: Option<String>,

    /// Timezone for the cron expression (scheduler default when unset)
    #[serde(default)]
    pub timezone: Option<String>,

    /// Max jitter in seconds (default: 0)
    pub jitter_secs: u64,

    /// Timeout in seconds for one tick (default: 300, 0 = none)
    pub timeout_secs: u64,
}

impl Default for ReindexJobConfig {
    fn default() -> Self {
        Self {
            delay_ms: 1_000,
            cron: None,
            timezone: None,
            jitter_secs: 0,
            timeout_secs: 300,
        }
    }
}

impl ReindexJobConfig {
    pub fn from_settings(settings: &JobsSettings) -> Self {
        Self {
            delay_ms: settings.reindex_next_entity_delay_ms,
            cron: settings.reindex_next_entity_cron.clone(),
            timezone: Some(settings.timezone.clone()),
            jitter_secs: settings.jitter_secs,
            timeout_secs: settings.timeout_secs,
        }
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn schedule(&self) -> JobSchedule {
        match &self.cron {
            Some(expr) => JobSchedule::cron(expr.clone(), self.timezone.clone()),
            None => JobSchedule::fixed_delay_ms(self.delay_ms),
        }
    }
}

/// Register the session advancement job with the scheduler.
pub async fn create_reindex_next_entity_job(
    scheduler: &SchedulerService,
    manager: Arc<IndexingQueueManager>,
    config: ReindexJobConfig,
) -> Result<(), SchedulerError> {
    scheduler
        .register_job(
            REINDEX_NEXT_ENTITY_JOB,
            config.schedule(),
            OverlapPolicy::Skip,
            JitterConfig::new(config.jitter_secs),
            TimeoutConfig::new(config.timeout_secs),
            move || {
                let manager = manager.clone();
                async move { run_reindex_next_entity(manager).await }
            },
        )
        .await?;

    info!("Registered session advancement job");
    Ok(())
}

async fn run_reindex_next_entity(
    manager: Arc<IndexingQueueManager>,
) -> Result<JobOutput, String> {
    let outcome = tokio::task::spawn_blocking(move || manager.process_next_enqueueing_session())
        .await
        .map_err(|e| format!("Session advancement task failed: {}", e))?
        .map_err(|e| format!("Session advancement failed: {}", e))?;

    let output = match &outcome {
        EnqueueOutcome::Idle => {
            debug!("No runnable enqueueing session");
            JobOutput::new().with_metadata("outcome", "idle")
        }
        EnqueueOutcome::Advanced {
            entity_type,
            enqueued,
            ..
        } => JobOutput::new()
            .with_metadata("outcome", "advanced")
            .with_metadata("entity_type", entity_type)
            .with_items_processed(*enqueued),
        EnqueueOutcome::Finished {
            entity_type,
            ids_enqueued,
        } => JobOutput::new()
            .with_metadata("outcome", "finished")
            .with_metadata("entity_type", entity_type)
            .with_metadata("ids_enqueued", ids_enqueued),
        EnqueueOutcome::Conflict { entity_type } => JobOutput::new()
            .with_metadata("outcome", "conflict")
            .with_metadata("entity_type", entity_type),
        EnqueueOutcome::Stalled {
            entity_type,
            reason,
        } => JobOutput::new()
            .with_metadata("outcome", "stalled")
            .with_metadata("entity_type", entity_type)
            .with_metadata("reason", reason),
    };
    Ok(output)
}
