//! Queue drain job.
//!
//! Each tick claims up to one batch of queue entries and hands them to the
//! indexers. Failed entries are settled inside the drain (retry or dead
//! letter), so a tick only fails when the store itself does.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use indexq_indexing::IndexingQueueManager;
use indexq_types::JobsSettings;

use crate::{
    JitterConfig, JobOutput, JobSchedule, OverlapPolicy, SchedulerError, SchedulerService,
    TimeoutConfig,
};

/// Registry name of the drain job.
pub const PROCESS_QUEUE_JOB: &str = "process_queue";

/// Configuration for the drain job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessQueueJobConfig {
    /// Delay between the end of one drain and the start of the next (default: 5000)
    pub delay_ms: u64,

    /// Cron expression used instead of the fixed delay when set
    #[serde(default)]
    pub cron: Option<String>,

    /// Timezone for the cron expression (scheduler default when unset)
    #[serde(default)]
    pub timezone: Option<String>,

    /// Max jitter in seconds (default: 0)
    pub jitter_secs: u64,

    /// Timeout in seconds for one drain (default: 300, 0 = none)
    pub timeout_secs: u64,
}

impl Default for ProcessQueueJobConfig {
    fn default() -> Self {
        Self {
            delay_ms: 5_000,
            cron: None,
            timezone: None,
            jitter_secs: 0,
            timeout_secs: 300,
        }
    }
}

impl ProcessQueueJobConfig {
    pub fn from_settings(settings: &JobsSettings) -> Self {
        Self {
            delay_ms: settings.process_queue_delay_ms,
            cron: settings.process_queue_cron.clone(),
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

/// Register the drain job with the scheduler.
///
/// # Errors
///
/// Returns error if job registration fails (invalid cron, invalid timezone,
/// zero delay, duplicate name).
pub async fn create_process_queue_job(
    scheduler: &SchedulerService,
    manager: Arc<IndexingQueueManager>,
    config: ProcessQueueJobConfig,
) -> Result<(), SchedulerError> {
    scheduler
        .register_job(
            PROCESS_QUEUE_JOB,
            config.schedule(),
            OverlapPolicy::Skip,
            JitterConfig::new(config.jitter_secs),
            TimeoutConfig::new(config.timeout_secs),
            move || {
                let manager = manager.clone();
                async move { run_process_queue(manager).await }
            },
        )
        .await?;

    info!("Registered queue drain job");
    Ok(())
}

async fn run_process_queue(manager: Arc<IndexingQueueManager>) -> Result<JobOutput, String> {
    let result = manager
        .process_queue()
        .await
        .map_err(|e| format!("Queue drain failed: {}", e))?;

    if result.has_work() {
        info!(
            claimed = result.claimed,
            completed = result.completed(),
            failed = result.failed(),
            "Queue drain tick"
        );
    } else {
        debug!("Queue drain: nothing to claim");
    }

    Ok(JobOutput::new()
        .with_items_processed(result.claimed)
        .with_metadata("indexed", result.indexed)
        .with_metadata("deleted", result.deleted)
        .with_metadata("retried", result.retried)
        .with_metadata("dead_lettered", result.dead_lettered))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use indexq_indexing::{
        DocumentStoreIndexer, IndexerRegistry, LoaderRegistry, QueueManagerConfig,
    };
    use indexq_storage::Storage;
    use tempfile::TempDir;

    use crate::SchedulerConfig;

    fn create_manager() -> (Arc<IndexingQueueManager>, Arc<Storage>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::open(temp_dir.path()).unwrap());
        let manager = IndexingQueueManager::new(
            storage.clone(),
            LoaderRegistry::new(),
            IndexerRegistry::new()
                .with_fallback(Arc::new(DocumentStoreIndexer::new(storage.clone()))),
            QueueManagerConfig::default(),
        );
        (Arc::new(manager), storage, temp_dir)
    }

    #[test]
    fn test_default_config() {
        let config = ProcessQueueJobConfig::default();
        assert_eq!(config.delay_ms, 5_000);
        assert_eq!(config.timeout_secs, 300);
        assert_eq!(config.schedule(), JobSchedule::fixed_delay_ms(5_000));
    }

    #[test]
    fn test_from_settings_prefers_cron() {
        let mut settings = JobsSettings::default();
        settings.process_queue_cron = Some("*/5 * * * * *".to_string());

        let config = ProcessQueueJobConfig::from_settings(&settings);
        assert_eq!(
            config.schedule(),
            JobSchedule::cron("*/5 * * * * *", Some("UTC".to_string()))
        );
    }

    #[tokio::test]
    async fn test_run_reports_counts() {
        let (manager, storage, _temp) = create_manager();
        storage
            .put_entity("customer", "c-1", serde_json::json!({}))
            .unwrap();
        storage
            .put_entity("customer", "c-2", serde_json::json!({}))
            .unwrap();

        let output = run_process_queue(manager).await.unwrap();
        assert_eq!(output.metadata["items_processed"], "2");
        assert_eq!(output.metadata["indexed"], "2");
        assert_eq!(storage.queue_len().unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_scheduled_drain_empties_queue() {
        let (manager, storage, _temp) = create_manager();
        for i in 0..5 {
            storage
                .put_entity("order", &format!("o-{}", i), serde_json::json!({"i": i}))
                .unwrap();
        }

        let mut scheduler =
            SchedulerService::new(SchedulerConfig::default().with_shutdown_timeout(1))
                .await
                .unwrap();
        create_process_queue_job(
            &scheduler,
            manager,
            ProcessQueueJobConfig::default().with_delay_ms(20),
        )
        .await
        .unwrap();

        scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        scheduler.shutdown().await.unwrap();

        assert_eq!(storage.queue_len().unwrap(), 0);
        assert_eq!(storage.get_stats().unwrap().document_count, 5);
        let status = scheduler.registry().get_status(PROCESS_QUEUE_JOB).unwrap();
        assert!(status.run_count >= 1);
        assert_eq!(status.error_count, 0);
    }
}
