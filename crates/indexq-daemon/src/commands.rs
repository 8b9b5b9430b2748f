//! Command implementations for the indexq daemon.
//!
//! Handles:
//! - start: open storage, register the queue jobs, run until signalled
//! - stop: signal the running daemon (via PID file)
//! - status: job and queue status, from the daemon snapshot when it runs
//! - reindex / queue / entity: offline admin against the store
//!
//! RocksDB allows one process at a time, so while the daemon runs it
//! publishes its status to a snapshot file next to the PID file and the
//! admin commands refuse to open the store.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::signal;
use tracing::{error, info, warn};

use indexq_indexing::{
    DocumentStoreIndexer, IndexerRegistry, IndexingQueueManager, LoaderRegistry,
    QueueManagerConfig, QueueStatus,
};
use indexq_scheduler::{
    create_process_queue_job, create_reindex_next_entity_job, JitterConfig, JobOutput,
    JobRegistry, JobResult, JobSchedule, JobStatus, OverlapPolicy, ProcessQueueJobConfig,
    ReindexJobConfig, SchedulerConfig, SchedulerService, TimeoutConfig,
};
use indexq_storage::Storage;
use indexq_types::{EntityRef, Settings};

use crate::cli::{EntityCommands, QueueCommands};

/// Registry name of the job that publishes the status snapshot.
pub const STATUS_SNAPSHOT_JOB: &str = "status_snapshot";

const STATUS_SNAPSHOT_INTERVAL_MS: u64 = 5_000;

fn runtime_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| {
            #[cfg(unix)]
            {
                dirs.runtime_dir()
                    .map(|p| p.to_path_buf())
                    .unwrap_or_else(|| dirs.cache_dir().to_path_buf())
            }
            #[cfg(not(unix))]
            {
                dirs.cache_dir().to_path_buf()
            }
        })
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("indexq")
}

/// Get the PID file path
pub fn pid_file_path() -> PathBuf {
    runtime_dir().join("daemon.pid")
}

/// Get the status snapshot path
pub fn status_file_path() -> PathBuf {
    runtime_dir().join("status.json")
}

fn write_pid_file() -> Result<()> {
    let pid_path = pid_file_path();
    if let Some(parent) = pid_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&pid_path, std::process::id().to_string())?;
    info!("Wrote PID file: {:?}", pid_path);
    Ok(())
}

fn remove_runtime_file(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to remove {:?}: {}", path, e);
        }
    }
}

fn read_pid_file() -> Option<u32> {
    fs::read_to_string(pid_file_path())
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

#[cfg(unix)]
fn is_process_running(pid: u32) -> bool {
    // Signal 0 only checks that the process exists
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn is_process_running(_pid: u32) -> bool {
    true
}

fn running_daemon_pid() -> Option<u32> {
    read_pid_file().filter(|pid| is_process_running(*pid))
}

// ==================== Setup ====================

/// Load settings and apply CLI overrides (highest precedence).
pub fn load_settings(
    config_path: Option<&str>,
    db_path_override: Option<&str>,
    log_level_override: Option<&str>,
) -> Result<Settings> {
    let mut settings = Settings::load(config_path).context("Failed to load configuration")?;

    if let Some(db_path) = db_path_override {
        settings.db_path = db_path.to_string();
    }
    if let Some(log_level) = log_level_override {
        settings.log_level = log_level.to_string();
    }
    Ok(settings)
}

/// Install the global tracing subscriber. `RUST_LOG` wins over settings.
pub fn init_logging(settings: &Settings) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&settings.log_level)),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

/// Open the store, creating its parent directory if needed.
pub fn open_storage(settings: &Settings) -> Result<Arc<Storage>> {
    let db_path = settings.expanded_db_path();
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let storage = Storage::open(&db_path).with_context(|| {
        format!(
            "Failed to open storage at {:?} (stop the daemon before running admin commands)",
            db_path
        )
    })?;
    Ok(Arc::new(storage))
}

/// Wire a queue manager for the configured entity types.
///
/// Every configured type gets the store-backed loader; index writes go to
/// the local document store.
pub fn build_manager(storage: Arc<Storage>, settings: &Settings) -> Result<IndexingQueueManager> {
    let loaders = LoaderRegistry::for_storage(storage.clone(), &settings.entity_types)
        .context("Invalid entity type in configuration")?;
    let indexers =
        IndexerRegistry::new().with_fallback(Arc::new(DocumentStoreIndexer::new(storage.clone())));

    Ok(IndexingQueueManager::new(
        storage,
        loaders,
        indexers,
        QueueManagerConfig::from_settings(settings),
    ))
}

// ==================== Status snapshot ====================

/// What the daemon publishes for `indexq status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub pid: u32,
    pub written_at: DateTime<Utc>,
    pub queue: QueueStatus,
    pub jobs: Vec<JobStatus>,
}

impl StatusSnapshot {
    pub fn capture(manager: &IndexingQueueManager, registry: &JobRegistry) -> Result<Self> {
        Ok(Self {
            pid: std::process::id(),
            written_at: Utc::now(),
            queue: manager.queue_status()?,
            jobs: registry.get_all_status(),
        })
    }

    /// Write through a temp file and rename so readers never see half a file.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
        serde_json::from_slice(&bytes).context("Malformed status snapshot")
    }
}

async fn register_status_snapshot_job(
    scheduler: &SchedulerService,
    manager: Arc<IndexingQueueManager>,
    path: PathBuf,
) -> Result<()> {
    let registry = scheduler.registry();
    scheduler
        .register_job(
            STATUS_SNAPSHOT_JOB,
            JobSchedule::fixed_delay_ms(STATUS_SNAPSHOT_INTERVAL_MS),
            OverlapPolicy::Skip,
            JitterConfig::none(),
            TimeoutConfig::none(),
            move || {
                let manager = manager.clone();
                let registry = registry.clone();
                let path = path.clone();
                async move {
                    StatusSnapshot::capture(&manager, &registry)
                        .and_then(|snapshot| snapshot.write_to(&path))
                        .map(|_| JobOutput::new())
                        .map_err(|e| format!("Status snapshot failed: {:#}", e))
                }
            },
        )
        .await
        .context("Failed to register status snapshot job")
}

// ==================== Daemon ====================

/// Start the daemon.
///
/// 1. Open RocksDB storage and wire the queue manager
/// 2. Apply any reindex requests given on the command line
/// 3. Register the queue jobs and start the scheduler
/// 4. Shut down gracefully on SIGINT/SIGTERM
pub async fn start_daemon(
    settings: &Settings,
    reindex: &[String],
    reindex_all: bool,
) -> Result<()> {
    if let Some(pid) = running_daemon_pid() {
        anyhow::bail!("Daemon already running (PID {})", pid);
    }

    info!("indexq daemon starting...");
    info!("  Database path: {}", settings.db_path);
    info!("  Log level: {}", settings.log_level);

    let storage = open_storage(settings)?;
    let manager = Arc::new(build_manager(storage.clone(), settings)?);
    info!("  Entity types: {:?}", manager.loaders().entity_types());

    if reindex_all {
        for (session, created) in manager.request_reindex_all()? {
            log_reindex_request(&session.entity_type, created);
        }
    }
    for entity_type in reindex {
        let (_, created) = manager
            .request_reindex(entity_type)
            .with_context(|| format!("Failed to request reindex of {}", entity_type))?;
        log_reindex_request(entity_type, created);
    }

    let scheduler_config = SchedulerConfig::default().with_timezone(settings.jobs.timezone.clone());
    let mut scheduler = SchedulerService::new(scheduler_config)
        .await
        .context("Failed to create scheduler")?;

    create_process_queue_job(
        &scheduler,
        manager.clone(),
        ProcessQueueJobConfig::from_settings(&settings.jobs),
    )
    .await
    .context("Failed to register process_queue job")?;
    create_reindex_next_entity_job(
        &scheduler,
        manager.clone(),
        ReindexJobConfig::from_settings(&settings.jobs),
    )
    .await
    .context("Failed to register reindex_next_entity job")?;

    let status_path = status_file_path();
    register_status_snapshot_job(&scheduler, manager.clone(), status_path.clone()).await?;

    write_pid_file()?;
    scheduler.start().await.context("Failed to start scheduler")?;
    info!("indexq daemon running");

    shutdown_signal().await;

    if let Err(e) = scheduler.shutdown().await {
        error!("Scheduler shutdown failed: {}", e);
    }
    if let Err(e) = storage.flush() {
        error!("Failed to flush storage: {}", e);
    }

    remove_runtime_file(&status_path);
    remove_runtime_file(&pid_file_path());
    info!("indexq daemon stopped");
    Ok(())
}

fn log_reindex_request(entity_type: &str, created: bool) {
    if created {
        info!(entity_type = entity_type, "Requested reindex sweep");
    } else {
        info!(entity_type = entity_type, "Reindex sweep already in progress");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

/// Stop the running daemon by sending SIGTERM.
pub fn stop_daemon() -> Result<()> {
    let pid = read_pid_file().context("No PID file found - daemon may not be running")?;

    if !is_process_running(pid) {
        remove_runtime_file(&pid_file_path());
        remove_runtime_file(&status_file_path());
        anyhow::bail!("Daemon not running (stale PID file removed)");
    }

    info!("Stopping daemon (PID {})", pid);

    #[cfg(unix)]
    {
        unsafe {
            if libc::kill(pid as i32, libc::SIGTERM) != 0 {
                anyhow::bail!("Failed to send SIGTERM to daemon");
            }
        }
        println!("Sent SIGTERM to daemon (PID {})", pid);
    }

    #[cfg(not(unix))]
    {
        anyhow::bail!("Stop command not yet implemented on this platform");
    }

    Ok(())
}

// ==================== Status ====================

/// Show daemon status.
///
/// A running daemon owns the store, so its last snapshot is shown;
/// otherwise the store is opened directly.
pub fn show_status(settings: &Settings) -> Result<()> {
    if let Some(pid) = running_daemon_pid() {
        println!("indexq daemon is running (PID {})", pid);
        match StatusSnapshot::read_from(&status_file_path()) {
            Ok(snapshot) => {
                println!("Snapshot taken {}", snapshot.written_at.to_rfc3339());
                println!();
                print!("{}", format_jobs(&snapshot.jobs));
                println!();
                print!("{}", format_queue_status(&snapshot.queue));
            }
            Err(e) => println!("No status snapshot yet ({:#})", e),
        }
        return Ok(());
    }

    println!("indexq daemon is NOT running");
    let storage = open_storage(settings)?;
    let manager = build_manager(storage, settings)?;
    println!();
    print!("{}", format_queue_status(&manager.queue_status()?));
    Ok(())
}

fn format_jobs(jobs: &[JobStatus]) -> String {
    let mut out = String::from("Jobs:\n");
    if jobs.is_empty() {
        out.push_str("  (none)\n");
    }
    for job in jobs {
        let last = match &job.last_result {
            Some(JobResult::Success) => "ok".to_string(),
            Some(JobResult::Failed(e)) => format!("failed: {}", e),
            Some(JobResult::Skipped(reason)) => format!("skipped: {}", reason),
            None => "never run".to_string(),
        };
        out.push_str(&format!(
            "  {:<20} {:<24} runs={} errors={} skipped={} last={}\n",
            job.job_name, job.schedule, job.run_count, job.error_count, job.skip_count, last
        ));
    }
    out
}

fn format_queue_status(status: &QueueStatus) -> String {
    let mut out = String::from("Sessions:\n");
    if status.sessions.is_empty() {
        out.push_str("  (none)\n");
    }
    for session in &status.sessions {
        let cursor = session
            .last_ordering_value
            .map(|v| v.get().to_string())
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "  {:<20} {:<9} batches={} ids={} cursor={}",
            session.entity_type,
            session.status.to_string(),
            session.batches_loaded,
            session.ids_enqueued,
            cursor
        ));
        if let Some(reason) = &session.stalled_reason {
            out.push_str(&format!(" STALLED: {}", reason));
        }
        out.push('\n');
    }
    out.push_str(&format!(
        "Queue: {} entries ({} claimed), {} dead letters\n",
        status.queue_len, status.claimed, status.dead_letters
    ));
    out
}

// ==================== Admin ====================

/// Request reindex sweeps from the command line.
pub fn handle_reindex(settings: &Settings, entity_type: Option<String>, all: bool) -> Result<()> {
    let storage = open_storage(settings)?;
    let manager = build_manager(storage.clone(), settings)?;

    let requested = if all {
        manager.request_reindex_all()?
    } else {
        let entity_type = entity_type.context("Entity type required unless --all is given")?;
        vec![manager
            .request_reindex(&entity_type)
            .with_context(|| format!("Failed to request reindex of {}", entity_type))?]
    };

    if requested.is_empty() {
        println!("No entity types configured");
    }
    for (session, created) in requested {
        if created {
            let rows = storage.count_entities(&session.entity_type)?;
            println!(
                "Started reindex of {} (session {}, {} rows)",
                session.entity_type, session.session_id, rows
            );
        } else {
            println!(
                "Reindex of {} already in progress (session {}, {} ids enqueued)",
                session.entity_type, session.session_id, session.ids_enqueued
            );
        }
    }
    Ok(())
}

/// Queue maintenance commands.
pub async fn handle_queue(settings: &Settings, command: QueueCommands) -> Result<()> {
    let storage = open_storage(settings)?;

    match command {
        QueueCommands::Drain { max_iterations } => {
            let manager = build_manager(storage.clone(), settings)?;
            let result = manager.process_queue_until_empty(max_iterations).await?;
            println!(
                "Drained {} entries: {} indexed, {} deleted, {} retried, {} dead-lettered",
                result.claimed, result.indexed, result.deleted, result.retried, result.dead_lettered
            );
            println!("{} entries left in queue", storage.queue_len()?);
        }
        QueueCommands::DeadLetters { limit } => {
            let dead_letters = storage.list_dead_letters(limit)?;
            if dead_letters.is_empty() {
                println!("No dead letters");
            }
            for dl in dead_letters {
                println!(
                    "{}  {} {}  attempts={}  failed_at={}  error={}",
                    dl.id,
                    dl.entry.operation,
                    dl.entry.entity,
                    dl.entry.attempts,
                    dl.failed_at.to_rfc3339(),
                    dl.error
                );
            }
        }
        QueueCommands::Requeue { id } => match storage.requeue_dead_letter(&id)? {
            Some(sequence) => println!("Requeued {} as queue entry {}", id, sequence),
            None => anyhow::bail!("No dead letter with id {}", id),
        },
        QueueCommands::PurgeDeadLetters => {
            let removed = storage.purge_dead_letters()?;
            println!("Purged {} dead letters", removed);
        }
    }

    storage.flush()?;
    Ok(())
}

/// Entity writes. Each write enqueues the matching index operation.
pub fn handle_entity(settings: &Settings, command: EntityCommands) -> Result<()> {
    let storage = open_storage(settings)?;

    match command {
        EntityCommands::Put {
            entity_type,
            entity_id,
            json,
        } => {
            let document: serde_json::Value =
                serde_json::from_str(&json).context("Entity document is not valid JSON")?;
            let ordering = storage.put_entity(&entity_type, &entity_id, document)?;
            println!(
                "Stored {} (ordering {})",
                EntityRef::new(entity_type, entity_id),
                ordering.get()
            );
        }
        EntityCommands::Delete {
            entity_type,
            entity_id,
        } => {
            let entity = EntityRef::new(entity_type, entity_id);
            if storage.delete_entity(&entity.entity_type, &entity.entity_id)? {
                println!("Deleted {}", entity);
            } else {
                println!("{} not found", entity);
            }
        }
    }

    storage.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexq_types::{EnqueueingSession, OrderingValue, SessionStatus};
    use tempfile::TempDir;

    fn test_settings(dir: &TempDir) -> Settings {
        Settings {
            db_path: dir.path().join("db").to_string_lossy().to_string(),
            entity_types: vec!["customer".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_runtime_paths() {
        let pid = pid_file_path();
        assert!(pid.ends_with("daemon.pid"));
        assert!(pid.parent().unwrap().to_string_lossy().contains("indexq"));
        assert_eq!(pid.parent(), status_file_path().parent());
    }

    #[test]
    fn test_open_storage_creates_parent() {
        let dir = TempDir::new().unwrap();
        let settings = Settings {
            db_path: dir.path().join("nested/db").to_string_lossy().to_string(),
            ..Default::default()
        };
        let storage = open_storage(&settings).unwrap();
        assert_eq!(storage.queue_len().unwrap(), 0);
        assert!(dir.path().join("nested").exists());
    }

    #[test]
    fn test_build_manager_registers_configured_types() {
        let dir = TempDir::new().unwrap();
        let settings = test_settings(&dir);
        let manager = build_manager(open_storage(&settings).unwrap(), &settings).unwrap();

        assert_eq!(manager.loaders().entity_types(), vec!["customer"]);
        assert!(manager.request_reindex("customer").is_ok());
        assert!(manager.request_reindex("order").is_err());
    }

    #[test]
    fn test_snapshot_roundtrip_through_file() {
        let dir = TempDir::new().unwrap();
        let settings = test_settings(&dir);
        let manager = build_manager(open_storage(&settings).unwrap(), &settings).unwrap();
        manager.request_reindex("customer").unwrap();

        let registry = JobRegistry::new();
        registry.register("process_queue", "every 5000ms");

        let path = dir.path().join("run/status.json");
        StatusSnapshot::capture(&manager, &registry)
            .unwrap()
            .write_to(&path)
            .unwrap();

        let snapshot = StatusSnapshot::read_from(&path).unwrap();
        assert_eq!(snapshot.pid, std::process::id());
        assert_eq!(snapshot.queue.sessions.len(), 1);
        assert_eq!(snapshot.jobs.len(), 1);
        assert_eq!(snapshot.jobs[0].job_name, "process_queue");
        assert!(!dir.path().join("run/status.json.tmp").exists());
    }

    #[test]
    fn test_format_queue_status_marks_stalled() {
        let mut session = EnqueueingSession::new("customer").unwrap();
        session.status = SessionStatus::Active;
        session.last_ordering_value = Some(OrderingValue(42));
        session.stalled_reason = Some("cursor did not advance".to_string());

        let text = format_queue_status(&QueueStatus {
            sessions: vec![session],
            queue_len: 3,
            claimed: 1,
            dead_letters: 0,
        });
        assert!(text.contains("cursor=42"));
        assert!(text.contains("STALLED: cursor did not advance"));
        assert!(text.contains("Queue: 3 entries (1 claimed), 0 dead letters"));
    }

    #[test]
    fn test_format_jobs_never_run() {
        let text = format_jobs(&[JobStatus::new(
            "reindex_next_entity".to_string(),
            "every 1000ms".to_string(),
        )]);
        assert!(text.contains("reindex_next_entity"));
        assert!(text.contains("never run"));
    }
}
