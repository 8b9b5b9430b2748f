//! Configuration loading for indexq.
//!
//! Layered config: defaults -> config file -> env vars -> CLI flags.
//! The default config file lives at `~/.config/indexq/config.toml`.

use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::TypesError;

/// Settings for session sweeps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueingSettings {
    /// Ids loaded and enqueued per scheduler tick
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for EnqueueingSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

/// Settings for queue draining.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Entries claimed per drain tick
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Failed attempts before an entry is dead-lettered
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Timeout of one index write
    #[serde(default = "default_item_timeout_ms")]
    pub item_timeout_ms: u64,

    /// How long a claimed entry stays invisible to other drains
    #[serde(default = "default_claim_lease_secs")]
    pub claim_lease_secs: u64,

    /// Delay before a failed entry becomes claimable again
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            item_timeout_ms: default_item_timeout_ms(),
            claim_lease_secs: default_claim_lease_secs(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

/// Settings for the two scheduled jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsSettings {
    /// Fixed delay between queue drains
    #[serde(default = "default_process_queue_delay_ms")]
    pub process_queue_delay_ms: u64,

    /// Fixed delay between session advances
    #[serde(default = "default_reindex_next_entity_delay_ms")]
    pub reindex_next_entity_delay_ms: u64,

    /// Max random delay before each tick (0 = none)
    #[serde(default)]
    pub jitter_secs: u64,

    /// Per-run timeout (0 = none)
    #[serde(default = "default_job_timeout_secs")]
    pub timeout_secs: u64,

    /// Cron expression replacing the fixed delay for queue drains
    #[serde(default)]
    pub process_queue_cron: Option<String>,

    /// Cron expression replacing the fixed delay for session advances
    #[serde(default)]
    pub reindex_next_entity_cron: Option<String>,

    /// IANA timezone for cron schedules
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for JobsSettings {
    fn default() -> Self {
        Self {
            process_queue_delay_ms: default_process_queue_delay_ms(),
            reindex_next_entity_delay_ms: default_reindex_next_entity_delay_ms(),
            jitter_secs: 0,
            timeout_secs: default_job_timeout_secs(),
            process_queue_cron: None,
            reindex_next_entity_cron: None,
            timezone: default_timezone(),
        }
    }
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Path to the RocksDB directory
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Entity types that get a loader and an indexer at startup
    #[serde(default)]
    pub entity_types: Vec<String>,

    #[serde(default)]
    pub enqueueing: EnqueueingSettings,

    #[serde(default)]
    pub queue: QueueSettings,

    #[serde(default)]
    pub jobs: JobsSettings,
}

fn default_db_path() -> String {
    ProjectDirs::from("", "", "indexq")
        .map(|p| p.data_local_dir().join("db"))
        .unwrap_or_else(|| PathBuf::from("./data"))
        .to_string_lossy()
        .to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_max_attempts() -> u32 {
    3
}

fn default_item_timeout_ms() -> u64 {
    30_000
}

fn default_claim_lease_secs() -> u64 {
    60
}

fn default_retry_delay_ms() -> u64 {
    5_000
}

fn default_process_queue_delay_ms() -> u64 {
    5_000
}

fn default_reindex_next_entity_delay_ms() -> u64 {
    1_000
}

fn default_job_timeout_secs() -> u64 {
    300
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            log_level: default_log_level(),
            entity_types: Vec::new(),
            enqueueing: EnqueueingSettings::default(),
            queue: QueueSettings::default(),
            jobs: JobsSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings with layered precedence:
    /// 1. Built-in defaults
    /// 2. Config file (~/.config/indexq/config.toml)
    /// 3. CLI-specified config file (optional)
    /// 4. Environment variables (INDEXQ_*, nested keys joined by `__`)
    ///
    /// CLI flags should be applied by the caller after this returns.
    pub fn load(cli_config_path: Option<&str>) -> Result<Self, TypesError> {
        let config_dir = ProjectDirs::from("", "", "indexq")
            .map(|p| p.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        let default_config_path = config_dir.join("config");

        let mut builder = Config::builder()
            .set_default("db_path", default_db_path())
            .map_err(|e| TypesError::Config(e.to_string()))?
            .set_default("log_level", default_log_level())
            .map_err(|e| TypesError::Config(e.to_string()))?
            .add_source(File::with_name(&default_config_path.to_string_lossy()).required(false));

        if let Some(path) = cli_config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // INDEXQ_DB_PATH, INDEXQ_QUEUE__MAX_ATTEMPTS, INDEXQ_ENTITY_TYPES=a,b
        builder = builder.add_source(
            Environment::with_prefix("INDEXQ")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("entity_types")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| TypesError::Config(e.to_string()))?;

        let settings: Settings = config
            .try_deserialize()
            .map_err(|e| TypesError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the queue cannot run with.
    pub fn validate(&self) -> Result<(), TypesError> {
        if self.enqueueing.batch_size == 0 {
            return Err(TypesError::Config(
                "enqueueing.batch_size must be positive".to_string(),
            ));
        }
        if self.queue.batch_size == 0 {
            return Err(TypesError::Config(
                "queue.batch_size must be positive".to_string(),
            ));
        }
        if self.queue.max_attempts == 0 {
            return Err(TypesError::Config(
                "queue.max_attempts must be positive".to_string(),
            ));
        }
        for entity_type in &self.entity_types {
            crate::entity::validate_entity_type(entity_type)
                .map_err(|e| TypesError::Config(e.to_string()))?;
        }
        Ok(())
    }

    /// Expand ~ in db_path to the home directory
    pub fn expanded_db_path(&self) -> PathBuf {
        if let Some(rest) = self.db_path.strip_prefix("~/") {
            if let Some(base) = directories::BaseDirs::new() {
                return base.home_dir().join(rest);
            }
        }
        PathBuf::from(&self.db_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.log_level, "info");
        assert!(settings.entity_types.is_empty());
        assert_eq!(settings.enqueueing.batch_size, 100);
        assert_eq!(settings.queue.batch_size, 100);
        assert_eq!(settings.queue.max_attempts, 3);
        assert_eq!(settings.queue.item_timeout_ms, 30_000);
        assert_eq!(settings.jobs.process_queue_delay_ms, 5_000);
        assert_eq!(settings.jobs.reindex_next_entity_delay_ms, 1_000);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_section_defaults() {
        let json = r#"{"db_path": "/tmp/q", "queue": {"max_attempts": 7}}"#;
        let settings: Settings = serde_json::from_str(json).unwrap();

        assert_eq!(settings.db_path, "/tmp/q");
        assert_eq!(settings.queue.max_attempts, 7);
        assert_eq!(settings.queue.batch_size, 100);
        assert_eq!(settings.jobs.timeout_secs, 300);
        assert_eq!(settings.jobs.timezone, "UTC");
        assert!(settings.jobs.process_queue_cron.is_none());
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut settings = Settings::default();
        settings.enqueueing.batch_size = 0;
        assert!(matches!(settings.validate(), Err(TypesError::Config(_))));

        let mut settings = Settings::default();
        settings.queue.max_attempts = 0;
        assert!(matches!(settings.validate(), Err(TypesError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_entity_type() {
        let settings = Settings {
            entity_types: vec!["good".to_string(), "bad:type".to_string()],
            ..Default::default()
        };
        assert!(matches!(settings.validate(), Err(TypesError::Config(_))));
    }

    #[test]
    fn test_load_from_explicit_file() {
        let dir = std::env::temp_dir().join(format!("indexq-cfg-{}", ulid::Ulid::new()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("indexq.toml");
        std::fs::write(
            &path,
            "db_path = \"/var/lib/indexq\"\nentity_types = [\"customer\", \"order\"]\n\n[queue]\nbatch_size = 20\n",
        )
        .unwrap();

        let settings = Settings::load(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(settings.db_path, "/var/lib/indexq");
        assert_eq!(settings.entity_types, vec!["customer", "order"]);
        assert_eq!(settings.queue.batch_size, 20);
        assert_eq!(settings.queue.max_attempts, 3);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_expanded_db_path_plain() {
        let settings = Settings {
            db_path: "/data/indexq".to_string(),
            ..Default::default()
        };
        assert_eq!(settings.expanded_db_path(), PathBuf::from("/data/indexq"));
    }
}
