//! CLI argument parsing for the indexq daemon.
//!
//! CLI flags override every other config source.

use clap::{Parser, Subcommand};

/// indexq: search reindexing queue
///
/// Runs the scheduled session advancement and queue drain jobs, and offers
/// offline admin commands against the same store.
#[derive(Parser, Debug)]
#[command(name = "indexq")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default ~/.config/indexq/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Set log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Override database path
    #[arg(long, global = true)]
    pub db_path: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the daemon in the foreground
    Start {
        /// Request a reindex sweep of this entity type before the jobs start
        #[arg(long = "reindex", value_name = "ENTITY_TYPE")]
        reindex: Vec<String>,

        /// Request a reindex sweep of every configured entity type
        #[arg(long, conflicts_with = "reindex")]
        reindex_all: bool,
    },

    /// Stop the running daemon
    Stop,

    /// Show daemon, job and queue status
    Status,

    /// Request a reindex sweep (daemon must be stopped)
    Reindex {
        /// Entity type to sweep
        #[arg(required_unless_present = "all")]
        entity_type: Option<String>,

        /// Sweep every configured entity type
        #[arg(long, conflicts_with = "entity_type")]
        all: bool,
    },

    /// Queue maintenance (daemon must be stopped)
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },

    /// Write entity rows; each write enqueues its index operation
    Entity {
        #[command(subcommand)]
        command: EntityCommands,
    },
}

/// Queue subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum QueueCommands {
    /// Drain the queue until empty
    Drain {
        /// Maximum drain ticks
        #[arg(long, default_value = "100")]
        max_iterations: usize,
    },

    /// List dead-lettered entries
    DeadLetters {
        /// Maximum results
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Put a dead letter back on the queue
    Requeue {
        /// Dead letter id
        id: String,
    },

    /// Delete every dead letter
    PurgeDeadLetters,
}

/// Entity subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum EntityCommands {
    /// Insert or update an entity row
    Put {
        entity_type: String,
        entity_id: String,
        /// Entity document as JSON
        json: String,
    },

    /// Delete an entity row
    Delete {
        entity_type: String,
        entity_id: String,
    },
}
