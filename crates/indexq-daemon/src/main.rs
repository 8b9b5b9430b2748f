//! indexq daemon
//!
//! Keeps a search index in step with an entity store through a durable
//! indexing queue.
//!
//! # Usage
//!
//! ```bash
//! indexq start [--reindex TYPE]... [--reindex-all]
//! indexq stop
//! indexq status
//! indexq reindex <TYPE> | --all
//! indexq queue drain | dead-letters | requeue <ID> | purge-dead-letters
//! indexq entity put <TYPE> <ID> <JSON> | delete <TYPE> <ID>
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded in order (later sources override earlier):
//! 1. Built-in defaults
//! 2. Config file (~/.config/indexq/config.toml)
//! 3. Environment variables (INDEXQ_*)
//! 4. CLI flags

use anyhow::Result;
use clap::Parser;

use indexq_daemon::{
    handle_entity, handle_queue, handle_reindex, init_logging, load_settings, show_status,
    start_daemon, stop_daemon, Cli, Commands,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Stop = cli.command {
        return stop_daemon();
    }

    let settings = load_settings(
        cli.config.as_deref(),
        cli.db_path.as_deref(),
        cli.log_level.as_deref(),
    )?;
    init_logging(&settings)?;

    match cli.command {
        Commands::Start {
            reindex,
            reindex_all,
        } => {
            start_daemon(&settings, &reindex, reindex_all).await?;
        }
        Commands::Stop => {
            stop_daemon()?;
        }
        Commands::Status => {
            show_status(&settings)?;
        }
        Commands::Reindex { entity_type, all } => {
            handle_reindex(&settings, entity_type, all)?;
        }
        Commands::Queue { command } => {
            handle_queue(&settings, command).await?;
        }
        Commands::Entity { command } => {
            handle_entity(&settings, command)?;
        }
    }

    Ok(())
}
