//! indexq daemon library exports.
//!
//! # Modules
//!
//! - `cli`: Command-line argument parsing with clap
//! - `commands`: Command implementations (start, stop, status, admin)

pub mod cli;
pub mod commands;

pub use cli::{Cli, Commands, EntityCommands, QueueCommands};
pub use commands::{
    build_manager, handle_entity, handle_queue, handle_reindex, init_logging, load_settings,
    open_storage, show_status, start_daemon, stop_daemon, StatusSnapshot,
};
