//! # indexq-types
//!
//! Shared domain types for the indexq search reindexing queue.
//!
//! This crate defines the records that flow between the store, the
//! indexing queue manager and the scheduled jobs:
//! - Entities: application rows keyed by a stable ordering value
//! - Enqueueing sessions: resumable cursors over a bulk reindex sweep
//! - Queue entries: durable pointers to entities awaiting an index write
//! - Settings: layered configuration
//!
//! ## Usage
//!
//! ```rust
//! use indexq_types::{EnqueueingSession, SessionStatus};
//!
//! let session = EnqueueingSession::new("customer").unwrap();
//! assert_eq!(session.status, SessionStatus::Created);
//! ```

pub mod config;
pub mod entity;
pub mod error;
pub mod queue;
pub mod session;

pub use config::{EnqueueingSettings, JobsSettings, QueueSettings, Settings};
pub use entity::{validate_entity_type, EntityRecord, EntityRef, IndexedDocument, OrderingValue};
pub use error::TypesError;
pub use queue::{DeadLetter, IndexingOperation, QueueEntry};
pub use session::{EnqueueingSession, SessionStatus};
