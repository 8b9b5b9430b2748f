//! Storage layer for indexq.
//!
//! Provides a RocksDB-backed store with:
//! - Column family isolation per record kind
//! - Zero-padded keys so entity and queue scans come back in order
//! - Optimistic transactions for version-checked session commits and
//!   queue claims
//! - Atomic entity write + queue entry (outbox pattern)

pub mod column_families;
pub mod db;
pub mod error;
pub mod keys;

pub use db::{SessionCommit, Storage, StorageStats};
pub use error::StorageError;
pub use keys::{DeadLetterKey, DocumentKey, EntityIdKey, EntityKey, QueueKey, SessionKey};
