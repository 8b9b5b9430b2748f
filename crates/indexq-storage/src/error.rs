//! Storage layer error types.

use indexq_types::TypesError;
use thiserror::Error;

/// Errors that can occur in the storage layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// RocksDB operation failed
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    /// Column family not found
    #[error("Column family not found: {0}")]
    ColumnFamilyNotFound(String),

    /// Key encoding/decoding error
    #[error("Key error: {0}")]
    Key(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Write kept losing optimistic transaction races
    #[error("Write conflict: {0}")]
    Conflict(String),

    /// Record failed domain validation
    #[error("Invalid record: {0}")]
    Invalid(#[from] TypesError),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Whether a RocksDB error is an optimistic transaction conflict.
pub(crate) fn is_conflict(err: &rocksdb::Error) -> bool {
    matches!(
        err.kind(),
        rocksdb::ErrorKind::Busy | rocksdb::ErrorKind::TryAgain
    )
}
