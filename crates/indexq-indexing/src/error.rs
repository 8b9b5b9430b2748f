//! Error types for the indexing queue.

use indexq_storage::StorageError;
use indexq_types::TypesError;
use thiserror::Error;

/// Errors that can occur while enqueueing or draining
#[derive(Error, Debug)]
pub enum IndexingError {
    /// Storage operation failed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Domain validation failed
    #[error("Validation error: {0}")]
    Types(#[from] TypesError),

    /// Loading entity ids failed
    #[error("Loader error: {0}")]
    Loader(String),

    /// Index write failed
    #[error("Index error: {0}")]
    Index(String),

    /// Index write did not finish in time
    #[error("Index write for {entity} timed out after {timeout_ms} ms")]
    Timeout { entity: String, timeout_ms: u64 },

    /// No loader registered for the entity type
    #[error("No loader registered for entity type: {0}")]
    NoLoader(String),

    /// No indexer registered for the entity type
    #[error("No indexer registered for entity type: {0}")]
    NoIndexer(String),

    /// A blocking store task panicked or was cancelled
    #[error("Blocking task failed: {0}")]
    Task(String),

    /// Caller passed an unusable argument
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
