//! Indexing queue for indexq.
//!
//! This crate moves entities from the application store into the search
//! index through a durable queue.
//!
//! ## Key Components
//!
//! - [`EntityIdsLoader`]: loads the next ordered batch of ids for a session
//! - [`ResultHolder`]: one loaded batch plus its last ordering value
//! - [`LoaderRegistry`]: entity type -> loader, resolved at startup
//! - [`EntityIndexer`]: async index write path (search engine client seam)
//! - [`IndexerRegistry`]: entity type -> indexer
//! - [`IndexingQueueManager`]: session advancement and queue draining
//! - [`IndexingError`]: error types for indexing operations
//!
//! ## Architecture
//!
//! 1. A reindex request starts an enqueueing session for an entity type
//! 2. Each enqueueing tick loads one batch after the session cursor and
//!    writes queue entries and the advanced cursor in one version-checked
//!    commit; an empty batch finishes the session
//! 3. Entity writes enqueue their own index/delete entries (outbox pattern)
//! 4. Each drain tick claims a batch of entries, dispatches them under a
//!    per-item timeout, and completes, retries or dead-letters each one
//!
//! ## Example
//!
//! ```ignore
//! use indexq_indexing::{IndexingQueueManager, LoaderRegistry, IndexerRegistry, QueueManagerConfig};
//!
//! let loaders = LoaderRegistry::for_storage(storage.clone(), &["customer"])?;
//! let indexers = IndexerRegistry::new().with_fallback(Arc::new(DocumentStoreIndexer::new(storage.clone())));
//! let manager = IndexingQueueManager::new(storage, loaders, indexers, QueueManagerConfig::default());
//!
//! manager.request_reindex("customer")?;
//! while !manager.process_next_enqueueing_session()?.is_idle() {}
//! manager.process_queue().await?;
//! ```

pub mod error;
pub mod indexer;
pub mod loader;
pub mod queue_manager;

pub use error::IndexingError;
pub use indexer::{DocumentStoreIndexer, DrainResult, EntityIndexer, IndexerRegistry};
pub use loader::{EntityIdsLoader, LoaderRegistry, ResultHolder, StorageIdsLoader};
pub use queue_manager::{EnqueueOutcome, IndexingQueueManager, QueueManagerConfig, QueueStatus};
