//! Index write path.
//!
//! Defines the interface the drain dispatches queue entries to. The search
//! engine client lives behind this trait; [`DocumentStoreIndexer`] writes
//! documents into the embedded store's document column family.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;

use indexq_storage::Storage;
use indexq_types::{validate_entity_type, EntityRef, IndexedDocument};

use crate::error::IndexingError;

/// Trait for index-specific write operations.
#[async_trait]
pub trait EntityIndexer: Send + Sync {
    /// Index a new or updated entity document.
    async fn index(
        &self,
        entity: &EntityRef,
        document: &serde_json::Value,
    ) -> Result<(), IndexingError>;

    /// Remove an entity from the index. Removing a missing entity is not an error.
    async fn delete(&self, entity: &EntityRef) -> Result<(), IndexingError>;

    /// Get the name of this indexer for logging.
    fn name(&self) -> &str;
}

/// Indexer writing into the local document store.
pub struct DocumentStoreIndexer {
    storage: Arc<Storage>,
}

impl DocumentStoreIndexer {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl EntityIndexer for DocumentStoreIndexer {
    async fn index(
        &self,
        entity: &EntityRef,
        document: &serde_json::Value,
    ) -> Result<(), IndexingError> {
        let doc = IndexedDocument {
            entity: entity.clone(),
            document: document.clone(),
            indexed_at: Utc::now(),
        };
        self.storage.put_document(&doc)?;
        Ok(())
    }

    async fn delete(&self, entity: &EntityRef) -> Result<(), IndexingError> {
        self.storage
            .delete_document(&entity.entity_type, &entity.entity_id)?;
        Ok(())
    }

    fn name(&self) -> &str {
        "document-store"
    }
}

/// Entity type -> indexer mapping with an optional fallback.
#[derive(Default, Clone)]
pub struct IndexerRegistry {
    indexers: HashMap<String, Arc<dyn EntityIndexer>>,
    fallback: Option<Arc<dyn EntityIndexer>>,
}

impl IndexerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `indexer` for entity types without a dedicated one.
    pub fn with_fallback(mut self, indexer: Arc<dyn EntityIndexer>) -> Self {
        self.fallback = Some(indexer);
        self
    }

    pub fn register(
        &mut self,
        entity_type: &str,
        indexer: Arc<dyn EntityIndexer>,
    ) -> Result<(), IndexingError> {
        validate_entity_type(entity_type)?;
        self.indexers.insert(entity_type.to_string(), indexer);
        Ok(())
    }

    pub fn get(&self, entity_type: &str) -> Option<Arc<dyn EntityIndexer>> {
        self.indexers
            .get(entity_type)
            .cloned()
            .or_else(|| self.fallback.clone())
    }
}

/// Outcome counters of one or more drain ticks.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct DrainResult {
    /// Entries claimed from the queue
    pub claimed: usize,
    /// Entries indexed and removed
    pub indexed: usize,
    /// Entries whose document was removed from the index
    pub deleted: usize,
    /// Entries that failed and stay queued for another attempt
    pub retried: usize,
    /// Entries moved to dead letters
    pub dead_lettered: usize,
    /// Entries whose lease ran out and were taken over by another drain
    pub lost_claims: usize,
}

impl DrainResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_indexed(&mut self) {
        self.indexed += 1;
    }

    pub fn record_deleted(&mut self) {
        self.deleted += 1;
    }

    pub fn record_retry(&mut self) {
        self.retried += 1;
    }

    pub fn record_dead_letter(&mut self) {
        self.dead_lettered += 1;
    }

    pub fn record_lost_claim(&mut self) {
        self.lost_claims += 1;
    }

    /// Merge another result into this one.
    pub fn merge(&mut self, other: &DrainResult) {
        self.claimed += other.claimed;
        self.indexed += other.indexed;
        self.deleted += other.deleted;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.lost_claims += other.lost_claims;
    }

    /// Entries removed from the queue successfully.
    pub fn completed(&self) -> usize {
        self.indexed + self.deleted
    }

    pub fn failed(&self) -> usize {
        self.retried + self.dead_lettered
    }

    pub fn has_work(&self) -> bool {
        self.claimed > 0
    }
}
