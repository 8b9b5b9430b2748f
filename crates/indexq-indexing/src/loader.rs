//! Entity id loading for enqueueing sessions.
//!
//! A loader returns the next batch of ids of the session's entity type
//! whose ordering value is strictly after the session cursor, in ascending
//! order. Loading is read-only: the caller persists the advanced cursor.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use indexq_storage::Storage;
use indexq_types::{validate_entity_type, EnqueueingSession, OrderingValue};

use crate::error::IndexingError;

/// One loaded batch of entity ids.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResultHolder {
    /// Ids in loader order
    pub ids: Vec<String>,
    /// Ordering value of the last id, `None` iff `ids` is empty
    pub last_ordering_value: Option<OrderingValue>,
}

impl ResultHolder {
    /// No more ids remain; finishes the session.
    pub const EMPTY: ResultHolder = ResultHolder {
        ids: Vec::new(),
        last_ordering_value: None,
    };

    pub fn new(ids: Vec<String>, last_ordering_value: Option<OrderingValue>) -> Self {
        Self {
            ids,
            last_ordering_value,
        }
    }

    /// Build from `(ordering, id)` pairs already in ascending order.
    pub fn from_pairs(pairs: Vec<(OrderingValue, String)>) -> Self {
        let last_ordering_value = pairs.last().map(|(ordering, _)| *ordering);
        let ids = pairs.into_iter().map(|(_, id)| id).collect();
        Self {
            ids,
            last_ordering_value,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }
}

/// Loads ordered id batches for one entity type.
///
/// Implementations surface data-access errors to the caller and do not
/// retry; the scheduled job retries on its next tick.
pub trait EntityIdsLoader: Send + Sync {
    /// Load up to `batch_size` ids after the session cursor.
    fn load_next_ids(
        &self,
        session: &EnqueueingSession,
        batch_size: usize,
    ) -> Result<ResultHolder, IndexingError>;

    /// Get the name of this loader for logging.
    fn name(&self) -> &str;
}

/// Loader over the embedded entity store.
pub struct StorageIdsLoader {
    storage: Arc<Storage>,
}

impl StorageIdsLoader {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl EntityIdsLoader for StorageIdsLoader {
    fn load_next_ids(
        &self,
        session: &EnqueueingSession,
        batch_size: usize,
    ) -> Result<ResultHolder, IndexingError> {
        if batch_size == 0 {
            return Err(IndexingError::InvalidInput(
                "batch size must be positive".to_string(),
            ));
        }

        let pairs = self.storage.load_entity_ids(
            &session.entity_type,
            session.last_ordering_value,
            batch_size,
        )?;

        if pairs.is_empty() {
            return Ok(ResultHolder::EMPTY);
        }

        let result = ResultHolder::from_pairs(pairs);
        debug!(
            entity_type = %session.entity_type,
            after = ?session.last_ordering_value,
            count = result.len(),
            last = ?result.last_ordering_value,
            "Loaded entity ids"
        );
        Ok(result)
    }

    fn name(&self) -> &str {
        "storage"
    }
}

/// Entity type -> loader mapping, built once at startup.
#[derive(Default, Clone)]
pub struct LoaderRegistry {
    loaders: HashMap<String, Arc<dyn EntityIdsLoader>>,
}

impl LoaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the storage loader for each of the given entity types.
    pub fn for_storage(
        storage: Arc<Storage>,
        entity_types: &[impl AsRef<str>],
    ) -> Result<Self, IndexingError> {
        let loader: Arc<dyn EntityIdsLoader> = Arc::new(StorageIdsLoader::new(storage));
        let mut registry = Self::new();
        for entity_type in entity_types {
            registry.register(entity_type.as_ref(), loader.clone())?;
        }
        Ok(registry)
    }

    /// Register a loader, replacing any previous one for the type.
    pub fn register(
        &mut self,
        entity_type: &str,
        loader: Arc<dyn EntityIdsLoader>,
    ) -> Result<(), IndexingError> {
        validate_entity_type(entity_type)?;
        self.loaders.insert(entity_type.to_string(), loader);
        Ok(())
    }

    pub fn get(&self, entity_type: &str) -> Option<Arc<dyn EntityIdsLoader>> {
        self.loaders.get(entity_type).cloned()
    }

    pub fn contains(&self, entity_type: &str) -> bool {
        self.loaders.contains_key(entity_type)
    }

    /// Registered entity types, sorted.
    pub fn entity_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.loaders.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.loaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_storage() -> (Arc<Storage>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::open(temp_dir.path()).unwrap();
        (Arc::new(storage), temp_dir)
    }

    #[test]
    fn test_result_holder_empty() {
        assert!(ResultHolder::EMPTY.is_empty());
        assert_eq!(ResultHolder::EMPTY.last_ordering_value, None);
        assert_eq!(ResultHolder::from_pairs(Vec::new()), ResultHolder::EMPTY);
        assert_eq!(ResultHolder::default(), ResultHolder::EMPTY);
    }

    #[test]
    fn test_result_holder_from_pairs() {
        let result = ResultHolder::from_pairs(vec![
            (OrderingValue(3), "a".to_string()),
            (OrderingValue(8), "b".to_string()),
        ]);
        assert_eq!(result.ids, vec!["a", "b"]);
        assert_eq!(result.last_ordering_value, Some(OrderingValue(8)));
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_storage_loader_walks_past_cursor() {
        let (storage, _temp) = create_test_storage();
        for i in 0..5 {
            storage
                .put_entity("customer", &format!("c-{}", i), serde_json::json!({}))
                .unwrap();
        }
        let loader = StorageIdsLoader::new(storage);
        let mut session = EnqueueingSession::new("customer").unwrap();

        let first = loader.load_next_ids(&session, 2).unwrap();
        assert_eq!(first.ids, vec!["c-0", "c-1"]);

        session.advance(first.last_ordering_value.unwrap(), 2).unwrap();
        let second = loader.load_next_ids(&session, 10).unwrap();
        assert_eq!(second.ids, vec!["c-2", "c-3", "c-4"]);
        assert!(second.last_ordering_value > first.last_ordering_value);

        session.advance(second.last_ordering_value.unwrap(), 3).unwrap();
        assert_eq!(loader.load_next_ids(&session, 10).unwrap(), ResultHolder::EMPTY);
    }

    #[test]
    fn test_storage_loader_rejects_zero_batch() {
        let (storage, _temp) = create_test_storage();
        let loader = StorageIdsLoader::new(storage);
        let session = EnqueueingSession::new("customer").unwrap();

        assert!(matches!(
            loader.load_next_ids(&session, 0),
            Err(IndexingError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_registry() {
        let (storage, _temp) = create_test_storage();
        let registry =
            LoaderRegistry::for_storage(storage.clone(), &["order", "customer"]).unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("customer"));
        assert!(registry.get("invoice").is_none());
        assert_eq!(registry.entity_types(), vec!["customer", "order"]);

        let mut registry = LoaderRegistry::new();
        let loader: Arc<dyn EntityIdsLoader> = Arc::new(StorageIdsLoader::new(storage));
        assert!(registry.register("bad:type", loader).is_err());
        assert!(registry.is_empty());
    }
}
