//! Entity rows and references.
//!
//! Entities are identified by `(entity_type, entity_id)`. Each row also
//! carries an [`OrderingValue`] assigned when the row is first written;
//! bulk reindex sweeps walk entities of one type in ascending ordering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TypesError;

/// Stable, monotonically comparable loading key of an entity row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderingValue(pub u64);

impl OrderingValue {
    /// The value immediately after this one, used as an exclusive lower bound.
    pub fn next(self) -> Option<OrderingValue> {
        self.0.checked_add(1).map(OrderingValue)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for OrderingValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Check that an entity type name can be used as a key component.
///
/// Entity types appear inside `:`-separated storage keys, so they must be
/// non-empty and must not contain the separator.
pub fn validate_entity_type(entity_type: &str) -> Result<(), TypesError> {
    if entity_type.is_empty() {
        return Err(TypesError::InvalidInput(
            "entity type must not be empty".to_string(),
        ));
    }
    if entity_type.contains(':') {
        return Err(TypesError::InvalidInput(format!(
            "entity type must not contain ':': {}",
            entity_type
        )));
    }
    Ok(())
}

/// Reference to one entity instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

/// An entity row in the application store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Opaque identifier, unique within the entity type
    pub entity_id: String,

    /// Loading key assigned on first write, never changed by updates
    pub ordering: OrderingValue,

    /// Indexable document body
    pub document: serde_json::Value,

    /// Last write time (milliseconds since epoch in JSON)
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl EntityRecord {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// A document written to the local search document store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedDocument {
    pub entity: EntityRef,
    pub document: serde_json::Value,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub indexed_at: DateTime<Utc>,
}

impl IndexedDocument {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
