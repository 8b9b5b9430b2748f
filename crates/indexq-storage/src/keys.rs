//! Key encoding and decoding for the storage layer.
//!
//! Key formats:
//! - entity rows:    `ent:{entity_type}:{ordering:020}`
//! - entity lookups: `eid:{entity_type}:{entity_id}`
//! - sessions:       `session:{entity_type}`
//! - queue entries:  `queue:{sequence:020}`
//! - dead letters:   `dead:{ulid}`
//! - documents:      `doc:{entity_type}:{entity_id}`
//!
//! Numbers are zero-padded so lexicographic order equals numeric order, and
//! entity types never contain `:` (see `validate_entity_type`), so a type
//! prefix never matches a longer type.

use indexq_types::{validate_entity_type, OrderingValue};
use ulid::Ulid;

use crate::error::StorageError;

fn check_type(entity_type: &str) -> Result<(), StorageError> {
    validate_entity_type(entity_type).map_err(|e| StorageError::Key(e.to_string()))
}

/// Key for entity rows, ordered by loading key within a type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityKey {
    pub entity_type: String,
    pub ordering: OrderingValue,
}

impl EntityKey {
    pub fn new(entity_type: &str, ordering: OrderingValue) -> Result<Self, StorageError> {
        check_type(entity_type)?;
        Ok(Self {
            entity_type: entity_type.to_string(),
            ordering,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!("ent:{}:{:020}", self.entity_type, self.ordering.get()).into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        let s = std::str::from_utf8(bytes)
            .map_err(|e| StorageError::Key(format!("Invalid UTF-8: {}", e)))?;

        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 || parts[0] != "ent" {
            return Err(StorageError::Key(format!("Invalid entity key format: {}", s)));
        }

        let ordering: u64 = parts[2]
            .parse()
            .map_err(|e| StorageError::Key(format!("Invalid ordering value: {}", e)))?;

        Self::new(parts[1], OrderingValue(ordering))
    }

    /// Prefix shared by all rows of one entity type.
    pub fn type_prefix(entity_type: &str) -> Result<Vec<u8>, StorageError> {
        check_type(entity_type)?;
        Ok(format!("ent:{}:", entity_type).into_bytes())
    }
}

/// Key mapping an entity id to its row's ordering value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityIdKey {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityIdKey {
    pub fn new(entity_type: &str, entity_id: &str) -> Result<Self, StorageError> {
        check_type(entity_type)?;
        if entity_id.is_empty() {
            return Err(StorageError::Key("entity id must not be empty".to_string()));
        }
        Ok(Self {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!("eid:{}:{}", self.entity_type, self.entity_id).into_bytes()
    }
}

/// Key for the current enqueueing session of an entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKey {
    pub entity_type: String,
}

impl SessionKey {
    pub fn new(entity_type: &str) -> Result<Self, StorageError> {
        check_type(entity_type)?;
        Ok(Self {
            entity_type: entity_type.to_string(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!("session:{}", self.entity_type).into_bytes()
    }
}

/// Key for queue entries.
/// Format: queue:{sequence:020}
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKey {
    /// Monotonic sequence number
    pub sequence: u64,
}

impl QueueKey {
    pub fn new(sequence: u64) -> Self {
        Self { sequence }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!("queue:{:020}", self.sequence).into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        let s = std::str::from_utf8(bytes)
            .map_err(|e| StorageError::Key(format!("Invalid UTF-8: {}", e)))?;

        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 2 || parts[0] != "queue" {
            return Err(StorageError::Key(format!("Invalid queue key format: {}", s)));
        }

        let sequence: u64 = parts[1]
            .parse()
            .map_err(|e| StorageError::Key(format!("Invalid sequence: {}", e)))?;

        Ok(Self { sequence })
    }
}

/// Key for dead letters, time-ordered by ULID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterKey {
    pub id: Ulid,
}

impl DeadLetterKey {
    pub fn new() -> Self {
        Self { id: Ulid::new() }
    }

    pub fn from_id(id: &str) -> Result<Self, StorageError> {
        let id: Ulid = id
            .parse()
            .map_err(|e| StorageError::Key(format!("Invalid dead letter id: {}", e)))?;
        Ok(Self { id })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!("dead:{}", self.id).into_bytes()
    }
}

impl Default for DeadLetterKey {
    fn default() -> Self {
        Self::new()
    }
}

/// Key for documents written by the local indexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentKey {
    pub entity_type: String,
    pub entity_id: String,
}

impl DocumentKey {
    pub fn new(entity_type: &str, entity_id: &str) -> Result<Self, StorageError> {
        check_type(entity_type)?;
        Ok(Self {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!("doc:{}:{}", self.entity_type, self.entity_id).into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_key_roundtrip() {
        let key = EntityKey::new("customer", OrderingValue(42)).unwrap();
        let bytes = key.to_bytes();
        assert_eq!(bytes, b"ent:customer:00000000000000000042".to_vec());
        assert_eq!(EntityKey::from_bytes(&bytes).unwrap(), key);
    }

    #[test]
    fn test_entity_key_lexicographic_order() {
        let k9 = EntityKey::new("customer", OrderingValue(9)).unwrap();
        let k10 = EntityKey::new("customer", OrderingValue(10)).unwrap();
        assert!(k9.to_bytes() < k10.to_bytes());
    }

    #[test]
    fn test_type_prefix_does_not_match_longer_type() {
        let prefix = EntityKey::type_prefix("order").unwrap();
        let other = EntityKey::new("order_line", OrderingValue(1)).unwrap();
        assert!(!other.to_bytes().starts_with(&prefix));

        let own = EntityKey::new("order", OrderingValue(1)).unwrap();
        assert!(own.to_bytes().starts_with(&prefix));
    }

    #[test]
    fn test_keys_reject_invalid_types() {
        assert!(EntityKey::new("a:b", OrderingValue(1)).is_err());
        assert!(SessionKey::new("").is_err());
        assert!(EntityIdKey::new("customer", "").is_err());
    }

    #[test]
    fn test_queue_key_roundtrip() {
        let key = QueueKey::new(12345);
        let decoded = QueueKey::from_bytes(&key.to_bytes()).unwrap();
        assert_eq!(key.sequence, decoded.sequence);
        assert!(QueueKey::from_bytes(b"outbox:1").is_err());
    }

    #[test]
    fn test_dead_letter_key_from_id() {
        let key = DeadLetterKey::new();
        let parsed = DeadLetterKey::from_id(&key.id.to_string()).unwrap();
        assert_eq!(key, parsed);
        assert!(DeadLetterKey::from_id("not-a-ulid").is_err());
    }
}
