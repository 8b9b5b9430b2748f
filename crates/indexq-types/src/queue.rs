//! Indexing queue records.
//!
//! Queue entries are written by enqueueing (session sweeps and individual
//! entity changes) and consumed by the drain job. A drain claims an entry by
//! setting `claimed_until` and a fresh `claim_token`; only the holder of the
//! current token may complete, release or dead-letter the entry. After a
//! failed attempt `claimed_until` doubles as the retry backoff and the token
//! is cleared.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::entity::EntityRef;

/// What the index write should do with the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexingOperation {
    /// (Re)index the entity document
    Index,
    /// Remove the entity document from the index
    Delete,
}

impl std::fmt::Display for IndexingOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexingOperation::Index => write!(f, "index"),
            IndexingOperation::Delete => write!(f, "delete"),
        }
    }
}

/// A durable pointer to one entity awaiting an index write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub entity: EntityRef,

    pub operation: IndexingOperation,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub enqueued_at: DateTime<Utc>,

    /// Failed processing attempts so far
    #[serde(default)]
    pub attempts: u32,

    /// Entry is invisible to drains until this instant
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub claimed_until: Option<DateTime<Utc>>,

    /// Identifies the drain currently holding the claim
    #[serde(default)]
    pub claim_token: Option<String>,

    #[serde(default)]
    pub last_error: Option<String>,
}

impl QueueEntry {
    pub fn new(entity: EntityRef, operation: IndexingOperation) -> Self {
        Self {
            entity,
            operation,
            enqueued_at: Utc::now(),
            attempts: 0,
            claimed_until: None,
            claim_token: None,
            last_error: None,
        }
    }

    pub fn index(entity: EntityRef) -> Self {
        Self::new(entity, IndexingOperation::Index)
    }

    pub fn delete(entity: EntityRef) -> Self {
        Self::new(entity, IndexingOperation::Delete)
    }

    /// Whether a drain may claim this entry at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.claimed_until {
            Some(until) => until <= now,
            None => true,
        }
    }

    /// Take the claim until `now + lease`. Returns the new claim token.
    pub fn claim(&mut self, now: DateTime<Utc>, lease: Duration) -> String {
        let token = Ulid::new().to_string();
        self.claimed_until = Some(now + lease);
        self.claim_token = Some(token.clone());
        token
    }

    /// Whether `token` is the current claim.
    pub fn is_claimed_by(&self, token: &str) -> bool {
        self.claim_token.as_deref() == Some(token)
    }

    /// Record a failed attempt and hide the entry for `backoff`.
    pub fn record_failure(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
        backoff: Duration,
    ) {
        self.attempts += 1;
        self.last_error = Some(error.into());
        self.claimed_until = Some(now + backoff);
        self.claim_token = None;
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// A queue entry that exhausted its attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Dead letter id (ULID)
    pub id: String,
    /// Queue sequence the entry had when it was removed
    pub sequence: u64,
    pub entry: QueueEntry,
    pub error: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
