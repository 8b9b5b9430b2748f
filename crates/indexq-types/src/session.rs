//! Enqueueing session model.
//!
//! An enqueueing session is the persisted cursor of one bulk reindex sweep
//! over a single entity type. Its lifecycle is strictly
//! `Created -> Active -> Finished`; a finished session is never reopened,
//! a new sweep starts a new session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::entity::{validate_entity_type, OrderingValue};
use crate::error::TypesError;

/// Status of an enqueueing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Requested, no batch loaded yet
    Created,
    /// At least one batch enqueued
    Active,
    /// A load returned no more ids
    Finished,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Created => write!(f, "created"),
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Finished => write!(f, "finished"),
        }
    }
}

/// Persisted progress of a bulk reindex over one entity type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueingSession {
    /// Unique id of this sweep (ULID)
    pub session_id: String,

    /// Entity type being swept
    pub entity_type: String,

    /// Ordering value of the last enqueued entity, `None` before the first batch
    pub last_ordering_value: Option<OrderingValue>,

    pub status: SessionStatus,

    /// Optimistic concurrency counter, bumped on every persisted change
    pub version: u64,

    /// Number of non-empty batches enqueued so far
    pub batches_loaded: u64,

    /// Number of ids enqueued so far
    pub ids_enqueued: u64,

    /// Set when the cursor was found malformed; the sweep is parked
    #[serde(default)]
    pub stalled_reason: Option<String>,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl EnqueueingSession {
    /// Create a fresh session for the given entity type.
    pub fn new(entity_type: impl Into<String>) -> Result<Self, TypesError> {
        let entity_type = entity_type.into();
        validate_entity_type(&entity_type)?;
        let now = Utc::now();
        Ok(Self {
            session_id: Ulid::new().to_string(),
            entity_type,
            last_ordering_value: None,
            status: SessionStatus::Created,
            version: 0,
            batches_loaded: 0,
            ids_enqueued: 0,
            stalled_reason: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_finished(&self) -> bool {
        self.status == SessionStatus::Finished
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled_reason.is_some()
    }

    /// Whether a scheduler tick may advance this session.
    pub fn is_runnable(&self) -> bool {
        !self.is_finished() && !self.is_stalled()
    }

    /// Check that `next` would move the cursor strictly forward.
    pub fn validate_next_cursor(&self, next: OrderingValue) -> Result<(), TypesError> {
        match self.last_ordering_value {
            Some(current) if next <= current => Err(TypesError::InvalidCursor {
                session_id: self.session_id.clone(),
                reason: format!("next ordering value {} is not after {}", next, current),
            }),
            _ => Ok(()),
        }
    }

    /// Record an enqueued batch ending at `last`.
    pub fn advance(&mut self, last: OrderingValue, count: usize) -> Result<(), TypesError> {
        if self.is_finished() {
            return Err(TypesError::InvalidTransition(format!(
                "session {} is finished and cannot advance",
                self.session_id
            )));
        }
        self.validate_next_cursor(last)?;
        self.last_ordering_value = Some(last);
        self.status = SessionStatus::Active;
        self.batches_loaded += 1;
        self.ids_enqueued += count as u64;
        self.touch();
        Ok(())
    }

    /// Mark the sweep complete.
    pub fn finish(&mut self) -> Result<(), TypesError> {
        if self.is_finished() {
            return Err(TypesError::InvalidTransition(format!(
                "session {} is already finished",
                self.session_id
            )));
        }
        self.status = SessionStatus::Finished;
        self.touch();
        Ok(())
    }

    /// Park the session after a malformed cursor. Status is left unchanged.
    pub fn flag_stalled(&mut self, reason: impl Into<String>) {
        self.stalled_reason = Some(reason.into());
        self.touch();
    }

    fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
