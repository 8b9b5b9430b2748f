//! Indexing queue manager.
//!
//! Coordinates both halves of the queue:
//! - enqueueing: advance reindex sessions batch by batch, and enqueue
//!   individual entity changes
//! - draining: claim entries, dispatch them to the indexer for their type,
//!   then complete, retry or dead-letter each one
//!
//! Session advancement is version-checked. When two instances race on the
//! same session exactly one commit wins; the other reports
//! [`EnqueueOutcome::Conflict`] and enqueues nothing.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use indexq_storage::{SessionCommit, Storage, StorageError};
use indexq_types::{
    validate_entity_type, EnqueueingSession, EntityRef, IndexingOperation, OrderingValue,
    QueueEntry, Settings, TypesError,
};

use crate::error::IndexingError;
use crate::indexer::{DrainResult, EntityIndexer, IndexerRegistry};
use crate::loader::LoaderRegistry;

/// Configuration for the queue manager.
#[derive(Debug, Clone)]
pub struct QueueManagerConfig {
    /// Ids loaded per session advancement
    pub enqueue_batch_size: usize,
    /// Entries claimed per drain tick
    pub queue_batch_size: usize,
    /// Failed attempts before an entry is dead-lettered
    pub max_attempts: u32,
    /// Upper bound on one index write
    pub item_timeout: Duration,
    /// How long a claim hides an entry from other drains
    pub claim_lease: Duration,
    /// How long a failed entry waits before it can be claimed again
    pub retry_delay: Duration,
}

impl Default for QueueManagerConfig {
    fn default() -> Self {
        Self {
            enqueue_batch_size: 100,
            queue_batch_size: 100,
            max_attempts: 3,
            item_timeout: Duration::from_millis(30_000),
            claim_lease: Duration::from_secs(60),
            retry_delay: Duration::from_millis(5_000),
        }
    }
}

impl QueueManagerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            enqueue_batch_size: settings.enqueueing.batch_size,
            queue_batch_size: settings.queue.batch_size,
            max_attempts: settings.queue.max_attempts,
            item_timeout: Duration::from_millis(settings.queue.item_timeout_ms),
            claim_lease: Duration::from_secs(settings.queue.claim_lease_secs),
            retry_delay: Duration::from_millis(settings.queue.retry_delay_ms),
        }
    }

    pub fn with_enqueue_batch_size(mut self, size: usize) -> Self {
        self.enqueue_batch_size = size;
        self
    }

    pub fn with_queue_batch_size(mut self, size: usize) -> Self {
        self.queue_batch_size = size;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_item_timeout(mut self, timeout: Duration) -> Self {
        self.item_timeout = timeout;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }
}

/// Result of one session advancement attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EnqueueOutcome {
    /// No runnable session
    Idle,
    /// A batch was enqueued and the cursor moved forward
    Advanced {
        entity_type: String,
        enqueued: usize,
        last_ordering_value: OrderingValue,
    },
    /// The loader ran dry and the session was closed
    Finished {
        entity_type: String,
        ids_enqueued: u64,
    },
    /// Another instance changed the session first; nothing was written
    Conflict { entity_type: String },
    /// The loader returned a malformed cursor; the session is parked
    Stalled { entity_type: String, reason: String },
}

impl EnqueueOutcome {
    pub fn is_idle(&self) -> bool {
        matches!(self, EnqueueOutcome::Idle)
    }

    /// Whether the session moved forward or closed.
    pub fn made_progress(&self) -> bool {
        matches!(
            self,
            EnqueueOutcome::Advanced { .. } | EnqueueOutcome::Finished { .. }
        )
    }
}

/// Snapshot of sessions and queue depth for operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatus {
    pub sessions: Vec<EnqueueingSession>,
    pub queue_len: usize,
    /// Entries currently leased or backing off after a failure
    pub claimed: usize,
    pub dead_letters: usize,
}

/// Coordinates enqueueing sessions and the queue drain.
pub struct IndexingQueueManager {
    storage: Arc<Storage>,
    loaders: LoaderRegistry,
    indexers: IndexerRegistry,
    config: QueueManagerConfig,
}

impl IndexingQueueManager {
    pub fn new(
        storage: Arc<Storage>,
        loaders: LoaderRegistry,
        indexers: IndexerRegistry,
        config: QueueManagerConfig,
    ) -> Self {
        Self {
            storage,
            loaders,
            indexers,
            config,
        }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn config(&self) -> &QueueManagerConfig {
        &self.config
    }

    pub fn loaders(&self) -> &LoaderRegistry {
        &self.loaders
    }

    // ==================== Enqueueing ====================

    /// Start a reindex sweep of one entity type.
    ///
    /// Returns the session and whether it was newly created. A runnable
    /// session that already exists is returned as is; a finished or stalled
    /// one is replaced.
    pub fn request_reindex(
        &self,
        entity_type: &str,
    ) -> Result<(EnqueueingSession, bool), IndexingError> {
        validate_entity_type(entity_type)?;
        if !self.loaders.contains(entity_type) {
            return Err(IndexingError::NoLoader(entity_type.to_string()));
        }
        Ok(self.storage.start_session(entity_type)?)
    }

    /// Start a reindex sweep for every type with a registered loader.
    pub fn request_reindex_all(&self) -> Result<Vec<(EnqueueingSession, bool)>, IndexingError> {
        self.loaders
            .entity_types()
            .iter()
            .map(|entity_type| self.request_reindex(entity_type))
            .collect()
    }

    /// Enqueue index operations for individual entities.
    pub fn enqueue_index(&self, entities: &[EntityRef]) -> Result<Vec<u64>, IndexingError> {
        self.enqueue_operation(entities, IndexingOperation::Index)
    }

    /// Enqueue delete operations for individual entities.
    pub fn enqueue_delete(&self, entities: &[EntityRef]) -> Result<Vec<u64>, IndexingError> {
        self.enqueue_operation(entities, IndexingOperation::Delete)
    }

    fn enqueue_operation(
        &self,
        entities: &[EntityRef],
        operation: IndexingOperation,
    ) -> Result<Vec<u64>, IndexingError> {
        if entities.is_empty() {
            return Ok(Vec::new());
        }
        for entity in entities {
            validate_entity_type(&entity.entity_type)?;
            if entity.entity_id.is_empty() {
                return Err(IndexingError::InvalidInput(format!(
                    "empty entity id for type {}",
                    entity.entity_type
                )));
            }
        }

        let entries: Vec<QueueEntry> = entities
            .iter()
            .map(|entity| QueueEntry::new(entity.clone(), operation))
            .collect();
        let sequences = self.storage.enqueue(&entries)?;
        debug!(count = sequences.len(), operation = %operation, "Enqueued entity changes");
        Ok(sequences)
    }

    /// Advance the least recently advanced runnable session by one batch.
    pub fn process_next_enqueueing_session(&self) -> Result<EnqueueOutcome, IndexingError> {
        let Some(session) = self.next_session()? else {
            return Ok(EnqueueOutcome::Idle);
        };
        let entity_type = session.entity_type.clone();
        let loader = self
            .loaders
            .get(&entity_type)
            .ok_or_else(|| IndexingError::NoLoader(entity_type.clone()))?;

        let expected_version = session.version;
        let result = loader.load_next_ids(&session, self.config.enqueue_batch_size)?;

        let mut updated = session.clone();

        if result.is_empty() {
            updated.finish()?;
            return match self.storage.commit_session(expected_version, &updated, &[])? {
                SessionCommit::Committed { .. } => {
                    info!(
                        entity_type = %entity_type,
                        session_id = %updated.session_id,
                        batches = updated.batches_loaded,
                        ids_enqueued = updated.ids_enqueued,
                        "Enqueueing session finished"
                    );
                    Ok(EnqueueOutcome::Finished {
                        entity_type,
                        ids_enqueued: updated.ids_enqueued,
                    })
                }
                SessionCommit::Conflict => Ok(EnqueueOutcome::Conflict { entity_type }),
            };
        }

        let Some(last) = result.last_ordering_value else {
            return self.stall(
                session,
                format!(
                    "loader {} returned {} ids without an ordering value",
                    loader.name(),
                    result.len()
                ),
            );
        };

        match updated.advance(last, result.len()) {
            Ok(()) => {}
            Err(TypesError::InvalidCursor { reason, .. }) => {
                return self.stall(session, format!("loader {}: {}", loader.name(), reason));
            }
            Err(e) => return Err(e.into()),
        }

        let entries: Vec<QueueEntry> = result
            .ids
            .iter()
            .map(|id| QueueEntry::index(EntityRef::new(entity_type.as_str(), id.as_str())))
            .collect();

        match self
            .storage
            .commit_session(expected_version, &updated, &entries)?
        {
            SessionCommit::Committed { sequences } => {
                debug!(
                    entity_type = %entity_type,
                    session_id = %updated.session_id,
                    enqueued = sequences.len(),
                    cursor = last.get(),
                    "Advanced enqueueing session"
                );
                Ok(EnqueueOutcome::Advanced {
                    entity_type,
                    enqueued: sequences.len(),
                    last_ordering_value: last,
                })
            }
            SessionCommit::Conflict => {
                debug!(entity_type = %entity_type, "Session advanced elsewhere, backing off");
                Ok(EnqueueOutcome::Conflict { entity_type })
            }
        }
    }

    /// Runnable session with a loader, least recently advanced first.
    fn next_session(&self) -> Result<Option<EnqueueingSession>, IndexingError> {
        let session = self
            .storage
            .list_sessions()?
            .into_iter()
            .filter(|s| s.is_runnable() && self.loaders.contains(&s.entity_type))
            .min_by(|a, b| {
                a.updated_at
                    .cmp(&b.updated_at)
                    .then_with(|| a.session_id.cmp(&b.session_id))
            });
        Ok(session)
    }

    fn stall(
        &self,
        session: EnqueueingSession,
        reason: String,
    ) -> Result<EnqueueOutcome, IndexingError> {
        let expected_version = session.version;
        let entity_type = session.entity_type.clone();
        let mut stalled = session;
        stalled.flag_stalled(reason.clone());

        match self.storage.commit_session(expected_version, &stalled, &[])? {
            SessionCommit::Committed { .. } => {
                error!(
                    entity_type = %entity_type,
                    session_id = %stalled.session_id,
                    cursor = ?stalled.last_ordering_value,
                    reason = %reason,
                    "Malformed cursor, enqueueing session stalled"
                );
                Ok(EnqueueOutcome::Stalled {
                    entity_type,
                    reason,
                })
            }
            SessionCommit::Conflict => Ok(EnqueueOutcome::Conflict { entity_type }),
        }
    }

    // ==================== Draining ====================

    /// Claim one batch and dispatch every entry.
    ///
    /// Item failures are recorded on the entry and never fail the tick.
    /// Only storage errors while claiming or settling entries propagate.
    ///
    /// Each entry's lease is renewed right before its dispatch to cover the
    /// item timeout, and every settle write is checked against the claim
    /// token. An entry whose lease ran out while earlier items were being
    /// dispatched, and was claimed by another drain, is left to that drain.
    pub async fn process_queue(&self) -> Result<DrainResult, IndexingError> {
        let limit = self.config.queue_batch_size;
        let lease = chrono_duration(self.config.claim_lease);
        let claimed = self
            .blocking(move |storage| storage.claim_queue_entries(limit, Utc::now(), lease))
            .await?;

        let mut result = DrainResult::new();
        result.claimed = claimed.len();
        if claimed.is_empty() {
            return Ok(result);
        }

        for (sequence, entry) in claimed {
            let Some(token) = entry.claim_token.clone() else {
                result.record_lost_claim();
                continue;
            };
            if !self.renew_claim(sequence, &token).await? {
                result.record_lost_claim();
                continue;
            }

            let settled = match self.dispatch(&entry).await {
                Ok(operation) => {
                    let done = self.complete(sequence, &token).await?;
                    if done {
                        match operation {
                            IndexingOperation::Index => result.record_indexed(),
                            IndexingOperation::Delete => result.record_deleted(),
                        }
                    }
                    done
                }
                Err(e) => {
                    self.settle_failure(sequence, &token, entry, &e, &mut result)
                        .await?
                }
            };
            if !settled {
                result.record_lost_claim();
            }
        }

        info!(
            claimed = result.claimed,
            indexed = result.indexed,
            deleted = result.deleted,
            retried = result.retried,
            dead_lettered = result.dead_lettered,
            lost_claims = result.lost_claims,
            "Processed queue batch"
        );
        Ok(result)
    }

    /// Drain until a tick claims nothing or `max_iterations` ticks ran.
    pub async fn process_queue_until_empty(
        &self,
        max_iterations: usize,
    ) -> Result<DrainResult, IndexingError> {
        let mut total = DrainResult::new();
        for _ in 0..max_iterations {
            let result = self.process_queue().await?;
            if !result.has_work() {
                break;
            }
            total.merge(&result);
        }
        Ok(total)
    }

    /// Run a store call on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, IndexingError>
    where
        F: FnOnce(&Storage) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || f(&storage))
            .await
            .map_err(|e| IndexingError::Task(e.to_string()))?
            .map_err(IndexingError::from)
    }

    async fn renew_claim(&self, sequence: u64, token: &str) -> Result<bool, IndexingError> {
        let until = Utc::now()
            + chrono_duration(self.config.item_timeout)
            + chrono_duration(self.config.claim_lease);
        let token = token.to_string();
        self.blocking(move |storage| storage.renew_queue_claim(sequence, &token, until))
            .await
    }

    async fn complete(&self, sequence: u64, token: &str) -> Result<bool, IndexingError> {
        let token = token.to_string();
        self.blocking(move |storage| storage.complete_queue_entry(sequence, &token))
            .await
    }

    /// Perform the index write for one entry under the item timeout.
    ///
    /// Returns the operation actually applied: an `Index` entry whose entity
    /// no longer exists is applied as a delete. The timeout bounds the entity
    /// read as well as the indexer call.
    async fn dispatch(&self, entry: &QueueEntry) -> Result<IndexingOperation, IndexingError> {
        let indexer = self
            .indexers
            .get(&entry.entity.entity_type)
            .ok_or_else(|| IndexingError::NoIndexer(entry.entity.entity_type.clone()))?;

        let timeout = self.config.item_timeout;
        match tokio::time::timeout(timeout, self.apply(indexer.as_ref(), entry)).await {
            Ok(result) => result,
            Err(_) => Err(IndexingError::Timeout {
                entity: entry.entity.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn apply(
        &self,
        indexer: &dyn EntityIndexer,
        entry: &QueueEntry,
    ) -> Result<IndexingOperation, IndexingError> {
        let entity = &entry.entity;
        match entry.operation {
            IndexingOperation::Index => {
                let entity_type = entity.entity_type.clone();
                let entity_id = entity.entity_id.clone();
                let record = self
                    .blocking(move |storage| storage.get_entity(&entity_type, &entity_id))
                    .await?;
                match record {
                    Some(record) => {
                        indexer.index(entity, &record.document).await?;
                        Ok(IndexingOperation::Index)
                    }
                    None => {
                        debug!(entity = %entity, "Entity gone, deleting from index");
                        indexer.delete(entity).await?;
                        Ok(IndexingOperation::Delete)
                    }
                }
            }
            IndexingOperation::Delete => {
                indexer.delete(entity).await?;
                Ok(IndexingOperation::Delete)
            }
        }
    }

    /// Retry or dead-letter a failed entry. Returns `false` if the claim
    /// was lost before the write.
    async fn settle_failure(
        &self,
        sequence: u64,
        token: &str,
        mut entry: QueueEntry,
        err: &IndexingError,
        result: &mut DrainResult,
    ) -> Result<bool, IndexingError> {
        let message = err.to_string();
        entry.record_failure(
            message.clone(),
            Utc::now(),
            chrono_duration(self.config.retry_delay),
        );
        let token = token.to_string();

        if entry.attempts >= self.config.max_attempts {
            let (dead_entry, error) = (entry.clone(), message.clone());
            let dead_letter = self
                .blocking(move |storage| {
                    storage.dead_letter_queue_entry(sequence, &token, &dead_entry, &error)
                })
                .await?;
            let Some(dead_letter) = dead_letter else {
                return Ok(false);
            };
            warn!(
                entity = %entry.entity,
                operation = %entry.operation,
                attempts = entry.attempts,
                dead_letter_id = %dead_letter.id,
                error = %message,
                "Queue entry exhausted its attempts, moved to dead letters"
            );
            result.record_dead_letter();
        } else {
            let retry_entry = entry.clone();
            let released = self
                .blocking(move |storage| {
                    storage.release_queue_entry(sequence, &token, &retry_entry)
                })
                .await?;
            if !released {
                return Ok(false);
            }
            warn!(
                entity = %entry.entity,
                operation = %entry.operation,
                attempts = entry.attempts,
                error = %message,
                "Index write failed, will retry"
            );
            result.record_retry();
        }
        Ok(true)
    }

    // ==================== Status ====================

    pub fn queue_status(&self) -> Result<QueueStatus, IndexingError> {
        let stats = self.storage.get_stats()?;
        Ok(QueueStatus {
            sessions: self.storage.list_sessions()?,
            queue_len: stats.queue_len,
            claimed: stats.claimed_count,
            dead_letters: stats.dead_letter_count,
        })
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
    chrono::Duration::milliseconds(millis)
}
