//! RocksDB wrapper for indexq storage.
//!
//! Provides:
//! - Database open with column family setup
//! - Entity writes that enqueue an index/delete entry in the same transaction
//! - Ordered entity id scans for bulk reindex sweeps
//! - Version-checked session commits (optimistic transactions)
//! - Queue claim / complete / release / dead-letter

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use rocksdb::{
    ColumnFamily, Direction, IteratorMode, OptimisticTransactionDB, Options, Transaction,
};
use tracing::{debug, info, warn};

use indexq_types::{
    DeadLetter, EnqueueingSession, EntityRecord, EntityRef, IndexedDocument, OrderingValue,
    QueueEntry,
};

use crate::column_families::{
    build_cf_descriptors, ALL_CF_NAMES, CF_DEAD_LETTERS, CF_DOCUMENTS, CF_ENTITIES, CF_ENTITY_IDS,
    CF_META, CF_QUEUE, CF_SESSIONS,
};
use crate::error::{is_conflict, StorageError};
use crate::keys::{DeadLetterKey, DocumentKey, EntityIdKey, EntityKey, QueueKey, SessionKey};

/// Attempts for writes that only conflict with other local writers.
const MAX_CONFLICT_RETRIES: usize = 16;

/// Meta key holding the highest ordering value handed out.
const ENTITY_ORDERING_KEY: &[u8] = b"meta:entity_ordering";

/// Outcome of a version-checked session commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommit {
    /// Session and queue entries were written; sequences of the new entries
    Committed { sequences: Vec<u64> },
    /// The stored session changed since it was read; nothing was written
    Conflict,
}

/// Main storage interface for indexq
pub struct Storage {
    db: OptimisticTransactionDB,
    /// Queue sequence counter for monotonic ordering
    queue_sequence: AtomicU64,
}

impl Storage {
    /// Open storage at the given path, creating if necessary
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        info!("Opening storage at {:?}", path);

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_background_jobs(4);

        let db =
            OptimisticTransactionDB::open_cf_descriptors(&db_opts, path, build_cf_descriptors())?;

        let queue_sequence = Self::load_queue_sequence(&db)?;

        Ok(Self {
            db,
            queue_sequence: AtomicU64::new(queue_sequence),
        })
    }

    /// Load the next queue sequence from the highest existing key
    fn load_queue_sequence(db: &OptimisticTransactionDB) -> Result<u64, StorageError> {
        let cf = db
            .cf_handle(CF_QUEUE)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(CF_QUEUE.to_string()))?;

        let mut iter = db.iterator_cf(cf, IteratorMode::End);
        if let Some(result) = iter.next() {
            let (key, _) = result?;
            let queue_key = QueueKey::from_bytes(&key)?;
            return Ok(queue_key.sequence + 1);
        }
        Ok(0)
    }

    fn next_queue_sequence(&self) -> u64 {
        self.queue_sequence.fetch_add(1, Ordering::SeqCst)
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(name.to_string()))
    }

    // ==================== Entity Methods ====================

    /// Insert or update an entity row and enqueue it for indexing.
    ///
    /// The first write of an id assigns the next ordering value; updates keep
    /// it so sweeps see a stable order.
    pub fn put_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
        document: serde_json::Value,
    ) -> Result<OrderingValue, StorageError> {
        let entities_cf = self.cf(CF_ENTITIES)?;
        let ids_cf = self.cf(CF_ENTITY_IDS)?;
        let meta_cf = self.cf(CF_META)?;
        let queue_cf = self.cf(CF_QUEUE)?;
        let id_key = EntityIdKey::new(entity_type, entity_id)?;

        for _ in 0..MAX_CONFLICT_RETRIES {
            let txn = self.db.transaction();

            let ordering = match txn.get_for_update_cf(ids_cf, id_key.to_bytes(), true)? {
                Some(bytes) => decode_ordering(&bytes)?,
                None => {
                    let last = match txn.get_for_update_cf(meta_cf, ENTITY_ORDERING_KEY, true)? {
                        Some(bytes) => decode_ordering(&bytes)?,
                        None => OrderingValue(0),
                    };
                    let next = last.next().ok_or_else(|| {
                        StorageError::Key("entity ordering counter exhausted".to_string())
                    })?;
                    txn.put_cf(meta_cf, ENTITY_ORDERING_KEY, encode_ordering(next))?;
                    txn.put_cf(ids_cf, id_key.to_bytes(), encode_ordering(next))?;
                    next
                }
            };

            let record = EntityRecord {
                entity_id: entity_id.to_string(),
                ordering,
                document: document.clone(),
                updated_at: Utc::now(),
            };
            let entity_key = EntityKey::new(entity_type, ordering)?;
            txn.put_cf(entities_cf, entity_key.to_bytes(), record.to_bytes()?)?;

            let queue_key = QueueKey::new(self.next_queue_sequence());
            let entry = QueueEntry::index(EntityRef::new(entity_type, entity_id));
            txn.put_cf(queue_cf, queue_key.to_bytes(), entry.to_bytes()?)?;

            match txn.commit() {
                Ok(()) => {
                    debug!(
                        entity_type = entity_type,
                        entity_id = entity_id,
                        ordering = ordering.get(),
                        queue_sequence = queue_key.sequence,
                        "Stored entity"
                    );
                    return Ok(ordering);
                }
                Err(e) if is_conflict(&e) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(StorageError::Conflict(format!(
            "put_entity {}/{} kept conflicting",
            entity_type, entity_id
        )))
    }

    /// Get an entity row by id
    pub fn get_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<EntityRecord>, StorageError> {
        let ids_cf = self.cf(CF_ENTITY_IDS)?;
        let entities_cf = self.cf(CF_ENTITIES)?;
        let id_key = EntityIdKey::new(entity_type, entity_id)?;

        let Some(bytes) = self.db.get_cf(ids_cf, id_key.to_bytes())? else {
            return Ok(None);
        };
        let ordering = decode_ordering(&bytes)?;
        let entity_key = EntityKey::new(entity_type, ordering)?;

        match self.db.get_cf(entities_cf, entity_key.to_bytes())? {
            Some(bytes) => Ok(Some(EntityRecord::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Delete an entity row and enqueue its removal from the index.
    ///
    /// Returns false if the entity did not exist (nothing is enqueued).
    pub fn delete_entity(&self, entity_type: &str, entity_id: &str) -> Result<bool, StorageError> {
        let entities_cf = self.cf(CF_ENTITIES)?;
        let ids_cf = self.cf(CF_ENTITY_IDS)?;
        let queue_cf = self.cf(CF_QUEUE)?;
        let id_key = EntityIdKey::new(entity_type, entity_id)?;

        for _ in 0..MAX_CONFLICT_RETRIES {
            let txn = self.db.transaction();

            let Some(bytes) = txn.get_for_update_cf(ids_cf, id_key.to_bytes(), true)? else {
                return Ok(false);
            };
            let ordering = decode_ordering(&bytes)?;
            let entity_key = EntityKey::new(entity_type, ordering)?;

            txn.delete_cf(ids_cf, id_key.to_bytes())?;
            txn.delete_cf(entities_cf, entity_key.to_bytes())?;

            let queue_key = QueueKey::new(self.next_queue_sequence());
            let entry = QueueEntry::delete(EntityRef::new(entity_type, entity_id));
            txn.put_cf(queue_cf, queue_key.to_bytes(), entry.to_bytes()?)?;

            match txn.commit() {
                Ok(()) => {
                    debug!(entity_type = entity_type, entity_id = entity_id, "Deleted entity");
                    return Ok(true);
                }
                Err(e) if is_conflict(&e) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(StorageError::Conflict(format!(
            "delete_entity {}/{} kept conflicting",
            entity_type, entity_id
        )))
    }

    /// Load up to `limit` entity ids of a type with ordering strictly after `after`.
    ///
    /// Returns `(ordering, entity_id)` pairs in ascending ordering.
    pub fn load_entity_ids(
        &self,
        entity_type: &str,
        after: Option<OrderingValue>,
        limit: usize,
    ) -> Result<Vec<(OrderingValue, String)>, StorageError> {
        let cf = self.cf(CF_ENTITIES)?;
        let prefix = EntityKey::type_prefix(entity_type)?;

        let start = match after {
            Some(value) => match value.next() {
                Some(next) => EntityKey::new(entity_type, next)?.to_bytes(),
                None => return Ok(Vec::new()),
            },
            None => prefix.clone(),
        };

        let mut results = Vec::new();
        if limit == 0 {
            return Ok(results);
        }

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let entity_key = EntityKey::from_bytes(&key)?;
            let record = EntityRecord::from_bytes(&value)?;
            results.push((entity_key.ordering, record.entity_id));
            if results.len() >= limit {
                break;
            }
        }

        Ok(results)
    }

    /// Count entity rows of one type.
    pub fn count_entities(&self, entity_type: &str) -> Result<usize, StorageError> {
        let cf = self.cf(CF_ENTITIES)?;
        let prefix = EntityKey::type_prefix(entity_type)?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));

        let mut count = 0;
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    // ==================== Session Methods ====================

    /// Get the current session of an entity type
    pub fn get_session(
        &self,
        entity_type: &str,
    ) -> Result<Option<EnqueueingSession>, StorageError> {
        let cf = self.cf(CF_SESSIONS)?;
        let key = SessionKey::new(entity_type)?;
        match self.db.get_cf(cf, key.to_bytes())? {
            Some(bytes) => Ok(Some(EnqueueingSession::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// List the current session of every entity type
    pub fn list_sessions(&self) -> Result<Vec<EnqueueingSession>, StorageError> {
        let cf = self.cf(CF_SESSIONS)?;
        let mut sessions = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            sessions.push(EnqueueingSession::from_bytes(&value)?);
        }
        Ok(sessions)
    }

    /// Start a new session for an entity type.
    ///
    /// If a runnable session already exists it is returned with `false`.
    /// Finished or stalled sessions are replaced; the new session's version
    /// continues from the replaced one so stale readers still conflict.
    pub fn start_session(
        &self,
        entity_type: &str,
    ) -> Result<(EnqueueingSession, bool), StorageError> {
        let cf = self.cf(CF_SESSIONS)?;
        let key = SessionKey::new(entity_type)?;

        for _ in 0..MAX_CONFLICT_RETRIES {
            let txn = self.db.transaction();

            let existing = match txn.get_for_update_cf(cf, key.to_bytes(), true)? {
                Some(bytes) => Some(EnqueueingSession::from_bytes(&bytes)?),
                None => None,
            };
            if let Some(current) = &existing {
                if current.is_runnable() {
                    return Ok((current.clone(), false));
                }
            }

            let mut session = EnqueueingSession::new(entity_type)?;
            session.version = existing.map(|s| s.version + 1).unwrap_or(0);
            txn.put_cf(cf, key.to_bytes(), session.to_bytes()?)?;

            match txn.commit() {
                Ok(()) => {
                    info!(
                        entity_type = entity_type,
                        session_id = %session.session_id,
                        "Started enqueueing session"
                    );
                    return Ok((session, true));
                }
                Err(e) if is_conflict(&e) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(StorageError::Conflict(format!(
            "start_session {} kept conflicting",
            entity_type
        )))
    }

    /// Persist an updated session together with its queue entries.
    ///
    /// The write only happens if the stored session is still the one with
    /// `expected_version`. Otherwise, or if another writer touched the
    /// session before commit, nothing is written and `Conflict` is returned.
    pub fn commit_session(
        &self,
        expected_version: u64,
        session: &EnqueueingSession,
        entries: &[QueueEntry],
    ) -> Result<SessionCommit, StorageError> {
        let sessions_cf = self.cf(CF_SESSIONS)?;
        let queue_cf = self.cf(CF_QUEUE)?;
        let key = SessionKey::new(&session.entity_type)?;

        let txn = self.db.transaction();

        let current = match txn.get_for_update_cf(sessions_cf, key.to_bytes(), true)? {
            Some(bytes) => EnqueueingSession::from_bytes(&bytes)?,
            None => return Ok(SessionCommit::Conflict),
        };
        if current.session_id != session.session_id || current.version != expected_version {
            debug!(
                entity_type = %session.entity_type,
                expected_version = expected_version,
                stored_version = current.version,
                "Session version mismatch"
            );
            return Ok(SessionCommit::Conflict);
        }

        txn.put_cf(sessions_cf, key.to_bytes(), session.to_bytes()?)?;

        let mut sequences = Vec::with_capacity(entries.len());
        for entry in entries {
            let queue_key = QueueKey::new(self.next_queue_sequence());
            txn.put_cf(queue_cf, queue_key.to_bytes(), entry.to_bytes()?)?;
            sequences.push(queue_key.sequence);
        }

        match txn.commit() {
            Ok(()) => Ok(SessionCommit::Committed { sequences }),
            Err(e) if is_conflict(&e) => {
                debug!(entity_type = %session.entity_type, "Session commit conflicted");
                Ok(SessionCommit::Conflict)
            }
            Err(e) => Err(e.into()),
        }
    }

    // ==================== Queue Methods ====================

    /// Append entries to the queue. Returns their sequence numbers.
    pub fn enqueue(&self, entries: &[QueueEntry]) -> Result<Vec<u64>, StorageError> {
        let cf = self.cf(CF_QUEUE)?;
        let txn = self.db.transaction();

        let mut sequences = Vec::with_capacity(entries.len());
        for entry in entries {
            let queue_key = QueueKey::new(self.next_queue_sequence());
            txn.put_cf(cf, queue_key.to_bytes(), entry.to_bytes()?)?;
            sequences.push(queue_key.sequence);
        }
        // Fresh keys only, so there is nothing to conflict with
        txn.commit()?;

        debug!(count = sequences.len(), "Enqueued entries");
        Ok(sequences)
    }

    /// Get queue entries starting from a sequence number, claimed or not.
    pub fn get_queue_entries(
        &self,
        start_sequence: u64,
        limit: usize,
    ) -> Result<Vec<(u64, QueueEntry)>, StorageError> {
        let cf = self.cf(CF_QUEUE)?;
        let start_key = QueueKey::new(start_sequence);
        let iter = self.db.iterator_cf(
            cf,
            IteratorMode::From(&start_key.to_bytes(), Direction::Forward),
        );

        let mut results = Vec::new();
        for item in iter.take(limit) {
            let (key, value) = item?;
            let queue_key = QueueKey::from_bytes(&key)?;
            results.push((queue_key.sequence, QueueEntry::from_bytes(&value)?));
        }
        Ok(results)
    }

    /// Claim up to `limit` claimable entries for `lease`.
    ///
    /// Claims are written in one optimistic transaction. If a concurrent
    /// drain claimed any of the same entries first, this returns an empty
    /// batch and the caller simply tries again on its next tick.
    pub fn claim_queue_entries(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<(u64, QueueEntry)>, StorageError> {
        let cf = self.cf(CF_QUEUE)?;

        let mut candidates = Vec::new();
        if limit == 0 {
            return Ok(candidates);
        }
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            match QueueEntry::from_bytes(&value) {
                Ok(entry) if entry.is_claimable(now) => candidates.push(key.to_vec()),
                Ok(_) => {}
                Err(e) => {
                    let key = String::from_utf8_lossy(&key);
                    warn!(key = %key, error = %e, "Skipping unreadable queue entry");
                }
            }
            if candidates.len() >= limit {
                break;
            }
        }

        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let txn = self.db.transaction();
        let mut claimed = Vec::with_capacity(candidates.len());
        for key in candidates {
            let Some(bytes) = txn.get_for_update_cf(cf, &key, true)? else {
                continue;
            };
            let mut entry = QueueEntry::from_bytes(&bytes)?;
            if !entry.is_claimable(now) {
                continue;
            }
            entry.claim(now, lease);
            txn.put_cf(cf, &key, entry.to_bytes()?)?;
            claimed.push((QueueKey::from_bytes(&key)?.sequence, entry));
        }

        match txn.commit() {
            Ok(()) => Ok(claimed),
            Err(e) if is_conflict(&e) => {
                debug!("Queue claim conflicted with another drain");
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Extend a held claim to `until`.
    ///
    /// Returns `false` if the claim was lost to another drain; the caller must
    /// then leave the entry alone.
    pub fn renew_queue_claim(
        &self,
        sequence: u64,
        claim_token: &str,
        until: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let cf = self.cf(CF_QUEUE)?;
        let key = QueueKey::new(sequence).to_bytes();
        let txn = self.db.transaction();
        let Some(mut entry) = held_entry(&txn, cf, &key, claim_token)? else {
            return Ok(claim_lost(sequence, "renew"));
        };
        entry.claimed_until = Some(until);
        txn.put_cf(cf, &key, entry.to_bytes()?)?;
        commit_held(txn, sequence, "renew")
    }

    /// Remove a processed entry if `claim_token` still holds it.
    pub fn complete_queue_entry(
        &self,
        sequence: u64,
        claim_token: &str,
    ) -> Result<bool, StorageError> {
        let cf = self.cf(CF_QUEUE)?;
        let key = QueueKey::new(sequence).to_bytes();
        let txn = self.db.transaction();
        if held_entry(&txn, cf, &key, claim_token)?.is_none() {
            return Ok(claim_lost(sequence, "complete"));
        }
        txn.delete_cf(cf, &key)?;
        commit_held(txn, sequence, "complete")
    }

    /// Write back a claimed entry (e.g. after a failed attempt) if
    /// `claim_token` still holds it.
    pub fn release_queue_entry(
        &self,
        sequence: u64,
        claim_token: &str,
        entry: &QueueEntry,
    ) -> Result<bool, StorageError> {
        let cf = self.cf(CF_QUEUE)?;
        let key = QueueKey::new(sequence).to_bytes();
        let txn = self.db.transaction();
        if held_entry(&txn, cf, &key, claim_token)?.is_none() {
            return Ok(claim_lost(sequence, "release"));
        }
        txn.put_cf(cf, &key, entry.to_bytes()?)?;
        commit_held(txn, sequence, "release")
    }

    /// Move a claimed queue entry to the dead letters in one write.
    ///
    /// Returns `None` if `claim_token` no longer holds the entry.
    pub fn dead_letter_queue_entry(
        &self,
        sequence: u64,
        claim_token: &str,
        entry: &QueueEntry,
        error: &str,
    ) -> Result<Option<DeadLetter>, StorageError> {
        let queue_cf = self.cf(CF_QUEUE)?;
        let dead_cf = self.cf(CF_DEAD_LETTERS)?;
        let queue_key = QueueKey::new(sequence).to_bytes();

        let txn = self.db.transaction();
        if held_entry(&txn, queue_cf, &queue_key, claim_token)?.is_none() {
            claim_lost(sequence, "dead-letter");
            return Ok(None);
        }

        let key = DeadLetterKey::new();
        let dead_letter = DeadLetter {
            id: key.id.to_string(),
            sequence,
            entry: entry.clone(),
            error: error.to_string(),
            failed_at: Utc::now(),
        };
        txn.delete_cf(queue_cf, &queue_key)?;
        txn.put_cf(dead_cf, key.to_bytes(), dead_letter.to_bytes()?)?;

        Ok(commit_held(txn, sequence, "dead-letter")?.then_some(dead_letter))
    }

    /// Number of entries in the queue, claimed or not.
    pub fn queue_len(&self) -> Result<usize, StorageError> {
        self.count_cf(CF_QUEUE)
    }

    /// List dead letters, oldest first.
    pub fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, StorageError> {
        let cf = self.cf(CF_DEAD_LETTERS)?;
        let mut results = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start).take(limit) {
            let (_, value) = item?;
            results.push(DeadLetter::from_bytes(&value)?);
        }
        Ok(results)
    }

    /// Put a dead letter back on the queue with a fresh attempt budget.
    ///
    /// Returns the new queue sequence, or `None` if no such dead letter exists.
    pub fn requeue_dead_letter(&self, id: &str) -> Result<Option<u64>, StorageError> {
        let queue_cf = self.cf(CF_QUEUE)?;
        let dead_cf = self.cf(CF_DEAD_LETTERS)?;
        let key = DeadLetterKey::from_id(id)?;

        let txn = self.db.transaction();
        let Some(bytes) = txn.get_for_update_cf(dead_cf, key.to_bytes(), true)? else {
            return Ok(None);
        };
        let dead_letter = DeadLetter::from_bytes(&bytes)?;
        let entry = QueueEntry::new(dead_letter.entry.entity, dead_letter.entry.operation);

        let queue_key = QueueKey::new(self.next_queue_sequence());
        txn.delete_cf(dead_cf, key.to_bytes())?;
        txn.put_cf(queue_cf, queue_key.to_bytes(), entry.to_bytes()?)?;
        txn.commit()?;

        Ok(Some(queue_key.sequence))
    }

    /// Delete all dead letters. Returns how many were removed.
    pub fn purge_dead_letters(&self) -> Result<usize, StorageError> {
        let cf = self.cf(CF_DEAD_LETTERS)?;
        let txn = self.db.transaction();
        let mut count = 0;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            txn.delete_cf(cf, &key)?;
            count += 1;
        }
        if count > 0 {
            txn.commit()?;
            info!(count = count, "Purged dead letters");
        }
        Ok(count)
    }

    // ==================== Document Methods ====================

    /// Store an indexed document, replacing any previous version
    pub fn put_document(&self, document: &IndexedDocument) -> Result<(), StorageError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let key = DocumentKey::new(&document.entity.entity_type, &document.entity.entity_id)?;
        let txn = self.db.transaction();
        txn.put_cf(cf, key.to_bytes(), document.to_bytes()?)?;
        txn.commit()?;
        Ok(())
    }

    /// Get an indexed document
    pub fn get_document(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<IndexedDocument>, StorageError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let key = DocumentKey::new(entity_type, entity_id)?;
        match self.db.get_cf(cf, key.to_bytes())? {
            Some(bytes) => Ok(Some(IndexedDocument::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Remove an indexed document. Returns false if it was not present.
    pub fn delete_document(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<bool, StorageError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let key = DocumentKey::new(entity_type, entity_id)?;
        let txn = self.db.transaction();
        let existed = txn.get_for_update_cf(cf, key.to_bytes(), true)?.is_some();
        if existed {
            txn.delete_cf(cf, key.to_bytes())?;
            txn.commit()?;
        }
        Ok(existed)
    }

    // ==================== Maintenance ====================

    /// Flush all column families to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        for cf_name in ALL_CF_NAMES {
            if let Some(cf) = self.db.cf_handle(cf_name) {
                self.db.flush_cf(cf)?;
            }
        }
        Ok(())
    }

    fn count_cf(&self, cf_name: &str) -> Result<usize, StorageError> {
        let cf = self.cf(cf_name)?;
        let mut count = 0;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    /// Get record counts for status reporting.
    pub fn get_stats(&self) -> Result<StorageStats, StorageError> {
        let now = Utc::now();
        let mut claimed_count = 0;
        let queue_cf = self.cf(CF_QUEUE)?;
        for item in self.db.iterator_cf(queue_cf, IteratorMode::Start) {
            let (_, value) = item?;
            if let Ok(entry) = QueueEntry::from_bytes(&value) {
                if !entry.is_claimable(now) {
                    claimed_count += 1;
                }
            }
        }

        Ok(StorageStats {
            entity_count: self.count_cf(CF_ENTITIES)?,
            session_count: self.count_cf(CF_SESSIONS)?,
            queue_len: self.count_cf(CF_QUEUE)?,
            claimed_count,
            dead_letter_count: self.count_cf(CF_DEAD_LETTERS)?,
            document_count: self.count_cf(CF_DOCUMENTS)?,
        })
    }
}

/// Record counts across column families.
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub entity_count: usize,
    pub session_count: usize,
    pub queue_len: usize,
    /// Queue entries currently leased or backing off
    pub claimed_count: usize,
    pub dead_letter_count: usize,
    pub document_count: usize,
}

/// Read a queue entry for update, returning it only if `claim_token` holds it.
fn held_entry(
    txn: &Transaction<'_, OptimisticTransactionDB>,
    cf: &ColumnFamily,
    key: &[u8],
    claim_token: &str,
) -> Result<Option<QueueEntry>, StorageError> {
    let Some(bytes) = txn.get_for_update_cf(cf, key, true)? else {
        return Ok(None);
    };
    let entry = QueueEntry::from_bytes(&bytes)?;
    Ok(entry.is_claimed_by(claim_token).then_some(entry))
}

/// Commit a claim-checked write. A conflict means another drain touched
/// the entry in between, which is a lost claim as well.
fn commit_held(
    txn: Transaction<'_, OptimisticTransactionDB>,
    sequence: u64,
    action: &str,
) -> Result<bool, StorageError> {
    match txn.commit() {
        Ok(()) => Ok(true),
        Err(e) if is_conflict(&e) => Ok(claim_lost(sequence, action)),
        Err(e) => Err(e.into()),
    }
}

fn claim_lost(sequence: u64, action: &str) -> bool {
    debug!(sequence = sequence, action = action, "Queue claim lost, leaving entry alone");
    false
}

fn encode_ordering(value: OrderingValue) -> Vec<u8> {
    value.get().to_string().into_bytes()
}

fn decode_ordering(bytes: &[u8]) -> Result<OrderingValue, StorageError> {
    let s = std::str::from_utf8(bytes)
        .map_err(|e| StorageError::Key(format!("Invalid UTF-8: {}", e)))?;
    s.parse::<u64>()
        .map(OrderingValue)
        .map_err(|e| StorageError::Key(format!("Invalid ordering value: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexq_types::{IndexingOperation, SessionStatus};
    use tempfile::TempDir;

    fn create_test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::open(temp_dir.path()).unwrap();
        (storage, temp_dir)
    }

    #[test]
    fn test_put_entity_assigns_increasing_ordering() {
        let (storage, _temp) = create_test_storage();

        let a = storage.put_entity("customer", "c-1", serde_json::json!({"n": 1})).unwrap();
        let b = storage.put_entity("order", "o-1", serde_json::json!({})).unwrap();
        let c = storage.put_entity("customer", "c-2", serde_json::json!({"n": 2})).unwrap();

        assert!(a < b && b < c);
        assert_eq!(a, OrderingValue(1));
    }

    #[test]
    fn test_update_keeps_ordering_and_enqueues() {
        let (storage, _temp) = create_test_storage();

        let first = storage.put_entity("customer", "c-1", serde_json::json!({"v": 1})).unwrap();
        let second = storage.put_entity("customer", "c-1", serde_json::json!({"v": 2})).unwrap();
        assert_eq!(first, second);

        let record = storage.get_entity("customer", "c-1").unwrap().unwrap();
        assert_eq!(record.document["v"], 2);
        assert_eq!(storage.count_entities("customer").unwrap(), 1);

        // One index entry per write
        let entries = storage.get_queue_entries(0, 10).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries
            .iter()
            .all(|(_, e)| e.operation == IndexingOperation::Index));
    }

    #[test]
    fn test_delete_entity_enqueues_delete() {
        let (storage, _temp) = create_test_storage();
        storage.put_entity("customer", "c-1", serde_json::json!({})).unwrap();

        assert!(storage.delete_entity("customer", "c-1").unwrap());
        assert!(storage.get_entity("customer", "c-1").unwrap().is_none());
        assert!(!storage.delete_entity("customer", "c-1").unwrap());

        let entries = storage.get_queue_entries(0, 10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].1.operation, IndexingOperation::Delete);
    }

    #[test]
    fn test_load_entity_ids_is_ordered_and_bounded() {
        let (storage, _temp) = create_test_storage();
        for i in 0..5 {
            storage
                .put_entity("customer", &format!("c-{}", i), serde_json::json!({}))
                .unwrap();
            storage
                .put_entity("customer_note", &format!("n-{}", i), serde_json::json!({}))
                .unwrap();
        }

        let first = storage.load_entity_ids("customer", None, 3).unwrap();
        let ids: Vec<_> = first.iter().map(|(_, id)| id.as_str()).collect();
        assert_eq!(ids, vec!["c-0", "c-1", "c-2"]);

        let rest = storage
            .load_entity_ids("customer", Some(first[2].0), 3)
            .unwrap();
        let ids: Vec<_> = rest.iter().map(|(_, id)| id.as_str()).collect();
        assert_eq!(ids, vec!["c-3", "c-4"]);

        let none = storage
            .load_entity_ids("customer", Some(rest[1].0), 3)
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_start_session_returns_existing_runnable() {
        let (storage, _temp) = create_test_storage();

        let (session, created) = storage.start_session("customer").unwrap();
        assert!(created);
        assert_eq!(session.status, SessionStatus::Created);

        let (again, created) = storage.start_session("customer").unwrap();
        assert!(!created);
        assert_eq!(again.session_id, session.session_id);
    }

    #[test]
    fn test_start_session_replaces_finished() {
        let (storage, _temp) = create_test_storage();
        let (mut session, _) = storage.start_session("customer").unwrap();

        let expected = session.version;
        session.finish().unwrap();
        let outcome = storage.commit_session(expected, &session, &[]).unwrap();
        assert!(matches!(outcome, SessionCommit::Committed { .. }));

        let (fresh, created) = storage.start_session("customer").unwrap();
        assert!(created);
        assert_ne!(fresh.session_id, session.session_id);
        assert_eq!(fresh.status, SessionStatus::Created);
        assert!(fresh.version > session.version);
    }

    #[test]
    fn test_commit_session_writes_entries_atomically() {
        let (storage, _temp) = create_test_storage();
        let (mut session, _) = storage.start_session("customer").unwrap();

        let expected = session.version;
        session.advance(OrderingValue(2), 2).unwrap();
        let entries = vec![
            QueueEntry::index(EntityRef::new("customer", "c-1")),
            QueueEntry::index(EntityRef::new("customer", "c-2")),
        ];
        let outcome = storage.commit_session(expected, &session, &entries).unwrap();

        match outcome {
            SessionCommit::Committed { sequences } => assert_eq!(sequences.len(), 2),
            SessionCommit::Conflict => panic!("unexpected conflict"),
        }
        assert_eq!(storage.queue_len().unwrap(), 2);

        let stored = storage.get_session("customer").unwrap().unwrap();
        assert_eq!(stored.last_ordering_value, Some(OrderingValue(2)));
        assert_eq!(stored.version, session.version);
    }

    #[test]
    fn test_commit_session_stale_version_conflicts() {
        let (storage, _temp) = create_test_storage();
        let (session, _) = storage.start_session("customer").unwrap();

        let mut first = session.clone();
        first.advance(OrderingValue(1), 1).unwrap();
        let entry = [QueueEntry::index(EntityRef::new("customer", "c-1"))];
        assert!(matches!(
            storage.commit_session(session.version, &first, &entry).unwrap(),
            SessionCommit::Committed { .. }
        ));

        // Second writer read the same version
        let mut second = session.clone();
        second.advance(OrderingValue(1), 1).unwrap();
        assert_eq!(
            storage.commit_session(session.version, &second, &entry).unwrap(),
            SessionCommit::Conflict
        );
        assert_eq!(storage.queue_len().unwrap(), 1);
    }

    #[test]
    fn test_claim_hides_entries_until_lease_expires() {
        let (storage, _temp) = create_test_storage();
        let entries: Vec<_> = (0..5)
            .map(|i| QueueEntry::index(EntityRef::new("customer", format!("c-{}", i))))
            .collect();
        storage.enqueue(&entries).unwrap();

        let now = Utc::now();
        let lease = Duration::seconds(60);
        let first = storage.claim_queue_entries(3, now, lease).unwrap();
        assert_eq!(first.len(), 3);

        let second = storage.claim_queue_entries(10, now, lease).unwrap();
        assert_eq!(second.len(), 2);

        assert!(storage.claim_queue_entries(10, now, lease).unwrap().is_empty());

        let later = now + Duration::seconds(61);
        assert_eq!(storage.claim_queue_entries(10, later, lease).unwrap().len(), 5);
    }

    fn token(entry: &QueueEntry) -> String {
        entry.claim_token.clone().unwrap()
    }

    #[test]
    fn test_complete_release_and_dead_letter() {
        let (storage, _temp) = create_test_storage();
        let entries: Vec<_> = (0..3)
            .map(|i| QueueEntry::index(EntityRef::new("customer", format!("c-{}", i))))
            .collect();
        storage.enqueue(&entries).unwrap();

        let now = Utc::now();
        let claimed = storage
            .claim_queue_entries(10, now, Duration::seconds(60))
            .unwrap();
        assert_eq!(claimed.len(), 3);

        assert!(storage
            .complete_queue_entry(claimed[0].0, &token(&claimed[0].1))
            .unwrap());

        let (seq, mut entry) = claimed[1].clone();
        let held = token(&entry);
        entry.record_failure("boom", now, Duration::zero());
        assert!(storage.release_queue_entry(seq, &held, &entry).unwrap());

        let (seq, entry) = claimed[2].clone();
        let dead = storage
            .dead_letter_queue_entry(seq, &token(&entry), &entry, "poison")
            .unwrap()
            .unwrap();
        assert_eq!(dead.error, "poison");

        assert_eq!(storage.queue_len().unwrap(), 1);
        let remaining = storage.get_queue_entries(0, 10).unwrap();
        assert_eq!(remaining[0].1.attempts, 1);
        assert!(remaining[0].1.is_claimable(now));
        assert!(remaining[0].1.claim_token.is_none());

        let dead_letters = storage.list_dead_letters(10).unwrap();
        assert_eq!(dead_letters.len(), 1);
        assert_eq!(dead_letters[0].entry.entity.entity_id, "c-2");
    }

    #[test]
    fn test_stale_claim_cannot_settle_entry() {
        let (storage, _temp) = create_test_storage();
        storage
            .enqueue(&[QueueEntry::index(EntityRef::new("customer", "c-1"))])
            .unwrap();

        let now = Utc::now();
        let lease = Duration::seconds(60);
        let (seq, stale) = storage.claim_queue_entries(1, now, lease).unwrap().remove(0);
        let (_, fresh) = storage
            .claim_queue_entries(1, now + Duration::seconds(61), lease)
            .unwrap()
            .remove(0);

        // The expired holder can no longer touch the entry
        let mut failed = stale.clone();
        failed.record_failure("timed out", now, Duration::zero());
        assert!(!storage.release_queue_entry(seq, &token(&stale), &failed).unwrap());
        assert!(!storage.complete_queue_entry(seq, &token(&stale)).unwrap());
        assert!(!storage
            .renew_queue_claim(seq, &token(&stale), now + Duration::seconds(600))
            .unwrap());
        assert!(storage
            .dead_letter_queue_entry(seq, &token(&stale), &failed, "timed out")
            .unwrap()
            .is_none());
        assert_eq!(storage.queue_len().unwrap(), 1);
        assert!(storage.list_dead_letters(10).unwrap().is_empty());

        // The current holder completes, and a late release does not resurrect it
        assert!(storage.complete_queue_entry(seq, &token(&fresh)).unwrap());
        assert!(!storage.release_queue_entry(seq, &token(&stale), &failed).unwrap());
        assert_eq!(storage.queue_len().unwrap(), 0);
    }

    #[test]
    fn test_renew_extends_lease() {
        let (storage, _temp) = create_test_storage();
        storage
            .enqueue(&[QueueEntry::index(EntityRef::new("customer", "c-1"))])
            .unwrap();

        let now = Utc::now();
        let (seq, entry) = storage
            .claim_queue_entries(1, now, Duration::seconds(60))
            .unwrap()
            .remove(0);
        assert!(storage
            .renew_queue_claim(seq, &token(&entry), now + Duration::seconds(600))
            .unwrap());

        let later = now + Duration::seconds(120);
        assert!(storage
            .claim_queue_entries(1, later, Duration::seconds(60))
            .unwrap()
            .is_empty());
        assert!(storage.complete_queue_entry(seq, &token(&entry)).unwrap());
    }

    #[test]
    fn test_requeue_and_purge_dead_letters() {
        let (storage, _temp) = create_test_storage();
        storage
            .enqueue(&[QueueEntry::index(EntityRef::new("customer", "c-1"))])
            .unwrap();
        let lease = Duration::seconds(60);
        let (seq, entry) = storage
            .claim_queue_entries(1, Utc::now(), lease)
            .unwrap()
            .remove(0);
        let dead = storage
            .dead_letter_queue_entry(seq, &token(&entry), &entry, "poison")
            .unwrap()
            .unwrap();
        assert_eq!(storage.queue_len().unwrap(), 0);

        let new_seq = storage.requeue_dead_letter(&dead.id).unwrap();
        assert!(new_seq.is_some());
        assert_eq!(storage.queue_len().unwrap(), 1);
        assert!(storage.list_dead_letters(10).unwrap().is_empty());
        assert!(storage.requeue_dead_letter(&dead.id).unwrap().is_none());

        let (seq, entry) = storage
            .claim_queue_entries(1, Utc::now(), lease)
            .unwrap()
            .remove(0);
        assert_eq!(entry.attempts, 0);
        storage
            .dead_letter_queue_entry(seq, &token(&entry), &entry, "again")
            .unwrap();
        assert_eq!(storage.purge_dead_letters().unwrap(), 1);
        assert_eq!(storage.purge_dead_letters().unwrap(), 0);
    }

    #[test]
    fn test_queue_sequence_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let storage = Storage::open(temp_dir.path()).unwrap();
            storage
                .enqueue(&[QueueEntry::index(EntityRef::new("customer", "c-1"))])
                .unwrap();
        }
        let storage = Storage::open(temp_dir.path()).unwrap();
        let seqs = storage
            .enqueue(&[QueueEntry::index(EntityRef::new("customer", "c-2"))])
            .unwrap();
        assert_eq!(seqs, vec![1]);
    }

    #[test]
    fn test_documents() {
        let (storage, _temp) = create_test_storage();
        let doc = IndexedDocument {
            entity: EntityRef::new("customer", "c-1"),
            document: serde_json::json!({"name": "Ada"}),
            indexed_at: Utc::now(),
        };
        storage.put_document(&doc).unwrap();

        let loaded = storage.get_document("customer", "c-1").unwrap().unwrap();
        assert_eq!(loaded.document["name"], "Ada");

        assert!(storage.delete_document("customer", "c-1").unwrap());
        assert!(!storage.delete_document("customer", "c-1").unwrap());
    }

    #[test]
    fn test_stats() {
        let (storage, _temp) = create_test_storage();
        storage.put_entity("customer", "c-1", serde_json::json!({})).unwrap();
        storage.start_session("customer").unwrap();

        let stats = storage.get_stats().unwrap();
        assert_eq!(stats.entity_count, 1);
        assert_eq!(stats.session_count, 1);
        assert_eq!(stats.queue_len, 1);
        assert_eq!(stats.claimed_count, 0);
        assert_eq!(stats.dead_letter_count, 0);
    }
}
