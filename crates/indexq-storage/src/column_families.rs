//! Column family definitions for RocksDB.
//!
//! Each column family isolates data with different access patterns:
//! - entities: application rows ordered by loading key
//! - entity_ids: entity id -> ordering value lookups
//! - sessions: current enqueueing session per entity type
//! - queue: pending indexing work, in sequence order
//! - dead_letters: queue entries that exhausted their attempts
//! - documents: output of the local document indexer
//! - meta: persisted counters

use rocksdb::{ColumnFamilyDescriptor, Options};

/// Column family name for entity rows
pub const CF_ENTITIES: &str = "entities";

/// Column family name for entity id lookups
pub const CF_ENTITY_IDS: &str = "entity_ids";

/// Column family name for enqueueing sessions
pub const CF_SESSIONS: &str = "sessions";

/// Column family name for the indexing queue
pub const CF_QUEUE: &str = "queue";

/// Column family name for dead-lettered queue entries
pub const CF_DEAD_LETTERS: &str = "dead_letters";

/// Column family name for indexed documents
pub const CF_DOCUMENTS: &str = "documents";

/// Column family name for counters
pub const CF_META: &str = "meta";

/// All column family names
pub const ALL_CF_NAMES: &[&str] = &[
    CF_ENTITIES,
    CF_ENTITY_IDS,
    CF_SESSIONS,
    CF_QUEUE,
    CF_DEAD_LETTERS,
    CF_DOCUMENTS,
    CF_META,
];

/// Entity rows and documents are the bulk of the data
fn compressed_options() -> Options {
    let mut opts = Options::default();
    opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
    opts
}

/// Build all column family descriptors
pub fn build_cf_descriptors() -> Vec<ColumnFamilyDescriptor> {
    vec![
        ColumnFamilyDescriptor::new(CF_ENTITIES, compressed_options()),
        ColumnFamilyDescriptor::new(CF_ENTITY_IDS, Options::default()),
        ColumnFamilyDescriptor::new(CF_SESSIONS, Options::default()),
        ColumnFamilyDescriptor::new(CF_QUEUE, Options::default()),
        ColumnFamilyDescriptor::new(CF_DEAD_LETTERS, Options::default()),
        ColumnFamilyDescriptor::new(CF_DOCUMENTS, compressed_options()),
        ColumnFamilyDescriptor::new(CF_META, Options::default()),
    ]
}
