//! Key-ordered document store keyed by [`PathId`] (spec §4.3).

pub mod sqlite;

use crate::document::Document;
use crate::error::MetaStoreError;
use crate::pathid::PathId;

pub use sqlite::SqliteMetaStore;

/// Held while an advisory lock is acquired; releases on drop.
pub trait ReleaseHandle: Send {}

/// Capability surface the CORE consumes for persisted document storage.
/// Implementations must serialize `put`/`bulk_put` against each other (the
/// teacher's single-writer-thread pattern is the reference implementation,
/// see [`sqlite::SqliteMetaStore`]) but may serve `get`/`scan_prefix`
/// concurrently with writes.
pub trait MetaStore: Send + Sync {
    fn get(&self, id: &PathId) -> Result<Option<Document>, MetaStoreError>;

    /// Single write. Fails with [`MetaStoreError::IdCollision`] if `doc.id`
    /// already names a distinct live document (different `path` folding to
    /// the same `PathId`).
    fn put(&self, doc: &Document) -> Result<(), MetaStoreError>;

    /// Atomic multi-document write: either every document lands, or none
    /// does. Used for move source+target pairs and recursive deletes.
    fn bulk_put(&self, docs: &[Document]) -> Result<(), MetaStoreError>;

    /// Every live document whose `PathId` lies under `prefix`, in key order.
    fn scan_prefix(&self, prefix: &PathId) -> Result<Vec<Document>, MetaStoreError>;

    fn lookup_by_remote_id(&self, remote_id: &str) -> Result<Option<Document>, MetaStoreError>;

    fn lookup_by_inode(&self, ino: u64) -> Result<Option<Document>, MetaStoreError>;

    /// Acquire the single process-wide advisory lock named `name`. Blocks
    /// until available. Used by [`crate::move_detector::MoveDetector`] to
    /// keep Merge from mutating documents while a deleted-inode history
    /// walk is in progress.
    fn lock(&self, name: &str) -> Result<Box<dyn ReleaseHandle>, MetaStoreError>;

    fn remote_seq_get(&self) -> Result<Option<i64>, MetaStoreError>;

    fn remote_seq_set(&self, seq: i64) -> Result<(), MetaStoreError>;
}
