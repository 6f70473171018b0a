//! Per-component error kinds, aggregated into [`CoreError`].
//!
//! Mirrors the teacher's own storage/scanning error shape: a plain
//! `#[derive(Debug)]` enum, a hand-written `Display`, and a bare
//! `impl std::error::Error` marker. No `thiserror`/`anyhow`.

use std::fmt;

/// Failure deriving or comparing a [`crate::pathid::PathId`].
#[derive(Debug)]
pub enum PathIdError {
    Empty,
    OutsideRoot,
    DotDotSegment,
}

impl fmt::Display for PathIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathIdError::Empty => write!(f, "path is empty"),
            PathIdError::OutsideRoot => write!(f, "path escapes the synchronized root"),
            PathIdError::DotDotSegment => write!(f, "path contains a `..` segment"),
        }
    }
}

impl std::error::Error for PathIdError {}

/// Failure computing an MD5 digest.
#[derive(Debug)]
pub enum ChecksumError {
    Missing,
    Busy,
    Io(std::io::Error),
}

impl fmt::Display for ChecksumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumError::Missing => write!(f, "file no longer exists"),
            ChecksumError::Busy => write!(f, "file locked by another writer"),
            ChecksumError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for ChecksumError {}

impl From<std::io::Error> for ChecksumError {
    fn from(err: std::io::Error) -> Self {
        ChecksumError::Io(err)
    }
}

/// Failure in the metadata store.
#[derive(Debug)]
pub enum MetaStoreError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
    /// A `put` collided with a distinct live document at the same id.
    IdCollision,
    /// An integrity check failed; the store must not be trusted further.
    Corrupt(String),
}

impl fmt::Display for MetaStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaStoreError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            MetaStoreError::Io(e) => write!(f, "I/O error: {e}"),
            MetaStoreError::IdCollision => write!(f, "id collides with a distinct live document"),
            MetaStoreError::Corrupt(detail) => write!(f, "metadata store corrupt: {detail}"),
        }
    }
}

impl std::error::Error for MetaStoreError {}

impl From<rusqlite::Error> for MetaStoreError {
    fn from(err: rusqlite::Error) -> Self {
        MetaStoreError::Sqlite(err)
    }
}

impl From<std::io::Error> for MetaStoreError {
    fn from(err: std::io::Error) -> Self {
        MetaStoreError::Io(err)
    }
}

/// Failure classifying a raw event/remote-doc into a [`crate::document::Change`].
#[derive(Debug)]
pub enum ChangeBuilderError {
    InvalidPath(PathIdError),
    Store(MetaStoreError),
}

impl fmt::Display for ChangeBuilderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeBuilderError::InvalidPath(e) => write!(f, "invalid path: {e}"),
            ChangeBuilderError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for ChangeBuilderError {}

impl From<MetaStoreError> for ChangeBuilderError {
    fn from(err: MetaStoreError) -> Self {
        ChangeBuilderError::Store(err)
    }
}

/// Failure applying a [`crate::document::Change`] in [`crate::merge::Merge`].
#[derive(Debug)]
pub enum MergeError {
    Store(MetaStoreError),
    /// Update or move would collapse a file onto a folder (or vice versa).
    KindConflict,
    /// Fatal: repeated kind conflict with no renamable form.
    Fatal(String),
}

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeError::Store(e) => write!(f, "store error: {e}"),
            MergeError::KindConflict => write!(f, "kind conflict between file and folder"),
            MergeError::Fatal(detail) => write!(f, "fatal merge error: {detail}"),
        }
    }
}

impl std::error::Error for MergeError {}

impl From<MetaStoreError> for MergeError {
    fn from(err: MetaStoreError) -> Self {
        MergeError::Store(err)
    }
}

impl From<PathIdError> for MergeError {
    fn from(err: PathIdError) -> Self {
        MergeError::Fatal(err.to_string())
    }
}

impl From<PathIdError> for ChangeBuilderError {
    fn from(err: PathIdError) -> Self {
        ChangeBuilderError::InvalidPath(err)
    }
}

/// Failure replaying a prep call against the opposite-side writer.
#[derive(Debug)]
pub enum SyncError {
    Transient(String),
    Permanent(String),
    Conflict(String),
    Store(MetaStoreError),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Transient(detail) => write!(f, "transient failure: {detail}"),
            SyncError::Permanent(detail) => write!(f, "permanent failure: {detail}"),
            SyncError::Conflict(detail) => write!(f, "conflict: {detail}"),
            SyncError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<MetaStoreError> for SyncError {
    fn from(err: MetaStoreError) -> Self {
        SyncError::Store(err)
    }
}

impl From<MergeError> for SyncError {
    fn from(err: MergeError) -> Self {
        match err {
            MergeError::Store(e) => SyncError::Store(e),
            MergeError::KindConflict => SyncError::Conflict(err.to_string()),
            MergeError::Fatal(detail) => SyncError::Permanent(detail),
        }
    }
}

/// Top-level classification a caller can match on without caring which
/// component raised the error: retryable, fatal, or a conflict needing a
/// targeted resync. Mirrors the semantic error classes in the design notes.
#[derive(Debug)]
pub enum CoreError {
    PathId(PathIdError),
    Checksum(ChecksumError),
    Store(MetaStoreError),
    ChangeBuilder(ChangeBuilderError),
    Merge(MergeError),
    Sync(SyncError),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::PathId(e) => write!(f, "{e}"),
            CoreError::Checksum(e) => write!(f, "{e}"),
            CoreError::Store(e) => write!(f, "{e}"),
            CoreError::ChangeBuilder(e) => write!(f, "{e}"),
            CoreError::Merge(e) => write!(f, "{e}"),
            CoreError::Sync(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<PathIdError> for CoreError {
    fn from(err: PathIdError) -> Self {
        CoreError::PathId(err)
    }
}

impl From<ChecksumError> for CoreError {
    fn from(err: ChecksumError) -> Self {
        CoreError::Checksum(err)
    }
}

impl From<MetaStoreError> for CoreError {
    fn from(err: MetaStoreError) -> Self {
        CoreError::Store(err)
    }
}

impl From<ChangeBuilderError> for CoreError {
    fn from(err: ChangeBuilderError) -> Self {
        CoreError::ChangeBuilder(err)
    }
}

impl From<MergeError> for CoreError {
    fn from(err: MergeError) -> Self {
        CoreError::Merge(err)
    }
}

impl From<SyncError> for CoreError {
    fn from(err: SyncError) -> Self {
        CoreError::Sync(err)
    }
}

/// Whether a [`CoreError`] should be retried, treated as fatal, or resolved
/// by resyncing the affected document from the opposite side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
    Conflict,
    Fatal,
}

impl CoreError {
    pub fn classify(&self) -> ErrorClass {
        match self {
            CoreError::Store(MetaStoreError::Corrupt(_)) => ErrorClass::Fatal,
            CoreError::Merge(MergeError::Fatal(_)) => ErrorClass::Fatal,
            CoreError::Sync(SyncError::Conflict(_)) => ErrorClass::Conflict,
            CoreError::Sync(SyncError::Permanent(_)) => ErrorClass::Permanent,
            CoreError::Sync(SyncError::Transient(_)) => ErrorClass::Transient,
            CoreError::Checksum(ChecksumError::Busy) => ErrorClass::Transient,
            CoreError::Checksum(ChecksumError::Missing) => ErrorClass::Permanent,
            CoreError::Merge(MergeError::KindConflict) => ErrorClass::Conflict,
            _ => ErrorClass::Permanent,
        }
    }
}
