//! External capabilities the CORE consumes but does not implement (spec §6),
//! plus the [`PrepCall`] actions [`crate::merge::Merge`] emits for
//! [`crate::sync::Sync`] to replay.

use crate::document::Document;

#[derive(Debug, Clone)]
pub struct RemoteDoc {
    pub id: String,
    pub rev: String,
    pub kind: crate::document::Kind,
    pub dir_id: String,
    pub name: String,
    pub path: String,
    pub updated_at: i64,
    pub md5sum: Option<[u8; 16]>,
    pub tags: Vec<String>,
    pub size: Option<u64>,
    pub mime: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RemoteDeletion {
    pub id: String,
    pub rev: String,
}

#[derive(Debug, Clone)]
pub enum RemoteChange {
    Doc(RemoteDoc),
    Deletion(RemoteDeletion),
}

pub struct RemoteFeedPage {
    pub last_seq: i64,
    pub docs: Vec<RemoteChange>,
}

/// Consumed iterator over the remote change feed.
pub trait RemoteFeed: Send {
    fn changes(&mut self, since: i64) -> Result<RemoteFeedPage, crate::error::SyncError>;
}

/// Post-write metadata a writer hands back after performing an operation —
/// the authoritative state to persist via `markSide`.
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub remote_id: Option<String>,
    pub remote_rev: Option<String>,
    pub updated_at: i64,
    pub md5sum: Option<[u8; 16]>,
    pub size: Option<u64>,
}

/// `RemoteWriter` / `LocalWriter` (spec §6): applies a reconciled operation
/// to one side, returning authoritative post-write metadata.
pub trait SideWriter: Send + Sync {
    fn add_file(&self, doc: &Document) -> Result<WriteOutcome, crate::error::SyncError>;
    fn update_file(&self, doc: &Document) -> Result<WriteOutcome, crate::error::SyncError>;
    fn move_file(&self, doc: &Document, was: &Document) -> Result<WriteOutcome, crate::error::SyncError>;
    fn trash_file(&self, doc: &Document) -> Result<WriteOutcome, crate::error::SyncError>;
    fn delete_file(&self, doc: &Document) -> Result<(), crate::error::SyncError>;
    fn add_dir(&self, doc: &Document) -> Result<WriteOutcome, crate::error::SyncError>;
    fn move_dir(&self, doc: &Document, was: &Document) -> Result<WriteOutcome, crate::error::SyncError>;
    fn trash_dir(&self, doc: &Document) -> Result<WriteOutcome, crate::error::SyncError>;
    fn delete_dir(&self, doc: &Document) -> Result<(), crate::error::SyncError>;
}

/// The externally observable operation Merge emits — the unit of assertion
/// for tests, and what Sync actually replays against the opposite writer.
#[derive(Debug, Clone)]
pub enum PrepCall {
    AddFile(Document),
    UpdateFile(Document),
    MoveFile { doc: Document, was: Document },
    TrashFile(Document),
    DeleteFile(Document),
    AddDir(Document),
    MoveDir { doc: Document, was: Document },
    TrashDir(Document),
    DeleteDir(Document),
}

impl PrepCall {
    pub fn target(&self) -> &Document {
        match self {
            PrepCall::AddFile(d)
            | PrepCall::UpdateFile(d)
            | PrepCall::TrashFile(d)
            | PrepCall::DeleteFile(d)
            | PrepCall::AddDir(d)
            | PrepCall::TrashDir(d)
            | PrepCall::DeleteDir(d) => d,
            PrepCall::MoveFile { doc, .. } | PrepCall::MoveDir { doc, .. } => doc,
        }
    }
}

/// User-visible outputs to an external orchestrator (spec §6). The CORE
/// only produces these; routing them to a GUI/CLI is out of scope.
#[derive(Debug, Clone)]
pub enum UserVisibleOutput {
    Progress { file: String, transferred: u64, total: u64 },
    UserActionRequired { code: String, detail: String, links: Vec<String> },
    Incompatibilities(Vec<crate::document::Incompatibility>),
    RemoteWarning(String),
}
