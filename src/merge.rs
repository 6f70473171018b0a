//! Applies a squashed batch of [`Change`]s to the metadata store,
//! producing the [`PrepCall`]s the opposite side must still replay (spec
//! §4.7). This is the sole writer of the [`crate::metastore::MetaStore`];
//! every mutation goes through here so `Sides` bookkeeping stays correct.

use std::sync::Arc;

use chrono::Utc;

use crate::document::{Change, Document, Kind, Side, Sides};
use crate::error::MergeError;
use crate::interfaces::PrepCall;
use crate::metastore::MetaStore;
use crate::pathid::PathFlavor;

pub struct Merge {
    store: Arc<dyn MetaStore>,
    flavor: PathFlavor,
}

impl Merge {
    pub fn new(store: Arc<dyn MetaStore>, flavor: PathFlavor) -> Self {
        Merge { store, flavor }
    }

    /// Apply one already-squashed [`Change`], updating the store and
    /// returning the [`PrepCall`] the opposite side's writer must still
    /// perform — `None` for changes that only update bookkeeping
    /// (`IgnoredChange`, `DescendantChange`) or that never reach a writer
    /// (`InvalidChange`, `PlatformIncompatibleChange`).
    pub fn apply(&self, change: Change) -> Result<Option<PrepCall>, MergeError> {
        match change {
            Change::FileAddition { side, mut doc } => {
                doc.sides.mark(side);
                self.ensure_parent_exists(&doc, side)?;
                self.store.put(&doc)?;
                Ok(Some(PrepCall::AddFile(doc)))
            }
            Change::DirAddition { side, mut doc } => {
                doc.sides.mark(side);
                self.ensure_parent_exists(&doc, side)?;
                self.store.put(&doc)?;
                Ok(Some(PrepCall::AddDir(doc)))
            }
            Change::FileUpdate { side, mut doc, was } => {
                if doc.kind != was.kind {
                    return self.resolve_kind_conflict(side, doc, was);
                }
                doc.sides = was.sides;
                doc.sides.mark(side);
                self.store.put(&doc)?;
                Ok(Some(PrepCall::UpdateFile(doc)))
            }
            Change::FileMove { side, mut doc, was, overwrite, .. } => {
                doc.sides = was.sides;
                doc.sides.mark(side);
                self.ensure_parent_exists(&doc, side)?;
                if let Some(over) = overwrite {
                    self.trash_in_store(&over)?;
                }
                let source_tombstone = tombstone_moved(&was, doc.id.clone());
                self.store.bulk_put(&[doc.clone(), source_tombstone])?;
                Ok(Some(PrepCall::MoveFile { doc, was }))
            }
            Change::DirMove { side, mut doc, was, overwrite, .. } => {
                doc.sides = was.sides;
                doc.sides.mark(side);
                self.ensure_parent_exists(&doc, side)?;
                if let Some(over) = overwrite {
                    self.trash_in_store(&over)?;
                }
                let mut batch = vec![doc.clone()];
                for descendant in self.store.scan_prefix(&was.id)? {
                    if descendant.id == was.id || descendant.deleted {
                        continue;
                    }
                    let Some(rest) = descendant.path.strip_prefix(&was.path) else {
                        continue;
                    };
                    let new_path = format!("{}{}", doc.path, rest);
                    let new_id = crate::pathid::PathId::new(&new_path, self.flavor)?;
                    let mut moved = descendant.clone();
                    moved.id = new_id.clone();
                    moved.path = new_path;
                    batch.push(moved);
                    batch.push(tombstone_moved(&descendant, new_id));
                }
                let source_tombstone = tombstone_moved(&was, doc.id.clone());
                batch.push(source_tombstone);
                self.store.bulk_put(&batch)?;
                Ok(Some(PrepCall::MoveDir { doc, was }))
            }
            Change::FileTrashing { side, mut doc, was } => {
                doc.sides = was.sides;
                doc.sides.mark(side);
                doc.deleted = true;
                self.store.put(&doc)?;
                Ok(Some(PrepCall::TrashFile(doc)))
            }
            Change::DirTrashing { side, mut doc, was } => {
                doc.sides = was.sides;
                doc.sides.mark(side);
                doc.deleted = true;
                self.store.put(&doc)?;
                Ok(Some(PrepCall::TrashDir(doc)))
            }
            Change::FileDeletion { side: _, was } => {
                self.store.put(&tombstone(&was))?;
                Ok(Some(PrepCall::DeleteFile(was)))
            }
            Change::DirDeletion { side: _, was } => {
                self.store.put(&tombstone(&was))?;
                Ok(Some(PrepCall::DeleteDir(was)))
            }
            Change::DescendantChange { side, mut doc, ancestor_path } => {
                doc.path = ancestor_path;
                doc.sides.mark(side);
                self.store.put(&doc)?;
                Ok(None)
            }
            Change::IgnoredChange { .. } | Change::InvalidChange { .. } | Change::PlatformIncompatibleChange { .. } => {
                Ok(None)
            }
        }
    }

    /// A file and a folder contending for the same path cannot both be
    /// written: rename the incoming side's document out of the way with a
    /// `-conflict-<timestamp>` suffix and let the next reconciliation pass
    /// pick the renamed copy up as a fresh addition.
    ///
    /// Open question resolved: when the opposite side's previous revision
    /// is unavailable (`was.sides` has no entry for `side.opposite()`),
    /// this fails closed — the incoming side is always the one renamed,
    /// on the assumption that a document the peer has never acknowledged
    /// is the one least safe to let win silently.
    fn resolve_kind_conflict(&self, side: Side, mut doc: Document, was: Document) -> Result<Option<PrepCall>, MergeError> {
        let peer_has_seen_it = match side.opposite() {
            Side::Local => was.sides.local.is_some(),
            Side::Remote => was.sides.remote.is_some(),
        };
        if !peer_has_seen_it {
            log::warn!("merge: kind conflict at {} with no prior peer revision, failing closed", was.path);
        }
        let suffix = Utc::now().format("-conflict-%Y%m%dT%H%M%SZ").to_string();
        doc.path = format!("{}{}", doc.path, suffix);
        doc.sides = Sides::default();
        doc.sides.mark(side);
        self.store.put(&doc)?;
        match doc.kind {
            Kind::File => Ok(Some(PrepCall::AddFile(doc))),
            Kind::Folder => Ok(Some(PrepCall::AddDir(doc))),
        }
    }

    /// Synthesize the parent folder document if it doesn't already exist
    /// in the store — an addition/move can arrive before its parent's own
    /// addition has been reconciled when events are processed out of
    /// strict depth order.
    fn ensure_parent_exists(&self, doc: &Document, side: Side) -> Result<(), MergeError> {
        let Some(parent_path) = parent_of(&doc.path) else {
            return Ok(());
        };
        if parent_path.is_empty() {
            return Ok(());
        }
        let parent_id = match crate::pathid::PathId::new(&parent_path, self.flavor) {
            Ok(id) => id,
            Err(_) => return Ok(()),
        };
        if self.store.get(&parent_id)?.is_some() {
            return Ok(());
        }
        let mut parent = Document {
            id: parent_id,
            path: parent_path,
            kind: Kind::Folder,
            md5sum: None,
            size: None,
            mime: None,
            class: None,
            executable: false,
            updated_at: doc.updated_at,
            created_at: None,
            tags: Vec::new(),
            remote: None,
            sides: Sides::default(),
            ino: None,
            move_to: None,
            deleted: false,
            errors: 0,
            overwrite: None,
        };
        parent.sides.mark(side);
        self.store.put(&parent)?;
        Ok(())
    }

    fn trash_in_store(&self, doc: &Document) -> Result<(), MergeError> {
        let mut trashed = doc.clone();
        trashed.deleted = true;
        self.store.put(&trashed)?;
        Ok(())
    }
}

fn tombstone(was: &Document) -> Document {
    let mut doc = was.clone();
    doc.deleted = true;
    doc
}

/// Tombstone the source side of a move: marks `was` deleted and points
/// `move_to` at the destination so a reader can still follow the trail.
fn tombstone_moved(was: &Document, new_id: crate::pathid::PathId) -> Document {
    let mut doc = was.clone();
    doc.deleted = true;
    doc.move_to = Some(new_id);
    doc
}

fn parent_of(path: &str) -> Option<String> {
    path.rsplit_once('/').map(|(parent, _)| parent.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metastore::sqlite::InMemoryMetaStore;
    use crate::pathid::PathFlavor;
    use crate::pathid::PathId;

    fn doc(path: &str, kind: Kind) -> Document {
        Document {
            id: PathId::new(path, PathFlavor::Posix).unwrap(),
            path: path.to_string(),
            kind,
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

    #[test]
    fn addition_marks_side_and_emits_prep_call() {
        let merge = Merge::new(Arc::new(InMemoryMetaStore::new()), PathFlavor::Posix);
        let call = merge.apply(Change::FileAddition { side: Side::Local, doc: doc("a.txt", Kind::File) }).unwrap();
        match call {
            Some(PrepCall::AddFile(d)) => assert_eq!(d.sides.local, Some(1)),
            other => panic!("expected AddFile, got {other:?}"),
        }
    }

    #[test]
    fn addition_synthesizes_missing_parent() {
        let store = Arc::new(InMemoryMetaStore::new());
        let merge = Merge::new(store.clone(), PathFlavor::Posix);
        merge.apply(Change::FileAddition { side: Side::Local, doc: doc("a/b/c.txt", Kind::File) }).unwrap();
        let parent_id = PathId::new("a/b", PathFlavor::Posix).unwrap();
        assert!(store.get(&parent_id).unwrap().is_some());
    }

    #[test]
    fn kind_conflict_renames_incoming_document() {
        let merge = Merge::new(Arc::new(InMemoryMetaStore::new()), PathFlavor::Posix);
        let mut was = doc("a", Kind::Folder);
        was.sides.remote = Some(1);
        let incoming = doc("a", Kind::File);
        let call = merge
            .apply(Change::FileUpdate { side: Side::Local, doc: incoming, was })
            .unwrap();
        match call {
            Some(PrepCall::AddFile(d)) => assert!(d.path.starts_with("a-conflict-")),
            other => panic!("expected renamed AddFile, got {other:?}"),
        }
    }

    #[test]
    fn deletion_emits_delete_prep_call() {
        let merge = Merge::new(Arc::new(InMemoryMetaStore::new()), PathFlavor::Posix);
        let call = merge.apply(Change::FileDeletion { side: Side::Local, was: doc("a.txt", Kind::File) }).unwrap();
        assert!(matches!(call, Some(PrepCall::DeleteFile(_))));
    }

    #[test]
    fn file_move_tombstones_source_and_writes_destination() {
        let store = Arc::new(InMemoryMetaStore::new());
        let merge = Merge::new(store.clone(), PathFlavor::Posix);
        let was = doc("src.txt", Kind::File);
        let dest = doc("dest.txt", Kind::File);
        merge
            .apply(Change::FileMove {
                side: Side::Local,
                doc: dest.clone(),
                was: was.clone(),
                update: false,
                overwrite: None,
                need_refetch: false,
            })
            .unwrap();

        let source = store.get(&was.id).unwrap().unwrap();
        assert!(source.deleted);
        assert_eq!(source.move_to, Some(dest.id.clone()));
        let destination = store.get(&dest.id).unwrap().unwrap();
        assert!(!destination.deleted);
    }

    #[test]
    fn dir_move_tombstones_source_and_rewrites_descendants() {
        let store = Arc::new(InMemoryMetaStore::new());
        let child = doc("old_parent/child.txt", Kind::File);
        store.put(&child).unwrap();
        let merge = Merge::new(store.clone(), PathFlavor::Posix);
        let was = doc("old_parent", Kind::Folder);
        let dest = doc("new_parent", Kind::Folder);

        merge
            .apply(Change::DirMove {
                side: Side::Local,
                doc: dest.clone(),
                was: was.clone(),
                overwrite: None,
                need_refetch: false,
            })
            .unwrap();

        let source = store.get(&was.id).unwrap().unwrap();
        assert!(source.deleted);
        let old_child = store.get(&child.id).unwrap().unwrap();
        assert!(old_child.deleted);
        let new_child_id = PathId::new("new_parent/child.txt", PathFlavor::Posix).unwrap();
        let new_child = store.get(&new_child_id).unwrap().unwrap();
        assert!(!new_child.deleted);
    }
}
