//! Classifies aggregated local filesystem events into [`Change`]s.
//!
//! Grounded on the teacher's `indexing/reconciler.rs` dispatch-by-event-kind
//! shape (`process_fs_event` routing to `handle_removal` /
//! `handle_creation_or_modification`).

use std::sync::Arc;

use super::{PathValidation, validate_path};
use crate::document::{Change, Document, Kind, RemoteLink, Side, Sides};
use crate::error::ChangeBuilderError;
use crate::event_source::{FsAction, FsEvent};
use crate::metastore::MetaStore;
use crate::pathid::PathFlavor;

pub struct LocalChangeBuilder {
    store: Arc<dyn MetaStore>,
    flavor: PathFlavor,
    trash_prefix: String,
}

impl LocalChangeBuilder {
    pub fn new(store: Arc<dyn MetaStore>, flavor: PathFlavor, trash_prefix: impl Into<String>) -> Self {
        LocalChangeBuilder {
            store,
            flavor,
            trash_prefix: trash_prefix.into(),
        }
    }

    pub fn build(&self, event: &FsEvent) -> Result<Change, ChangeBuilderError> {
        let normalized = match validate_path(&event.path, self.flavor, &self.trash_prefix) {
            PathValidation::Valid(p) => p,
            PathValidation::Invalid(reason) => {
                return Ok(Change::InvalidChange {
                    side: Side::Local,
                    path: event.path.clone(),
                    reason,
                });
            }
            PathValidation::Incompatible(incompatibilities) => {
                return Ok(Change::PlatformIncompatibleChange {
                    side: Side::Local,
                    path: event.path.clone(),
                    incompatibilities,
                });
            }
        };

        let id = crate::pathid::PathId::new(&normalized, self.flavor)?;
        let prior = self.store.get(&id)?;
        let is_dir = event.stats.map(|s| s.is_dir).unwrap_or(false);
        let under_trash = crate::pathid::is_child_path(&self.trash_prefix, &normalized);

        match event.action {
            FsAction::Deleted => Ok(self.classify_deleted(&normalized, &id, prior, under_trash)),
            FsAction::Renamed => self.classify_renamed(event, &normalized, &id, prior, under_trash),
            FsAction::Created | FsAction::Scan => Ok(self.classify_created(event, &normalized, &id, prior, is_dir, under_trash)),
            FsAction::Modified => Ok(self.classify_modified(event, &normalized, &id, prior)),
        }
    }

    fn classify_deleted(
        &self,
        path: &str,
        id: &crate::pathid::PathId,
        prior: Option<Document>,
        _under_trash: bool,
    ) -> Change {
        let Some(was) = prior else {
            return Change::IgnoredChange {
                side: Side::Local,
                doc: blank_doc(id.clone(), path.to_string(), Kind::File),
                detail: "delete of untracked path".to_string(),
            };
        };
        let mut doc = was.clone();
        doc.deleted = true;
        match was.kind {
            Kind::File => Change::FileTrashing { side: Side::Local, doc, was },
            Kind::Folder => Change::DirTrashing { side: Side::Local, doc, was },
        }
    }

    fn classify_renamed(
        &self,
        event: &FsEvent,
        new_path: &str,
        new_id: &crate::pathid::PathId,
        prior_at_dest: Option<Document>,
        under_trash: bool,
    ) -> Result<Change, ChangeBuilderError> {
        let old_path = event.old_path.clone().unwrap_or_default();
        let was = match self.lookup_source(&old_path, event.stats.map(|s| s.ino))? {
            Some(w) => w,
            None => {
                // No prior document anywhere: treat as a fresh addition at
                // the destination rather than a move with nothing behind it.
                let is_dir = event.stats.map(|s| s.is_dir).unwrap_or(false);
                return Ok(self.classify_created(event, new_path, new_id, prior_at_dest, is_dir, under_trash));
            }
        };

        if under_trash {
            let mut doc = was.clone();
            doc.deleted = true;
            return Ok(match was.kind {
                Kind::File => Change::FileTrashing { side: Side::Local, doc, was },
                Kind::Folder => Change::DirTrashing { side: Side::Local, doc, was },
            });
        }

        let mut doc = was.clone();
        doc.id = new_id.clone();
        doc.path = new_path.to_string();
        if let Some(stats) = event.stats {
            doc.ino = Some(stats.ino);
            doc.updated_at = stats.updated_at;
        }
        let update = matches!((was.kind, event.stats), (Kind::File, Some(stats)) if Some(stats.size) != was.size);

        Ok(match was.kind {
            Kind::File => Change::FileMove {
                side: Side::Local,
                doc,
                was,
                update,
                overwrite: prior_at_dest,
                need_refetch: false,
            },
            Kind::Folder => Change::DirMove {
                side: Side::Local,
                doc,
                was,
                overwrite: prior_at_dest,
                need_refetch: false,
            },
        })
    }

    fn classify_created(
        &self,
        event: &FsEvent,
        path: &str,
        id: &crate::pathid::PathId,
        prior: Option<Document>,
        is_dir: bool,
        _under_trash: bool,
    ) -> Change {
        let kind = if is_dir { Kind::Folder } else { Kind::File };

        match prior {
            None => {
                let mut doc = blank_doc(id.clone(), path.to_string(), kind);
                if let Some(stats) = event.stats {
                    doc.ino = Some(stats.ino);
                    doc.updated_at = stats.updated_at;
                    if kind == Kind::File {
                        doc.size = Some(stats.size);
                    }
                }
                match kind {
                    Kind::File => Change::FileAddition { side: Side::Local, doc },
                    Kind::Folder => Change::DirAddition { side: Side::Local, doc },
                }
            }
            Some(was) if was.kind != kind => {
                // Kind mismatch: pass an update through so Merge raises the
                // KindConflict and performs the conflict rename.
                let mut doc = was.clone();
                doc.kind = kind;
                Change::FileUpdate { side: Side::Local, doc, was }
            }
            Some(was) => {
                let mut doc = was.clone();
                if let Some(stats) = event.stats {
                    doc.updated_at = stats.updated_at;
                    if kind == Kind::File {
                        doc.size = Some(stats.size);
                    }
                }
                if doc == was {
                    Change::IgnoredChange {
                        side: Side::Local,
                        doc,
                        detail: "re-created with identical metadata".to_string(),
                    }
                } else {
                    Change::FileUpdate { side: Side::Local, doc, was }
                }
            }
        }
    }

    fn classify_modified(&self, event: &FsEvent, path: &str, id: &crate::pathid::PathId, prior: Option<Document>) -> Change {
        let Some(was) = prior else {
            let is_dir = event.stats.map(|s| s.is_dir).unwrap_or(false);
            return self.classify_created(event, path, id, None, is_dir, false);
        };
        let mut doc = was.clone();
        if let Some(stats) = event.stats {
            doc.updated_at = stats.updated_at;
            if was.kind == Kind::File {
                doc.size = Some(stats.size);
            }
        }
        if doc == was {
            Change::IgnoredChange {
                side: Side::Local,
                doc,
                detail: "modify event with unchanged metadata".to_string(),
            }
        } else {
            Change::FileUpdate { side: Side::Local, doc, was }
        }
    }

    fn lookup_source(&self, old_path: &str, ino: Option<u64>) -> Result<Option<Document>, ChangeBuilderError> {
        if !old_path.is_empty()
            && let Ok(old_id) = crate::pathid::PathId::new(old_path, self.flavor)
            && let Some(doc) = self.store.get(&old_id)?
        {
            return Ok(Some(doc));
        }
        if let Some(ino) = ino {
            return Ok(self.store.lookup_by_inode(ino)?);
        }
        Ok(None)
    }
}

fn blank_doc(id: crate::pathid::PathId, path: String, kind: Kind) -> Document {
    Document {
        id,
        path,
        kind,
        md5sum: None,
        size: None,
        mime: None,
        class: None,
        executable: false,
        updated_at: 0,
        created_at: None,
        tags: Vec::new(),
        remote: None::<RemoteLink>,
        sides: Sides::default(),
        ino: None,
        move_to: None,
        deleted: false,
        errors: 0,
        overwrite: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_source::FsStats;
    use crate::metastore::sqlite::InMemoryMetaStore;

    fn builder() -> LocalChangeBuilder {
        LocalChangeBuilder::new(Arc::new(InMemoryMetaStore::new()), PathFlavor::Posix, ".trash".to_string())
    }

    #[test]
    fn no_prior_file_is_addition() {
        let b = builder();
        let change = b
            .build(&FsEvent {
                action: FsAction::Created,
                path: "a.txt".into(),
                stats: Some(FsStats {
                    ino: 1,
                    size: 10,
                    updated_at: 0,
                    is_dir: false,
                }),
                old_path: None,
            })
            .unwrap();
        assert!(matches!(change, Change::FileAddition { .. }));
    }

    #[test]
    fn no_prior_dir_is_addition() {
        let b = builder();
        let change = b
            .build(&FsEvent {
                action: FsAction::Created,
                path: "dir".into(),
                stats: Some(FsStats {
                    ino: 1,
                    size: 0,
                    updated_at: 0,
                    is_dir: true,
                }),
                old_path: None,
            })
            .unwrap();
        assert!(matches!(change, Change::DirAddition { .. }));
    }

    #[test]
    fn invalid_path_is_rejected() {
        let b = builder();
        let change = b
            .build(&FsEvent {
                action: FsAction::Created,
                path: "a/../b".into(),
                stats: None,
                old_path: None,
            })
            .unwrap();
        assert!(matches!(change, Change::InvalidChange { .. }));
    }

    #[test]
    fn rename_with_prior_document_becomes_move() {
        let store = Arc::new(InMemoryMetaStore::new());
        let id = crate::pathid::PathId::new("old.txt", PathFlavor::Posix).unwrap();
        store
            .put(&Document {
                id,
                path: "old.txt".into(),
                kind: Kind::File,
                md5sum: None,
                size: Some(5),
                mime: None,
                class: None,
                executable: false,
                updated_at: 0,
                created_at: None,
                tags: Vec::new(),
                remote: None,
                sides: Sides::default(),
                ino: Some(7),
                move_to: None,
                deleted: false,
                errors: 0,
                overwrite: None,
            })
            .unwrap();
        let b = LocalChangeBuilder::new(store, PathFlavor::Posix, ".trash".to_string());
        let change = b
            .build(&FsEvent {
                action: FsAction::Renamed,
                path: "new.txt".into(),
                stats: Some(FsStats {
                    ino: 7,
                    size: 5,
                    updated_at: 1,
                    is_dir: false,
                }),
                old_path: Some("old.txt".into()),
            })
            .unwrap();
        match change {
            Change::FileMove { doc, was, update, .. } => {
                assert_eq!(doc.path, "new.txt");
                assert_eq!(was.path, "old.txt");
                assert!(!update);
            }
            other => panic!("expected FileMove, got {other:?}"),
        }
    }
}
