//! Classifies remote feed docs into [`Change`]s, mirroring
//! [`super::local::LocalChangeBuilder`]'s dispatch shape but keyed off the
//! remote identity rather than an inode.

use std::sync::Arc;

use super::{PathValidation, validate_path};
use crate::document::{Change, Document, Kind, RemoteLink, Side, Sides};
use crate::error::ChangeBuilderError;
use crate::interfaces::{RemoteChange, RemoteDeletion, RemoteDoc};
use crate::metastore::MetaStore;
use crate::pathid::PathFlavor;

pub struct RemoteChangeBuilder {
    store: Arc<dyn MetaStore>,
    flavor: PathFlavor,
    trash_prefix: String,
}

impl RemoteChangeBuilder {
    pub fn new(store: Arc<dyn MetaStore>, flavor: PathFlavor, trash_prefix: impl Into<String>) -> Self {
        RemoteChangeBuilder {
            store,
            flavor,
            trash_prefix: trash_prefix.into(),
        }
    }

    pub fn build(&self, change: &RemoteChange) -> Result<Change, ChangeBuilderError> {
        match change {
            RemoteChange::Doc(doc) => self.build_doc(doc),
            RemoteChange::Deletion(deletion) => self.build_deletion(deletion),
        }
    }

    fn build_doc(&self, remote: &RemoteDoc) -> Result<Change, ChangeBuilderError> {
        let validated = match validate_path(&remote.path, self.flavor, &self.trash_prefix) {
            PathValidation::Valid(p) => p,
            PathValidation::Invalid(reason) => {
                return Ok(Change::InvalidChange {
                    side: Side::Remote,
                    path: remote.path.clone(),
                    reason,
                });
            }
            PathValidation::Incompatible(incompatibilities) => {
                return Ok(Change::PlatformIncompatibleChange {
                    side: Side::Remote,
                    path: remote.path.clone(),
                    incompatibilities,
                });
            }
        };

        let id = crate::pathid::PathId::new(&validated, self.flavor)?;
        let prior = self
            .store
            .lookup_by_remote_id(&remote.id)?
            .or(self.store.get(&id)?);
        let under_trash = crate::pathid::is_child_path(&self.trash_prefix, &validated);

        let Some(was) = prior else {
            let doc = doc_from_remote(id, validated, remote);
            return Ok(match remote.kind {
                Kind::File => Change::FileAddition { side: Side::Remote, doc },
                Kind::Folder => Change::DirAddition { side: Side::Remote, doc },
            });
        };

        if was.path != validated {
            let mut doc = doc_from_remote(id, validated, remote);
            doc.sides = was.sides;
            let update = was.kind == Kind::File && was.md5sum != remote.md5sum;
            return Ok(if under_trash {
                match was.kind {
                    Kind::File => Change::FileTrashing { side: Side::Remote, doc, was },
                    Kind::Folder => Change::DirTrashing { side: Side::Remote, doc, was },
                }
            } else {
                match was.kind {
                    Kind::File => Change::FileMove {
                        side: Side::Remote,
                        doc,
                        was,
                        update,
                        overwrite: None,
                        need_refetch: false,
                    },
                    Kind::Folder => Change::DirMove {
                        side: Side::Remote,
                        doc,
                        was,
                        overwrite: None,
                        need_refetch: false,
                    },
                }
            });
        }

        if was.kind != remote.kind {
            let mut doc = doc_from_remote(id, validated, remote);
            doc.sides = was.sides;
            return Ok(Change::FileUpdate { side: Side::Remote, doc, was });
        }

        let mut doc = doc_from_remote(id, validated, remote);
        doc.sides = was.sides;
        if doc == was {
            Ok(Change::IgnoredChange {
                side: Side::Remote,
                doc,
                detail: "remote doc unchanged".to_string(),
            })
        } else {
            Ok(Change::FileUpdate { side: Side::Remote, doc, was })
        }
    }

    fn build_deletion(&self, deletion: &RemoteDeletion) -> Result<Change, ChangeBuilderError> {
        let Some(was) = self.store.lookup_by_remote_id(&deletion.id)? else {
            let id = crate::pathid::PathId::new(&format!("unknown/{}", deletion.id), self.flavor)?;
            return Ok(Change::IgnoredChange {
                side: Side::Remote,
                doc: blank_doc(id, deletion.id.clone(), Kind::File),
                detail: "deletion of untracked remote id".to_string(),
            });
        };
        Ok(match was.kind {
            Kind::File => Change::FileDeletion { side: Side::Remote, was },
            Kind::Folder => Change::DirDeletion { side: Side::Remote, was },
        })
    }
}

fn doc_from_remote(id: crate::pathid::PathId, path: String, remote: &RemoteDoc) -> Document {
    Document {
        id,
        path,
        kind: remote.kind,
        md5sum: remote.md5sum,
        size: remote.size,
        mime: remote.mime.clone(),
        class: None,
        executable: false,
        updated_at: remote.updated_at,
        created_at: None,
        tags: remote.tags.clone(),
        remote: Some(RemoteLink {
            id: remote.id.clone(),
            rev: remote.rev.clone(),
        }),
        sides: Sides::default(),
        ino: None,
        move_to: None,
        deleted: false,
        errors: 0,
        overwrite: None,
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
        remote: None,
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
    use crate::metastore::sqlite::InMemoryMetaStore;

    fn builder() -> RemoteChangeBuilder {
        RemoteChangeBuilder::new(Arc::new(InMemoryMetaStore::new()), PathFlavor::Posix, ".trash".to_string())
    }

    #[test]
    fn unseen_remote_doc_is_addition() {
        let b = builder();
        let change = b
            .build(&RemoteChange::Doc(RemoteDoc {
                id: "r1".into(),
                rev: "1-abc".into(),
                kind: Kind::File,
                dir_id: "root".into(),
                name: "a.txt".into(),
                path: "a.txt".into(),
                updated_at: 0,
                md5sum: None,
                tags: Vec::new(),
                size: Some(1),
                mime: None,
            }))
            .unwrap();
        assert!(matches!(change, Change::FileAddition { .. }));
    }

    #[test]
    fn deletion_of_untracked_id_is_ignored() {
        let b = builder();
        let change = b
            .build(&RemoteChange::Deletion(RemoteDeletion {
                id: "missing".into(),
                rev: "1-x".into(),
            }))
            .unwrap();
        assert!(matches!(change, Change::IgnoredChange { .. }));
    }
}
