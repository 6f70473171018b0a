//! The persisted [`Document`] and the ephemeral [`Change`] sum type that
//! flows between components (spec §3).

use serde::{Deserialize, Serialize};

use crate::pathid::PathId;

/// `md5sum` is stored as raw bytes in memory but, per the documented
/// on-disk form, serialized as padded base64 text rather than a JSON
/// byte array.
mod md5sum_base64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<[u8; 16]>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<[u8; 16]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let Some(encoded) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };
        let bytes = STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)?;
        let array: [u8; 16] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("md5sum must decode to 16 bytes"))?;
        Ok(Some(array))
    }
}

/// Which half of the synchronized pair produced or should receive a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Side {
    Local,
    Remote,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Local => Side::Remote,
            Side::Remote => Side::Local,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Kind {
    File,
    Folder,
}

/// Per-side revision counters. `None` means the side has never seen this
/// document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sides {
    pub local: Option<u32>,
    pub remote: Option<u32>,
}

impl Sides {
    /// `true` once both sides report the same revision (fully propagated).
    pub fn is_settled(&self) -> bool {
        self.local == self.remote
    }

    fn max_rev(&self) -> u32 {
        self.local.unwrap_or(0).max(self.remote.unwrap_or(0))
    }

    /// Bump `side`'s counter to `max(local, remote) + 1`, per spec §4.7's
    /// `markSide`. Never decreases either counter.
    pub fn mark(&mut self, side: Side) {
        let next = self.max_rev() + 1;
        match side {
            Side::Local => self.local = Some(next),
            Side::Remote => self.remote = Some(next),
        }
    }
}

/// Link to the corresponding remote object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteLink {
    pub id: String,
    pub rev: String,
}

/// One synchronized path, as persisted in the [`crate::metastore::MetaStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: PathId,
    pub path: String,
    pub kind: Kind,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "md5sum_base64")]
    pub md5sum: Option<[u8; 16]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    #[serde(default)]
    pub executable: bool,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteLink>,
    #[serde(default)]
    pub sides: Sides,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ino: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub move_to: Option<PathId>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub errors: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overwrite: Option<Box<Document>>,
}

impl Document {
    /// `true` if `other` is a parent directory path of `self.path`.
    pub fn is_child_of_path(&self, parent: &Document) -> bool {
        crate::pathid::is_child_path(&parent.path, &self.path)
    }
}

/// Character ranges/names that make a path segment unrepresentable on a
/// given target platform (spec §4.5 `PlatformIncompatibleChange`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incompatibility {
    pub segment: String,
    pub reason: String,
}

/// The sealed set of reconciled operations (spec §3). Every arm the spec
/// names appears here; there is no catch-all variant.
#[derive(Debug, Clone)]
pub enum Change {
    FileAddition {
        side: Side,
        doc: Document,
    },
    FileUpdate {
        side: Side,
        doc: Document,
        was: Document,
    },
    FileMove {
        side: Side,
        doc: Document,
        was: Document,
        update: bool,
        overwrite: Option<Document>,
        need_refetch: bool,
    },
    FileTrashing {
        side: Side,
        doc: Document,
        was: Document,
    },
    FileDeletion {
        side: Side,
        was: Document,
    },
    DirAddition {
        side: Side,
        doc: Document,
    },
    DirMove {
        side: Side,
        doc: Document,
        was: Document,
        overwrite: Option<Document>,
        need_refetch: bool,
    },
    DirTrashing {
        side: Side,
        doc: Document,
        was: Document,
    },
    DirDeletion {
        side: Side,
        was: Document,
    },
    /// Absorbed into an ancestor move by [`crate::squasher::ChangeSquasher`];
    /// carried along so replay can still check invariants but is never
    /// reissued as a separate prep call.
    DescendantChange {
        side: Side,
        doc: Document,
        ancestor_path: String,
    },
    IgnoredChange {
        side: Side,
        doc: Document,
        detail: String,
    },
    InvalidChange {
        side: Side,
        path: String,
        reason: String,
    },
    PlatformIncompatibleChange {
        side: Side,
        path: String,
        incompatibilities: Vec<Incompatibility>,
    },
}

impl Change {
    pub fn side(&self) -> Side {
        match self {
            Change::FileAddition { side, .. }
            | Change::FileUpdate { side, .. }
            | Change::FileMove { side, .. }
            | Change::FileTrashing { side, .. }
            | Change::FileDeletion { side, .. }
            | Change::DirAddition { side, .. }
            | Change::DirMove { side, .. }
            | Change::DirTrashing { side, .. }
            | Change::DirDeletion { side, .. }
            | Change::DescendantChange { side, .. }
            | Change::IgnoredChange { side, .. }
            | Change::InvalidChange { side, .. }
            | Change::PlatformIncompatibleChange { side, .. } => *side,
        }
    }

    /// Path identifying the change's target, where one exists. `None` for
    /// pure-deletion changes that only carry a `was`.
    pub fn target_path(&self) -> Option<&str> {
        match self {
            Change::FileAddition { doc, .. }
            | Change::FileUpdate { doc, .. }
            | Change::FileMove { doc, .. }
            | Change::FileTrashing { doc, .. }
            | Change::DirAddition { doc, .. }
            | Change::DirMove { doc, .. }
            | Change::DirTrashing { doc, .. }
            | Change::DescendantChange { doc, .. }
            | Change::IgnoredChange { doc, .. } => Some(&doc.path),
            Change::InvalidChange { path, .. } | Change::PlatformIncompatibleChange { path, .. } => Some(path),
            Change::FileDeletion { .. } | Change::DirDeletion { .. } => None,
        }
    }

    /// Source path for moves, the trashed/deleted path otherwise. Used by
    /// the squasher's parent/child correlation.
    pub fn source_path(&self) -> Option<&str> {
        match self {
            Change::FileMove { was, .. }
            | Change::DirMove { was, .. }
            | Change::FileTrashing { was, .. }
            | Change::DirTrashing { was, .. }
            | Change::FileUpdate { was, .. } => Some(&was.path),
            Change::FileDeletion { was, .. } | Change::DirDeletion { was, .. } => Some(&was.path),
            _ => self.target_path(),
        }
    }

    pub fn is_dir_move(&self) -> bool {
        matches!(self, Change::DirMove { .. })
    }

    pub fn is_trashing(&self) -> bool {
        matches!(self, Change::FileTrashing { .. } | Change::DirTrashing { .. })
    }
}
