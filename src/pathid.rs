//! Canonical per-path identity used as the [`crate::metastore::MetaStore`]
//! primary key (spec §4.1).

use std::fmt;

use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use crate::error::PathIdError;

/// Filesystem flavor controlling how raw paths fold into a [`PathId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathFlavor {
    /// Case-sensitive, byte-exact. Linux, most network filesystems.
    Posix,
    /// Case-preserving but case-insensitive, NFD-normalized. macOS/APFS/HFS+.
    Hfs,
    /// Case-preserving but case-insensitive. Windows/NTFS.
    Ntfs,
}

/// Canonical identity for a synchronized path. Two paths the filesystem
/// considers equal always produce the same `PathId`; two it distinguishes
/// never do.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PathId(String);

impl PathId {
    /// Derive the canonical key for `path` under `flavor`.
    ///
    /// `path` must already be normalized (no leading separator, no `..`
    /// segments, no bare `.` segments) — that normalization is the caller's
    /// responsibility (see [`normalize_path`]), `PathId` only folds case and
    /// unicode form.
    pub fn new(path: &str, flavor: PathFlavor) -> Result<Self, PathIdError> {
        if path.is_empty() {
            return Err(PathIdError::Empty);
        }
        if path.split('/').any(|seg| seg == "..") {
            return Err(PathIdError::DotDotSegment);
        }
        let key = match flavor {
            PathFlavor::Posix => path.to_string(),
            PathFlavor::Hfs => path.nfd().collect::<String>().to_ascii_uppercase(),
            PathFlavor::Ntfs => path.to_ascii_uppercase(),
        };
        Ok(PathId(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `true` if `self` names a path lexically nested under `parent`
    /// (`parent + "/"` is a prefix of `self`).
    pub fn is_child_of(&self, parent: &PathId) -> bool {
        is_child_path(parent.as_str(), self.as_str())
    }

    /// Lower bound (inclusive) / upper bound (exclusive) of the key range
    /// covering every document whose `PathId` lies under `self`, for use
    /// with `scanPrefix`.
    pub fn prefix_range(&self) -> (String, String) {
        let lower = format!("{}/", self.0);
        let mut upper = lower.clone();
        upper.pop();
        upper.push(char::from_u32('/' as u32 + 1).unwrap());
        (lower, upper)
    }
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `child.starts_with(parent + "/")`, operating on raw key strings.
/// Exposed standalone since [`crate::squasher::ChangeSquasher`] compares
/// human paths (for relative-tail bookkeeping) as well as `PathId`s.
pub fn is_child_path(parent: &str, child: &str) -> bool {
    if parent.is_empty() {
        return !child.is_empty() && !child.contains('/');
    }
    child
        .strip_prefix(parent)
        .map(|rest| rest.starts_with('/'))
        .unwrap_or(false)
}

/// Normalize a human path: strip a leading separator, collapse `.`
/// segments, reject (rather than silently collapse) `..` segments — a
/// path containing one is invalid per spec §4.5, not merely non-canonical.
pub fn normalize_path(raw: &str) -> Result<String, PathIdError> {
    let trimmed = raw.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(PathIdError::Empty);
    }
    let mut segments = Vec::new();
    for seg in trimmed.split('/') {
        if seg.is_empty() || seg == "." {
            continue;
        }
        if seg == ".." {
            return Err(PathIdError::DotDotSegment);
        }
        segments.push(seg);
    }
    if segments.is_empty() {
        return Err(PathIdError::Empty);
    }
    Ok(segments.join("/"))
}
