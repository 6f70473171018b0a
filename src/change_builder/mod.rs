//! Classifies raw events/remote docs against the prior document loaded
//! from the metadata store into typed [`Change`]s (spec §4.5).

pub mod local;
pub mod remote;

pub use local::LocalChangeBuilder;
pub use remote::RemoteChangeBuilder;

use crate::document::Incompatibility;
use crate::pathid::{PathFlavor, normalize_path};

/// Windows' reserved device names; matched case-insensitively against the
/// filename stem.
const RESERVED_DEVICE_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8", "COM9", "LPT1",
    "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

const WINDOWS_RESERVED_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Outcome of validating a human path before it becomes a `Change`.
pub enum PathValidation {
    Valid(String),
    Invalid(String),
    Incompatible(Vec<Incompatibility>),
}

/// Validate and normalize `raw_path` per spec §4.5. Reserved-character
/// checks are scoped to the `Ntfs` flavor (Windows); suppressed entirely
/// for paths under `trash_prefix`, since dead files need not be reachable.
pub fn validate_path(raw_path: &str, flavor: PathFlavor, trash_prefix: &str) -> PathValidation {
    let normalized = match normalize_path(raw_path) {
        Ok(p) => p,
        Err(e) => return PathValidation::Invalid(e.to_string()),
    };

    let under_trash = crate::pathid::is_child_path(trash_prefix, &normalized) || normalized == trash_prefix;
    if flavor != PathFlavor::Ntfs || under_trash {
        return PathValidation::Valid(normalized);
    }

    let mut incompatibilities = Vec::new();
    for segment in normalized.split('/') {
        if let Some(bad) = segment.chars().find(|c| WINDOWS_RESERVED_CHARS.contains(c)) {
            incompatibilities.push(Incompatibility {
                segment: segment.to_string(),
                reason: format!("contains reserved character '{bad}'"),
            });
            continue;
        }
        if segment.ends_with(' ') || segment.ends_with('.') {
            incompatibilities.push(Incompatibility {
                segment: segment.to_string(),
                reason: "ends with a space or dot".to_string(),
            });
            continue;
        }
        let stem = segment.split('.').next().unwrap_or(segment);
        if RESERVED_DEVICE_NAMES.iter().any(|n| n.eq_ignore_ascii_case(stem)) {
            incompatibilities.push(Incompatibility {
                segment: segment.to_string(),
                reason: "reserved device name".to_string(),
            });
        }
    }

    if incompatibilities.is_empty() {
        PathValidation::Valid(normalized)
    } else {
        PathValidation::Incompatible(incompatibilities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_rejects_reserved_characters() {
        match validate_path("a/b:c.txt", PathFlavor::Ntfs, ".trash") {
            PathValidation::Incompatible(bad) => assert_eq!(bad.len(), 1),
            _ => panic!("expected incompatibility"),
        }
    }

    #[test]
    fn posix_allows_colon() {
        assert!(matches!(
            validate_path("a/b:c.txt", PathFlavor::Posix, ".trash"),
            PathValidation::Valid(_)
        ));
    }

    #[test]
    fn trash_sentinel_suppresses_incompatibility() {
        assert!(matches!(
            validate_path(".trash/b:c.txt", PathFlavor::Ntfs, ".trash"),
            PathValidation::Valid(_)
        ));
    }

    #[test]
    fn reserved_device_name_is_incompatible() {
        match validate_path("docs/NUL.txt", PathFlavor::Ntfs, ".trash") {
            PathValidation::Incompatible(bad) => assert_eq!(bad.len(), 1),
            _ => panic!("expected incompatibility"),
        }
    }
}
