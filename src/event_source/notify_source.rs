//! Cross-platform reference [`EventSource`], grounded on the teacher's
//! `file_system/watcher.rs` (`notify_debouncer_full::new_debouncer`,
//! `RecursiveMode`) rather than its macOS-only FSEvents watcher — the
//! `PathId` flavors this crate supports are not macOS-specific, so the
//! reference adapter isn't either.

use std::path::Path;
use std::sync::mpsc::{self, Receiver};
use std::time::Duration;

use notify::RecursiveMode;
use notify_debouncer_full::{DebounceEventResult, Debouncer, RecommendedCache, new_debouncer};

use super::{EventSource, FsAction, FsEvent, FsStats};

/// Stats a host OS can supply for a changed path. Unix targets populate
/// `ino`; other targets leave it `None` (MoveDetector's inode correlation
/// then falls back to path-based history, same as the spec's Windows
/// split-rename scenario, which correlates on `ino` taken from the
/// platform's own file-id facility rather than this adapter's stat call).
fn stat(path: &Path) -> Option<FsStats> {
    let metadata = std::fs::symlink_metadata(path).ok()?;
    let updated_at = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    #[cfg(unix)]
    let ino = {
        use std::os::unix::fs::MetadataExt;
        metadata.ino()
    };
    #[cfg(not(unix))]
    let ino = 0u64;

    Some(FsStats {
        ino,
        size: metadata.len(),
        updated_at,
        is_dir: metadata.is_dir(),
    })
}

fn convert(event: &notify::Event) -> Vec<FsEvent> {
    use notify::EventKind;
    use notify::event::{ModifyKind, RenameMode};

    match &event.kind {
        EventKind::Create(_) => event
            .paths
            .iter()
            .map(|p| FsEvent {
                action: FsAction::Created,
                path: p.to_string_lossy().into_owned(),
                stats: stat(p),
                old_path: None,
            })
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .map(|p| FsEvent {
                action: FsAction::Deleted,
                path: p.to_string_lossy().into_owned(),
                stats: None,
                old_path: None,
            })
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            let old = &event.paths[0];
            let new = &event.paths[1];
            vec![FsEvent {
                action: FsAction::Renamed,
                path: new.to_string_lossy().into_owned(),
                stats: stat(new),
                old_path: Some(old.to_string_lossy().into_owned()),
            }]
        }
        EventKind::Modify(_) => event
            .paths
            .iter()
            .map(|p| FsEvent {
                action: FsAction::Modified,
                path: p.to_string_lossy().into_owned(),
                stats: stat(p),
                old_path: None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// `EventSource` backed by a debounced `notify` watch. `next()` blocks
/// until at least one batch of debounced events is available, then drains
/// everything currently queued.
pub struct NotifyEventSource {
    _debouncer: Debouncer<notify::RecommendedWatcher, RecommendedCache>,
    receiver: Receiver<Vec<FsEvent>>,
}

impl NotifyEventSource {
    pub fn watch(root: &Path, debounce: Duration) -> Result<Self, notify::Error> {
        let (sender, receiver) = mpsc::channel();
        let mut debouncer = new_debouncer(debounce, None, move |result: DebounceEventResult| match result {
            Ok(events) => {
                let batch: Vec<FsEvent> = events.iter().flat_map(|e| convert(&e.event)).collect();
                if !batch.is_empty() {
                    let _ = sender.send(batch);
                }
            }
            Err(errors) => {
                for err in errors {
                    log::warn!("notify watcher error: {err}");
                }
            }
        })?;
        debouncer.watch(root, RecursiveMode::Recursive)?;

        Ok(NotifyEventSource {
            _debouncer: debouncer,
            receiver,
        })
    }
}

impl EventSource for NotifyEventSource {
    fn next(&mut self) -> Vec<FsEvent> {
        let Ok(mut batch) = self.receiver.recv() else {
            return Vec::new();
        };
        while let Ok(more) = self.receiver.try_recv() {
            batch.extend(more);
        }
        batch
    }
}
