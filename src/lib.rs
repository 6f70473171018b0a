//! Change-reconciliation core for a bidirectional local/remote file
//! synchronizer: turns raw filesystem events and a remote change feed into
//! a squashed, conflict-resolved batch of operations and replays it
//! against both sides' writers.
//!
//! The crate owns the reconciliation pipeline only — path identity,
//! metadata storage, move detection, change classification, squashing,
//! merge, and replay. It does not implement a concrete remote backend, a
//! transfer layer, or a user interface; those are capabilities callers
//! inject through the traits in [`interfaces`], [`event_source`], and
//! [`metastore`].

pub mod change_builder;
pub mod checksum;
pub mod document;
pub mod error;
pub mod event_source;
pub mod interfaces;
pub mod merge;
pub mod metastore;
pub mod move_detector;
pub mod pathid;
pub mod squasher;
pub mod sync;

use std::sync::Arc;

use change_builder::{LocalChangeBuilder, RemoteChangeBuilder};
use checksum::{Checksumer, Md5Checksumer};
use error::CoreError;
use event_source::EventSource;
use interfaces::{RemoteFeed, SideWriter};
use merge::Merge;
use metastore::MetaStore;
use move_detector::MoveDetector;
use pathid::PathFlavor;
use squasher::ChangeSquasher;
use sync::Sync;

/// Ambient settings threaded through the pipeline's components, mirroring
/// the capability-injection pattern used throughout (spec §9/§10): every
/// external dependency — store, event source, remote feed, writers — is
/// handed in rather than constructed internally, so a host can swap in
/// test doubles or alternate backends without touching this crate.
pub struct SessionConfig {
    /// Path-identity rules for the filesystem(s) in play. HFS+/NTFS are
    /// case-insensitive; POSIX is case-sensitive and byte-exact.
    pub flavor: PathFlavor,
    /// Subtree (relative, already-normalized path) treated as the trash:
    /// incompatibility checks are suppressed there, and a move into it is
    /// classified as a trashing rather than a plain move.
    pub trash_prefix: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            flavor: PathFlavor::Posix,
            trash_prefix: ".trash".to_string(),
        }
    }
}

/// Ties together one configured instance of every pipeline component. A
/// caller drives a reconciliation pass by calling [`SyncSession::poll_local`]
/// and/or [`SyncSession::poll_remote`], then [`SyncSession::reconcile`].
pub struct SyncSession {
    config: SessionConfig,
    store: Arc<dyn MetaStore>,
    event_source: Box<dyn EventSource>,
    move_detector: MoveDetector,
    local_change_builder: LocalChangeBuilder,
    squasher: ChangeSquasher,
    sync: Sync,
    checksumer: Md5Checksumer,
}

impl SyncSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SessionConfig,
        store: Arc<dyn MetaStore>,
        event_source: Box<dyn EventSource>,
        remote_feed: Box<dyn RemoteFeed>,
        local_writer: Box<dyn SideWriter>,
        remote_writer: Box<dyn SideWriter>,
    ) -> Self {
        let move_detector = MoveDetector::new(store.clone(), config.flavor);
        let local_change_builder = LocalChangeBuilder::new(store.clone(), config.flavor, config.trash_prefix.clone());
        let remote_change_builder = RemoteChangeBuilder::new(store.clone(), config.flavor, config.trash_prefix.clone());
        let squasher = ChangeSquasher::new(config.flavor != PathFlavor::Posix);
        let sync = Sync::new(
            store.clone(),
            Merge::new(store.clone(), config.flavor),
            remote_feed,
            remote_change_builder,
            local_writer,
            remote_writer,
        );
        let checksumer = Md5Checksumer::spawn();

        SyncSession {
            config,
            store,
            event_source,
            move_detector,
            local_change_builder,
            squasher,
            sync,
            checksumer,
        }
    }

    /// Pull one batch of raw events from the local watcher, fuse split
    /// renames, and classify each into a squashed, ready-to-apply batch
    /// of [`document::Change`]s.
    pub fn poll_local(&mut self) -> Result<Vec<document::Change>, CoreError> {
        let raw = self.event_source.next();
        let fused = self.move_detector.ingest(raw);
        let mut changes = Vec::with_capacity(fused.len());
        for event in &fused {
            changes.push(self.local_change_builder.build(event)?);
            self.move_detector.forget(event);
        }
        Ok(self.squasher.squash(changes))
    }

    /// Pull and classify every remote change since the last checkpoint
    /// into a squashed batch.
    pub fn poll_remote(&mut self) -> Result<Vec<document::Change>, CoreError> {
        let changes = self.sync.fetch_remote_changes()?;
        Ok(self.squasher.squash(changes))
    }

    /// Apply a squashed batch (from either [`SyncSession::poll_local`] or
    /// [`SyncSession::poll_remote`]) through merge and replay it against
    /// the opposite side.
    pub fn reconcile(&mut self, changes: Vec<document::Change>) -> Result<(), CoreError> {
        self.sync.replay_batch(changes)?;
        Ok(())
    }

    /// Compute the content digest backing `md5sum` comparisons, used by
    /// callers constructing a [`document::Document`] before handing an
    /// addition/update off for classification.
    pub fn checksum(&self, path: &std::path::Path) -> Result<[u8; 16], CoreError> {
        self.checksumer.checksum(path).map_err(CoreError::from)
    }

    pub fn store(&self) -> &Arc<dyn MetaStore> {
        &self.store
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}
