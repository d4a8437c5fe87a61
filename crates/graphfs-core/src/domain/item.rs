//! Item and metadata-entry domain entities
//!
//! This module defines the unit of the remote store (`Item`), its durable
//! local projection (`MetadataEntry`), and the item-state machine that every
//! component routes mutations through.
//!
//! ## State machine
//!
//! ```text
//!   ┌───────┐ begin_hydrate ┌───────────┐ complete ┌──────────┐
//!   │ GHOST │ ────────────► │ HYDRATING │ ───────► │ HYDRATED │
//!   └───────┘               └───────────┘          └──────────┘
//!       ▲                                           │ write
//!       │ evict                                     ▼
//!       │                   ┌───────────┐ begin ┌─────────────┐
//!       └────────────────── │ UPLOADING │ ◄──── │ DIRTY_LOCAL │
//!                           └───────────┘       └─────────────┘
//!                             │ remote etag moved    │
//!                             ▼                      ▼
//!                           ┌──────────┐        ┌──────────┐
//!                           │ CONFLICT │        │ DELETED  │
//!                           └──────────┘        └──────────┘
//! ```
//!
//! The full transition relation is [`ItemState::allowed`]; any transition
//! outside it is a [`CoreError::InvalidTransition`] and is never coerced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::hash::ContentHash;
use super::ids::{ETag, ItemId, RemoteId};
use crate::error::CoreError;

// ============================================================================
// ItemState
// ============================================================================

/// Hydration/synchronization state of a metadata entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// Metadata known, no local content.
    #[default]
    Ghost,
    /// A download worker is assigned.
    Hydrating,
    /// Local content present and validated against the etag.
    Hydrated,
    /// Local content differs from the remote.
    DirtyLocal,
    /// An upload worker is assigned.
    Uploading,
    /// Remote changed while local was dirty.
    Conflict,
    /// Terminal until retried; the entry carries `last_error`.
    Error,
    /// Tombstone awaiting remote confirmation.
    Deleted,
}

impl ItemState {
    /// The §4.2-style transition relation. Everything else is refused.
    #[must_use]
    pub fn allowed(from: ItemState, to: ItemState) -> bool {
        use ItemState::*;
        matches!(
            (from, to),
            (Ghost, Hydrating)
                | (Ghost, DirtyLocal) // new local create
                | (Ghost, Deleted)
                | (Hydrating, Hydrated)
                | (Hydrating, Error)
                | (Hydrating, Ghost) // cancellation
                | (Hydrated, DirtyLocal)
                | (Hydrated, Ghost) // eviction
                | (Hydrated, Deleted)
                | (Hydrated, Hydrating) // re-hydrate after invalidation
                | (DirtyLocal, Uploading)
                | (DirtyLocal, Conflict)
                | (DirtyLocal, Deleted)
                | (Uploading, Hydrated)
                | (Uploading, Error)
                | (Uploading, Conflict)
                | (Uploading, DirtyLocal) // retry
                | (Conflict, DirtyLocal) // user chose local
                | (Conflict, Hydrated) // user chose remote, after re-hydrate
                | (Conflict, Deleted)
                | (Error, Hydrating)
                | (Error, Uploading)
                | (Error, Ghost) // manual clear
        )
    }

    /// True if invariant 4 requires a cache file on disk for this state.
    #[must_use]
    pub fn requires_content(self) -> bool {
        matches!(
            self,
            ItemState::Hydrated | ItemState::DirtyLocal | ItemState::Uploading | ItemState::Conflict
        )
    }

    /// True if the cache entry for this state may be evicted.
    ///
    /// Dirty, uploading and conflicted content is never evicted; only clean
    /// hydrated content can be dropped back to a ghost.
    #[must_use]
    pub fn evictable(self) -> bool {
        matches!(self, ItemState::Hydrated)
    }

    /// True if the entry has unsynced local changes.
    #[must_use]
    pub fn is_dirty(self) -> bool {
        matches!(self, ItemState::DirtyLocal | ItemState::Uploading)
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ItemState::Ghost => "Ghost",
            ItemState::Hydrating => "Hydrating",
            ItemState::Hydrated => "Hydrated",
            ItemState::DirtyLocal => "DirtyLocal",
            ItemState::Uploading => "Uploading",
            ItemState::Conflict => "Conflict",
            ItemState::Error => "Error",
            ItemState::Deleted => "Deleted",
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ============================================================================
// PinMode / OverlayPolicy / ConflictPolicy
// ============================================================================

/// Per-entry residency directive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinMode {
    /// Content is never kept resident beyond active use.
    Never,
    /// Normal LRU residency.
    #[default]
    Auto,
    /// Content is kept resident; re-hydration is queued after any eviction.
    Always,
}

impl PinMode {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            PinMode::Never => "Never",
            PinMode::Auto => "Auto",
            PinMode::Always => "Always",
        }
    }
}

impl fmt::Display for PinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Default reconciliation stance for newly-observed entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlayPolicy {
    #[default]
    RemoteWins,
    LocalWins,
    Merged,
}

impl OverlayPolicy {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            OverlayPolicy::RemoteWins => "RemoteWins",
            OverlayPolicy::LocalWins => "LocalWins",
            OverlayPolicy::Merged => "Merged",
        }
    }

    /// Parse a CLI/config spelling (`REMOTE_WINS`, `remote_wins`, ...).
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s.to_ascii_lowercase().as_str() {
            "remote_wins" => Ok(OverlayPolicy::RemoteWins),
            "local_wins" => Ok(OverlayPolicy::LocalWins),
            "merged" => Ok(OverlayPolicy::Merged),
            other => Err(CoreError::Validation(format!(
                "unknown overlay policy: {other}"
            ))),
        }
    }
}

impl fmt::Display for OverlayPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// How upload-time conflicts are resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Rename the local copy alongside the re-hydrated remote version.
    #[default]
    KeepBoth,
    /// Compare modification timestamps; the newer side wins.
    LastWriterWins,
    /// Leave the entry in `Conflict` and surface it to the UI.
    UserChoice,
    /// Attempt a textual merge for supported types; fall back to keep-both.
    Merge,
}

// ============================================================================
// FileStatus
// ============================================================================

/// User-visible status derived from the item state, for xattrs and the
/// status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Cloud,
    Downloading,
    Local,
    LocalModified,
    Syncing,
    Conflict,
    Error,
}

impl FileStatus {
    /// Derive the status label for an entry.
    #[must_use]
    pub fn derive(state: ItemState, pending_remote: bool) -> Self {
        match state {
            ItemState::Ghost => FileStatus::Cloud,
            ItemState::Hydrating => FileStatus::Downloading,
            ItemState::Hydrated if pending_remote => FileStatus::Syncing,
            ItemState::Hydrated => FileStatus::Local,
            ItemState::DirtyLocal => FileStatus::LocalModified,
            ItemState::Uploading => FileStatus::Syncing,
            ItemState::Conflict => FileStatus::Conflict,
            ItemState::Error => FileStatus::Error,
            ItemState::Deleted => FileStatus::Cloud,
        }
    }

    /// The xattr value exposed for this status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FileStatus::Cloud => "cloud",
            FileStatus::Downloading => "downloading",
            FileStatus::Local => "local",
            FileStatus::LocalModified => "local-modified",
            FileStatus::Syncing => "syncing",
            FileStatus::Conflict => "conflict",
            FileStatus::Error => "error",
        }
    }
}

// ============================================================================
// Item
// ============================================================================

/// The unit of the remote store: one file or directory record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Primary key. `local-*` for items not yet synced.
    pub id: ItemId,
    /// Canonical remote id; `None` for purely-local items.
    pub remote_id: Option<RemoteId>,
    /// Name within the parent directory.
    pub name: String,
    /// Parent directory id; `None` only for the root.
    pub parent_id: Option<ItemId>,
    pub is_directory: bool,
    /// Content size in bytes (0 for directories).
    pub size: u64,
    /// Version token from the remote store.
    pub etag: Option<ETag>,
    pub mtime: DateTime<Utc>,
    /// QuickXOR digest of the content, when the remote reports one.
    pub content_hash: Option<ContentHash>,
    /// POSIX permission bits derived from policy.
    pub mode: u32,
}

impl Item {
    /// Record for a directory discovered remotely.
    pub fn remote_directory(
        id: ItemId,
        remote_id: RemoteId,
        name: impl Into<String>,
        parent_id: Option<ItemId>,
        etag: ETag,
        mtime: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            remote_id: Some(remote_id),
            name: name.into(),
            parent_id,
            is_directory: true,
            size: 0,
            etag: Some(etag),
            mtime,
            content_hash: None,
            mode: 0o755,
        }
    }

    /// Record for a file discovered remotely.
    #[allow(clippy::too_many_arguments)]
    pub fn remote_file(
        id: ItemId,
        remote_id: RemoteId,
        name: impl Into<String>,
        parent_id: ItemId,
        size: u64,
        etag: ETag,
        mtime: DateTime<Utc>,
        content_hash: Option<ContentHash>,
    ) -> Self {
        Self {
            id,
            remote_id: Some(remote_id),
            name: name.into(),
            parent_id: Some(parent_id),
            is_directory: false,
            size,
            etag: Some(etag),
            mtime,
            content_hash,
            mode: 0o644,
        }
    }

    /// Record for an item created locally before its first upload.
    pub fn new_local(name: impl Into<String>, parent_id: ItemId, is_directory: bool) -> Self {
        Self {
            id: ItemId::new_local(),
            remote_id: None,
            name: name.into(),
            parent_id: Some(parent_id),
            is_directory,
            size: 0,
            etag: None,
            mtime: Utc::now(),
            content_hash: None,
            mode: if is_directory { 0o755 } else { 0o644 },
        }
    }
}

// ============================================================================
// MetadataEntry
// ============================================================================

/// Durable local projection of an [`Item`] plus its engine state.
///
/// Stored in the `metadata_v2` bucket; mutated only through the
/// State Manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    item: Item,
    item_state: ItemState,
    pin_mode: PinMode,
    overlay_policy: OverlayPolicy,
    /// Message from the failure that put the entry in `Error`.
    last_error: Option<String>,
    last_transition_at: DateTime<Utc>,
    /// True while a background mutation or upload is queued for this entry.
    pending_remote: bool,
    /// Local-only overlay entries (volume info files); never synced.
    is_virtual: bool,
    /// ETag captured when the entry last went dirty; consulted for conflict
    /// detection by uploads and delta applies.
    dirty_base_etag: Option<ETag>,
}

impl MetadataEntry {
    /// Entry for a remotely-discovered item, starting as a ghost (files) or
    /// hydrated (directories carry no content).
    pub fn from_remote(item: Item, overlay_policy: OverlayPolicy) -> Self {
        let state = if item.is_directory {
            ItemState::Hydrated
        } else {
            ItemState::Ghost
        };
        Self {
            item,
            item_state: state,
            pin_mode: PinMode::default(),
            overlay_policy,
            last_error: None,
            last_transition_at: Utc::now(),
            pending_remote: false,
            is_virtual: false,
            dirty_base_etag: None,
        }
    }

    /// Entry for a locally-created item (foreground `create`/`mkdir`).
    ///
    /// Directories start `Hydrated` (a local mkdir needs no download);
    /// files start `DirtyLocal` via the Ghost → DirtyLocal create edge.
    pub fn from_local_create(item: Item, overlay_policy: OverlayPolicy) -> Self {
        let state = if item.is_directory {
            ItemState::Hydrated
        } else {
            ItemState::DirtyLocal
        };
        Self {
            item,
            item_state: state,
            pin_mode: PinMode::default(),
            overlay_policy,
            last_error: None,
            last_transition_at: Utc::now(),
            pending_remote: true,
            is_virtual: false,
            dirty_base_etag: None,
        }
    }

    /// A virtual overlay entry: always hydrated, never synced, invisible to
    /// every queue.
    pub fn new_virtual(name: impl Into<String>, parent_id: ItemId, size: u64) -> Self {
        let mut item = Item::new_local(name, parent_id, false);
        item.size = size;
        item.mode = 0o444;
        Self {
            item,
            item_state: ItemState::Hydrated,
            pin_mode: PinMode::Never,
            overlay_policy: OverlayPolicy::LocalWins,
            last_error: None,
            last_transition_at: Utc::now(),
            pending_remote: false,
            is_virtual: true,
            dirty_base_etag: None,
        }
    }

    // --- Accessors ---

    pub fn item(&self) -> &Item {
        &self.item
    }

    pub fn id(&self) -> &ItemId {
        &self.item.id
    }

    pub fn name(&self) -> &str {
        &self.item.name
    }

    pub fn parent_id(&self) -> Option<&ItemId> {
        self.item.parent_id.as_ref()
    }

    pub fn is_directory(&self) -> bool {
        self.item.is_directory
    }

    pub fn state(&self) -> ItemState {
        self.item_state
    }

    pub fn pin_mode(&self) -> PinMode {
        self.pin_mode
    }

    pub fn overlay_policy(&self) -> OverlayPolicy {
        self.overlay_policy
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn last_transition_at(&self) -> DateTime<Utc> {
        self.last_transition_at
    }

    pub fn pending_remote(&self) -> bool {
        self.pending_remote
    }

    pub fn is_virtual(&self) -> bool {
        self.is_virtual
    }

    pub fn dirty_base_etag(&self) -> Option<&ETag> {
        self.dirty_base_etag.as_ref()
    }

    pub fn status(&self) -> FileStatus {
        FileStatus::derive(self.item_state, self.pending_remote)
    }

    // --- Mutation (State Manager and store internals only) ---

    /// Validate and apply a state transition.
    ///
    /// Clears `last_error` when leaving `Error` and stamps
    /// `last_transition_at`.
    pub fn transition_to(&mut self, target: ItemState) -> Result<(), CoreError> {
        if !ItemState::allowed(self.item_state, target) {
            return Err(CoreError::InvalidTransition {
                from: self.item_state.name(),
                to: target.name(),
            });
        }
        if self.item_state == ItemState::Error {
            self.last_error = None;
        }
        self.item_state = target;
        self.last_transition_at = Utc::now();
        Ok(())
    }

    /// Transition into `Error`, recording the cause.
    pub fn transition_to_error(&mut self, message: impl Into<String>) -> Result<(), CoreError> {
        if !ItemState::allowed(self.item_state, ItemState::Error) {
            return Err(CoreError::InvalidTransition {
                from: self.item_state.name(),
                to: ItemState::Error.name(),
            });
        }
        self.item_state = ItemState::Error;
        self.last_error = Some(message.into());
        self.last_transition_at = Utc::now();
        Ok(())
    }

    /// Remember the etag the local edit was based on. A second dirtying
    /// write keeps the original base.
    pub fn capture_dirty_base(&mut self) {
        if self.dirty_base_etag.is_none() {
            self.dirty_base_etag = self.item.etag.clone();
        }
    }

    pub fn clear_dirty_base(&mut self) {
        self.dirty_base_etag = None;
    }

    /// Override the dirty base (deliberate-overwrite conflict resolution).
    pub fn set_dirty_base(&mut self, base: Option<ETag>) {
        self.dirty_base_etag = base;
    }

    pub fn set_pin_mode(&mut self, mode: PinMode) {
        self.pin_mode = mode;
    }

    pub fn set_pending_remote(&mut self, pending: bool) {
        self.pending_remote = pending;
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.item.name = name.into();
    }

    pub fn set_parent_id(&mut self, parent: ItemId) {
        self.item.parent_id = Some(parent);
    }

    pub fn set_size(&mut self, size: u64) {
        self.item.size = size;
    }

    pub fn set_mtime(&mut self, mtime: DateTime<Utc>) {
        self.item.mtime = mtime;
    }

    pub fn set_etag(&mut self, etag: ETag) {
        self.item.etag = Some(etag);
    }

    pub fn set_content_hash(&mut self, hash: Option<ContentHash>) {
        self.item.content_hash = hash;
    }

    /// Re-key a `local-*` entry to its remote-assigned canonical id.
    pub fn adopt_remote_id(&mut self, remote_id: RemoteId) {
        self.item.id = ItemId::from(remote_id.clone());
        self.item.remote_id = Some(remote_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_file_entry() -> MetadataEntry {
        let parent = ItemId::new("root").unwrap();
        let item = Item::remote_file(
            ItemId::new("item-1").unwrap(),
            RemoteId::new("item-1").unwrap(),
            "report.txt",
            parent,
            1024,
            ETag::new("e1"),
            Utc::now(),
            None,
        );
        MetadataEntry::from_remote(item, OverlayPolicy::RemoteWins)
    }

    mod transition_table_tests {
        use super::*;
        use ItemState::*;

        #[test]
        fn test_ghost_edges() {
            assert!(ItemState::allowed(Ghost, Hydrating));
            assert!(ItemState::allowed(Ghost, DirtyLocal));
            assert!(ItemState::allowed(Ghost, Deleted));
            assert!(!ItemState::allowed(Ghost, Hydrated));
            assert!(!ItemState::allowed(Ghost, Uploading));
        }

        #[test]
        fn test_hydrating_edges() {
            assert!(ItemState::allowed(Hydrating, Hydrated));
            assert!(ItemState::allowed(Hydrating, Error));
            assert!(ItemState::allowed(Hydrating, Ghost));
            assert!(!ItemState::allowed(Hydrating, DirtyLocal));
            assert!(!ItemState::allowed(Hydrating, Deleted));
        }

        #[test]
        fn test_hydrated_edges() {
            assert!(ItemState::allowed(Hydrated, DirtyLocal));
            assert!(ItemState::allowed(Hydrated, Ghost));
            assert!(ItemState::allowed(Hydrated, Deleted));
            assert!(ItemState::allowed(Hydrated, Hydrating));
            assert!(!ItemState::allowed(Hydrated, Uploading));
            assert!(!ItemState::allowed(Hydrated, Conflict));
        }

        #[test]
        fn test_dirty_edges() {
            assert!(ItemState::allowed(DirtyLocal, Uploading));
            assert!(ItemState::allowed(DirtyLocal, Conflict));
            assert!(ItemState::allowed(DirtyLocal, Deleted));
            assert!(!ItemState::allowed(DirtyLocal, Ghost));
            assert!(!ItemState::allowed(DirtyLocal, Hydrated));
        }

        #[test]
        fn test_uploading_edges() {
            assert!(ItemState::allowed(Uploading, Hydrated));
            assert!(ItemState::allowed(Uploading, Error));
            assert!(ItemState::allowed(Uploading, Conflict));
            assert!(ItemState::allowed(Uploading, DirtyLocal));
            assert!(!ItemState::allowed(Uploading, Deleted));
            assert!(!ItemState::allowed(Uploading, Ghost));
        }

        #[test]
        fn test_conflict_edges() {
            assert!(ItemState::allowed(Conflict, DirtyLocal));
            assert!(ItemState::allowed(Conflict, Hydrated));
            assert!(ItemState::allowed(Conflict, Deleted));
            assert!(!ItemState::allowed(Conflict, Ghost));
            assert!(!ItemState::allowed(Conflict, Uploading));
        }

        #[test]
        fn test_error_edges() {
            assert!(ItemState::allowed(Error, Hydrating));
            assert!(ItemState::allowed(Error, Uploading));
            assert!(ItemState::allowed(Error, Ghost));
            assert!(!ItemState::allowed(Error, Hydrated));
            assert!(!ItemState::allowed(Error, Deleted));
        }

        #[test]
        fn test_deleted_is_terminal() {
            for to in [
                Ghost, Hydrating, Hydrated, DirtyLocal, Uploading, Conflict, Error,
            ] {
                assert!(!ItemState::allowed(Deleted, to), "Deleted -> {to:?}");
            }
        }

        #[test]
        fn test_content_requirement_matches_invariant() {
            assert!(!Ghost.requires_content());
            assert!(!Hydrating.requires_content());
            assert!(Hydrated.requires_content());
            assert!(DirtyLocal.requires_content());
            assert!(Uploading.requires_content());
            assert!(Conflict.requires_content());
            assert!(!Deleted.requires_content());
        }

        #[test]
        fn test_only_clean_hydrated_is_evictable() {
            assert!(Hydrated.evictable());
            assert!(!DirtyLocal.evictable());
            assert!(!Uploading.evictable());
            assert!(!Conflict.evictable());
        }
    }

    mod entry_tests {
        use super::*;

        #[test]
        fn test_remote_file_starts_as_ghost() {
            let entry = test_file_entry();
            assert_eq!(entry.state(), ItemState::Ghost);
            assert!(!entry.pending_remote());
        }

        #[test]
        fn test_remote_directory_starts_hydrated() {
            let item = Item::remote_directory(
                ItemId::new("dir-1").unwrap(),
                RemoteId::new("dir-1").unwrap(),
                "docs",
                Some(ItemId::new("root").unwrap()),
                ETag::new("e2"),
                Utc::now(),
            );
            let entry = MetadataEntry::from_remote(item, OverlayPolicy::RemoteWins);
            assert_eq!(entry.state(), ItemState::Hydrated);
        }

        #[test]
        fn test_local_create_is_dirty_and_pending() {
            let item = Item::new_local("new.txt", ItemId::new("root").unwrap(), false);
            let entry = MetadataEntry::from_local_create(item, OverlayPolicy::RemoteWins);
            assert_eq!(entry.state(), ItemState::DirtyLocal);
            assert!(entry.pending_remote());
            assert!(entry.id().is_local());
        }

        #[test]
        fn test_invalid_transition_is_hard_error() {
            let mut entry = test_file_entry();
            let err = entry.transition_to(ItemState::Uploading).unwrap_err();
            assert!(matches!(
                err,
                CoreError::InvalidTransition {
                    from: "Ghost",
                    to: "Uploading"
                }
            ));
            assert_eq!(entry.state(), ItemState::Ghost);
        }

        #[test]
        fn test_error_transition_records_and_clears_message() {
            let mut entry = test_file_entry();
            entry.transition_to(ItemState::Hydrating).unwrap();
            entry.transition_to_error("download failed").unwrap();
            assert_eq!(entry.last_error(), Some("download failed"));

            entry.transition_to(ItemState::Hydrating).unwrap();
            assert!(entry.last_error().is_none());
        }

        #[test]
        fn test_dirty_base_is_sticky() {
            let mut entry = test_file_entry();
            entry.capture_dirty_base();
            assert_eq!(entry.dirty_base_etag().map(ETag::as_str), Some("e1"));

            entry.set_etag(ETag::new("e9"));
            entry.capture_dirty_base();
            // A second write keeps the original base etag.
            assert_eq!(entry.dirty_base_etag().map(ETag::as_str), Some("e1"));
        }

        #[test]
        fn test_adopt_remote_id() {
            let item = Item::new_local("new.txt", ItemId::new("root").unwrap(), false);
            let mut entry = MetadataEntry::from_local_create(item, OverlayPolicy::RemoteWins);
            assert!(entry.id().is_local());

            entry.adopt_remote_id(RemoteId::new("canonical-9").unwrap());
            assert!(!entry.id().is_local());
            assert_eq!(entry.id().as_str(), "canonical-9");
        }

        #[test]
        fn test_virtual_entry_shape() {
            let entry = MetadataEntry::new_virtual(".xdg-volume-info", ItemId::new("root").unwrap(), 64);
            assert!(entry.is_virtual());
            assert_eq!(entry.state(), ItemState::Hydrated);
            assert!(entry.item().remote_id.is_none());
        }

        #[test]
        fn test_status_derivation() {
            assert_eq!(FileStatus::derive(ItemState::Ghost, false), FileStatus::Cloud);
            assert_eq!(
                FileStatus::derive(ItemState::Hydrating, false),
                FileStatus::Downloading
            );
            assert_eq!(FileStatus::derive(ItemState::Hydrated, false), FileStatus::Local);
            assert_eq!(
                FileStatus::derive(ItemState::Hydrated, true),
                FileStatus::Syncing
            );
            assert_eq!(
                FileStatus::derive(ItemState::DirtyLocal, true),
                FileStatus::LocalModified
            );
            assert_eq!(
                FileStatus::derive(ItemState::Uploading, true),
                FileStatus::Syncing
            );
        }

        #[test]
        fn test_serialization_roundtrip() {
            let entry = test_file_entry();
            let json = serde_json::to_string(&entry).unwrap();
            let back: MetadataEntry = serde_json::from_str(&json).unwrap();
            assert_eq!(entry, back);
        }
    }
}
