//! State manager
//!
//! Sole authority for `ItemState` transitions. Every mutation of a
//! metadata entry funnels through here: the transition is validated against
//! the state machine, written back to the metadata store, and announced on
//! a broadcast channel for interested workers (pin re-hydration, status
//! surfaces).
//!
//! Workers hold ids, not entries; each helper re-resolves the entry from
//! the store, mutates, persists, and emits. Metadata mutations to the same
//! entry are therefore linearizable through this type.

use tokio::sync::broadcast;

use graphfs_core::domain::{
    ETag, ItemId, ItemState, MetadataEntry, OverlayPolicy, PinMode,
};
use graphfs_core::domain::hash::ContentHash;
use graphfs_core::ports::RemoteItem;
use graphfs_core::CoreError;

use crate::metadata::MetadataStore;

/// A committed state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateEvent {
    pub id: ItemId,
    pub from: ItemState,
    pub to: ItemState,
}

/// Outcome of applying one remote delta event to local metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    /// A new entry was created.
    Created,
    /// Metadata fields changed; local content, if any, is still valid.
    Updated,
    /// The content version moved while local was clean; the entry was
    /// ghosted and the caller must drop the cache file (and requeue
    /// hydration when pinned).
    Invalidated,
    /// The content version moved while local was dirty; the entry is now
    /// in `Conflict`.
    ConflictDetected,
    /// Nothing changed.
    Unchanged,
}

/// An entry re-keyed from a `local-*` id to its canonical remote id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RekeyEvent {
    pub old_id: ItemId,
    pub new_id: ItemId,
}

/// Sole owner of item-state transitions.
#[derive(Clone)]
pub struct StateManager {
    store: MetadataStore,
    events: broadcast::Sender<StateEvent>,
    rekeys: broadcast::Sender<RekeyEvent>,
    default_overlay: OverlayPolicy,
}

impl StateManager {
    pub fn new(store: MetadataStore, default_overlay: OverlayPolicy) -> Self {
        let (events, _) = broadcast::channel(256);
        let (rekeys, _) = broadcast::channel(64);
        Self {
            store,
            events,
            rekeys,
            default_overlay,
        }
    }

    /// Subscribe to committed transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    /// Subscribe to id adoptions (kept inodes follow the new key).
    pub fn subscribe_rekeys(&self) -> broadcast::Receiver<RekeyEvent> {
        self.rekeys.subscribe()
    }

    fn emit_rekey(&self, old_id: ItemId, new_id: ItemId) {
        tracing::debug!(old = %old_id, new = %new_id, "entry re-keyed");
        let _ = self.rekeys.send(RekeyEvent { old_id, new_id });
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn default_overlay(&self) -> OverlayPolicy {
        self.default_overlay
    }

    async fn load(&self, id: &ItemId) -> Result<MetadataEntry, CoreError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("no metadata entry for {id}")))
    }

    /// Validate, persist, and announce one transition.
    async fn commit_transition(
        &self,
        entry: &mut MetadataEntry,
        to: ItemState,
    ) -> Result<(), CoreError> {
        let from = entry.state();
        entry.transition_to(to)?;
        self.store.put(entry).await?;
        self.emit(entry.id().clone(), from, to);
        Ok(())
    }

    fn emit(&self, id: ItemId, from: ItemState, to: ItemState) {
        tracing::debug!(id = %id, from = %from, to = %to, "state transition");
        let _ = self.events.send(StateEvent { id, from, to });
    }

    // ========================================================================
    // Creation
    // ========================================================================

    /// Insert an entry for a locally-created item (foreground create/mkdir).
    pub async fn insert_local(&self, entry: &MetadataEntry) -> Result<(), CoreError> {
        self.store.put(entry).await
    }

    /// Insert a virtual overlay entry at mount time.
    pub async fn insert_virtual(&self, entry: &MetadataEntry) -> Result<(), CoreError> {
        debug_assert!(entry.is_virtual());
        self.store.put(entry).await
    }

    // ========================================================================
    // Dirty / clean
    // ========================================================================

    /// Local content diverged from the remote: `Hydrated -> DirtyLocal`
    /// (or `Ghost -> DirtyLocal` for a brand-new local file). Captures the
    /// etag the edit is based on. Already-dirty entries are left alone.
    pub async fn mark_dirty(&self, id: &ItemId) -> Result<(), CoreError> {
        let mut entry = self.load(id).await?;
        match entry.state() {
            ItemState::DirtyLocal | ItemState::Uploading => Ok(()),
            _ => {
                entry.capture_dirty_base();
                self.commit_transition(&mut entry, ItemState::DirtyLocal).await
            }
        }
    }

    /// A metadata-only mutation (rename) was acknowledged by the remote:
    /// record the fresh etag and clear the pending flag. Content-dirty
    /// entries keep their state; the upload pipeline owns that path.
    pub async fn mark_clean(&self, id: &ItemId, new_etag: ETag) -> Result<(), CoreError> {
        let mut entry = self.load(id).await?;
        entry.set_etag(new_etag);
        entry.set_pending_remote(false);
        self.store.put(&entry).await
    }

    /// Transition into `Error`, recording the message.
    pub async fn mark_error(&self, id: &ItemId, err: &CoreError) -> Result<(), CoreError> {
        let mut entry = self.load(id).await?;
        let from = entry.state();
        entry.transition_to_error(err.to_string())?;
        self.store.put(&entry).await?;
        self.emit(entry.id().clone(), from, ItemState::Error);
        Ok(())
    }

    /// `Error -> Ghost` (manual clear / retry reset).
    pub async fn clear_error(&self, id: &ItemId) -> Result<(), CoreError> {
        let mut entry = self.load(id).await?;
        self.commit_transition(&mut entry, ItemState::Ghost).await
    }

    // ========================================================================
    // Deletion
    // ========================================================================

    /// Tombstone an entry.
    ///
    /// Allowed from any state except `Uploading` (the upload must be
    /// cancelled first). States with no direct edge to `Deleted` route
    /// through their cancellation edge, each hop committed and announced.
    pub async fn mark_deleted(&self, id: &ItemId) -> Result<(), CoreError> {
        let mut entry = self.load(id).await?;
        match entry.state() {
            ItemState::Uploading => Err(CoreError::InvalidTransition {
                from: "Uploading",
                to: "Deleted",
            }),
            ItemState::Hydrating | ItemState::Error => {
                self.commit_transition(&mut entry, ItemState::Ghost).await?;
                self.commit_transition(&mut entry, ItemState::Deleted).await
            }
            ItemState::Deleted => Ok(()),
            _ => self.commit_transition(&mut entry, ItemState::Deleted).await,
        }
    }

    /// Remove a tombstoned entry after remote confirmation.
    pub async fn remove(&self, id: &ItemId) -> Result<(), CoreError> {
        let entry = self.load(id).await?;
        if entry.state() != ItemState::Deleted && !entry.is_virtual() {
            return Err(CoreError::InvalidTransition {
                from: entry.state().name(),
                to: "removed",
            });
        }
        self.store.delete(id).await
    }

    // ========================================================================
    // Hydration
    // ========================================================================

    /// `Ghost -> Hydrating` (also valid from `Error` retry and `Hydrated`
    /// re-hydration after invalidation).
    pub async fn begin_hydrate(&self, id: &ItemId) -> Result<(), CoreError> {
        let mut entry = self.load(id).await?;
        self.commit_transition(&mut entry, ItemState::Hydrating).await
    }

    /// `Hydrating -> Hydrated`: content is on disk and verified.
    pub async fn complete_hydrate(
        &self,
        id: &ItemId,
        etag: ETag,
        size: u64,
    ) -> Result<(), CoreError> {
        let mut entry = self.load(id).await?;
        entry.set_etag(etag);
        entry.set_size(size);
        self.commit_transition(&mut entry, ItemState::Hydrated).await
    }

    /// `Hydrating -> Ghost`: every waiter cancelled.
    pub async fn cancel_hydrate(&self, id: &ItemId) -> Result<(), CoreError> {
        let mut entry = self.load(id).await?;
        self.commit_transition(&mut entry, ItemState::Ghost).await
    }

    // ========================================================================
    // Upload
    // ========================================================================

    /// `DirtyLocal -> Uploading` (also valid from `Error` retry).
    pub async fn begin_upload(&self, id: &ItemId) -> Result<(), CoreError> {
        let mut entry = self.load(id).await?;
        self.commit_transition(&mut entry, ItemState::Uploading).await
    }

    /// `Uploading -> Hydrated`: the remote accepted the content.
    ///
    /// Adopts the canonical remote id when the entry still carries a
    /// `local-*` id, rewriting the parent index atomically. Returns the id
    /// the entry lives under afterwards.
    pub async fn complete_upload(&self, id: &ItemId, item: &RemoteItem) -> Result<ItemId, CoreError> {
        let mut entry = self.load(id).await?;
        let from = entry.state();

        entry.set_etag(item.etag.clone());
        entry.set_size(item.size);
        entry.set_mtime(item.mtime);
        entry.set_content_hash(item.content_hash);
        entry.clear_dirty_base();
        entry.set_pending_remote(false);
        entry.transition_to(ItemState::Hydrated)?;

        let new_id = if entry.id().is_local() {
            let old_id = entry.id().clone();
            entry.adopt_remote_id(item.id.clone());
            self.store.rekey(&old_id, &entry).await?;
            self.emit_rekey(old_id, entry.id().clone());
            entry.id().clone()
        } else {
            self.store.put(&entry).await?;
            entry.id().clone()
        };

        self.emit(new_id.clone(), from, ItemState::Hydrated);
        Ok(new_id)
    }

    /// Record the remote's acknowledgement of a locally-created directory.
    ///
    /// Normally the entry still lives under its `local-*` id and is rekeyed
    /// to the canonical id. When a delta upsert already reconciled it, the
    /// entry is found by remote id instead and only freshened. Returns the
    /// id the entry lives under afterwards.
    pub async fn finish_create(
        &self,
        local_id: &ItemId,
        item: &RemoteItem,
    ) -> Result<ItemId, CoreError> {
        if let Some(mut entry) = self.store.get(local_id).await? {
            entry.set_etag(item.etag.clone());
            entry.set_mtime(item.mtime);
            entry.set_pending_remote(false);
            if entry.id().is_local() {
                entry.adopt_remote_id(item.id.clone());
                self.store.rekey(local_id, &entry).await?;
                self.emit_rekey(local_id.clone(), entry.id().clone());
            } else {
                self.store.put(&entry).await?;
            }
            return Ok(entry.id().clone());
        }
        // Already reconciled by a delta upsert.
        if let Some(mut entry) = self.store.get_by_remote(&item.id).await? {
            entry.set_pending_remote(false);
            self.store.put(&entry).await?;
            return Ok(entry.id().clone());
        }
        Err(CoreError::NotFound(format!(
            "no entry for created item {local_id}"
        )))
    }

    /// `Uploading -> DirtyLocal`: the session failed but will be retried.
    pub async fn upload_interrupted(&self, id: &ItemId) -> Result<(), CoreError> {
        let mut entry = self.load(id).await?;
        self.commit_transition(&mut entry, ItemState::DirtyLocal).await
    }

    /// Transition into `Conflict` (from `DirtyLocal` or `Uploading`).
    pub async fn mark_conflict(&self, id: &ItemId) -> Result<(), CoreError> {
        let mut entry = self.load(id).await?;
        self.commit_transition(&mut entry, ItemState::Conflict).await
    }

    /// `Conflict -> DirtyLocal`: the user (or policy) chose the local copy.
    ///
    /// `observed_remote_etag` is the version being deliberately
    /// overwritten; it becomes the new dirty base so the re-upload's
    /// precondition passes.
    pub async fn resolve_conflict_local(
        &self,
        id: &ItemId,
        observed_remote_etag: ETag,
    ) -> Result<(), CoreError> {
        let mut entry = self.load(id).await?;
        entry.set_dirty_base(Some(observed_remote_etag));
        self.commit_transition(&mut entry, ItemState::DirtyLocal).await
    }

    /// `Conflict -> Hydrated`: the remote copy won and its content has
    /// already been written to the cache.
    pub async fn resolve_conflict_remote(
        &self,
        id: &ItemId,
        etag: ETag,
        size: u64,
        content_hash: Option<ContentHash>,
    ) -> Result<(), CoreError> {
        let mut entry = self.load(id).await?;
        entry.set_etag(etag);
        entry.set_size(size);
        entry.set_content_hash(content_hash);
        entry.clear_dirty_base();
        entry.set_pending_remote(false);
        self.commit_transition(&mut entry, ItemState::Hydrated).await
    }

    // ========================================================================
    // Eviction / pins
    // ========================================================================

    /// `Hydrated -> Ghost` for cache eviction. Refused for pinned entries;
    /// the caller has already verified the open refcount is zero.
    pub async fn evict_to_ghost(&self, id: &ItemId) -> Result<(), CoreError> {
        let mut entry = self.load(id).await?;
        if entry.pin_mode() == PinMode::Always {
            return Err(CoreError::Permission(format!(
                "{id} is pinned and cannot be evicted"
            )));
        }
        self.commit_transition(&mut entry, ItemState::Ghost).await
    }

    /// `Hydrated -> Ghost` without the pin check, for last-resort eviction
    /// under cache pressure. The pin watcher requeues hydration right away,
    /// so a pinned entry never stays ghosted longer than one tick.
    pub async fn evict_to_ghost_forced(&self, id: &ItemId) -> Result<(), CoreError> {
        let mut entry = self.load(id).await?;
        self.commit_transition(&mut entry, ItemState::Ghost).await
    }

    pub async fn set_pin(&self, id: &ItemId, mode: PinMode) -> Result<(), CoreError> {
        let mut entry = self.load(id).await?;
        entry.set_pin_mode(mode);
        self.store.put(&entry).await
    }

    /// Flag that a background mutation or upload is queued for this entry.
    pub async fn set_pending_remote(&self, id: &ItemId, pending: bool) -> Result<(), CoreError> {
        let mut entry = self.load(id).await?;
        entry.set_pending_remote(pending);
        self.store.put(&entry).await
    }

    /// Update the recorded modification time (setattr).
    pub async fn set_mtime(
        &self,
        id: &ItemId,
        mtime: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), CoreError> {
        let mut entry = self.load(id).await?;
        entry.set_mtime(mtime);
        self.store.put(&entry).await
    }

    /// Apply a local rename/move to metadata (the remote PATCH is queued
    /// separately).
    pub async fn apply_local_rename(
        &self,
        id: &ItemId,
        new_name: &str,
        new_parent: &ItemId,
    ) -> Result<(), CoreError> {
        let mut entry = self.load(id).await?;
        entry.set_name(new_name);
        entry.set_parent_id(new_parent.clone());
        entry.set_pending_remote(true);
        self.store.put(&entry).await
    }

    // ========================================================================
    // Remote delta application
    // ========================================================================

    /// Apply one remote upsert to local metadata.
    ///
    /// Routes every effect through the state machine: content invalidation
    /// ghosts clean entries; a version moved under a dirty entry becomes an
    /// explicit `Conflict`. Id reconciliation matches a pending `local-*`
    /// entry by (parent, name) and adopts the canonical id.
    pub async fn apply_remote_delta(&self, item: &RemoteItem) -> Result<DeltaOutcome, CoreError> {
        // Resolve the local entry: by remote id first, then by (parent,
        // name) for a pending local-* creation.
        let existing = match self.store.get_by_remote(&item.id).await? {
            Some(entry) => Some(entry),
            None => self.match_pending_local(item).await?,
        };

        let Some(mut entry) = existing else {
            return self.create_from_remote(item).await;
        };

        if entry.is_virtual() {
            return Ok(DeltaOutcome::Unchanged);
        }

        // Reconcile a still-local id before anything else.
        if entry.id().is_local() {
            let old_id = entry.id().clone();
            entry.adopt_remote_id(item.id.clone());
            self.store.rekey(&old_id, &entry).await?;
            self.emit_rekey(old_id, entry.id().clone());
        }

        let etag_moved = entry.item().etag.as_ref() != Some(&item.etag);

        if entry.state().is_dirty() {
            // Compare against the etag captured when the entry went dirty;
            // an echo of our own base version is not a conflict.
            let base_moved = entry.dirty_base_etag() != Some(&item.etag);
            if etag_moved && base_moved {
                let from = entry.state();
                entry.transition_to(ItemState::Conflict)?;
                self.store.put(&entry).await?;
                self.emit(entry.id().clone(), from, ItemState::Conflict);
                return Ok(DeltaOutcome::ConflictDetected);
            }
            return Ok(DeltaOutcome::Unchanged);
        }

        let name_moved =
            entry.name() != item.name || parent_differs(&entry, item);

        if !etag_moved && !name_moved && entry.item().size == item.size {
            return Ok(DeltaOutcome::Unchanged);
        }

        // Fold the remote fields in.
        entry.set_name(item.name.clone());
        if let Some(parent) = self.resolve_parent_id(item).await? {
            entry.set_parent_id(parent);
        }
        entry.set_size(item.size);
        entry.set_mtime(item.mtime);
        entry.set_etag(item.etag.clone());
        entry.set_content_hash(item.content_hash);

        // Content invalidation: a moved etag over clean hydrated content
        // ghosts the entry; the delta loop drops the cache file and
        // requeues pinned items.
        if etag_moved && !entry.is_directory() && entry.state() == ItemState::Hydrated {
            let from = entry.state();
            entry.transition_to(ItemState::Ghost)?;
            self.store.put(&entry).await?;
            self.emit(entry.id().clone(), from, ItemState::Ghost);
            return Ok(DeltaOutcome::Invalidated);
        }

        self.store.put(&entry).await?;
        Ok(DeltaOutcome::Updated)
    }

    /// Remote tombstone: mark deleted. The caller removes the entry (and
    /// its content) after parent-index fixup.
    ///
    /// An in-flight upload is parked first; the remote's deletion wins,
    /// and the orphaned session dies when it finds the tombstone.
    pub async fn apply_remote_tombstone(
        &self,
        remote_id: &graphfs_core::domain::RemoteId,
    ) -> Result<Option<ItemId>, CoreError> {
        let Some(entry) = self.store.get_by_remote(remote_id).await? else {
            return Ok(None);
        };
        let id = entry.id().clone();
        match entry.state() {
            ItemState::Deleted => {}
            ItemState::Uploading => {
                self.upload_interrupted(&id).await?;
                self.mark_deleted(&id).await?;
            }
            _ => self.mark_deleted(&id).await?,
        }
        Ok(Some(id))
    }

    async fn create_from_remote(&self, item: &RemoteItem) -> Result<DeltaOutcome, CoreError> {
        let parent_id = self.resolve_parent_id(item).await?;
        let local = graphfs_core::domain::Item {
            id: ItemId::new(item.id.as_str())?,
            remote_id: Some(item.id.clone()),
            name: item.name.clone(),
            parent_id,
            is_directory: item.is_directory,
            size: item.size,
            etag: Some(item.etag.clone()),
            mtime: item.mtime,
            content_hash: item.content_hash,
            mode: if item.is_directory { 0o755 } else { 0o644 },
        };
        let entry = MetadataEntry::from_remote(local, self.default_overlay);
        self.store.put(&entry).await?;
        Ok(DeltaOutcome::Created)
    }

    /// Map the remote parent reference onto the local id space.
    async fn resolve_parent_id(&self, item: &RemoteItem) -> Result<Option<ItemId>, CoreError> {
        let Some(remote_parent) = &item.parent_id else {
            return Ok(None);
        };
        if let Some(parent_entry) = self.store.get_by_remote(remote_parent).await? {
            return Ok(Some(parent_entry.id().clone()));
        }
        // Parent not yet known locally; fall back to the remote id, which
        // is the local key once the parent's upsert lands.
        Ok(Some(ItemId::new(remote_parent.as_str())?))
    }

    /// Find a pending `local-*` entry matching a remote upsert by
    /// (parent, name).
    async fn match_pending_local(
        &self,
        item: &RemoteItem,
    ) -> Result<Option<MetadataEntry>, CoreError> {
        let Some(parent) = self.resolve_parent_id(item).await? else {
            return Ok(None);
        };
        let found = self.store.lookup_child(&parent, &item.name).await?;
        Ok(found.filter(|e| e.id().is_local() && e.pending_remote() && !e.is_virtual()))
    }
}

fn parent_differs(entry: &MetadataEntry, item: &RemoteItem) -> bool {
    match (&entry.item().parent_id, &item.parent_id) {
        (Some(local), Some(remote)) => local.as_str() != remote.as_str(),
        (None, None) => false,
        _ => true,
    }
}
