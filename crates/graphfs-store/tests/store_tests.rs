//! Integration tests for the metadata store, state manager, and content
//! cache working against a real (in-memory) database and a temp directory.

use std::sync::Arc;

use chrono::Utc;

use graphfs_core::domain::{
    ChangeKind, ChangePayload, ContentRef, ETag, Item, ItemId, ItemState, MetadataEntry,
    OfflineChange, OverlayPolicy, PinMode, RemoteId, SessionState, UploadSession,
};
use graphfs_core::ports::RemoteItem;
use graphfs_core::CoreError;
use graphfs_store::{
    BatchOp, CacheMaintainer, ContentCache, DatabasePool, DeltaOutcome, MetadataStore, StateManager,
};

async fn test_store() -> MetadataStore {
    let pool = DatabasePool::in_memory().await.unwrap();
    MetadataStore::new(&pool)
}

async fn test_state() -> StateManager {
    StateManager::new(test_store().await, OverlayPolicy::RemoteWins)
}

fn root_entry() -> MetadataEntry {
    let item = Item::remote_directory(
        ItemId::new("root").unwrap(),
        RemoteId::new("root").unwrap(),
        "",
        None,
        ETag::new("e-root"),
        Utc::now(),
    );
    MetadataEntry::from_remote(item, OverlayPolicy::RemoteWins)
}

fn file_entry(id: &str, name: &str, etag: &str) -> MetadataEntry {
    let item = Item::remote_file(
        ItemId::new(id).unwrap(),
        RemoteId::new(id).unwrap(),
        name,
        ItemId::new("root").unwrap(),
        500,
        ETag::new(etag),
        Utc::now(),
        None,
    );
    MetadataEntry::from_remote(item, OverlayPolicy::RemoteWins)
}

fn remote_file(id: &str, name: &str, etag: &str, size: u64) -> RemoteItem {
    RemoteItem {
        id: RemoteId::new(id).unwrap(),
        name: name.to_string(),
        parent_id: Some(RemoteId::new("root").unwrap()),
        is_directory: false,
        size,
        etag: ETag::new(etag),
        mtime: Utc::now(),
        content_hash: None,
    }
}

mod metadata_store_tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = test_store().await;
        let entry = file_entry("a1", "A.txt", "e1");
        store.put(&entry).await.unwrap();

        let loaded = store.get(entry.id()).await.unwrap().unwrap();
        assert_eq!(loaded, entry);
    }

    #[tokio::test]
    async fn test_get_missing_is_none_not_error() {
        let store = test_store().await;
        let got = store.get(&ItemId::new("nope").unwrap()).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_parent_index_tracks_children() {
        let store = test_store().await;
        store.put(&root_entry()).await.unwrap();
        store.put(&file_entry("a1", "A.txt", "e1")).await.unwrap();
        store.put(&file_entry("b1", "B.txt", "e2")).await.unwrap();

        let root = ItemId::new("root").unwrap();
        let children = store.list_children(&root).await.unwrap();
        let names: Vec<&str> = children.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["A.txt", "B.txt"]);

        let ids = store.child_ids(&root).await.unwrap();
        assert_eq!(ids.len(), 2);
    }

    #[tokio::test]
    async fn test_put_is_atomic_with_index_on_reparent() {
        let store = test_store().await;
        store.put(&root_entry()).await.unwrap();

        let dir_item = Item::remote_directory(
            ItemId::new("d1").unwrap(),
            RemoteId::new("d1").unwrap(),
            "docs",
            Some(ItemId::new("root").unwrap()),
            ETag::new("e-d"),
            Utc::now(),
        );
        store
            .put(&MetadataEntry::from_remote(dir_item, OverlayPolicy::RemoteWins))
            .await
            .unwrap();

        let mut entry = file_entry("a1", "A.txt", "e1");
        store.put(&entry).await.unwrap();

        // Move the file under the directory; the old index row must vanish.
        entry.set_parent_id(ItemId::new("d1").unwrap());
        store.put(&entry).await.unwrap();

        let root_children = store.child_ids(&ItemId::new("root").unwrap()).await.unwrap();
        assert_eq!(root_children.len(), 1); // only the directory
        let dir_children = store.child_ids(&ItemId::new("d1").unwrap()).await.unwrap();
        assert_eq!(dir_children, vec![ItemId::new("a1").unwrap()]);
    }

    #[tokio::test]
    async fn test_delete_removes_entry_and_index() {
        let store = test_store().await;
        store.put(&root_entry()).await.unwrap();
        store.put(&file_entry("a1", "A.txt", "e1")).await.unwrap();

        store.delete(&ItemId::new("a1").unwrap()).await.unwrap();
        assert!(store.get(&ItemId::new("a1").unwrap()).await.unwrap().is_none());
        assert!(store
            .child_ids(&ItemId::new("root").unwrap())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_atomic_batch_applies_all_ops() {
        let store = test_store().await;
        store.put(&root_entry()).await.unwrap();
        store.put(&file_entry("old", "Old.txt", "e0")).await.unwrap();

        store
            .atomic_batch(vec![
                BatchOp::Delete(ItemId::new("old").unwrap()),
                BatchOp::Put(file_entry("new", "New.txt", "e1")),
            ])
            .await
            .unwrap();

        assert!(store.get(&ItemId::new("old").unwrap()).await.unwrap().is_none());
        assert!(store.get(&ItemId::new("new").unwrap()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rekey_rewrites_children() {
        let store = test_store().await;
        store.put(&root_entry()).await.unwrap();

        // A local-* directory with one child.
        let local_dir = Item::new_local("newdir", ItemId::new("root").unwrap(), true);
        let local_dir_id = local_dir.id.clone();
        let mut dir_entry = MetadataEntry::from_local_create(local_dir, OverlayPolicy::RemoteWins);
        store.put(&dir_entry).await.unwrap();

        let child = Item::new_local("inner.txt", local_dir_id.clone(), false);
        store
            .put(&MetadataEntry::from_local_create(child, OverlayPolicy::RemoteWins))
            .await
            .unwrap();

        // Adopt the canonical id.
        dir_entry.adopt_remote_id(RemoteId::new("canonical-dir").unwrap());
        store.rekey(&local_dir_id, &dir_entry).await.unwrap();

        assert!(store.get(&local_dir_id).await.unwrap().is_none());
        let rekeyed = store
            .get(&ItemId::new("canonical-dir").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rekeyed.name(), "newdir");

        let children = store
            .list_children(&ItemId::new("canonical-dir").unwrap())
            .await
            .unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(
            children[0].parent_id().unwrap().as_str(),
            "canonical-dir"
        );
    }

    #[tokio::test]
    async fn test_scan_states() {
        let store = test_store().await;
        store.put(&root_entry()).await.unwrap();
        store.put(&file_entry("a1", "A.txt", "e1")).await.unwrap();

        let ghosts = store.scan_states(&[ItemState::Ghost]).await.unwrap();
        assert_eq!(ghosts.len(), 1);
        let dirty = store.scan_states(&[ItemState::DirtyLocal]).await.unwrap();
        assert!(dirty.is_empty());
    }

    #[tokio::test]
    async fn test_delta_link_persistence() {
        let store = test_store().await;
        assert!(store.delta_link().await.unwrap().is_none());
        store.set_delta_link("cursor-1").await.unwrap();
        store.set_delta_link("cursor-2").await.unwrap();
        assert_eq!(store.delta_link().await.unwrap().as_deref(), Some("cursor-2"));
    }

    #[tokio::test]
    async fn test_upload_session_bucket() {
        let store = test_store().await;
        let session = UploadSession::new(
            ItemId::new("a1").unwrap(),
            ContentRef::Buffer(vec![1, 2, 3]),
            1024,
        );
        store.put_upload_session(&session).await.unwrap();

        let loaded = store
            .get_upload_session(&ItemId::new("a1").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, session);
        assert_eq!(loaded.state, SessionState::Queued);

        store
            .delete_upload_session(&ItemId::new("a1").unwrap())
            .await
            .unwrap();
        assert!(store
            .get_upload_session(&ItemId::new("a1").unwrap())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_offline_log_preserves_order() {
        let store = test_store().await;
        let id = ItemId::new_local();
        for name in ["first", "second", "third"] {
            store
                .append_offline_change(&OfflineChange::new(
                    ChangeKind::Rename,
                    id.clone(),
                    ChangePayload {
                        new_name: Some(name.to_string()),
                        ..ChangePayload::default()
                    },
                ))
                .await
                .unwrap();
        }

        let changes = store.list_offline_changes().await.unwrap();
        let names: Vec<_> = changes
            .iter()
            .map(|c| c.payload.new_name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["first", "second", "third"]);

        store.remove_offline_change(&changes[1]).await.unwrap();
        assert_eq!(store.count_offline_changes().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_offline_log_compaction_for_item() {
        let store = test_store().await;
        let doomed = ItemId::new_local();
        let kept = ItemId::new_local();
        store
            .append_offline_change(&OfflineChange::new(
                ChangeKind::Create,
                doomed.clone(),
                ChangePayload::default(),
            ))
            .await
            .unwrap();
        store
            .append_offline_change(&OfflineChange::new(
                ChangeKind::Modify,
                doomed.clone(),
                ChangePayload::default(),
            ))
            .await
            .unwrap();
        store
            .append_offline_change(&OfflineChange::new(
                ChangeKind::Create,
                kept.clone(),
                ChangePayload::default(),
            ))
            .await
            .unwrap();

        let removed = store.purge_offline_changes_for(&doomed).await.unwrap();
        assert_eq!(removed, 2);
        let remaining = store.list_offline_changes().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].item_id, kept);
    }

    #[tokio::test]
    async fn test_enumeration_marker() {
        let store = test_store().await;
        store.put(&root_entry()).await.unwrap();
        let root = ItemId::new("root").unwrap();

        assert!(!store.has_enumerated(&root).await.unwrap());
        store.mark_enumerated(&root).await.unwrap();
        assert!(store.has_enumerated(&root).await.unwrap());
    }
}

mod state_manager_tests {
    use super::*;

    async fn seed_file(state: &StateManager, id: &str, etag: &str) -> ItemId {
        state.store().put(&root_entry()).await.unwrap();
        let entry = file_entry(id, &format!("{id}.txt"), etag);
        state.store().put(&entry).await.unwrap();
        entry.id().clone()
    }

    #[tokio::test]
    async fn test_hydration_lifecycle() {
        let state = test_state().await;
        let id = seed_file(&state, "a1", "e1").await;

        state.begin_hydrate(&id).await.unwrap();
        assert_eq!(
            state.store().get(&id).await.unwrap().unwrap().state(),
            ItemState::Hydrating
        );

        state
            .complete_hydrate(&id, ETag::new("e1"), 500)
            .await
            .unwrap();
        assert_eq!(
            state.store().get(&id).await.unwrap().unwrap().state(),
            ItemState::Hydrated
        );
    }

    #[tokio::test]
    async fn test_invalid_transition_is_refused() {
        let state = test_state().await;
        let id = seed_file(&state, "a1", "e1").await;

        // Ghost -> Uploading is not in the table.
        let err = state.begin_upload(&id).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_transition_events_are_emitted() {
        let state = test_state().await;
        let id = seed_file(&state, "a1", "e1").await;
        let mut events = state.subscribe();

        state.begin_hydrate(&id).await.unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.id, id);
        assert_eq!(event.from, ItemState::Ghost);
        assert_eq!(event.to, ItemState::Hydrating);
    }

    #[tokio::test]
    async fn test_mark_deleted_routes_through_cancellation() {
        let state = test_state().await;
        let id = seed_file(&state, "a1", "e1").await;
        state.begin_hydrate(&id).await.unwrap();

        // Hydrating has no direct Deleted edge; the manager cancels first.
        state.mark_deleted(&id).await.unwrap();
        assert_eq!(
            state.store().get(&id).await.unwrap().unwrap().state(),
            ItemState::Deleted
        );
    }

    #[tokio::test]
    async fn test_mark_deleted_refused_while_uploading() {
        let state = test_state().await;
        let id = seed_file(&state, "a1", "e1").await;
        state.mark_dirty(&id).await.unwrap();
        state.begin_upload(&id).await.unwrap();

        let err = state.mark_deleted(&id).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));

        // After interrupting the upload, deletion proceeds.
        state.upload_interrupted(&id).await.unwrap();
        state.mark_deleted(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_complete_upload_adopts_remote_id() {
        let state = test_state().await;
        state.store().put(&root_entry()).await.unwrap();

        let item = Item::new_local("fresh.txt", ItemId::new("root").unwrap(), false);
        let local_id = item.id.clone();
        state
            .store()
            .put(&MetadataEntry::from_local_create(item, OverlayPolicy::RemoteWins))
            .await
            .unwrap();

        state.begin_upload(&local_id).await.unwrap();
        let remote = remote_file("assigned-1", "fresh.txt", "e-up", 9);
        let new_id = state.complete_upload(&local_id, &remote).await.unwrap();

        assert_eq!(new_id.as_str(), "assigned-1");
        assert!(state.store().get(&local_id).await.unwrap().is_none());
        let entry = state.store().get(&new_id).await.unwrap().unwrap();
        assert_eq!(entry.state(), ItemState::Hydrated);
        assert!(!entry.pending_remote());

        // The parent index now carries the canonical id.
        let children = state
            .store()
            .child_ids(&ItemId::new("root").unwrap())
            .await
            .unwrap();
        assert!(children.contains(&new_id));
        assert!(!children.contains(&local_id));
    }

    #[tokio::test]
    async fn test_eviction_refused_for_pinned() {
        let state = test_state().await;
        let id = seed_file(&state, "a1", "e1").await;
        state.begin_hydrate(&id).await.unwrap();
        state.complete_hydrate(&id, ETag::new("e1"), 500).await.unwrap();
        state.set_pin(&id, PinMode::Always).await.unwrap();

        assert!(state.evict_to_ghost(&id).await.is_err());
        // The forced variant is reserved for cache pressure.
        state.evict_to_ghost_forced(&id).await.unwrap();
        assert_eq!(
            state.store().get(&id).await.unwrap().unwrap().state(),
            ItemState::Ghost
        );
    }

    #[tokio::test]
    async fn test_delta_upsert_creates_entry() {
        let state = test_state().await;
        state.store().put(&root_entry()).await.unwrap();

        let outcome = state
            .apply_remote_delta(&remote_file("n1", "New.txt", "e1", 42))
            .await
            .unwrap();
        assert_eq!(outcome, DeltaOutcome::Created);

        let entry = state
            .store()
            .get(&ItemId::new("n1").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.state(), ItemState::Ghost);
        assert_eq!(entry.item().size, 42);
    }

    #[tokio::test]
    async fn test_delta_is_idempotent() {
        let state = test_state().await;
        state.store().put(&root_entry()).await.unwrap();
        let item = remote_file("n1", "New.txt", "e1", 42);

        assert_eq!(
            state.apply_remote_delta(&item).await.unwrap(),
            DeltaOutcome::Created
        );
        assert_eq!(
            state.apply_remote_delta(&item).await.unwrap(),
            DeltaOutcome::Unchanged
        );
        assert_eq!(state.store().count_entries().await.unwrap(), 2); // root + n1
    }

    #[tokio::test]
    async fn test_delta_invalidates_clean_hydrated_content() {
        // Scenario: /x hydrated at e1; delta brings e2.
        let state = test_state().await;
        let id = seed_file(&state, "x", "e1").await;
        state.begin_hydrate(&id).await.unwrap();
        state.complete_hydrate(&id, ETag::new("e1"), 500).await.unwrap();

        let outcome = state
            .apply_remote_delta(&remote_file("x", "x.txt", "e2", 600))
            .await
            .unwrap();
        assert_eq!(outcome, DeltaOutcome::Invalidated);

        let entry = state.store().get(&id).await.unwrap().unwrap();
        assert_eq!(entry.state(), ItemState::Ghost);
        assert_eq!(entry.item().etag.as_ref().unwrap().as_str(), "e2");
        assert_eq!(entry.item().size, 600);
    }

    #[tokio::test]
    async fn test_delta_conflicts_with_dirty_local() {
        let state = test_state().await;
        let id = seed_file(&state, "x", "e1").await;
        state.begin_hydrate(&id).await.unwrap();
        state.complete_hydrate(&id, ETag::new("e1"), 500).await.unwrap();
        state.mark_dirty(&id).await.unwrap();

        let outcome = state
            .apply_remote_delta(&remote_file("x", "x.txt", "e3", 600))
            .await
            .unwrap();
        assert_eq!(outcome, DeltaOutcome::ConflictDetected);
        assert_eq!(
            state.store().get(&id).await.unwrap().unwrap().state(),
            ItemState::Conflict
        );
    }

    #[tokio::test]
    async fn test_delta_echo_of_dirty_base_is_noop() {
        // A delta carrying the etag the local edit is based on is not a
        // conflict.
        let state = test_state().await;
        let id = seed_file(&state, "x", "e1").await;
        state.begin_hydrate(&id).await.unwrap();
        state.complete_hydrate(&id, ETag::new("e1"), 500).await.unwrap();
        state.mark_dirty(&id).await.unwrap();

        let outcome = state
            .apply_remote_delta(&remote_file("x", "x.txt", "e1", 500))
            .await
            .unwrap();
        assert_eq!(outcome, DeltaOutcome::Unchanged);
        assert_eq!(
            state.store().get(&id).await.unwrap().unwrap().state(),
            ItemState::DirtyLocal
        );
    }

    #[tokio::test]
    async fn test_delta_reconciles_pending_local_by_name() {
        // mkdir happened locally; the delta for the created directory must
        // merge into the local-* entry, not duplicate it.
        let state = test_state().await;
        state.store().put(&root_entry()).await.unwrap();

        let item = Item::new_local("newdir", ItemId::new("root").unwrap(), true);
        let local_id = item.id.clone();
        state
            .store()
            .put(&MetadataEntry::from_local_create(item, OverlayPolicy::RemoteWins))
            .await
            .unwrap();

        let mut upsert = remote_file("remote-dir", "newdir", "e-dir", 0);
        upsert.is_directory = true;

        state.apply_remote_delta(&upsert).await.unwrap();

        assert!(state.store().get(&local_id).await.unwrap().is_none());
        let children = state
            .store()
            .list_children(&ItemId::new("root").unwrap())
            .await
            .unwrap();
        let matching: Vec<_> = children.iter().filter(|c| c.name() == "newdir").collect();
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].id().as_str(), "remote-dir");
    }

    #[tokio::test]
    async fn test_tombstone_marks_deleted() {
        let state = test_state().await;
        let id = seed_file(&state, "x", "e1").await;

        let removed = state
            .apply_remote_tombstone(&RemoteId::new("x").unwrap())
            .await
            .unwrap();
        assert_eq!(removed, Some(id.clone()));
        assert_eq!(
            state.store().get(&id).await.unwrap().unwrap().state(),
            ItemState::Deleted
        );

        state.remove(&id).await.unwrap();
        assert!(state.store().get(&id).await.unwrap().is_none());
    }
}

mod content_cache_tests {
    use super::*;

    fn test_cache(max_size: u64) -> (Arc<ContentCache>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::open(dir.path().join("content"), max_size, 30).unwrap();
        (Arc::new(cache), dir)
    }

    #[test]
    fn test_insert_read_roundtrip() {
        let (cache, _dir) = test_cache(0);
        let id = ItemId::new("f1").unwrap();
        cache.insert(&id, b"hello content").unwrap();

        assert!(cache.has_content(&id));
        assert_eq!(cache.size_of(&id), Some(13));
        assert_eq!(cache.total_size(), 13);

        let data = cache.read_at(&id, 6, 7).unwrap();
        assert_eq!(&data, b"content");
    }

    #[test]
    fn test_read_past_eof_is_short() {
        let (cache, _dir) = test_cache(0);
        let id = ItemId::new("f1").unwrap();
        cache.insert(&id, b"short").unwrap();
        let data = cache.read_at(&id, 0, 100).unwrap();
        assert_eq!(&data, b"short");
    }

    #[test]
    fn test_write_at_extends_and_updates_size() {
        let (cache, _dir) = test_cache(0);
        let id = ItemId::new("f1").unwrap();
        cache.insert(&id, b"12345").unwrap();
        cache.write_at(&id, 5, b"6789").unwrap();
        assert_eq!(cache.size_of(&id), Some(9));
        assert_eq!(cache.total_size(), 9);
    }

    #[test]
    fn test_truncate_shrinks() {
        let (cache, _dir) = test_cache(0);
        let id = ItemId::new("f1").unwrap();
        cache.insert(&id, b"1234567890").unwrap();
        cache.truncate(&id, 4).unwrap();
        assert_eq!(cache.size_of(&id), Some(4));
        assert_eq!(cache.read_at(&id, 0, 10).unwrap(), b"1234");
    }

    #[test]
    fn test_stream_commit_and_abort() {
        let (cache, _dir) = test_cache(0);
        let id = ItemId::new("f1").unwrap();

        {
            // Abort path: dropping without commit leaves nothing behind.
            let mut writer = cache.insert_stream(&id).unwrap();
            writer.write_chunk(b"partial").unwrap();
        }
        assert!(!cache.has_content(&id));

        let mut writer = cache.insert_stream(&id).unwrap();
        writer.write_chunk(b"first ").unwrap();
        writer.write_chunk(b"second").unwrap();
        let written = writer.commit().unwrap();
        assert_eq!(written, 12);
        assert_eq!(cache.read_at(&id, 0, 64).unwrap(), b"first second");
    }

    #[test]
    fn test_delete_updates_total() {
        let (cache, _dir) = test_cache(0);
        let id = ItemId::new("f1").unwrap();
        cache.insert(&id, b"0123456789").unwrap();
        cache.delete(&id).unwrap();
        assert!(!cache.has_content(&id));
        assert_eq!(cache.total_size(), 0);
    }

    #[test]
    fn test_rekey_moves_content() {
        let (cache, _dir) = test_cache(0);
        let old = ItemId::new_local();
        let new = ItemId::new("canonical").unwrap();
        cache.insert(&old, b"payload").unwrap();

        cache.rekey(&old, &new).unwrap();
        assert!(!cache.has_content(&old));
        assert_eq!(cache.read_at(&new, 0, 16).unwrap(), b"payload");
    }

    #[test]
    fn test_open_refcount_blocks_candidacy() {
        let (cache, _dir) = test_cache(0);
        let id = ItemId::new("f1").unwrap();
        cache.insert(&id, b"data").unwrap();

        cache.open(&id).unwrap();
        assert!(cache.lru_candidates().is_empty());

        cache.release(&id);
        assert_eq!(cache.lru_candidates().len(), 1);
    }

    #[test]
    fn test_lru_order_is_by_access_time() {
        let (cache, _dir) = test_cache(0);
        let a = ItemId::new("a").unwrap();
        let b = ItemId::new("b").unwrap();
        cache.insert(&a, b"aaaa").unwrap();
        cache.insert(&b, b"bbbb").unwrap();

        // Touch a so b becomes the LRU entry.
        cache.read_at(&a, 0, 4).unwrap();
        let candidates = cache.lru_candidates();
        assert_eq!(candidates[0].0, b);
    }
}

mod maintainer_tests {
    use super::*;

    async fn hydrated_file(state: &StateManager, cache: &Arc<ContentCache>, id: &str, data: &[u8]) {
        let entry = file_entry(id, &format!("{id}.bin"), "e1");
        state.store().put(&entry).await.unwrap();
        let item_id = ItemId::new(id).unwrap();
        state.begin_hydrate(&item_id).await.unwrap();
        cache.insert(&item_id, data).unwrap();
        state
            .complete_hydrate(&item_id, ETag::new("e1"), data.len() as u64)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_capacity_eviction_ghosts_lru_entry() {
        let state = test_state().await;
        state.store().put(&root_entry()).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ContentCache::open(dir.path().join("content"), 10, 30).unwrap());
        let maintainer = CacheMaintainer::new(Arc::clone(&cache), state.clone());

        hydrated_file(&state, &cache, "a", b"aaaaaa").await; // 6 bytes

        // Making room for 6 more requires evicting "a".
        maintainer.ensure_capacity(6).await.unwrap();
        assert!(!cache.has_content(&ItemId::new("a").unwrap()));
        assert_eq!(
            state
                .store()
                .get(&ItemId::new("a").unwrap())
                .await
                .unwrap()
                .unwrap()
                .state(),
            ItemState::Ghost
        );
    }

    #[tokio::test]
    async fn test_dirty_content_is_never_evicted() {
        let state = test_state().await;
        state.store().put(&root_entry()).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ContentCache::open(dir.path().join("content"), 10, 30).unwrap());
        let maintainer = CacheMaintainer::new(Arc::clone(&cache), state.clone());

        hydrated_file(&state, &cache, "a", b"aaaaaa").await;
        state.mark_dirty(&ItemId::new("a").unwrap()).await.unwrap();

        let err = maintainer.ensure_capacity(6).await.unwrap_err();
        assert!(matches!(err, CoreError::Backpressure(_)));
        assert!(cache.has_content(&ItemId::new("a").unwrap()));
    }

    #[tokio::test]
    async fn test_pinned_entry_evicted_only_under_pressure() {
        let state = test_state().await;
        state.store().put(&root_entry()).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ContentCache::open(dir.path().join("content"), 10, 30).unwrap());
        let maintainer = CacheMaintainer::new(Arc::clone(&cache), state.clone());

        hydrated_file(&state, &cache, "pinned", b"aaaaaa").await;
        state
            .set_pin(&ItemId::new("pinned").unwrap(), PinMode::Always)
            .await
            .unwrap();
        hydrated_file(&state, &cache, "other", b"bb").await;

        // 8 bytes cached, capacity 10, incoming 6: evicting "other" (2
        // bytes) is not enough, so the pinned entry goes too.
        maintainer.ensure_capacity(6).await.unwrap();
        assert!(!cache.has_content(&ItemId::new("pinned").unwrap()));
        assert_eq!(
            state
                .store()
                .get(&ItemId::new("pinned").unwrap())
                .await
                .unwrap()
                .unwrap()
                .state(),
            ItemState::Ghost
        );
    }

    #[tokio::test]
    async fn test_cleanup_removes_orphans() {
        let state = test_state().await;
        state.store().put(&root_entry()).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ContentCache::open(dir.path().join("content"), 0, 30).unwrap());
        let maintainer = CacheMaintainer::new(Arc::clone(&cache), state.clone());

        // Content with no metadata entry at all.
        cache.insert(&ItemId::new("orphan").unwrap(), b"stray").unwrap();

        let report = maintainer.cleanup().await.unwrap();
        assert_eq!(report.orphans, 1);
        assert!(!cache.has_content(&ItemId::new("orphan").unwrap()));
    }
}
