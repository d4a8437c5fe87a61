//! Content cache
//!
//! On-disk byte storage for hydrated file content: one file per item under
//! `content/`, named by id (`local-*` ids verbatim). An in-memory index
//! mirrors the directory with per-entry size, last-access time, and open
//! refcount; the index is presence information only, never the source of
//! truth for metadata.
//!
//! Eviction is LRU by last access and routes the `Hydrated -> Ghost`
//! transition through the State Manager; dirty, uploading, and conflicted
//! content is never evicted. The periodic cleanup pass additionally expires
//! entries older than the configured age and removes orphaned files whose
//! metadata entry is gone.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use graphfs_core::domain::{ItemId, PinMode};
use graphfs_core::CoreError;

use crate::state::StateManager;

/// In-memory mirror of one cached content file.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub size: u64,
    pub last_accessed: DateTime<Utc>,
    pub open_refcount: u32,
}

/// On-disk content store with an in-memory presence index.
pub struct ContentCache {
    content_dir: PathBuf,
    /// Total-size bound in bytes; 0 means unlimited.
    max_size: u64,
    expiration_days: u32,
    entries: DashMap<ItemId, CacheEntry>,
    total: AtomicU64,
}

impl ContentCache {
    /// Open the cache rooted at `content_dir`, creating the directory and
    /// indexing any files left over from a previous run. Stray `.partial`
    /// files are removed.
    pub fn open(
        content_dir: PathBuf,
        max_size: u64,
        expiration_days: u32,
    ) -> Result<Self, CoreError> {
        fs::create_dir_all(&content_dir)
            .map_err(|e| CoreError::Storage(format!("create {}: {e}", content_dir.display())))?;

        let cache = Self {
            content_dir,
            max_size,
            expiration_days,
            entries: DashMap::new(),
            total: AtomicU64::new(0),
        };
        cache.index_existing()?;
        Ok(cache)
    }

    fn index_existing(&self) -> Result<(), CoreError> {
        for dirent in fs::read_dir(&self.content_dir)
            .map_err(|e| CoreError::Storage(format!("scan cache: {e}")))?
        {
            let dirent = dirent.map_err(|e| CoreError::Storage(format!("scan cache: {e}")))?;
            let name = dirent.file_name().to_string_lossy().to_string();
            if name.ends_with(".partial") {
                let _ = fs::remove_file(dirent.path());
                continue;
            }
            let meta = dirent
                .metadata()
                .map_err(|e| CoreError::Storage(format!("stat {name}: {e}")))?;
            if !meta.is_file() {
                continue;
            }
            let Ok(id) = ItemId::new(name) else { continue };
            self.entries.insert(
                id,
                CacheEntry {
                    size: meta.len(),
                    last_accessed: meta
                        .accessed()
                        .map(DateTime::<Utc>::from)
                        .unwrap_or_else(|_| Utc::now()),
                    open_refcount: 0,
                },
            );
            self.total.fetch_add(meta.len(), Ordering::SeqCst);
        }
        tracing::debug!(
            entries = self.entries.len(),
            bytes = self.total.load(Ordering::SeqCst),
            "content cache indexed"
        );
        Ok(())
    }

    /// Path of the content file for `id`.
    pub fn path_for(&self, id: &ItemId) -> PathBuf {
        self.content_dir.join(id.as_str())
    }

    fn partial_path_for(&self, id: &ItemId) -> PathBuf {
        self.content_dir.join(format!("{}.partial", id.as_str()))
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn expiration_days(&self) -> u32 {
        self.expiration_days
    }

    pub fn has_content(&self, id: &ItemId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn size_of(&self, id: &ItemId) -> Option<u64> {
        self.entries.get(id).map(|e| e.size)
    }

    pub fn total_size(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn open_refcount(&self, id: &ItemId) -> u32 {
        self.entries.get(id).map(|e| e.open_refcount).unwrap_or(0)
    }

    // ========================================================================
    // Handles
    // ========================================================================

    /// Register an open file handle against the entry. While the refcount
    /// is non-zero the entry cannot be evicted.
    pub fn open(&self, id: &ItemId) -> Result<(), CoreError> {
        let mut entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| CoreError::NotFound(format!("no cached content for {id}")))?;
        entry.open_refcount += 1;
        entry.last_accessed = Utc::now();
        Ok(())
    }

    /// Drop one open-handle reference.
    pub fn release(&self, id: &ItemId) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.open_refcount = entry.open_refcount.saturating_sub(1);
            entry.last_accessed = Utc::now();
        }
    }

    // ========================================================================
    // I/O
    // ========================================================================

    /// Read up to `size` bytes at `offset`. Short reads at EOF return the
    /// available bytes.
    pub fn read_at(&self, id: &ItemId, offset: u64, size: u32) -> Result<Vec<u8>, CoreError> {
        let path = self.path_for(id);
        let mut file = File::open(&path)
            .map_err(|e| CoreError::Storage(format!("open {}: {e}", path.display())))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| CoreError::Storage(format!("seek {}: {e}", path.display())))?;
        let mut buffer = vec![0u8; size as usize];
        let mut read_total = 0usize;
        loop {
            let n = file
                .read(&mut buffer[read_total..])
                .map_err(|e| CoreError::Storage(format!("read {}: {e}", path.display())))?;
            if n == 0 {
                break;
            }
            read_total += n;
            if read_total == buffer.len() {
                break;
            }
        }
        buffer.truncate(read_total);
        self.touch(id);
        Ok(buffer)
    }

    /// Write `data` at `offset`, creating the file if needed. Returns the
    /// byte count written.
    pub fn write_at(&self, id: &ItemId, offset: u64, data: &[u8]) -> Result<u32, CoreError> {
        let path = self.path_for(id);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| CoreError::Storage(format!("open {}: {e}", path.display())))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| CoreError::Storage(format!("seek {}: {e}", path.display())))?;
        file.write_all(data)
            .map_err(|e| CoreError::Storage(format!("write {}: {e}", path.display())))?;
        let new_size = file
            .metadata()
            .map_err(|e| CoreError::Storage(format!("stat {}: {e}", path.display())))?
            .len();
        self.update_index(id, new_size);
        Ok(data.len() as u32)
    }

    /// Truncate the content file to `size`.
    pub fn truncate(&self, id: &ItemId, size: u64) -> Result<(), CoreError> {
        let path = self.path_for(id);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| CoreError::Storage(format!("open {}: {e}", path.display())))?;
        file.set_len(size)
            .map_err(|e| CoreError::Storage(format!("truncate {}: {e}", path.display())))?;
        self.update_index(id, size);
        Ok(())
    }

    /// Store a complete buffer as the content for `id`.
    pub fn insert(&self, id: &ItemId, data: &[u8]) -> Result<(), CoreError> {
        let path = self.path_for(id);
        let mut file = File::create(&path)
            .map_err(|e| CoreError::Storage(format!("create {}: {e}", path.display())))?;
        file.write_all(data)
            .map_err(|e| CoreError::Storage(format!("write {}: {e}", path.display())))?;
        self.update_index(id, data.len() as u64);
        Ok(())
    }

    /// Begin a streaming insert. Bytes go to a `.partial` file; `commit`
    /// renames it into place and indexes it. Dropping the writer without
    /// committing removes the partial file.
    pub fn insert_stream(self: &Arc<Self>, id: &ItemId) -> Result<CacheWriter, CoreError> {
        let partial = self.partial_path_for(id);
        let file = File::create(&partial)
            .map_err(|e| CoreError::Storage(format!("create {}: {e}", partial.display())))?;
        Ok(CacheWriter {
            cache: Arc::clone(self),
            id: id.clone(),
            file: Some(file),
            partial,
            written: 0,
            committed: false,
        })
    }

    /// Remove the content file (and any partial) for `id`.
    pub fn delete(&self, id: &ItemId) -> Result<(), CoreError> {
        if let Some((_, entry)) = self.entries.remove(id) {
            self.total.fetch_sub(entry.size, Ordering::SeqCst);
        }
        let path = self.path_for(id);
        if path.exists() {
            fs::remove_file(&path)
                .map_err(|e| CoreError::Storage(format!("remove {}: {e}", path.display())))?;
        }
        let partial = self.partial_path_for(id);
        if partial.exists() {
            let _ = fs::remove_file(&partial);
        }
        Ok(())
    }

    /// Duplicate cached content under a second id (conflict siblings).
    pub fn copy(&self, from: &ItemId, to: &ItemId) -> Result<u64, CoreError> {
        let from_path = self.path_for(from);
        let to_path = self.path_for(to);
        let copied = fs::copy(&from_path, &to_path).map_err(|e| {
            CoreError::Storage(format!(
                "copy {} -> {}: {e}",
                from_path.display(),
                to_path.display()
            ))
        })?;
        self.update_index(to, copied);
        Ok(copied)
    }

    /// Move cached content from a `local-*` id to its adopted canonical id.
    pub fn rekey(&self, old: &ItemId, new: &ItemId) -> Result<(), CoreError> {
        let Some((_, entry)) = self.entries.remove(old) else {
            return Ok(());
        };
        let old_path = self.path_for(old);
        let new_path = self.path_for(new);
        fs::rename(&old_path, &new_path).map_err(|e| {
            CoreError::Storage(format!(
                "rename {} -> {}: {e}",
                old_path.display(),
                new_path.display()
            ))
        })?;
        self.entries.insert(new.clone(), entry);
        Ok(())
    }

    fn touch(&self, id: &ItemId) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.last_accessed = Utc::now();
        }
    }

    fn update_index(&self, id: &ItemId, new_size: u64) {
        let mut delta_old = 0u64;
        let mut existed = false;
        if let Some(mut entry) = self.entries.get_mut(id) {
            delta_old = entry.size;
            entry.size = new_size;
            entry.last_accessed = Utc::now();
            existed = true;
        }
        if existed {
            self.total.fetch_sub(delta_old, Ordering::SeqCst);
            self.total.fetch_add(new_size, Ordering::SeqCst);
        } else {
            self.entries.insert(
                id.clone(),
                CacheEntry {
                    size: new_size,
                    last_accessed: Utc::now(),
                    open_refcount: 0,
                },
            );
            self.total.fetch_add(new_size, Ordering::SeqCst);
        }
    }

    // ========================================================================
    // Eviction candidates
    // ========================================================================

    /// Unreferenced entries ordered least-recently-used first.
    pub fn lru_candidates(&self) -> Vec<(ItemId, u64)> {
        let mut candidates: Vec<(ItemId, DateTime<Utc>, u64)> = self
            .entries
            .iter()
            .filter(|e| e.value().open_refcount == 0)
            .map(|e| (e.key().clone(), e.value().last_accessed, e.value().size))
            .collect();
        candidates.sort_by_key(|(_, accessed, _)| *accessed);
        candidates
            .into_iter()
            .map(|(id, _, size)| (id, size))
            .collect()
    }

    /// Unreferenced entries whose last access is older than the expiration
    /// window.
    pub fn expired_candidates(&self) -> Vec<ItemId> {
        if self.expiration_days == 0 {
            return Vec::new();
        }
        let cutoff = Utc::now() - Duration::days(i64::from(self.expiration_days));
        self.entries
            .iter()
            .filter(|e| e.value().open_refcount == 0 && e.value().last_accessed < cutoff)
            .map(|e| e.key().clone())
            .collect()
    }
}

// ============================================================================
// CacheWriter
// ============================================================================

/// Streaming writer returned by [`ContentCache::insert_stream`].
pub struct CacheWriter {
    cache: Arc<ContentCache>,
    id: ItemId,
    file: Option<File>,
    partial: PathBuf,
    written: u64,
    committed: bool,
}

impl CacheWriter {
    /// Append one chunk.
    pub fn write_chunk(&mut self, data: &[u8]) -> Result<(), CoreError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| CoreError::Storage("cache writer already finished".into()))?;
        file.write_all(data)
            .map_err(|e| CoreError::Storage(format!("write {}: {e}", self.partial.display())))?;
        self.written += data.len() as u64;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Rename the partial file into place and index it.
    pub fn commit(mut self) -> Result<u64, CoreError> {
        let file = self.file.take();
        drop(file);
        let final_path = self.cache.path_for(&self.id);
        fs::rename(&self.partial, &final_path).map_err(|e| {
            CoreError::Storage(format!("commit {}: {e}", final_path.display()))
        })?;
        self.cache.update_index(&self.id, self.written);
        self.committed = true;
        Ok(self.written)
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        if !self.committed {
            self.file.take();
            let _ = fs::remove_file(&self.partial);
        }
    }
}

// ============================================================================
// CacheMaintainer
// ============================================================================

/// Result of one cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub expired: usize,
    pub orphans: usize,
    pub evicted_for_space: usize,
}

/// Couples the content cache to the State Manager for the operations that
/// must keep both sides consistent: size-bounded eviction and the periodic
/// cleanup pass.
#[derive(Clone)]
pub struct CacheMaintainer {
    cache: Arc<ContentCache>,
    state: StateManager,
}

impl CacheMaintainer {
    pub fn new(cache: Arc<ContentCache>, state: StateManager) -> Self {
        Self { cache, state }
    }

    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    /// Make room for `incoming` bytes, evicting least-recently-used clean
    /// entries first. Pinned entries are only touched as a last resort
    /// (the pin watcher requeues their hydration immediately), and open
    /// entries never.
    pub async fn ensure_capacity(&self, incoming: u64) -> Result<(), CoreError> {
        let max = self.cache.max_size();
        if max == 0 {
            return Ok(());
        }

        // First pass skips pinned entries; the second may take them.
        for allow_pinned in [false, true] {
            while self.cache.total_size() + incoming > max {
                if !self.evict_one(allow_pinned).await? {
                    break;
                }
            }
            if self.cache.total_size() + incoming <= max {
                return Ok(());
            }
        }

        Err(CoreError::Backpressure(format!(
            "cache full: {} + {incoming} bytes exceeds {max} and nothing is evictable",
            self.cache.total_size()
        )))
    }

    /// Evict the least-recently-used evictable entry. Returns false when no
    /// candidate qualifies.
    async fn evict_one(&self, allow_pinned: bool) -> Result<bool, CoreError> {
        for (id, _) in self.cache.lru_candidates() {
            let Some(entry) = self.state.store().get(&id).await? else {
                // Orphaned content with no metadata entry.
                self.cache.delete(&id)?;
                tracing::warn!(id = %id, "removed orphaned cache content");
                return Ok(true);
            };
            if !entry.state().evictable() {
                continue;
            }
            if entry.pin_mode() == PinMode::Always && !allow_pinned {
                continue;
            }

            if entry.pin_mode() == PinMode::Always {
                self.state.evict_to_ghost_forced(&id).await?;
                tracing::info!(id = %id, "evicted pinned entry under cache pressure");
            } else {
                self.state.evict_to_ghost(&id).await?;
            }
            self.cache.delete(&id)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Periodic cleanup: expire old entries, remove orphans, and re-enforce
    /// the size bound.
    pub async fn cleanup(&self) -> Result<CleanupReport, CoreError> {
        let mut report = CleanupReport::default();

        for id in self.cache.expired_candidates() {
            let Some(entry) = self.state.store().get(&id).await? else {
                self.cache.delete(&id)?;
                report.orphans += 1;
                continue;
            };
            if entry.state().evictable() && entry.pin_mode() != PinMode::Always {
                self.state.evict_to_ghost(&id).await?;
                self.cache.delete(&id)?;
                report.expired += 1;
            }
        }

        // Orphan sweep: content whose metadata entry is Ghost or absent.
        for (id, _) in self.cache.lru_candidates() {
            match self.state.store().get(&id).await? {
                None => {
                    self.cache.delete(&id)?;
                    report.orphans += 1;
                }
                Some(entry) if entry.state() == graphfs_core::domain::ItemState::Ghost => {
                    self.cache.delete(&id)?;
                    report.orphans += 1;
                }
                Some(_) => {}
            }
        }

        // Size bound may have been exceeded while cleanup was pending.
        let max = self.cache.max_size();
        if max > 0 {
            while self.cache.total_size() > max {
                if !self.evict_one(false).await? {
                    break;
                }
                report.evicted_for_space += 1;
            }
        }

        tracing::info!(
            expired = report.expired,
            orphans = report.orphans,
            evicted = report.evicted_for_space,
            total_bytes = self.cache.total_size(),
            "cache cleanup pass complete"
        );
        Ok(report)
    }
}
