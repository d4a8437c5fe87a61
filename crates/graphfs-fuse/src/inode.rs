//! Inode table
//!
//! Bidirectional mapping between kernel inode numbers and item ids, plus
//! the per-inode locks of the locking discipline. Inode numbers are stable
//! for the lifetime of the mount: a rename keeps its inode, and an id
//! adoption (`local-*` to canonical) moves the mapping rather than
//! allocating a new number, so open file handles survive both.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use dashmap::DashMap;

use graphfs_core::domain::ItemId;

/// Inode number of the filesystem root.
pub const ROOT_INO: u64 = 1;

/// Bidirectional ino ↔ id map with per-inode RW locks.
pub struct InodeTable {
    by_ino: DashMap<u64, ItemId>,
    by_id: DashMap<ItemId, u64>,
    locks: DashMap<u64, Arc<RwLock<()>>>,
    next: AtomicU64,
}

impl InodeTable {
    /// New table with the root pre-registered as inode 1.
    pub fn new(root_id: ItemId) -> Self {
        let table = Self {
            by_ino: DashMap::new(),
            by_id: DashMap::new(),
            locks: DashMap::new(),
            next: AtomicU64::new(ROOT_INO + 1),
        };
        table.by_ino.insert(ROOT_INO, root_id.clone());
        table.by_id.insert(root_id, ROOT_INO);
        table
    }

    /// Inode number for an id, allocating one on first sight.
    pub fn ino_for(&self, id: &ItemId) -> u64 {
        if let Some(ino) = self.by_id.get(id) {
            return *ino;
        }
        let ino = self.next.fetch_add(1, Ordering::SeqCst);
        self.by_id.insert(id.clone(), ino);
        self.by_ino.insert(ino, id.clone());
        ino
    }

    /// Id behind an inode number, if known.
    pub fn id_for(&self, ino: u64) -> Option<ItemId> {
        self.by_ino.get(&ino).map(|id| id.clone())
    }

    /// Move a mapping to an adopted canonical id, keeping the inode.
    pub fn rekey(&self, old_id: &ItemId, new_id: &ItemId) {
        if let Some((_, ino)) = self.by_id.remove(old_id) {
            self.by_id.insert(new_id.clone(), ino);
            self.by_ino.insert(ino, new_id.clone());
        }
    }

    /// Drop the mapping for a removed entry.
    pub fn forget(&self, id: &ItemId) {
        if let Some((_, ino)) = self.by_id.remove(id) {
            self.by_ino.remove(&ino);
            self.locks.remove(&ino);
        }
    }

    pub fn len(&self) -> usize {
        self.by_ino.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ino.is_empty()
    }

    // ========================================================================
    // Per-inode locks
    // ========================================================================

    /// The lock backing one inode. The caller holds the `Arc` for as long
    /// as the guard lives.
    pub fn lock_arc(&self, ino: u64) -> Arc<RwLock<()>> {
        self.locks
            .entry(ino)
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Locks for two inodes, ordered ascending by id (ties collapse to one
    /// lock) so no interleaving of rename operations can invert the
    /// acquisition order. Lock them in the returned order.
    pub fn ordered_locks(
        &self,
        a: (u64, &ItemId),
        b: (u64, &ItemId),
    ) -> Vec<Arc<RwLock<()>>> {
        if a.0 == b.0 {
            return vec![self.lock_arc(a.0)];
        }
        let (first, second) = if a.1 <= b.1 { (a.0, b.0) } else { (b.0, a.0) };
        vec![self.lock_arc(first), self.lock_arc(second)]
    }
}

/// Acquire a shared guard, absorbing poison (the protected data is `()`).
pub fn read_lock(lock: &RwLock<()>) -> RwLockReadGuard<'_, ()> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Acquire an exclusive guard, absorbing poison.
pub fn write_lock(lock: &RwLock<()>) -> RwLockWriteGuard<'_, ()> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> InodeTable {
        InodeTable::new(ItemId::new("root").unwrap())
    }

    #[test]
    fn test_root_is_ino_one() {
        let t = table();
        assert_eq!(t.ino_for(&ItemId::new("root").unwrap()), ROOT_INO);
        assert_eq!(t.id_for(ROOT_INO).unwrap().as_str(), "root");
    }

    #[test]
    fn test_allocation_is_stable() {
        let t = table();
        let id = ItemId::new("a").unwrap();
        let ino = t.ino_for(&id);
        assert!(ino > ROOT_INO);
        assert_eq!(t.ino_for(&id), ino);
        assert_eq!(t.id_for(ino).unwrap(), id);
    }

    #[test]
    fn test_rekey_keeps_ino() {
        let t = table();
        let local = ItemId::new_local();
        let ino = t.ino_for(&local);

        let canonical = ItemId::new("srv-1").unwrap();
        t.rekey(&local, &canonical);

        assert_eq!(t.id_for(ino).unwrap(), canonical);
        assert_eq!(t.ino_for(&canonical), ino);
        assert!(t.by_id.get(&local).is_none());
    }

    #[test]
    fn test_forget_removes_both_directions() {
        let t = table();
        let id = ItemId::new("a").unwrap();
        let ino = t.ino_for(&id);
        t.forget(&id);
        assert!(t.id_for(ino).is_none());
        // A fresh sighting allocates a new inode.
        assert_ne!(t.ino_for(&id), ino);
    }

    #[test]
    fn test_ordered_locks_same_inode_collapse() {
        let t = table();
        let id = ItemId::new("a").unwrap();
        let ino = t.ino_for(&id);
        assert_eq!(t.ordered_locks((ino, &id), (ino, &id)).len(), 1);
    }

    #[test]
    fn test_ordered_locks_are_order_independent() {
        let t = table();
        let a = ItemId::new("aaa").unwrap();
        let b = ItemId::new("bbb").unwrap();
        let ino_a = t.ino_for(&a);
        let ino_b = t.ino_for(&b);

        let forward = t.ordered_locks((ino_a, &a), (ino_b, &b));
        let reverse = t.ordered_locks((ino_b, &b), (ino_a, &a));
        assert!(Arc::ptr_eq(&forward[0], &reverse[0]));
        assert!(Arc::ptr_eq(&forward[1], &reverse[1]));
    }

    #[test]
    fn test_lock_guards() {
        let t = table();
        let id = ItemId::new("a").unwrap();
        let ino = t.ino_for(&id);
        let lock = t.lock_arc(ino);
        {
            let _w = write_lock(&lock);
            assert!(lock.try_read().is_err());
        }
        let _r1 = read_lock(&lock);
        let _r2 = read_lock(&lock);
    }
}
