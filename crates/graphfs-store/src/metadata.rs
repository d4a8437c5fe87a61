//! Metadata store
//!
//! Durable, transactional mapping `id -> MetadataEntry` plus the
//! parent/child index, backed by the bucket tables of the schema. Entries
//! are stored as JSON documents; the columns needed for indexed lookups
//! (`remote_id`, `parent_id`, `name`, `state`) are extracted alongside and
//! always written in the same transaction as the document, which is what
//! makes `put` atomic with respect to the index.
//!
//! Absence is not deletion: a `Deleted`-state entry is a tombstone row and
//! is distinct from a missing key.

use sqlx::{Row, SqlitePool};

use graphfs_core::domain::{
    DownloadSession, ItemId, ItemState, MetadataEntry, OfflineChange, RemoteId, UploadSession,
};
use graphfs_core::CoreError;

use crate::pool::DatabasePool;

/// One operation of an atomic batch.
#[derive(Debug, Clone)]
pub enum BatchOp {
    Put(MetadataEntry),
    Delete(ItemId),
}

/// Durable key/value store for metadata entries and the auxiliary buckets
/// (delta cursor, transfer sessions, offline change log, settings).
#[derive(Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    pub fn new(pool: &DatabasePool) -> Self {
        Self {
            pool: pool.pool().clone(),
        }
    }

    // ========================================================================
    // metadata_v2 + parent_index
    // ========================================================================

    /// Fetch an entry by primary key. `Ok(None)` for missing ids; never
    /// blocks on the network.
    pub async fn get(&self, id: &ItemId) -> Result<Option<MetadataEntry>, CoreError> {
        let row = sqlx::query("SELECT entry FROM metadata_v2 WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.map(|r| decode_entry(&r.get::<String, _>("entry")))
            .transpose()
    }

    /// Fetch an entry by its remote id.
    pub async fn get_by_remote(
        &self,
        remote_id: &RemoteId,
    ) -> Result<Option<MetadataEntry>, CoreError> {
        let row = sqlx::query("SELECT entry FROM metadata_v2 WHERE remote_id = ?")
            .bind(remote_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.map(|r| decode_entry(&r.get::<String, _>("entry")))
            .transpose()
    }

    /// Resolve a child by name within a parent.
    pub async fn lookup_child(
        &self,
        parent_id: &ItemId,
        name: &str,
    ) -> Result<Option<MetadataEntry>, CoreError> {
        let row = sqlx::query("SELECT entry FROM metadata_v2 WHERE parent_id = ? AND name = ?")
            .bind(parent_id.as_str())
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.map(|r| decode_entry(&r.get::<String, _>("entry")))
            .transpose()
    }

    /// All children of a directory, as a consistent snapshot at call time.
    pub async fn list_children(
        &self,
        parent_id: &ItemId,
    ) -> Result<Vec<MetadataEntry>, CoreError> {
        let rows = sqlx::query(
            "SELECT m.entry FROM parent_index p \
             JOIN metadata_v2 m ON m.id = p.child_id \
             WHERE p.parent_id = ? ORDER BY m.name",
        )
        .bind(parent_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.iter()
            .map(|r| decode_entry(&r.get::<String, _>("entry")))
            .collect()
    }

    /// Child ids of a directory, for snapshot-then-iterate traversal.
    pub async fn child_ids(&self, parent_id: &ItemId) -> Result<Vec<ItemId>, CoreError> {
        let rows = sqlx::query("SELECT child_id FROM parent_index WHERE parent_id = ?")
            .bind(parent_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter()
            .map(|r| ItemId::new(r.get::<String, _>("child_id")))
            .collect()
    }

    /// True once any children have been recorded for this parent (used by
    /// the stale-cache policy to distinguish "empty" from "never fetched").
    pub async fn has_enumerated(&self, parent_id: &ItemId) -> Result<bool, CoreError> {
        if !self.child_ids(parent_id).await?.is_empty() {
            return Ok(true);
        }
        Ok(self
            .get_setting(&format!("enumerated:{parent_id}"))
            .await?
            .is_some())
    }

    /// Record that a directory has been fully enumerated at least once.
    pub async fn mark_enumerated(&self, parent_id: &ItemId) -> Result<(), CoreError> {
        self.set_setting(&format!("enumerated:{parent_id}"), "1")
            .await
    }

    /// Insert or replace an entry, updating the parent index in the same
    /// transaction.
    pub async fn put(&self, entry: &MetadataEntry) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        put_in_tx(&mut tx, entry).await?;
        tx.commit().await.map_err(storage_err)
    }

    /// Remove an entry and its index rows.
    pub async fn delete(&self, id: &ItemId) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        delete_in_tx(&mut tx, id).await?;
        tx.commit().await.map_err(storage_err)
    }

    /// Apply a set of puts/deletes in one transaction.
    pub async fn atomic_batch(&self, ops: Vec<BatchOp>) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        for op in &ops {
            match op {
                BatchOp::Put(entry) => put_in_tx(&mut tx, entry).await?,
                BatchOp::Delete(id) => delete_in_tx(&mut tx, id).await?,
            }
        }
        tx.commit().await.map_err(storage_err)
    }

    /// Re-key an entry from `old_id` to the id inside `entry`, rewriting
    /// the parent index and every child's parent reference atomically.
    ///
    /// Used when a `local-*` item receives its canonical remote id.
    pub async fn rekey(&self, old_id: &ItemId, entry: &MetadataEntry) -> Result<(), CoreError> {
        let children = self.list_children(old_id).await?;

        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        delete_in_tx(&mut tx, old_id).await?;
        put_in_tx(&mut tx, entry).await?;

        for mut child in children {
            child.set_parent_id(entry.id().clone());
            put_in_tx(&mut tx, &child).await?;
        }

        // Carry the enumeration marker over to the new key.
        let moved: Option<String> = sqlx::query("SELECT value FROM settings WHERE key = ?")
            .bind(format!("enumerated:{old_id}"))
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage_err)?
            .map(|r| r.get("value"));
        if moved.is_some() {
            sqlx::query("DELETE FROM settings WHERE key = ?")
                .bind(format!("enumerated:{old_id}"))
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
            sqlx::query("INSERT OR REPLACE INTO settings (key, value) VALUES (?, '1')")
                .bind(format!("enumerated:{}", entry.id()))
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
        }

        tx.commit().await.map_err(storage_err)
    }

    /// All entries currently in one of the given states.
    pub async fn scan_states(
        &self,
        states: &[ItemState],
    ) -> Result<Vec<MetadataEntry>, CoreError> {
        let mut out = Vec::new();
        for state in states {
            let rows = sqlx::query("SELECT entry FROM metadata_v2 WHERE state = ?")
                .bind(state.name())
                .fetch_all(&self.pool)
                .await
                .map_err(storage_err)?;
            for r in &rows {
                out.push(decode_entry(&r.get::<String, _>("entry"))?);
            }
        }
        Ok(out)
    }

    /// Item counts per state name, for the stats snapshot.
    pub async fn count_by_state(&self) -> Result<Vec<(String, u64)>, CoreError> {
        let rows =
            sqlx::query("SELECT state, COUNT(*) AS n FROM metadata_v2 GROUP BY state ORDER BY state")
                .fetch_all(&self.pool)
                .await
                .map_err(storage_err)?;
        Ok(rows
            .iter()
            .map(|r| (r.get::<String, _>("state"), r.get::<i64, _>("n") as u64))
            .collect())
    }

    /// Total number of entries.
    pub async fn count_entries(&self) -> Result<u64, CoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM metadata_v2")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    // ========================================================================
    // delta_link
    // ========================================================================

    pub async fn delta_link(&self) -> Result<Option<String>, CoreError> {
        let row = sqlx::query("SELECT link FROM delta_link WHERE k = 0")
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.map(|r| r.get("link")))
    }

    pub async fn set_delta_link(&self, link: &str) -> Result<(), CoreError> {
        sqlx::query("INSERT OR REPLACE INTO delta_link (k, link) VALUES (0, ?)")
            .bind(link)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    // ========================================================================
    // uploads / downloads
    // ========================================================================

    pub async fn put_upload_session(&self, session: &UploadSession) -> Result<(), CoreError> {
        let json = serde_json::to_string(session)
            .map_err(|e| CoreError::Storage(format!("serialize upload session: {e}")))?;
        sqlx::query("INSERT OR REPLACE INTO uploads (item_id, session) VALUES (?, ?)")
            .bind(session.target_item_id.as_str())
            .bind(json)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    pub async fn get_upload_session(
        &self,
        item_id: &ItemId,
    ) -> Result<Option<UploadSession>, CoreError> {
        let row = sqlx::query("SELECT session FROM uploads WHERE item_id = ?")
            .bind(item_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.map(|r| {
            serde_json::from_str(&r.get::<String, _>("session"))
                .map_err(|e| CoreError::Storage(format!("decode upload session: {e}")))
        })
        .transpose()
    }

    pub async fn delete_upload_session(&self, item_id: &ItemId) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM uploads WHERE item_id = ?")
            .bind(item_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    pub async fn list_upload_sessions(&self) -> Result<Vec<UploadSession>, CoreError> {
        let rows = sqlx::query("SELECT session FROM uploads")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter()
            .map(|r| {
                serde_json::from_str(&r.get::<String, _>("session"))
                    .map_err(|e| CoreError::Storage(format!("decode upload session: {e}")))
            })
            .collect()
    }

    pub async fn put_download_session(&self, session: &DownloadSession) -> Result<(), CoreError> {
        let json = serde_json::to_string(session)
            .map_err(|e| CoreError::Storage(format!("serialize download session: {e}")))?;
        sqlx::query("INSERT OR REPLACE INTO downloads (item_id, session) VALUES (?, ?)")
            .bind(session.target_item_id.as_str())
            .bind(json)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    pub async fn delete_download_session(&self, item_id: &ItemId) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM downloads WHERE item_id = ?")
            .bind(item_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    pub async fn list_download_sessions(&self) -> Result<Vec<DownloadSession>, CoreError> {
        let rows = sqlx::query("SELECT session FROM downloads")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter()
            .map(|r| {
                serde_json::from_str(&r.get::<String, _>("session"))
                    .map_err(|e| CoreError::Storage(format!("decode download session: {e}")))
            })
            .collect()
    }

    // ========================================================================
    // offline_changes
    // ========================================================================

    /// Append a change to the durable log. Must complete before the change
    /// is applied to local metadata (offline-safety invariant).
    pub async fn append_offline_change(&self, change: &OfflineChange) -> Result<(), CoreError> {
        let json = serde_json::to_string(change)
            .map_err(|e| CoreError::Storage(format!("serialize offline change: {e}")))?;
        sqlx::query(
            "INSERT INTO offline_changes (change_id, item_id, change) VALUES (?, ?, ?)",
        )
        .bind(change.change_id.to_string())
        .bind(change.item_id.as_str())
        .bind(json)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    /// All pending changes in recorded order.
    pub async fn list_offline_changes(&self) -> Result<Vec<OfflineChange>, CoreError> {
        let rows = sqlx::query("SELECT change FROM offline_changes ORDER BY seq")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter()
            .map(|r| {
                serde_json::from_str(&r.get::<String, _>("change"))
                    .map_err(|e| CoreError::Storage(format!("decode offline change: {e}")))
            })
            .collect()
    }

    pub async fn count_offline_changes(&self) -> Result<usize, CoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM offline_changes")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.get::<i64, _>("n") as usize)
    }

    /// Remove one drained change by its change id.
    pub async fn remove_offline_change(&self, change: &OfflineChange) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM offline_changes WHERE change_id = ?")
            .bind(change.change_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Drop every pending change for a `local-*` item that was deleted
    /// before ever reaching the remote (log compaction).
    pub async fn purge_offline_changes_for(&self, item_id: &ItemId) -> Result<u64, CoreError> {
        let result = sqlx::query("DELETE FROM offline_changes WHERE item_id = ?")
            .bind(item_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(result.rows_affected())
    }

    // ========================================================================
    // settings
    // ========================================================================

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>, CoreError> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.map(|r| r.get("value")))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<(), CoreError> {
        sqlx::query("INSERT OR REPLACE INTO settings (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}

// ============================================================================
// Internals
// ============================================================================

fn storage_err(e: sqlx::Error) -> CoreError {
    CoreError::Storage(e.to_string())
}

fn decode_entry(json: &str) -> Result<MetadataEntry, CoreError> {
    serde_json::from_str(json).map_err(|e| CoreError::Storage(format!("decode entry: {e}")))
}

async fn put_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    entry: &MetadataEntry,
) -> Result<(), CoreError> {
    let json = serde_json::to_string(entry)
        .map_err(|e| CoreError::Storage(format!("serialize entry: {e}")))?;

    sqlx::query(
        "INSERT OR REPLACE INTO metadata_v2 (id, remote_id, parent_id, name, state, entry) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(entry.id().as_str())
    .bind(entry.item().remote_id.as_ref().map(|r| r.as_str()))
    .bind(entry.parent_id().map(|p| p.as_str()))
    .bind(entry.name())
    .bind(entry.state().name())
    .bind(json)
    .execute(&mut **tx)
    .await
    .map_err(storage_err)?;

    // Rebuild this child's index rows: drop any stale parent association,
    // then insert the current one.
    sqlx::query("DELETE FROM parent_index WHERE child_id = ?")
        .bind(entry.id().as_str())
        .execute(&mut **tx)
        .await
        .map_err(storage_err)?;
    if let Some(parent) = entry.parent_id() {
        sqlx::query("INSERT OR REPLACE INTO parent_index (parent_id, child_id) VALUES (?, ?)")
            .bind(parent.as_str())
            .bind(entry.id().as_str())
            .execute(&mut **tx)
            .await
            .map_err(storage_err)?;
    }
    Ok(())
}

async fn delete_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    id: &ItemId,
) -> Result<(), CoreError> {
    sqlx::query("DELETE FROM metadata_v2 WHERE id = ?")
        .bind(id.as_str())
        .execute(&mut **tx)
        .await
        .map_err(storage_err)?;
    sqlx::query("DELETE FROM parent_index WHERE child_id = ?")
        .bind(id.as_str())
        .execute(&mut **tx)
        .await
        .map_err(storage_err)?;
    sqlx::query("DELETE FROM parent_index WHERE parent_id = ?")
        .bind(id.as_str())
        .execute(&mut **tx)
        .await
        .map_err(storage_err)?;
    Ok(())
}
