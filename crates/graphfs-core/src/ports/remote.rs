//! Remote store port (driven/secondary port)
//!
//! Abstract contract to the remote object store. The production adapter is
//! an authenticated Graph HTTP client; tests use in-process fakes. The
//! engine never sees HTTP: errors arrive pre-classified into the
//! [`CoreError`] taxonomy (transport failures as `Network`, 401/403 as
//! `Auth`, 404 as `NotFound`, 412 as `Conflict`).
//!
//! Content URLs are pre-authenticated and do not support conditional GET;
//! cache invalidation is delta-driven, so no method takes an etag
//! precondition on reads.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::hash::ContentHash;
use crate::domain::ids::{ETag, RemoteId};
use crate::error::CoreError;

/// An item record as the remote store reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteItem {
    pub id: RemoteId,
    pub name: String,
    /// `None` only for the drive root.
    pub parent_id: Option<RemoteId>,
    pub is_directory: bool,
    pub size: u64,
    pub etag: ETag,
    pub mtime: DateTime<Utc>,
    /// QuickXOR digest; absent for directories.
    pub content_hash: Option<ContentHash>,
}

/// One page of a `list_children` enumeration.
#[derive(Debug, Clone)]
pub struct ChildPage {
    pub items: Vec<RemoteItem>,
    /// Opaque continuation token; `None` on the last page.
    pub next_page: Option<String>,
}

/// One incremental change from the delta endpoint.
#[derive(Debug, Clone)]
pub enum DeltaEvent {
    Upsert(RemoteItem),
    Tombstone { id: RemoteId },
}

/// One page of the delta feed.
#[derive(Debug, Clone)]
pub struct DeltaPage {
    pub events: Vec<DeltaEvent>,
    /// More pages follow in this sweep.
    pub next_link: Option<String>,
    /// New durable cursor; present only on the final page of a sweep.
    pub delta_link: Option<String>,
}

/// Byte range of a content read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub len: u64,
}

/// Fields of a metadata patch (rename / move).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemPatch {
    pub name: Option<String>,
    pub parent_id: Option<RemoteId>,
}

/// Outcome of sending one chunk to an upload session.
#[derive(Debug, Clone)]
pub enum ChunkResult {
    /// Chunk stored; the session expects the next range.
    Accepted { next_offset: u64 },
    /// Final chunk stored; the item now exists with this record.
    Completed { item: RemoteItem },
}

/// Name-collision behavior for session creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictBehavior {
    /// Fail with `Conflict` when the target changed underneath us.
    Fail,
    /// Replace the remote content.
    Replace,
    /// Let the remote rename the incoming item.
    Rename,
}

/// Port trait for the remote object store.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Fetch a single item record.
    async fn get_item(&self, id: &RemoteId) -> Result<RemoteItem, CoreError>;

    /// Enumerate a directory, one page at a time.
    async fn list_children(
        &self,
        id: &RemoteId,
        page: Option<&str>,
    ) -> Result<ChildPage, CoreError>;

    /// Read content bytes. `None` range means the whole file.
    async fn get_content(
        &self,
        id: &RemoteId,
        range: Option<ByteRange>,
    ) -> Result<Vec<u8>, CoreError>;

    /// Create a remote directory.
    async fn create_dir(
        &self,
        parent: &RemoteId,
        name: &str,
    ) -> Result<RemoteItem, CoreError>;

    /// Open a resumable upload session; returns the session URL.
    async fn create_upload_session(
        &self,
        parent: &RemoteId,
        name: &str,
        conflict_behavior: ConflictBehavior,
        base_etag: Option<&ETag>,
    ) -> Result<String, CoreError>;

    /// Send one chunk of an upload session.
    async fn put_chunk(
        &self,
        session_url: &str,
        range: ByteRange,
        total_size: u64,
        bytes: &[u8],
    ) -> Result<ChunkResult, CoreError>;

    /// Patch item metadata (rename / move).
    async fn patch_item(&self, id: &RemoteId, patch: ItemPatch) -> Result<RemoteItem, CoreError>;

    /// Delete an item.
    async fn delete_item(&self, id: &RemoteId) -> Result<(), CoreError>;

    /// Fetch the next delta page. `link` is either a stored delta cursor or
    /// a `next_link` from the previous page; `None` starts a full sweep.
    async fn delta(&self, link: Option<&str>) -> Result<DeltaPage, CoreError>;

    /// Root item of the drive.
    async fn get_root(&self) -> Result<RemoteItem, CoreError>;

    /// Cheap reachability probe for the active connectivity check.
    async fn ping(&self) -> Result<(), CoreError>;
}
