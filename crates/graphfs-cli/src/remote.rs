//! Remote adapter seam
//!
//! The authenticated Graph HTTP client is an external collaborator and is
//! linked in by the packaging build. This module provides the stand-in
//! used when no adapter is wired: every call fails with a transport-level
//! error, which the engine's passive classifier treats as offline. A mount
//! built this way serves previously-synced state read/write and queues all
//! mutations in the offline change log.

use async_trait::async_trait;

use graphfs_core::domain::{ETag, RemoteId};
use graphfs_core::ports::{
    ByteRange, ChildPage, ChunkResult, ConflictBehavior, DeltaPage, ItemPatch, RemoteClient,
    RemoteItem,
};
use graphfs_core::CoreError;

/// A remote client with no transport behind it.
pub struct DisconnectedClient;

impl DisconnectedClient {
    fn unreachable<T>() -> Result<T, CoreError> {
        Err(CoreError::Network(
            "network is unreachable: no remote adapter configured".into(),
        ))
    }
}

#[async_trait]
impl RemoteClient for DisconnectedClient {
    async fn get_item(&self, _id: &RemoteId) -> Result<RemoteItem, CoreError> {
        Self::unreachable()
    }

    async fn list_children(
        &self,
        _id: &RemoteId,
        _page: Option<&str>,
    ) -> Result<ChildPage, CoreError> {
        Self::unreachable()
    }

    async fn get_content(
        &self,
        _id: &RemoteId,
        _range: Option<ByteRange>,
    ) -> Result<Vec<u8>, CoreError> {
        Self::unreachable()
    }

    async fn create_dir(&self, _parent: &RemoteId, _name: &str) -> Result<RemoteItem, CoreError> {
        Self::unreachable()
    }

    async fn create_upload_session(
        &self,
        _parent: &RemoteId,
        _name: &str,
        _conflict_behavior: ConflictBehavior,
        _base_etag: Option<&ETag>,
    ) -> Result<String, CoreError> {
        Self::unreachable()
    }

    async fn put_chunk(
        &self,
        _session_url: &str,
        _range: ByteRange,
        _total_size: u64,
        _bytes: &[u8],
    ) -> Result<ChunkResult, CoreError> {
        Self::unreachable()
    }

    async fn patch_item(&self, _id: &RemoteId, _patch: ItemPatch) -> Result<RemoteItem, CoreError> {
        Self::unreachable()
    }

    async fn delete_item(&self, _id: &RemoteId) -> Result<(), CoreError> {
        Self::unreachable()
    }

    async fn delta(&self, _link: Option<&str>) -> Result<DeltaPage, CoreError> {
        Self::unreachable()
    }

    async fn get_root(&self) -> Result<RemoteItem, CoreError> {
        Self::unreachable()
    }

    async fn ping(&self) -> Result<(), CoreError> {
        Self::unreachable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failures_classify_as_offline() {
        let client = DisconnectedClient;
        let err = client.ping().await.unwrap_err();
        assert!(graphfs_core::is_offline_error(&err));
    }
}
