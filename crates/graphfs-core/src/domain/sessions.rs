//! Transfer-session and mutation records
//!
//! Durable records for the background pipelines: resumable upload sessions,
//! download sessions, the offline change log, and remote-mutation jobs.
//! Waiter sets and cancellation tokens are runtime state and live with the
//! managers in `graphfs-engine`; what is persisted here is exactly what a
//! restart needs to resume.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ChangeId, ETag, ItemId};

/// Lifecycle of a persisted transfer session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Queued,
    Started,
    Completed,
    Errored,
}

impl SessionState {
    /// Terminal sessions are never resumed or deduplicated against.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Errored)
    }
}

/// Where upload content comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentRef {
    /// Stream from a cache file on disk.
    Path(PathBuf),
    /// Small in-memory payload (metadata-only rewrites, tests).
    Buffer(Vec<u8>),
}

impl ContentRef {
    #[must_use]
    pub fn len_hint(&self) -> Option<u64> {
        match self {
            ContentRef::Path(_) => None,
            ContentRef::Buffer(buf) => Some(buf.len() as u64),
        }
    }
}

/// A resumable chunked upload, persisted in the `uploads` bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: ChangeId,
    pub target_item_id: ItemId,
    pub content_ref: ContentRef,
    /// Next byte to send; advanced only after the remote accepts a chunk.
    pub offset: u64,
    pub chunk_size: u64,
    /// Remote resumable handle, once the session has been created.
    pub session_url: Option<String>,
    pub attempts: u32,
    pub state: SessionState,
    pub last_error: Option<String>,
}

impl UploadSession {
    pub fn new(target_item_id: ItemId, content_ref: ContentRef, chunk_size: u64) -> Self {
        Self {
            id: ChangeId::new(),
            target_item_id,
            content_ref,
            offset: 0,
            chunk_size,
            session_url: None,
            attempts: 0,
            state: SessionState::Queued,
            last_error: None,
        }
    }
}

/// A download in flight or awaiting a worker, persisted in the `downloads`
/// bucket so queued hydrations survive a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadSession {
    pub id: ChangeId,
    pub target_item_id: ItemId,
    pub state: SessionState,
    pub attempts: u32,
    pub err: Option<String>,
}

impl DownloadSession {
    pub fn new(target_item_id: ItemId) -> Self {
        Self {
            id: ChangeId::new(),
            target_item_id,
            state: SessionState::Queued,
            attempts: 0,
            err: None,
        }
    }
}

// ============================================================================
// Offline change log
// ============================================================================

/// Kind of a mutation recorded while disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Modify,
    Delete,
    Rename,
}

/// Arguments of an offline change, interpreted per [`ChangeKind`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangePayload {
    pub name: Option<String>,
    pub parent_id: Option<ItemId>,
    pub new_name: Option<String>,
    pub new_parent_id: Option<ItemId>,
    pub is_directory: bool,
    /// Cache path of the content to upload for CREATE/MODIFY of files.
    pub content_ref: Option<PathBuf>,
}

/// One entry of the durable offline change log (`offline_changes` bucket).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineChange {
    pub change_id: ChangeId,
    pub kind: ChangeKind,
    pub item_id: ItemId,
    pub payload: ChangePayload,
    pub recorded_at: DateTime<Utc>,
}

impl OfflineChange {
    pub fn new(kind: ChangeKind, item_id: ItemId, payload: ChangePayload) -> Self {
        Self {
            change_id: ChangeId::new(),
            kind,
            item_id,
            payload,
            recorded_at: Utc::now(),
        }
    }
}

// ============================================================================
// Mutation queue jobs
// ============================================================================

/// Remote-side directory mutation operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOp {
    CreateDir,
    Rename,
    Delete,
}

/// Arguments for a [`MutationJob`], interpreted per [`MutationOp`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationArgs {
    pub name: Option<String>,
    pub new_name: Option<String>,
    pub new_parent_id: Option<ItemId>,
}

/// A queued remote create/rename/delete.
///
/// Jobs are processed FIFO per parent id so create/rename order within a
/// directory is preserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationJob {
    pub op: MutationOp,
    pub item_id: ItemId,
    /// Parent that serializes this job; jobs under different parents may run
    /// in any order.
    pub parent_id: ItemId,
    pub args: MutationArgs,
    pub retries: u32,
    /// Set when this job was captured while offline and the etag at capture
    /// time matters for conflict detection during drain.
    pub base_etag: Option<ETag>,
}

impl MutationJob {
    pub fn create_dir(item_id: ItemId, parent_id: ItemId, name: impl Into<String>) -> Self {
        Self {
            op: MutationOp::CreateDir,
            item_id,
            parent_id,
            args: MutationArgs {
                name: Some(name.into()),
                ..MutationArgs::default()
            },
            retries: 0,
            base_etag: None,
        }
    }

    pub fn rename(
        item_id: ItemId,
        parent_id: ItemId,
        new_name: impl Into<String>,
        new_parent_id: ItemId,
    ) -> Self {
        Self {
            op: MutationOp::Rename,
            item_id,
            parent_id,
            args: MutationArgs {
                name: None,
                new_name: Some(new_name.into()),
                new_parent_id: Some(new_parent_id),
            },
            retries: 0,
            base_etag: None,
        }
    }

    pub fn delete(item_id: ItemId, parent_id: ItemId) -> Self {
        Self {
            op: MutationOp::Delete,
            item_id,
            parent_id,
            args: MutationArgs::default(),
            retries: 0,
            base_etag: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_terminality() {
        assert!(!SessionState::Queued.is_terminal());
        assert!(!SessionState::Started.is_terminal());
        assert!(SessionState::Completed.is_terminal());
        assert!(SessionState::Errored.is_terminal());
    }

    #[test]
    fn test_new_upload_session_starts_at_zero() {
        let session = UploadSession::new(
            ItemId::new("f1").unwrap(),
            ContentRef::Path(PathBuf::from("/cache/f1")),
            10 * 1024 * 1024,
        );
        assert_eq!(session.offset, 0);
        assert_eq!(session.state, SessionState::Queued);
        assert!(session.session_url.is_none());
    }

    #[test]
    fn test_buffer_ref_knows_its_length() {
        let content = ContentRef::Buffer(vec![0u8; 42]);
        assert_eq!(content.len_hint(), Some(42));
        assert_eq!(ContentRef::Path(PathBuf::from("/x")).len_hint(), None);
    }

    #[test]
    fn test_mutation_job_constructors() {
        let root = ItemId::new("root").unwrap();
        let dir = ItemId::new_local();

        let job = MutationJob::create_dir(dir.clone(), root.clone(), "new");
        assert_eq!(job.op, MutationOp::CreateDir);
        assert_eq!(job.args.name.as_deref(), Some("new"));

        let job = MutationJob::rename(dir.clone(), root.clone(), "renamed", root.clone());
        assert_eq!(job.op, MutationOp::Rename);
        assert_eq!(job.args.new_name.as_deref(), Some("renamed"));

        let job = MutationJob::delete(dir, root);
        assert_eq!(job.op, MutationOp::Delete);
    }

    #[test]
    fn test_offline_change_roundtrip() {
        let change = OfflineChange::new(
            ChangeKind::Create,
            ItemId::new_local(),
            ChangePayload {
                name: Some("new".into()),
                parent_id: Some(ItemId::new("root").unwrap()),
                is_directory: true,
                ..ChangePayload::default()
            },
        );
        let json = serde_json::to_string(&change).unwrap();
        let back: OfflineChange = serde_json::from_str(&json).unwrap();
        assert_eq!(change, back);
    }
}
