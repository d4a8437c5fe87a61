//! Domain model
//!
//! Entities and value types of the layering engine. Everything here is
//! plain data plus validation; persistence lives in `graphfs-store` and
//! behavior in `graphfs-engine`.

pub mod hash;
pub mod ids;
pub mod item;
pub mod sessions;

pub use hash::{ContentHash, QuickXorHasher};
pub use ids::{ChangeId, ETag, ItemId, RemoteId, LOCAL_ID_PREFIX};
pub use item::{
    ConflictPolicy, FileStatus, Item, ItemState, MetadataEntry, OverlayPolicy, PinMode,
};
pub use sessions::{
    ChangeKind, ChangePayload, ContentRef, DownloadSession, MutationArgs, MutationJob, MutationOp,
    OfflineChange, SessionState, UploadSession,
};
