//! Port traits
//!
//! Small interface seams at the three external boundaries: the remote
//! object store, the realtime-notification transport, and the user-feedback
//! sink. Adapters live outside this workspace (or in tests).

pub mod feedback;
pub mod notifier;
pub mod remote;

pub use feedback::{FeedbackHandler, LogFeedbackHandler, Notification};
pub use notifier::{NotifierTransport, NotifyStream};
pub use remote::{
    ByteRange, ChildPage, ChunkResult, ConflictBehavior, DeltaEvent, DeltaPage, ItemPatch,
    RemoteClient, RemoteItem,
};
