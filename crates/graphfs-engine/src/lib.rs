//! GraphFS engine
//!
//! The background half of the layering engine: hydration and upload
//! pipelines, the mutation queue, the delta loop with its change notifier,
//! the metadata request manager, offline operation, and status surfaces.
//! Everything here holds ids into the store, not entry references, and
//! routes every state change through the `StateManager`.

pub mod delta;
pub mod hydration;
pub mod mutation;
pub mod notifier;
pub mod offline;
pub mod requests;
pub mod runtime;
pub mod status;
pub mod upload;

pub use delta::{ActivityTracker, DeltaLoop, SweepReport};
pub use hydration::{HydrationManager, HydrationPriority, HydrationTicket};
pub use mutation::MutationQueue;
pub use notifier::{ChangeNotifier, HealthStatus, NotifierHealth, NotifierMode};
pub use offline::{OfflineDrainer, OfflineTracker};
pub use requests::{MetadataRequestManager, RequestPriority};
pub use runtime::Engine;
pub use status::{FeedbackManager, StatsCollector, StatsSnapshot};
pub use upload::UploadManager;
