//! GraphFS store
//!
//! The durable foundation of the layering engine: the metadata store
//! (bucket tables over SQLite), the state manager that owns every item
//! state transition, and the on-disk content cache with its maintainer.
//!
//! Layering: `MetadataStore` knows nothing of states beyond persisting
//! them; `StateManager` is the only writer of `item_state`; `ContentCache`
//! owns content bytes and `CacheMaintainer` couples the two for eviction.

pub mod content;
pub mod metadata;
pub mod pool;
pub mod state;

pub use content::{CacheEntry, CacheMaintainer, CacheWriter, CleanupReport, ContentCache};
pub use metadata::{BatchOp, MetadataStore};
pub use pool::DatabasePool;
pub use state::{DeltaOutcome, RekeyEvent, StateEvent, StateManager};
