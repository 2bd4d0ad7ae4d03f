//! Sync coordinator and its local state
//!
//! ## Data flow
//!
//! ```text
//! subscription_data -> SyncCoordinator -> DataCache (conflict check) -> SyncEvent::DataUpdated
//! submit_change     -> SyncCoordinator -> data_sync        (connected and online)
//!                                      -> OfflineQueue     (otherwise, drained on connect)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let sync = SyncCoordinator::builder(registry).build();
//! sync.subscribe_to_data_type("dashboard", filters).await?;
//! let dashboard = sync.get_cached_data("dashboard:d1");
//! ```

mod cache;
mod conflict;
mod coordinator;
mod presence;
mod queue;
mod state;

pub use cache::{cache_key, CacheEntry, DataCache};
pub use conflict::{is_conflict, ConflictResolver, LastWriterWins, DEFAULT_CONFLICT_WINDOW};
pub use coordinator::{
    Submission, SyncCoordinator, SyncCoordinatorBuilder, SyncEvent, SyncStatus,
    DEFAULT_QUEUE_CAPACITY,
};
pub use presence::NetworkPresence;
pub use queue::{OfflineQueue, QueueError, QueueResult, QueuedChange};
pub use state::SyncState;
