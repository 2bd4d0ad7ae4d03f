//! Local persistence
//!
//! The sync engine keeps two files in the data directory:
//!
//! ```text
//! {data_dir}/
//! ├── sync_state.json       # lastSyncTimestamp
//! └── offline_queue.jsonl   # changes waiting for a connection
//! ```

mod persistence;

pub use persistence::{atomic_write, read_optional};

/// Sync state file name
pub const SYNC_STATE_FILE: &str = "sync_state.json";

/// Offline queue file name
pub const OFFLINE_QUEUE_FILE: &str = "offline_queue.jsonl";
