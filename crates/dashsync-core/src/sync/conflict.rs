//! Update conflict detection and resolution
//!
//! Two versions of an entity conflict when their modification times are
//! closer together than the conflict window. Resolution is pluggable; the
//! default keeps whichever version was written last.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::cache::CacheEntry;

/// Default conflict window
pub const DEFAULT_CONFLICT_WINDOW: Duration = Duration::from_millis(5000);

/// Whether two modification times fall within `window` of each other
pub fn is_conflict(local: DateTime<Utc>, remote: DateTime<Utc>, window: Duration) -> bool {
    let delta = (local - remote).num_milliseconds().unsigned_abs();
    u128::from(delta) < window.as_millis()
}

/// Picks the version to keep when a remote update conflicts with the cache
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, local: &CacheEntry, remote: &CacheEntry) -> CacheEntry;
}

/// Keep the later `last_modified`; ties go to the remote version
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriterWins;

impl ConflictResolver for LastWriterWins {
    fn resolve(&self, local: &CacheEntry, remote: &CacheEntry) -> CacheEntry {
        if local.last_modified > remote.last_modified {
            local.clone()
        } else {
            remote.clone()
        }
    }
}

impl<F> ConflictResolver for F
where
    F: Fn(&CacheEntry, &CacheEntry) -> CacheEntry + Send + Sync,
{
    fn resolve(&self, local: &CacheEntry, remote: &CacheEntry) -> CacheEntry {
        self(local, remote)
    }
}
