//! Local entity cache
//!
//! Entries are keyed `<kind>:<id>` and replaced whole. Readers get shared
//! snapshots; only the coordinator writes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Last-known state of one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: String,
    pub data: Value,
    pub last_modified: DateTime<Utc>,
}

/// Build the cache key for an entity
pub fn cache_key(kind: &str, id: &str) -> String {
    format!("{}:{}", kind, id)
}

#[derive(Debug, Default)]
pub struct DataCache {
    entries: RwLock<HashMap<String, Arc<CacheEntry>>>,
}

impl DataCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Arc<CacheEntry>> {
        self.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Replace the entry under its key, returning the previous one
    pub(crate) fn insert(&self, entry: CacheEntry) -> Option<Arc<CacheEntry>> {
        self.write().insert(entry.key.clone(), Arc::new(entry))
    }

    pub(crate) fn clear(&self) {
        self.write().clear();
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<CacheEntry>>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<CacheEntry>>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }
}
