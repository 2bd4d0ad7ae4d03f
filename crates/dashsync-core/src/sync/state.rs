//! Sync state persistence
//!
//! Remembers when the last sync completed so a full resync after a
//! reconnect only asks the server for what was missed.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::{atomic_write, read_optional};

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateFile {
    #[serde(default)]
    last_sync_timestamp: Option<DateTime<Utc>>,
}

/// Persistent sync state
#[derive(Debug, Default)]
pub struct SyncState {
    last_sync: Option<DateTime<Utc>>,
    /// Path to persist state
    path: Option<PathBuf>,
}

impl SyncState {
    /// Create a new sync state (in-memory only)
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a sync state that persists to disk
    ///
    /// Loads the existing file when present.
    pub fn with_path(path: PathBuf) -> Result<Self> {
        let mut state = Self {
            last_sync: None,
            path: Some(path),
        };
        state.load()?;
        Ok(state)
    }

    /// When the last sync completed
    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.last_sync
    }

    /// Record a completed sync and persist it
    pub fn record_sync(&mut self, at: DateTime<Utc>) -> Result<()> {
        self.last_sync = Some(at);
        self.save()
    }

    /// Save state to disk
    pub fn save(&self) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };

        let file = StateFile {
            last_sync_timestamp: self.last_sync,
        };
        let json = serde_json::to_string_pretty(&file).context("Failed to serialize sync state")?;
        atomic_write(path, json.as_bytes()).context("Failed to save sync state")
    }

    fn load(&mut self) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        let Some(json) = read_optional(path)? else {
            return Ok(());
        };

        let file: StateFile = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse sync state {:?}", path))?;
        self.last_sync = file.last_sync_timestamp;
        Ok(())
    }
}
