//! Offline queue for changes made while disconnected
//!
//! Changes are kept in arrival order and drained front to back. When a file
//! path is set, the queue is mirrored to a JSONL file (one change per line,
//! fsynced on every append) so changes survive a restart. Removals and
//! overflow replace the whole file atomically.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::storage::atomic_write;

/// Error type for queue operations
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to persist queue: {0}")]
    Persist(String),
}

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// A locally-originated change waiting to be sent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedChange {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl QueuedChange {
    /// Stamp a change with the current time
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Bounded FIFO of pending changes
#[derive(Debug)]
pub struct OfflineQueue {
    items: VecDeque<QueuedChange>,
    capacity: usize,
    path: Option<PathBuf>,
}

impl OfflineQueue {
    /// Create an in-memory queue
    ///
    /// A capacity of zero is treated as one.
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity: capacity.max(1),
            path: None,
        }
    }

    /// Create or open a queue mirrored to `path`
    ///
    /// Unreadable lines are skipped. If the file holds more than `capacity`
    /// changes, the oldest are dropped and the file is rewritten.
    pub fn open(path: &Path, capacity: usize) -> QueueResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(path)?;

        let capacity = capacity.max(1);
        let mut items = read_lines(path)?;
        let excess = items.len().saturating_sub(capacity);
        if excess > 0 {
            items.drain(..excess);
            write_all(path, &items)?;
        }
        Ok(Self {
            items,
            capacity,
            path: Some(path.to_path_buf()),
        })
    }

    /// Number of readable changes in a persisted queue file
    ///
    /// Leaves the file untouched; a missing file counts as empty.
    pub fn persisted_len(path: &Path) -> QueueResult<usize> {
        Ok(read_lines(path)?.len())
    }

    /// Append a change, returning how many of the oldest were dropped
    ///
    /// The file is updated before the in-memory queue, so a failed write
    /// leaves the queue as it was.
    pub fn push(&mut self, change: QueuedChange) -> QueueResult<usize> {
        let dropped = (self.items.len() + 1).saturating_sub(self.capacity);
        if dropped == 0 {
            if let Some(ref path) = self.path {
                let line = serde_json::to_string(&change)?;
                let mut file = OpenOptions::new().append(true).open(path)?;
                writeln!(file, "{}", line)?;
                file.sync_all()?;
            }
            self.items.push_back(change);
            return Ok(0);
        }

        let mut items = self.items.clone();
        items.drain(..dropped);
        items.push_back(change);
        self.persist(&items)?;
        self.items = items;
        Ok(dropped)
    }

    /// Remove the `count` oldest changes
    pub fn remove_front(&mut self, count: usize) -> QueueResult<()> {
        if count == 0 {
            return Ok(());
        }
        let count = count.min(self.items.len());
        let items: VecDeque<QueuedChange> = self.items.iter().skip(count).cloned().collect();
        self.persist(&items)?;
        self.items = items;
        Ok(())
    }

    /// Snapshot of the queued changes, oldest first
    pub fn snapshot(&self) -> Vec<QueuedChange> {
        self.items.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn persist(&self, items: &VecDeque<QueuedChange>) -> QueueResult<()> {
        match self.path {
            Some(ref path) => write_all(path, items),
            None => Ok(()),
        }
    }
}

/// Replace the file contents atomically
fn write_all(path: &Path, items: &VecDeque<QueuedChange>) -> QueueResult<()> {
    let mut buf = String::new();
    for change in items {
        buf.push_str(&serde_json::to_string(change)?);
        buf.push('\n');
    }
    atomic_write(path, buf.as_bytes()).map_err(|e| QueueError::Persist(format!("{:#}", e)))
}

fn read_lines(path: &Path) -> QueueResult<VecDeque<QueuedChange>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(VecDeque::new()),
        Err(e) => return Err(e.into()),
    };

    let mut items = VecDeque::new();
    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(change) => items.push_back(change),
            Err(e) => warn!("Skipping unreadable queue line {} in {:?}: {}", number + 1, path, e),
        }
    }
    Ok(items)
}
