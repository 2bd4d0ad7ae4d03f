//! Sync error handling
//!
//! Typed errors returned by the connection manager, the subscription
//! registry and the sync coordinator.

use std::time::Duration;

use thiserror::Error;

use crate::connection::TransportError;
use crate::sync::QueueError;

/// Errors surfaced to callers of explicit operations
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    /// No `connection_established` arrived before the connect deadline
    #[error("Timed out after {0:?} waiting for the server to establish the connection")]
    ConnectTimeout(Duration),

    /// The operation requires a live connection
    #[error("Not connected to the sync server")]
    NotConnected,

    /// The server did not confirm a subscription in time
    #[error("Timed out waiting for the server to confirm subscription to '{topic}'")]
    SubscriptionTimeout { topic: String },

    /// Underlying transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Malformed envelope or server-reported error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The offline queue dropped its oldest entries to stay within its cap
    #[error("Offline queue full: dropped {dropped} oldest change(s)")]
    QueueOverflow { dropped: usize },

    /// Inbound updates were lost because a consumer fell behind
    #[error("Missed {skipped} inbound event(s); a full resync is needed")]
    UpdatesMissed { skipped: u64 },

    /// Persisted state could not be read or written
    #[error("Storage error: {0}")]
    Storage(String),

    /// A pending operation was cancelled by an explicit disconnect
    #[error("Operation cancelled by disconnect")]
    Cancelled,

    /// The task that owns the connection or coordinator has stopped
    #[error("Sync engine has shut down")]
    Shutdown,
}

impl SyncError {
    /// Whether retrying the same operation later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectTimeout(_)
                | SyncError::NotConnected
                | SyncError::SubscriptionTimeout { .. }
                | SyncError::Transport(_)
                | SyncError::Cancelled
        )
    }
}

impl From<QueueError> for SyncError {
    fn from(err: QueueError) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;
