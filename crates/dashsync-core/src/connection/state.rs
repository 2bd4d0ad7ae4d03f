//! Connection state machine types

use std::fmt;
use std::time::Duration;

use crate::protocol::Envelope;

/// Lifecycle state of the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not connected, not trying
    Disconnected,
    /// Explicit connect in progress
    Connecting,
    /// Connection established and acknowledged by the server
    Connected,
    /// Waiting out backoff or retrying after an abnormal close
    Reconnecting,
    /// Reconnection attempts exhausted; only an explicit connect recovers
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted by the connection manager
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// State transition
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// A new epoch started
    Connected { connection_id: String },
    /// The current epoch ended
    Disconnected { code: u16, reason: String },
    /// A reconnection attempt is scheduled after `delay`
    Reconnecting { attempt: u32, delay: Duration },
    /// A new epoch resumed one that ended abnormally or for a token refresh
    Reconnected { connection_id: String },
    /// Every reconnection attempt failed; the manager is in `Error`
    ReconnectionFailed { attempts: u32 },
    /// Malformed inbound envelope or server-reported error
    Error(String),
    /// An inbound envelope for the layers above
    Message(Envelope),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Disconnected.to_string(), "disconnected");
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(ConnectionState::Error.as_str(), "error");
    }
}
