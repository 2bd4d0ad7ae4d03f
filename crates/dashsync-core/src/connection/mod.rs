//! Connection manager
//!
//! Maintains one persistent WebSocket connection to the sync server.
//!
//! ## Lifecycle
//!
//! ```text
//! Disconnected --connect--> Connecting --connection_established--> Connected
//! Connected --abnormal close / heartbeat timeout--> Reconnecting
//! Reconnecting --attempt succeeds--> Connected
//! Reconnecting --attempts exhausted--> Error --connect--> Connecting
//! any --close 1000 / disconnect--> Disconnected
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let manager = ConnectionManager::new(ConnectionConfig {
//!     url: "ws://localhost:8080/ws".to_string(),
//!     ..Default::default()
//! });
//! let connection_id = manager.connect().await?;
//! manager.send(ClientMessage::Ping).await?;
//! ```

mod backoff;
mod manager;
mod state;
mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use backoff::{ReconnectPolicy, BACKOFF_MULTIPLIER};
pub use manager::{ConnectionConfig, ConnectionManager};
pub use state::{ConnectionEvent, ConnectionState};
pub use transport::{
    connection_url, CloseInfo, Connector, Frame, FrameSink, FrameStream, Link, TransportError,
    TransportResult, WebSocketConnector,
};
