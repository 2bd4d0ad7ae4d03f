//! dashsync core library
//!
//! Keeps a client's view of server-side entities current over one persistent
//! WebSocket connection, and holds local changes until they can be delivered.
//!
//! # Architecture
//!
//! ```text
//! ConnectionManager  one duplex link, heartbeat, reconnect with backoff
//!        ^
//! SubscriptionRegistry  subscribe/confirm exchanges, replay after reconnect
//!        ^
//! SyncCoordinator  entity cache, conflict resolution, offline queue, resync
//! ```
//!
//! # Quick Start
//!
//! ```text
//! let config = Config::load()?;
//! let sync = SyncCoordinator::from_config(&config)?;
//!
//! sync.connection().connect().await?;
//! sync.subscribe_to_data_type("dashboard", filters).await?;
//!
//! let mut events = sync.events();
//! while let Ok(event) = events.recv().await { /* ... */ }
//! ```
//!
//! # Modules
//!
//! - `connection`: connection state machine and transport
//! - `protocol`: wire envelopes
//! - `subscription`: subscription identity and registry
//! - `sync`: cache, conflict handling, offline queue, coordinator
//! - `storage`: on-disk state files
//! - `config`: application configuration

pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod storage;
pub mod subscription;
pub mod sync;

pub use config::{Config, SyncSettings};
pub use connection::{ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectionState};
pub use error::{SyncError, SyncResult};
pub use protocol::{ClientMessage, Envelope, ServerMessage};
pub use subscription::{filters_from_pairs, Filters, Subscription, SubscriptionRegistry, TopicData};
pub use sync::{
    CacheEntry, ConflictResolver, NetworkPresence, Submission, SyncCoordinator, SyncEvent,
    SyncStatus,
};
