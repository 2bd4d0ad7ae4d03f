//! Wire protocol message types
//!
//! Every frame is a JSON envelope `{ "type", "data", "timestamp"? }`.
//! Inbound envelopes are decoded into [`ServerMessage`], outbound ones are
//! built from [`ClientMessage`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{SyncError, SyncResult};
use crate::subscription::Subscription;

/// Normal closure code; the only close code that does not trigger reconnection
pub const NORMAL_CLOSURE: u16 = 1000;

/// Reported when the link drops without a close frame
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Reported when the heartbeat watchdog force-closes a silent connection
pub const HEARTBEAT_TIMEOUT: u16 = 4000;

/// Envelope type names
pub mod kind {
    pub const CONNECTION_ESTABLISHED: &str = "connection_established";
    pub const SUBSCRIPTION_CONFIRMED: &str = "subscription_confirmed";
    pub const UNSUBSCRIPTION_CONFIRMED: &str = "unsubscription_confirmed";
    pub const SUBSCRIPTION_DATA: &str = "subscription_data";
    pub const PONG: &str = "pong";
    pub const ERROR: &str = "error";

    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const PING: &str = "ping";
    pub const DATA_SYNC: &str = "data_sync";
    pub const REQUEST_FULL_SYNC: &str = "request_full_sync";
}

/// A single message crossing the connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Envelope {
    /// Create an envelope stamped with the current time
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: Some(Utc::now()),
        }
    }

    /// Encode to a JSON text frame
    pub fn encode(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from a JSON text frame
    pub fn decode(text: &str) -> SyncResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| SyncError::Protocol(format!("Malformed envelope: {}", e)))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EstablishedData {
    connection_id: String,
}

#[derive(Debug, Deserialize)]
struct TopicPayload {
    topic: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct ErrorData {
    #[serde(default)]
    message: String,
}

/// Messages received from the server
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Handshake acknowledgement carrying the server-assigned connection ID
    ConnectionEstablished { connection_id: String },
    /// A subscribe request was accepted
    SubscriptionConfirmed(Subscription),
    /// An unsubscribe request was accepted
    UnsubscriptionConfirmed(Subscription),
    /// An update published on a subscribed topic
    SubscriptionData { topic: String, payload: Value },
    /// Heartbeat reply
    Pong,
    /// Server-reported error
    Error { message: String },
    /// Any envelope type this client does not handle
    Other(String),
}

impl ServerMessage {
    /// Interpret an envelope
    pub fn from_envelope(envelope: &Envelope) -> SyncResult<Self> {
        let data = envelope.data.clone();
        let message = match envelope.kind.as_str() {
            kind::CONNECTION_ESTABLISHED => {
                let d: EstablishedData = payload(&envelope.kind, data)?;
                ServerMessage::ConnectionEstablished {
                    connection_id: d.connection_id,
                }
            }
            kind::SUBSCRIPTION_CONFIRMED => {
                ServerMessage::SubscriptionConfirmed(payload(&envelope.kind, data)?)
            }
            kind::UNSUBSCRIPTION_CONFIRMED => {
                ServerMessage::UnsubscriptionConfirmed(payload(&envelope.kind, data)?)
            }
            kind::SUBSCRIPTION_DATA => {
                let d: TopicPayload = payload(&envelope.kind, data)?;
                ServerMessage::SubscriptionData {
                    topic: d.topic,
                    payload: d.payload,
                }
            }
            kind::PONG => ServerMessage::Pong,
            kind::ERROR => {
                let d: ErrorData = payload(&envelope.kind, data)?;
                ServerMessage::Error { message: d.message }
            }
            other => ServerMessage::Other(other.to_string()),
        };
        Ok(message)
    }
}

fn payload<T: serde::de::DeserializeOwned>(kind: &str, data: Value) -> SyncResult<T> {
    serde_json::from_value(data)
        .map_err(|e| SyncError::Protocol(format!("Invalid '{}' payload: {}", kind, e)))
}

/// Messages sent to the server
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Ask the server to start publishing a topic
    Subscribe(Subscription),
    /// Ask the server to stop publishing a topic
    Unsubscribe(Subscription),
    /// Heartbeat probe
    Ping,
    /// A locally-originated change
    DataSync {
        change_type: String,
        payload: Value,
        timestamp: DateTime<Utc>,
        client_id: String,
    },
    /// Ask the server to replay updates missed since `last_sync`
    RequestFullSync {
        subscriptions: Vec<Subscription>,
        last_sync: Option<DateTime<Utc>>,
        client_id: String,
    },
}

impl ClientMessage {
    /// Envelope type name for this message
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Subscribe(_) => kind::SUBSCRIBE,
            ClientMessage::Unsubscribe(_) => kind::UNSUBSCRIBE,
            ClientMessage::Ping => kind::PING,
            ClientMessage::DataSync { .. } => kind::DATA_SYNC,
            ClientMessage::RequestFullSync { .. } => kind::REQUEST_FULL_SYNC,
        }
    }

    /// Wrap in a timestamped envelope
    pub fn into_envelope(self) -> Envelope {
        let kind = self.kind();
        let data = match self {
            ClientMessage::Subscribe(sub) | ClientMessage::Unsubscribe(sub) => {
                json!({ "topic": sub.topic, "filters": sub.filters })
            }
            ClientMessage::Ping => json!({}),
            ClientMessage::DataSync {
                change_type,
                payload,
                timestamp,
                client_id,
            } => json!({
                "changeType": change_type,
                "payload": payload,
                "timestamp": timestamp,
                "clientId": client_id,
            }),
            ClientMessage::RequestFullSync {
                subscriptions,
                last_sync,
                client_id,
            } => json!({
                "subscriptions": subscriptions,
                "lastSync": last_sync,
                "clientId": client_id,
            }),
        };
        Envelope::new(kind, data)
    }
}

impl From<ClientMessage> for Envelope {
    fn from(message: ClientMessage) -> Self {
        message.into_envelope()
    }
}
