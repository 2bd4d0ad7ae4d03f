//! In-memory server used by unit tests
//!
//! Plays the server side of the protocol: acknowledges connections, answers
//! pings, confirms subscriptions and records everything the client sends.
//! Behaviour can be switched off per test to simulate silent or failing peers.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::{self, BoxFuture};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use url::Url;

use super::backoff::ReconnectPolicy;
use super::manager::ConnectionConfig;
use super::transport::{CloseInfo, Connector, Frame, Link, TransportError, TransportResult};
use crate::protocol::{kind, Envelope};

struct ServerState {
    epoch: usize,
    refuse: usize,
    refuse_all: bool,
    silent: bool,
    auto_pong: bool,
    auto_confirm: bool,
    fail_data_sync_after: Option<usize>,
    data_sync_sent: usize,
    urls: Vec<String>,
    attempted_at: Vec<Instant>,
    received: Vec<Envelope>,
    closes: Vec<Option<CloseInfo>>,
    live: Option<mpsc::UnboundedSender<TransportResult<Frame>>>,
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            epoch: 0,
            refuse: 0,
            refuse_all: false,
            silent: false,
            auto_pong: true,
            auto_confirm: true,
            fail_data_sync_after: None,
            data_sync_sent: 0,
            urls: Vec::new(),
            attempted_at: Vec::new(),
            received: Vec::new(),
            closes: Vec::new(),
            live: None,
        }
    }
}

/// Scriptable server shared between a test and its [`MockConnector`]
#[derive(Clone, Default)]
pub(crate) struct MockServer {
    state: Arc<Mutex<ServerState>>,
}

/// Connector handing out links to a [`MockServer`]
pub(crate) struct MockConnector {
    state: Arc<Mutex<ServerState>>,
}

fn lock(state: &Mutex<ServerState>) -> MutexGuard<'_, ServerState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl MockServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> MockConnector {
        MockConnector {
            state: self.state.clone(),
        }
    }

    /// Refuse the next `n` connection attempts
    pub fn refuse_next(&self, n: usize) {
        lock(&self.state).refuse = n;
    }

    /// Refuse every connection attempt until switched off
    pub fn refuse_all(&self, refuse: bool) {
        lock(&self.state).refuse_all = refuse;
    }

    /// Accept links but never send `connection_established`
    pub fn set_silent(&self, silent: bool) {
        lock(&self.state).silent = silent;
    }

    pub fn set_auto_pong(&self, enabled: bool) {
        lock(&self.state).auto_pong = enabled;
    }

    pub fn set_auto_confirm(&self, enabled: bool) {
        lock(&self.state).auto_confirm = enabled;
    }

    /// Let `n` more `data_sync` envelopes through, then fail the next send once
    pub fn fail_data_sync_after(&self, n: usize) {
        let mut state = lock(&self.state);
        let sent = state.data_sync_sent;
        state.fail_data_sync_after = Some(sent + n);
    }

    /// Number of links opened (refused attempts excluded)
    pub fn epochs(&self) -> usize {
        lock(&self.state).epoch
    }

    /// URLs of every connection attempt, refused ones included
    pub fn urls(&self) -> Vec<String> {
        lock(&self.state).urls.clone()
    }

    /// When each connection attempt was made
    pub fn attempt_times(&self) -> Vec<Instant> {
        lock(&self.state).attempted_at.clone()
    }

    /// Close frames the client sent
    pub fn closes(&self) -> Vec<Option<CloseInfo>> {
        lock(&self.state).closes.clone()
    }

    /// Envelopes of the given type received so far
    pub fn received(&self, envelope_kind: &str) -> Vec<Envelope> {
        lock(&self.state)
            .received
            .iter()
            .filter(|e| e.kind == envelope_kind)
            .cloned()
            .collect()
    }

    /// Send an envelope to the client on the live link
    pub fn push(&self, envelope: Envelope) {
        let state = lock(&self.state);
        if let (Some(live), Ok(text)) = (&state.live, envelope.encode()) {
            let _ = live.send(Ok(Frame::Text(text)));
        }
    }

    /// Send a raw text frame to the client
    pub fn push_raw(&self, text: &str) {
        let state = lock(&self.state);
        if let Some(live) = &state.live {
            let _ = live.send(Ok(Frame::Text(text.to_string())));
        }
    }

    /// Publish an update on a topic
    pub fn publish(&self, topic: &str, payload: Value) {
        self.push(Envelope::new(
            kind::SUBSCRIPTION_DATA,
            json!({ "topic": topic, "payload": payload }),
        ));
    }

    /// Close the live link with a close frame
    pub fn close(&self, code: u16) {
        let mut state = lock(&self.state);
        if let Some(live) = state.live.take() {
            let _ = live.send(Ok(Frame::Close(Some(CloseInfo {
                code,
                reason: "server close".to_string(),
            }))));
        }
    }

    /// Drop the live link without a close frame
    pub fn drop_link(&self) {
        lock(&self.state).live = None;
    }

    /// Wait until at least `count` envelopes of the given type have arrived
    pub async fn wait_for(&self, envelope_kind: &str, count: usize) -> Vec<Envelope> {
        let waiting = async {
            loop {
                let seen = self.received(envelope_kind);
                if seen.len() >= count {
                    return seen;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(600), waiting)
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {} '{}'", count, envelope_kind))
    }
}

impl Connector for MockConnector {
    fn connect(&self, url: &Url) -> BoxFuture<'static, TransportResult<Link>> {
        Box::pin(future::ready(open_link(&self.state, url)))
    }
}

fn open_link(shared: &Arc<Mutex<ServerState>>, url: &Url) -> TransportResult<Link> {
    let mut state = lock(shared);
    state.urls.push(url.to_string());
    state.attempted_at.push(Instant::now());

    if state.refuse_all || state.refuse > 0 {
        state.refuse = state.refuse.saturating_sub(1);
        return Err(TransportError::ConnectionFailed("connection refused".to_string()));
    }

    state.epoch += 1;
    let epoch = state.epoch;
    let (tx, rx) = mpsc::unbounded_channel();
    if !state.silent {
        let established = Envelope::new(
            kind::CONNECTION_ESTABLISHED,
            json!({ "connectionId": format!("conn-{}", epoch) }),
        );
        if let Ok(text) = established.encode() {
            let _ = tx.send(Ok(Frame::Text(text)));
        }
    }
    state.live = Some(tx);
    drop(state);

    let sink_state = shared.clone();
    let sink = futures_util::sink::unfold(sink_state, move |state, frame: Frame| async move {
        respond(&state, epoch, frame)?;
        Ok::<_, TransportError>(state)
    });
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });

    Ok(Link {
        sink: Box::pin(sink),
        stream: Box::pin(stream),
    })
}

fn respond(shared: &Mutex<ServerState>, epoch: usize, frame: Frame) -> TransportResult<()> {
    let mut state = lock(shared);
    let text = match frame {
        Frame::Close(info) => {
            state.closes.push(info);
            if state.epoch == epoch {
                state.live = None;
            }
            return Ok(());
        }
        Frame::Text(text) => text,
    };

    let envelope = Envelope::decode(&text)
        .map_err(|e| TransportError::SendFailed(format!("client sent garbage: {}", e)))?;

    if envelope.kind == kind::DATA_SYNC {
        if let Some(limit) = state.fail_data_sync_after {
            if state.data_sync_sent >= limit {
                state.fail_data_sync_after = None;
                return Err(TransportError::SendFailed("injected failure".to_string()));
            }
        }
        state.data_sync_sent += 1;
    }

    let reply = match envelope.kind.as_str() {
        kind::PING if state.auto_pong => Some(Envelope::new(kind::PONG, json!({}))),
        kind::SUBSCRIBE if state.auto_confirm => Some(Envelope::new(
            kind::SUBSCRIPTION_CONFIRMED,
            envelope.data.clone(),
        )),
        kind::UNSUBSCRIBE if state.auto_confirm => Some(Envelope::new(
            kind::UNSUBSCRIPTION_CONFIRMED,
            envelope.data.clone(),
        )),
        _ => None,
    };
    state.received.push(envelope);

    if state.epoch == epoch {
        if let (Some(reply), Some(live)) = (reply, &state.live) {
            if let Ok(text) = reply.encode() {
                let _ = live.send(Ok(Frame::Text(text)));
            }
        }
    }
    Ok(())
}

/// Connection settings with short, round timings
pub(crate) fn test_config() -> ConnectionConfig {
    ConnectionConfig {
        url: "ws://mock.test/ws".to_string(),
        token: None,
        connect_timeout: Duration::from_secs(10),
        heartbeat_interval: Duration::from_secs(30),
        heartbeat_timeout_multiplier: 2,
        reconnect: ReconnectPolicy {
            base_interval: Duration::from_secs(1),
            max_attempts: 3,
        },
    }
}

/// Receive events until one satisfies `pred`
pub(crate) async fn next_matching<T, F>(rx: &mut broadcast::Receiver<T>, mut pred: F) -> T
where
    T: Clone,
    F: FnMut(&T) -> bool,
{
    let waiting = async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(600), waiting)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for event"))
}
