//! Subscription registry
//!
//! Turns subscribe/unsubscribe calls into request/confirmation exchanges over
//! a [`ConnectionManager`], remembers what the caller wants across reconnects
//! and re-emits published data.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, info, warn};

use super::topic::{Filters, Subscription};
use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{ClientMessage, Envelope, ServerMessage};

/// How long `subscribe` waits for `subscription_confirmed`
pub const DEFAULT_SUBSCRIPTION_TIMEOUT: Duration = Duration::from_secs(5);

const DATA_CAPACITY: usize = 256;

/// One `subscription_data` update
#[derive(Debug, Clone, PartialEq)]
pub struct TopicData {
    pub topic: String,
    pub payload: Value,
    /// Envelope timestamp, when the server sent one
    pub timestamp: Option<DateTime<Utc>>,
}

struct Waiter {
    id: u64,
    /// Reissued after a reconnect rather than requested by a caller
    replay: bool,
    reply: oneshot::Sender<()>,
}

#[derive(Default)]
struct RegistryState {
    /// Survives reconnects, keyed by [`Subscription::key`]
    desired: BTreeMap<String, Subscription>,
    /// Confirmed by the server during the current epoch
    acknowledged: HashSet<String>,
    pending: HashMap<String, Vec<Waiter>>,
    pending_unsubscribe: HashMap<String, Vec<Waiter>>,
    next_waiter: u64,
}

impl RegistryState {
    fn register(&mut self, unsubscribe: bool, key: &str, replay: bool) -> (u64, oneshot::Receiver<()>) {
        let (reply, rx) = oneshot::channel();
        self.next_waiter += 1;
        let id = self.next_waiter;
        let table = if unsubscribe {
            &mut self.pending_unsubscribe
        } else {
            &mut self.pending
        };
        table
            .entry(key.to_string())
            .or_default()
            .push(Waiter { id, replay, reply });
        (id, rx)
    }

    fn deregister(&mut self, unsubscribe: bool, key: &str, id: u64) {
        let table = if unsubscribe {
            &mut self.pending_unsubscribe
        } else {
            &mut self.pending
        };
        if let Some(waiters) = table.get_mut(key) {
            waiters.retain(|w| w.id != id);
            if waiters.is_empty() {
                table.remove(key);
            }
        }
    }
}

struct Inner {
    connection: ConnectionManager,
    timeout: Duration,
    state: Mutex<RegistryState>,
    data_tx: broadcast::Sender<TopicData>,
    topics: Mutex<HashMap<String, broadcast::Sender<TopicData>>>,
    /// Connection events lost to lag, published data possibly among them
    missed_tx: watch::Sender<u64>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Tracks desired and acknowledged subscriptions for one connection
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<Inner>,
}

impl SubscriptionRegistry {
    /// Create a registry with the default confirmation timeout
    pub fn new(connection: ConnectionManager) -> Self {
        Self::with_timeout(connection, DEFAULT_SUBSCRIPTION_TIMEOUT)
    }

    /// Create a registry that waits `timeout` for confirmations
    pub fn with_timeout(connection: ConnectionManager, timeout: Duration) -> Self {
        let events = connection.events();
        let (data_tx, _) = broadcast::channel(DATA_CAPACITY);
        let inner = Arc::new(Inner {
            connection,
            timeout,
            state: Mutex::new(RegistryState::default()),
            data_tx,
            topics: Mutex::new(HashMap::new()),
            missed_tx: watch::channel(0).0,
        });
        tokio::spawn(listen(Arc::downgrade(&inner), events));
        Self { inner }
    }

    /// The connection this registry sends on
    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    /// Subscribe to `topic` narrowed by `filters`
    ///
    /// Resolves once the server confirms. Subscribing again to a canonically
    /// equal subscription is harmless and leaves a single desired entry.
    pub async fn subscribe(&self, topic: impl Into<String>, filters: Filters) -> SyncResult<()> {
        self.inner
            .request_subscribe(Subscription::new(topic, filters), false)
            .await
    }

    /// Unsubscribe from `topic` narrowed by `filters`
    ///
    /// The subscription stops being desired immediately. Without a
    /// confirmation the call still succeeds once the timeout elapses.
    pub async fn unsubscribe(&self, topic: impl Into<String>, filters: Filters) -> SyncResult<()> {
        let sub = Subscription::new(topic, filters);
        let key = sub.key();
        {
            let mut state = lock(&self.inner.state);
            state.desired.remove(&key);
            state.acknowledged.remove(&key);
        }

        if !self.inner.connection.is_connected() {
            return Err(SyncError::NotConnected);
        }

        let (id, rx) = lock(&self.inner.state).register(true, &key, false);
        if let Err(err) = self.inner.connection.send(ClientMessage::Unsubscribe(sub.clone())).await {
            lock(&self.inner.state).deregister(true, &key, id);
            return Err(err);
        }

        if tokio::time::timeout(self.inner.timeout, rx).await.is_err() {
            debug!("No unsubscription confirmation for {}", sub);
            lock(&self.inner.state).deregister(true, &key, id);
        }
        Ok(())
    }

    /// Snapshot of the desired subscriptions
    pub fn desired(&self) -> Vec<Subscription> {
        lock(&self.inner.state).desired.values().cloned().collect()
    }

    /// Snapshot of the subscriptions confirmed during the current epoch
    pub fn acknowledged(&self) -> Vec<Subscription> {
        let state = lock(&self.inner.state);
        state
            .desired
            .iter()
            .filter(|(key, _)| state.acknowledged.contains(*key))
            .map(|(_, sub)| sub.clone())
            .collect()
    }

    pub fn is_desired(&self, topic: &str, filters: &Filters) -> bool {
        let key = Subscription::new(topic, filters.clone()).key();
        lock(&self.inner.state).desired.contains_key(&key)
    }

    /// Receive every published update
    pub fn data(&self) -> broadcast::Receiver<TopicData> {
        self.inner.data_tx.subscribe()
    }

    /// Running count of connection events the registry skipped after lagging
    ///
    /// Any `subscription_data` among them never reached [`Self::data`].
    pub fn missed_events(&self) -> watch::Receiver<u64> {
        self.inner.missed_tx.subscribe()
    }

    /// Receive updates published on one topic
    pub fn topic_events(&self, topic: &str) -> broadcast::Receiver<TopicData> {
        lock(&self.inner.topics)
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(DATA_CAPACITY).0)
            .subscribe()
    }
}

impl Inner {
    async fn request_subscribe(&self, sub: Subscription, replay: bool) -> SyncResult<()> {
        if !self.connection.is_connected() {
            return Err(SyncError::NotConnected);
        }

        let key = sub.key();
        let (id, rx) = lock(&self.state).register(false, &key, replay);
        if let Err(err) = self.connection.send(ClientMessage::Subscribe(sub.clone())).await {
            lock(&self.state).deregister(false, &key, id);
            return Err(err);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(())) => {
                debug!("Subscribed to {}", sub);
                Ok(())
            }
            Ok(Err(_)) => Err(SyncError::Shutdown),
            Err(_) => {
                lock(&self.state).deregister(false, &key, id);
                Err(SyncError::SubscriptionTimeout { topic: sub.topic })
            }
        }
    }

    fn confirmed(&self, sub: Subscription) {
        let key = sub.key();
        let mut state = lock(&self.state);
        let waiters = state.pending.remove(&key).unwrap_or_default();

        if waiters.is_empty() && !state.desired.contains_key(&key) {
            debug!("Ignoring confirmation for unknown subscription {}", sub);
            return;
        }
        if waiters.iter().any(|w| !w.replay) {
            state.desired.insert(key.clone(), sub);
        }
        if state.desired.contains_key(&key) {
            state.acknowledged.insert(key);
        }
        for waiter in waiters {
            let _ = waiter.reply.send(());
        }
    }

    fn unconfirmed(&self, sub: Subscription) {
        let key = sub.key();
        let waiters = lock(&self.state)
            .pending_unsubscribe
            .remove(&key)
            .unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.reply.send(());
        }
    }

    fn publish(&self, envelope: &Envelope, topic: String, payload: Value) {
        let data = TopicData {
            topic,
            payload,
            timestamp: envelope.timestamp,
        };
        let topic_tx = lock(&self.topics).get(&data.topic).cloned();
        if let Some(tx) = topic_tx {
            let _ = tx.send(data.clone());
        }
        let _ = self.data_tx.send(data);
    }

    fn handle_envelope(&self, envelope: &Envelope) {
        match ServerMessage::from_envelope(envelope) {
            Ok(ServerMessage::SubscriptionConfirmed(sub)) => self.confirmed(sub),
            Ok(ServerMessage::UnsubscriptionConfirmed(sub)) => self.unconfirmed(sub),
            Ok(ServerMessage::SubscriptionData { topic, payload }) => {
                self.publish(envelope, topic, payload)
            }
            Ok(_) => {}
            Err(err) => warn!("Ignoring '{}': {}", envelope.kind, err),
        }
    }
}

/// Reissue every desired subscription, each on its own task
fn replay(inner: &Arc<Inner>) {
    let subs: Vec<Subscription> = lock(&inner.state).desired.values().cloned().collect();
    if subs.is_empty() {
        return;
    }
    info!("Replaying {} subscription(s)", subs.len());

    for sub in subs {
        let inner = inner.clone();
        tokio::spawn(async move {
            let label = sub.to_string();
            if let Err(err) = inner.request_subscribe(sub, true).await {
                warn!("Failed to restore subscription {}: {}", label, err);
            }
        });
    }
}

async fn listen(inner: Weak<Inner>, mut events: broadcast::Receiver<ConnectionEvent>) {
    loop {
        let event = events.recv().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };

        match event {
            Ok(ConnectionEvent::Message(envelope)) => inner.handle_envelope(&envelope),
            Ok(ConnectionEvent::Disconnected { .. }) => lock(&inner.state).acknowledged.clear(),
            // Every new epoch starts with nothing acknowledged
            Ok(ConnectionEvent::Connected { .. }) => replay(&inner),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Subscription registry lagged by {} connection events", skipped);
                inner.missed_tx.send_modify(|missed| *missed += skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("Subscription listener stopped");
}
