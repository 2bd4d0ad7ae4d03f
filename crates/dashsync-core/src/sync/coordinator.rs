//! Sync coordinator
//!
//! Sits on top of the subscription registry. Inbound topic data is applied
//! to the local cache with conflict detection; outbound changes go straight
//! to the server when possible and through the offline queue otherwise.
//!
//! All cache and queue mutation happens on one spawned worker task. The
//! [`SyncCoordinator`] handle forwards commands to it and reads shared
//! snapshots.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::cache::{cache_key, CacheEntry, DataCache};
use super::conflict::{is_conflict, ConflictResolver, LastWriterWins, DEFAULT_CONFLICT_WINDOW};
use super::presence::NetworkPresence;
use super::queue::{OfflineQueue, QueuedChange};
use super::state::SyncState;
use crate::config::Config;
use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionState};
use crate::error::{SyncError, SyncResult};
use crate::protocol::ClientMessage;
use crate::storage::{OFFLINE_QUEUE_FILE, SYNC_STATE_FILE};
use crate::subscription::{Filters, SubscriptionRegistry, TopicData};

/// Default offline queue cap
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

const COMMAND_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 256;

/// Sync status as seen by consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Connected,
    Disconnected,
    Reconnecting,
    /// Draining the offline queue or requesting a full resync
    Syncing,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Connected => "connected",
            SyncStatus::Disconnected => "disconnected",
            SyncStatus::Reconnecting => "reconnecting",
            SyncStatus::Syncing => "syncing",
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted by the sync coordinator
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A cached entity changed (`<kind>_updated`)
    DataUpdated {
        kind: String,
        entry: Arc<CacheEntry>,
        has_conflict: bool,
    },
    /// Sync status changed
    StatusChanged(SyncStatus),
    /// The host network-presence signal changed
    OnlineStatusChanged { is_online: bool },
    /// A change was added to the offline queue
    DataQueued { queue_size: usize },
    /// A drain pass finished
    QueueDrained { sent: usize, remaining: usize },
    /// A `request_full_sync` was sent
    FullSyncRequested {
        subscriptions: usize,
        last_sync: Option<DateTime<Utc>>,
    },
    /// The cache was emptied
    CacheCleared,
    /// A non-fatal failure (queue overflow, failed drain or resync)
    Error(SyncError),
}

/// Outcome of [`SyncCoordinator::submit_change`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Delivered to the server
    Sent,
    /// Held in the offline queue
    Queued { queue_size: usize },
}

enum Command {
    Queue {
        change: QueuedChange,
        reply: oneshot::Sender<SyncResult<usize>>,
    },
    Submit {
        change: QueuedChange,
        reply: oneshot::Sender<SyncResult<Submission>>,
    },
    FullSync {
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<QueuedChange>>,
    },
    ClearCache {
        reply: oneshot::Sender<()>,
    },
    LastSync {
        reply: oneshot::Sender<Option<DateTime<Utc>>>,
    },
    Shutdown,
}

/// Builder for [`SyncCoordinator`]
pub struct SyncCoordinatorBuilder {
    registry: SubscriptionRegistry,
    presence: NetworkPresence,
    resolver: Arc<dyn ConflictResolver>,
    conflict_window: Duration,
    queue: Option<OfflineQueue>,
    state: SyncState,
    client_id: Option<String>,
}

impl SyncCoordinatorBuilder {
    /// Share an existing presence signal
    pub fn presence(mut self, presence: NetworkPresence) -> Self {
        self.presence = presence;
        self
    }

    /// Resolve conflicting updates with `resolver` instead of last-writer-wins
    pub fn resolver(mut self, resolver: impl ConflictResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn conflict_window(mut self, window: Duration) -> Self {
        self.conflict_window = window;
        self
    }

    pub fn offline_queue(mut self, queue: OfflineQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn sync_state(mut self, state: SyncState) -> Self {
        self.state = state;
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Spawn the worker task
    pub fn build(self) -> SyncCoordinator {
        let connection = self.registry.connection().clone();
        let client_id = self
            .client_id
            .unwrap_or_else(|| format!("dashsync-{}", &uuid::Uuid::new_v4().to_string()[..8]));
        let queue = self
            .queue
            .unwrap_or_else(|| OfflineQueue::in_memory(DEFAULT_QUEUE_CAPACITY));

        let conn_state = connection.state();
        let online = self.presence.is_online();
        let initial = compute_status(conn_state, online, false);

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (status_tx, status_rx) = watch::channel(initial);
        let (queue_size_tx, queue_size_rx) = watch::channel(queue.len());
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let cache = Arc::new(DataCache::new());

        let missed_rx = self.registry.missed_events();
        let missed_seen = *missed_rx.borrow();
        let worker = Worker {
            connection_events: connection.events(),
            data: self.registry.data(),
            missed_seen,
            missed_rx,
            presence_rx: self.presence.subscribe(),
            _presence: self.presence.clone(),
            connection,
            registry: self.registry.clone(),
            commands: command_rx,
            cache: cache.clone(),
            queue,
            state: self.state,
            resolver: self.resolver,
            conflict_window: self.conflict_window,
            client_id: client_id.clone(),
            status_tx,
            queue_size_tx,
            events: event_tx.clone(),
            seen_epoch: conn_state == ConnectionState::Connected,
            conn_state,
            online,
            syncing: false,
            resync_pending: false,
        };
        tokio::spawn(worker.run());

        SyncCoordinator {
            command_tx,
            status_rx,
            queue_size_rx,
            event_tx,
            cache,
            registry: self.registry,
            presence: self.presence,
            client_id,
        }
    }
}

/// Handle to a sync worker
///
/// Cheap to clone; clones drive the same worker.
#[derive(Clone)]
pub struct SyncCoordinator {
    command_tx: mpsc::Sender<Command>,
    status_rx: watch::Receiver<SyncStatus>,
    queue_size_rx: watch::Receiver<usize>,
    event_tx: broadcast::Sender<SyncEvent>,
    cache: Arc<DataCache>,
    registry: SubscriptionRegistry,
    presence: NetworkPresence,
    client_id: String,
}

impl SyncCoordinator {
    /// Start configuring a coordinator over `registry`
    pub fn builder(registry: SubscriptionRegistry) -> SyncCoordinatorBuilder {
        SyncCoordinatorBuilder {
            registry,
            presence: NetworkPresence::default(),
            resolver: Arc::new(LastWriterWins),
            conflict_window: DEFAULT_CONFLICT_WINDOW,
            queue: None,
            state: SyncState::new(),
            client_id: None,
        }
    }

    /// Build the whole stack from configuration
    ///
    /// Opens the persisted sync state and, when enabled, the persisted
    /// offline queue in the data directory. Does not connect.
    pub fn from_config(config: &Config) -> Result<Self> {
        let connection = ConnectionManager::new(config.connection_config()?);
        let registry = SubscriptionRegistry::with_timeout(connection, config.sync.subscription_timeout());

        let state = SyncState::with_path(config.data_dir.join(SYNC_STATE_FILE))?;
        let capacity = config.sync.queue_capacity;
        let queue = if config.sync.persist_queue {
            let path = config.data_dir.join(OFFLINE_QUEUE_FILE);
            OfflineQueue::open(&path, capacity)
                .with_context(|| format!("Failed to open offline queue {:?}", path))?
        } else {
            OfflineQueue::in_memory(capacity)
        };

        Ok(Self::builder(registry)
            .conflict_window(config.sync.conflict_window())
            .offline_queue(queue)
            .sync_state(state)
            .build())
    }

    /// Subscribe to updates of one entity kind (topic `<kind>_updated`)
    ///
    /// Idempotent: an already-desired subscription is not requested again.
    pub async fn subscribe_to_data_type(&self, kind: &str, filters: Filters) -> SyncResult<()> {
        let topic = topic_for(kind);
        if self.registry.is_desired(&topic, &filters) {
            debug!("Already subscribed to {}", topic);
            return Ok(());
        }
        self.registry.subscribe(topic, filters).await
    }

    pub async fn unsubscribe_from_data_type(&self, kind: &str, filters: Filters) -> SyncResult<()> {
        self.registry.unsubscribe(topic_for(kind), filters).await
    }

    /// Append a change to the offline queue, returning the new queue size
    pub async fn queue_data_change(&self, kind: &str, data: Value) -> SyncResult<usize> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Queue {
            change: QueuedChange::new(kind, data),
            reply,
        })
        .await?;
        rx.await.map_err(|_| SyncError::Shutdown)?
    }

    /// Send a change now if the server is reachable, queue it otherwise
    pub async fn submit_change(&self, kind: &str, data: Value) -> SyncResult<Submission> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Submit {
            change: QueuedChange::new(kind, data),
            reply,
        })
        .await?;
        rx.await.map_err(|_| SyncError::Shutdown)?
    }

    /// Ask the server to replay everything since the last sync
    pub async fn request_full_sync(&self) -> SyncResult<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::FullSync { reply }).await?;
        rx.await.map_err(|_| SyncError::Shutdown)?
    }

    /// Cached payload for `key` (`<kind>:<id>`)
    pub fn get_cached_data(&self, key: &str) -> Option<Value> {
        self.cache.get(key).map(|entry| entry.data.clone())
    }

    /// Cached entry for `key`, including its modification time
    pub fn cache_entry(&self, key: &str) -> Option<Arc<CacheEntry>> {
        self.cache.get(key)
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub async fn clear_cache(&self) -> SyncResult<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::ClearCache { reply }).await?;
        rx.await.map_err(|_| SyncError::Shutdown)
    }

    pub fn queue_len(&self) -> usize {
        *self.queue_size_rx.borrow()
    }

    /// Snapshot of the offline queue, oldest first
    pub async fn queued_changes(&self) -> SyncResult<Vec<QueuedChange>> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Snapshot { reply }).await?;
        rx.await.map_err(|_| SyncError::Shutdown)
    }

    /// When the last sync completed
    pub async fn last_sync(&self) -> SyncResult<Option<DateTime<Utc>>> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::LastSync { reply }).await?;
        rx.await.map_err(|_| SyncError::Shutdown)
    }

    pub fn status(&self) -> SyncStatus {
        *self.status_rx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status_rx.clone()
    }

    /// Receive sync events emitted from now on
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_tx.subscribe()
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn connection(&self) -> &ConnectionManager {
        self.registry.connection()
    }

    pub fn presence(&self) -> &NetworkPresence {
        &self.presence
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Stop the worker and the connection task
    pub fn shutdown(&self) {
        let _ = self.command_tx.try_send(Command::Shutdown);
        self.connection().shutdown();
    }

    async fn command(&self, command: Command) -> SyncResult<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| SyncError::Shutdown)
    }
}

fn topic_for(kind: &str) -> String {
    format!("{}_updated", kind)
}

fn compute_status(conn_state: ConnectionState, online: bool, syncing: bool) -> SyncStatus {
    if syncing {
        return SyncStatus::Syncing;
    }
    if !online {
        return SyncStatus::Disconnected;
    }
    match conn_state {
        ConnectionState::Connected => SyncStatus::Connected,
        ConnectionState::Reconnecting => SyncStatus::Reconnecting,
        ConnectionState::Disconnected | ConnectionState::Connecting | ConnectionState::Error => {
            SyncStatus::Disconnected
        }
    }
}

struct Worker {
    connection: ConnectionManager,
    registry: SubscriptionRegistry,
    commands: mpsc::Receiver<Command>,
    connection_events: broadcast::Receiver<ConnectionEvent>,
    data: broadcast::Receiver<TopicData>,
    missed_rx: watch::Receiver<u64>,
    missed_seen: u64,
    /// Keeps the presence sender alive as long as `presence_rx`
    _presence: NetworkPresence,
    presence_rx: watch::Receiver<bool>,
    cache: Arc<DataCache>,
    queue: OfflineQueue,
    state: SyncState,
    resolver: Arc<dyn ConflictResolver>,
    conflict_window: Duration,
    client_id: String,
    status_tx: watch::Sender<SyncStatus>,
    queue_size_tx: watch::Sender<usize>,
    events: broadcast::Sender<SyncEvent>,
    conn_state: ConnectionState,
    /// An epoch has started since the worker was built
    seen_epoch: bool,
    online: bool,
    syncing: bool,
    /// Updates were lost; request a full resync as soon as possible
    resync_pending: bool,
}

impl Worker {
    async fn run(mut self) {
        loop {
            // Connection state first so commands see the current epoch
            tokio::select! {
                biased;

                event = self.connection_events.recv() => match event {
                    Ok(event) => self.handle_connection_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Sync worker lagged by {} connection events", skipped);
                        self.conn_state = self.connection.state();
                        self.refresh_status();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },

                data = self.data.recv() => match data {
                    Ok(data) => self.apply_update(data),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        self.updates_missed(skipped).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },

                changed = self.missed_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let total = *self.missed_rx.borrow_and_update();
                    let skipped = total.saturating_sub(self.missed_seen);
                    self.missed_seen = total;
                    if skipped > 0 {
                        self.updates_missed(skipped).await;
                    }
                }

                changed = self.presence_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = *self.presence_rx.borrow_and_update();
                    self.handle_presence(online).await;
                }

                cmd = self.commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
            }
        }
        debug!("Sync worker stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Queue { change, reply } => {
                let result = self.enqueue(change);
                let _ = reply.send(result);
                if self.can_sync() {
                    self.drain().await;
                }
            }
            Command::Submit { change, reply } => {
                let result = self.submit(change).await;
                let _ = reply.send(result);
            }
            Command::FullSync { reply } => {
                let result = if self.can_sync() {
                    self.full_sync().await
                } else {
                    Err(SyncError::NotConnected)
                };
                let _ = reply.send(result);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.queue.snapshot());
            }
            Command::ClearCache { reply } => {
                self.cache.clear();
                info!("Cache cleared");
                self.emit(SyncEvent::CacheCleared);
                let _ = reply.send(());
            }
            Command::LastSync { reply } => {
                let _ = reply.send(self.state.last_sync());
            }
            Command::Shutdown => {}
        }
    }

    async fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StateChanged { to, .. } => {
                self.conn_state = to;
                self.refresh_status();
            }
            ConnectionEvent::Connected { .. } => {
                self.conn_state = ConnectionState::Connected;
                self.refresh_status();
                // Any epoch after the first may have missed updates
                let resync = self.seen_epoch || self.resync_pending;
                self.seen_epoch = true;
                if self.online {
                    self.drain().await;
                }
                if resync && self.can_sync() {
                    self.resync("reconnect").await;
                }
            }
            _ => {}
        }
    }

    async fn handle_presence(&mut self, online: bool) {
        if online == self.online {
            return;
        }
        info!("Network is {}", if online { "online" } else { "offline" });
        self.online = online;
        self.refresh_status();
        self.emit(SyncEvent::OnlineStatusChanged { is_online: online });

        if self.can_sync() {
            self.drain().await;
            self.resync("coming online").await;
        }
    }

    /// Inbound updates were dropped before reaching the cache
    async fn updates_missed(&mut self, skipped: u64) {
        warn!("Sync worker missed {} inbound event(s), requesting a full resync", skipped);
        self.emit(SyncEvent::Error(SyncError::UpdatesMissed { skipped }));
        self.resync_pending = true;
        if self.can_sync() {
            self.resync("missed updates").await;
        }
    }

    async fn resync(&mut self, reason: &str) {
        if let Err(err) = self.full_sync().await {
            warn!("Full resync after {} failed: {}", reason, err);
            self.emit(SyncEvent::Error(err));
        }
    }

    fn can_sync(&self) -> bool {
        self.online && self.conn_state == ConnectionState::Connected
    }

    fn enqueue(&mut self, change: QueuedChange) -> SyncResult<usize> {
        let dropped = self.queue.push(change)?;
        let queue_size = self.queue.len();
        self.queue_size_tx.send_replace(queue_size);

        if dropped > 0 {
            warn!("Offline queue full, dropped {} oldest change(s)", dropped);
            self.emit(SyncEvent::Error(SyncError::QueueOverflow { dropped }));
        }
        debug!("Queued change ({} pending)", queue_size);
        self.emit(SyncEvent::DataQueued { queue_size });
        Ok(queue_size)
    }

    async fn submit(&mut self, change: QueuedChange) -> SyncResult<Submission> {
        // Queued changes go first to keep arrival order
        if self.can_sync() && self.queue.is_empty() {
            match self.connection.send(self.data_sync(&change)).await {
                Ok(()) => {
                    self.record_sync();
                    return Ok(Submission::Sent);
                }
                Err(err) => warn!("Send failed, queueing change: {}", err),
            }
        }
        let queue_size = self.enqueue(change)?;
        if self.can_sync() {
            self.drain().await;
        }
        Ok(Submission::Queued { queue_size })
    }

    /// Send queued changes in order, stopping at the first failure
    async fn drain(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        self.set_syncing(true);
        info!("Draining {} queued change(s)", self.queue.len());

        let mut sent = 0;
        let mut failure = None;
        for change in self.queue.snapshot() {
            match self.connection.send(self.data_sync(&change)).await {
                Ok(()) => sent += 1,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        if let Err(err) = self.queue.remove_front(sent) {
            warn!("Failed to persist offline queue: {}", err);
            self.emit(SyncEvent::Error(err.into()));
        }
        let remaining = self.queue.len();
        self.queue_size_tx.send_replace(remaining);
        if sent > 0 {
            self.record_sync();
        }
        self.emit(SyncEvent::QueueDrained { sent, remaining });

        if let Some(err) = failure {
            warn!("Drain stopped after {} change(s): {}", sent, err);
            self.emit(SyncEvent::Error(err));
        }
        self.set_syncing(false);
    }

    async fn full_sync(&mut self) -> SyncResult<()> {
        let subscriptions = self.registry.desired();
        let last_sync = self.state.last_sync();
        let count = subscriptions.len();

        self.set_syncing(true);
        let result = self
            .connection
            .send(ClientMessage::RequestFullSync {
                subscriptions,
                last_sync,
                client_id: self.client_id.clone(),
            })
            .await;
        if result.is_ok() {
            info!("Requested full sync of {} subscription(s)", count);
            self.resync_pending = false;
            self.record_sync();
            self.emit(SyncEvent::FullSyncRequested {
                subscriptions: count,
                last_sync,
            });
        }
        self.set_syncing(false);
        result
    }

    fn data_sync(&self, change: &QueuedChange) -> ClientMessage {
        ClientMessage::DataSync {
            change_type: change.kind.clone(),
            payload: change.data.clone(),
            timestamp: change.timestamp,
            client_id: self.client_id.clone(),
        }
    }

    fn record_sync(&mut self) {
        if let Err(err) = self.state.record_sync(Utc::now()) {
            warn!("Failed to persist sync state: {:#}", err);
            self.emit(SyncEvent::Error(SyncError::Storage(format!("{:#}", err))));
        }
    }

    /// Apply one inbound update to the cache
    fn apply_update(&mut self, update: TopicData) {
        let kind = update
            .topic
            .strip_suffix("_updated")
            .unwrap_or(&update.topic)
            .to_string();
        let Some(id) = entity_id(&kind, &update.payload) else {
            debug!("Ignoring '{}' update without an entity id", update.topic);
            return;
        };

        let remote = CacheEntry {
            key: cache_key(&kind, &id),
            last_modified: last_modified(&update),
            data: entity_data(update.payload),
        };

        let (stored, has_conflict) = match self.cache.get(&remote.key) {
            None => (remote, false),
            Some(local) => {
                if is_conflict(local.last_modified, remote.last_modified, self.conflict_window) {
                    debug!("Conflicting update for {}", remote.key);
                    (self.resolver.resolve(&local, &remote), true)
                } else {
                    (remote, false)
                }
            }
        };

        self.cache.insert(stored.clone());
        self.emit(SyncEvent::DataUpdated {
            kind,
            entry: Arc::new(stored),
            has_conflict,
        });
    }

    fn set_syncing(&mut self, syncing: bool) {
        self.syncing = syncing;
        self.refresh_status();
    }

    fn refresh_status(&self) {
        let status = compute_status(self.conn_state, self.online, self.syncing);
        let previous = self.status_tx.send_replace(status);
        if previous != status {
            debug!("Sync status {} -> {}", previous, status);
            self.emit(SyncEvent::StatusChanged(status));
        }
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }
}

/// Entity id from `id` or `<kind>Id`
fn entity_id(kind: &str, payload: &Value) -> Option<String> {
    let value = payload
        .get("id")
        .or_else(|| payload.get(format!("{}Id", kind)))?;
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Entity state from `changes`, then `data`, then the payload itself
fn entity_data(payload: Value) -> Value {
    match payload {
        Value::Object(mut map) => {
            if let Some(changes) = map.remove("changes") {
                changes
            } else if let Some(data) = map.remove("data") {
                data
            } else {
                Value::Object(map)
            }
        }
        other => other,
    }
}

/// `lastModified` (RFC 3339 or epoch millis), else the envelope time, else now
fn last_modified(update: &TopicData) -> DateTime<Utc> {
    let parsed = match update.payload.get("lastModified") {
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    };
    parsed.or(update.timestamp).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::{next_matching, test_config, MockServer};
    use crate::protocol::kind;
    use serde_json::json;
    use tempfile::TempDir;

    fn filters(value: Value) -> Filters {
        value.as_object().cloned().unwrap()
    }

    fn t(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_714_560_000_000 + ms).unwrap()
    }

    fn registry(server: &MockServer) -> SubscriptionRegistry {
        SubscriptionRegistry::new(ConnectionManager::with_connector(
            test_config(),
            server.connector(),
        ))
    }

    async fn next_update(events: &mut broadcast::Receiver<SyncEvent>) -> (Arc<CacheEntry>, bool) {
        match next_matching(events, |e| matches!(e, SyncEvent::DataUpdated { .. })).await {
            SyncEvent::DataUpdated {
                entry,
                has_conflict,
                ..
            } => (entry, has_conflict),
            other => panic!("Expected DataUpdated, got {:?}", other),
        }
    }

    fn publish_dashboard(server: &MockServer, title: &str, at: DateTime<Utc>) {
        server.publish(
            "dashboard_updated",
            json!({
                "id": "d1",
                "changes": { "title": title },
                "lastModified": at.to_rfc3339(),
            }),
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dashboard_update_scenario() {
        let server = MockServer::new();
        let sync = SyncCoordinator::builder(registry(&server)).build();
        let mut events = sync.events();

        sync.connection().connect().await.unwrap();
        sync.subscribe_to_data_type("dashboard", filters(json!({"userId": "u1"})))
            .await
            .unwrap();
        assert_eq!(server.received(kind::SUBSCRIBE)[0].data["topic"], "dashboard_updated");

        publish_dashboard(&server, "A", t(0));
        let (entry, has_conflict) = next_update(&mut events).await;
        assert!(!has_conflict);
        assert_eq!(entry.key, "dashboard:d1");
        assert_eq!(entry.last_modified, t(0));
        assert_eq!(sync.get_cached_data("dashboard:d1").unwrap()["title"], "A");

        publish_dashboard(&server, "B", t(2000));
        let (_, has_conflict) = next_update(&mut events).await;
        assert!(has_conflict);
        assert_eq!(sync.get_cached_data("dashboard:d1").unwrap()["title"], "B");
        assert_eq!(sync.cache_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_outside_window_replaces() {
        let server = MockServer::new();
        let sync = SyncCoordinator::builder(registry(&server)).build();
        let mut events = sync.events();
        sync.connection().connect().await.unwrap();

        publish_dashboard(&server, "A", t(0));
        next_update(&mut events).await;

        // Older but outside the window: no conflict, remote wins
        publish_dashboard(&server, "old", t(-60_000));
        let (entry, has_conflict) = next_update(&mut events).await;
        assert!(!has_conflict);
        assert_eq!(entry.data["title"], "old");
        assert_eq!(sync.cache_entry("dashboard:d1").unwrap().last_modified, t(-60_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflict_keeps_later_write() {
        let server = MockServer::new();
        let sync = SyncCoordinator::builder(registry(&server)).build();
        let mut events = sync.events();
        sync.connection().connect().await.unwrap();

        publish_dashboard(&server, "newer", t(3000));
        next_update(&mut events).await;

        publish_dashboard(&server, "stale", t(1000));
        let (entry, has_conflict) = next_update(&mut events).await;
        assert!(has_conflict);
        assert_eq!(entry.data["title"], "newer");
        assert_eq!(sync.get_cached_data("dashboard:d1").unwrap()["title"], "newer");
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_resolver() {
        let server = MockServer::new();
        let merge = |local: &CacheEntry, remote: &CacheEntry| {
            let mut data = local.data.clone();
            if let (Some(into), Some(from)) = (data.as_object_mut(), remote.data.as_object()) {
                for (k, v) in from {
                    into.insert(k.clone(), v.clone());
                }
            }
            CacheEntry {
                data,
                ..remote.clone()
            }
        };
        let sync = SyncCoordinator::builder(registry(&server))
            .resolver(merge)
            .build();
        let mut events = sync.events();
        sync.connection().connect().await.unwrap();

        server.publish("widget_updated", json!({"widgetId": 7, "data": {"x": 1}, "lastModified": 1000}));
        next_update(&mut events).await;
        server.publish("widget_updated", json!({"widgetId": 7, "data": {"y": 2}, "lastModified": 1500}));
        let (_, has_conflict) = next_update(&mut events).await;

        assert!(has_conflict);
        assert_eq!(sync.get_cached_data("widget:7").unwrap(), json!({"x": 1, "y": 2}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_is_idempotent() {
        let server = MockServer::new();
        let sync = SyncCoordinator::builder(registry(&server)).build();
        sync.connection().connect().await.unwrap();

        let f = filters(json!({"userId": "u1"}));
        sync.subscribe_to_data_type("dashboard", f.clone()).await.unwrap();
        sync.subscribe_to_data_type("dashboard", f).await.unwrap();

        assert_eq!(sync.registry().desired().len(), 1);
        assert_eq!(server.received(kind::SUBSCRIBE).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_queue_drains_in_order() {
        let server = MockServer::new();
        let sync = SyncCoordinator::builder(registry(&server))
            .client_id("client-1")
            .build();
        let mut events = sync.events();

        for n in 1..=3 {
            let size = sync
                .queue_data_change("widget_moved", json!({ "n": n }))
                .await
                .unwrap();
            assert_eq!(size, n as usize);
        }
        let event = next_matching(&mut events, |e| matches!(e, SyncEvent::DataQueued { .. })).await;
        assert!(matches!(event, SyncEvent::DataQueued { queue_size: 1 }));
        assert_eq!(sync.queue_len(), 3);

        sync.connection().connect().await.unwrap();
        let event = next_matching(&mut events, |e| matches!(e, SyncEvent::QueueDrained { .. })).await;
        assert!(matches!(event, SyncEvent::QueueDrained { sent: 3, remaining: 0 }));
        assert_eq!(sync.queue_len(), 0);

        let sent = server.received(kind::DATA_SYNC);
        let order: Vec<i64> = sent.iter().map(|e| e.data["payload"]["n"].as_i64().unwrap()).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(sent[0].data["changeType"], "widget_moved");
        assert_eq!(sent[0].data["clientId"], "client-1");
        assert!(sync.last_sync().await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_drain_requeues_in_order() {
        let server = MockServer::new();
        server.fail_data_sync_after(1);
        let sync = SyncCoordinator::builder(registry(&server)).build();
        let mut events = sync.events();

        for name in ["a", "b", "c"] {
            sync.queue_data_change("note", json!({ "name": name })).await.unwrap();
        }

        sync.connection().connect().await.unwrap();
        let event = next_matching(&mut events, |e| matches!(e, SyncEvent::QueueDrained { .. })).await;
        assert!(matches!(event, SyncEvent::QueueDrained { sent: 1, remaining: 2 }));

        // The failed send drops the link; the next epoch drains the rest
        let event = next_matching(&mut events, |e| matches!(e, SyncEvent::QueueDrained { .. })).await;
        assert!(matches!(event, SyncEvent::QueueDrained { sent: 2, remaining: 0 }));

        let names: Vec<String> = server
            .received(kind::DATA_SYNC)
            .iter()
            .map(|e| e.data["payload"]["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(sync.queued_changes().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_sync_after_reconnect() {
        let server = MockServer::new();
        let sync = SyncCoordinator::builder(registry(&server)).build();
        let mut events = sync.events();
        sync.connection().connect().await.unwrap();
        sync.subscribe_to_data_type("dashboard", Filters::new()).await.unwrap();
        assert!(server.received(kind::REQUEST_FULL_SYNC).is_empty());

        server.drop_link();
        let event = next_matching(&mut events, |e| matches!(e, SyncEvent::FullSyncRequested { .. })).await;
        assert!(matches!(
            event,
            SyncEvent::FullSyncRequested { subscriptions: 1, last_sync: None }
        ));

        let requests = server.received(kind::REQUEST_FULL_SYNC);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].data["subscriptions"][0]["topic"], "dashboard_updated");
        assert!(requests[0].data["lastSync"].is_null());
        assert_eq!(requests[0].data["clientId"], sync.client_id());

        // The second resync carries the time of the first
        server.drop_link();
        next_matching(&mut events, |e| matches!(e, SyncEvent::FullSyncRequested { .. })).await;
        let requests = server.received(kind::REQUEST_FULL_SYNC);
        assert_eq!(requests.len(), 2);
        assert!(requests[1].data["lastSync"].is_string());
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_refresh_resubscribes_and_resyncs() {
        let server = MockServer::new();
        let sync = SyncCoordinator::builder(registry(&server)).build();
        sync.connection().connect().await.unwrap();
        sync.subscribe_to_data_type("dashboard", Filters::new()).await.unwrap();

        sync.connection()
            .set_token(Some("fresh".to_string()))
            .await
            .unwrap();
        server.wait_for(kind::SUBSCRIBE, 2).await;
        let requests = server.wait_for(kind::REQUEST_FULL_SYNC, 1).await;
        assert_eq!(requests[0].data["subscriptions"][0]["topic"], "dashboard_updated");

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sync.registry().acknowledged().len(), 1);
        assert_eq!(server.received(kind::REQUEST_FULL_SYNC).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_reconnect_resyncs() {
        let server = MockServer::new();
        let sync = SyncCoordinator::builder(registry(&server)).build();
        sync.connection().connect().await.unwrap();
        sync.subscribe_to_data_type("dashboard", Filters::new()).await.unwrap();

        sync.connection().disconnect().await.unwrap();
        sync.connection().connect().await.unwrap();

        server.wait_for(kind::SUBSCRIBE, 2).await;
        server.wait_for(kind::REQUEST_FULL_SYNC, 1).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sync.registry().acknowledged().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_burst_is_not_silently_lost() {
        let server = MockServer::new();
        let sync = SyncCoordinator::builder(registry(&server)).build();
        sync.connection().connect().await.unwrap();
        sync.subscribe_to_data_type("dashboard", Filters::new()).await.unwrap();

        for n in 0..2000 {
            server.publish("dashboard_updated", json!({"id": format!("d{}", n)}));
        }
        tokio::time::sleep(Duration::from_secs(5)).await;

        // Every update reached the cache, or the server was asked to resend
        let resynced = !server.received(kind::REQUEST_FULL_SYNC).is_empty();
        assert!(
            sync.cache_len() == 2000 || resynced,
            "cached {} of 2000 without a resync",
            sync.cache_len()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_presence_holds_changes() {
        let server = MockServer::new();
        let presence = NetworkPresence::new(true);
        let sync = SyncCoordinator::builder(registry(&server))
            .presence(presence.clone())
            .build();
        let mut events = sync.events();
        sync.connection().connect().await.unwrap();

        presence.set_online(false);
        let event = next_matching(&mut events, |e| {
            matches!(e, SyncEvent::OnlineStatusChanged { .. })
        })
        .await;
        assert!(matches!(event, SyncEvent::OnlineStatusChanged { is_online: false }));
        assert_eq!(sync.status(), SyncStatus::Disconnected);

        let outcome = sync.submit_change("note", json!({"text": "hi"})).await.unwrap();
        assert_eq!(outcome, Submission::Queued { queue_size: 1 });
        assert!(matches!(
            sync.request_full_sync().await,
            Err(SyncError::NotConnected)
        ));
        assert!(server.received(kind::DATA_SYNC).is_empty());

        presence.set_online(true);
        let event = next_matching(&mut events, |e| matches!(e, SyncEvent::QueueDrained { .. })).await;
        assert!(matches!(event, SyncEvent::QueueDrained { sent: 1, remaining: 0 }));
        next_matching(&mut events, |e| matches!(e, SyncEvent::FullSyncRequested { .. })).await;
        assert_eq!(server.received(kind::DATA_SYNC).len(), 1);
        assert_eq!(sync.status(), SyncStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_sends_when_connected() {
        let server = MockServer::new();
        let sync = SyncCoordinator::builder(registry(&server)).build();

        let outcome = sync.submit_change("note", json!({"text": "later"})).await.unwrap();
        assert_eq!(outcome, Submission::Queued { queue_size: 1 });

        sync.connection().connect().await.unwrap();
        server.wait_for(kind::DATA_SYNC, 1).await;

        let outcome = sync.submit_change("note", json!({"text": "now"})).await.unwrap();
        assert_eq!(outcome, Submission::Sent);
        let sent = server.wait_for(kind::DATA_SYNC, 2).await;
        assert_eq!(sent[1].data["payload"]["text"], "now");
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_full_sync() {
        let server = MockServer::new();
        let sync = SyncCoordinator::builder(registry(&server)).build();

        assert!(matches!(
            sync.request_full_sync().await,
            Err(SyncError::NotConnected)
        ));

        sync.connection().connect().await.unwrap();
        let mut status = sync.subscribe_status();
        status
            .wait_for(|s| *s == SyncStatus::Connected)
            .await
            .unwrap();
        sync.request_full_sync().await.unwrap();
        assert_eq!(server.received(kind::REQUEST_FULL_SYNC).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_follows_connection() {
        let server = MockServer::new();
        let sync = SyncCoordinator::builder(registry(&server)).build();
        let mut status = sync.subscribe_status();
        assert_eq!(sync.status(), SyncStatus::Disconnected);

        sync.connection().connect().await.unwrap();
        status.wait_for(|s| *s == SyncStatus::Connected).await.unwrap();

        server.refuse_all(true);
        server.drop_link();
        status.wait_for(|s| *s == SyncStatus::Reconnecting).await.unwrap();
        status.wait_for(|s| *s == SyncStatus::Disconnected).await.unwrap();
        assert_eq!(sync.connection().state(), ConnectionState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_cache() {
        let server = MockServer::new();
        let sync = SyncCoordinator::builder(registry(&server)).build();
        let mut events = sync.events();
        sync.connection().connect().await.unwrap();

        publish_dashboard(&server, "A", t(0));
        next_update(&mut events).await;
        assert_eq!(sync.cache_len(), 1);

        sync.clear_cache().await.unwrap();
        assert_eq!(sync.cache_len(), 0);
        let event = next_matching(&mut events, |e| matches!(e, SyncEvent::CacheCleared)).await;
        assert!(matches!(event, SyncEvent::CacheCleared));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_overflow_reported() {
        let server = MockServer::new();
        let sync = SyncCoordinator::builder(registry(&server))
            .offline_queue(OfflineQueue::in_memory(2))
            .build();
        let mut events = sync.events();

        for n in 0..3 {
            sync.queue_data_change("note", json!({ "n": n })).await.unwrap();
        }
        let event = next_matching(&mut events, |e| matches!(e, SyncEvent::Error(_))).await;
        assert!(matches!(
            event,
            SyncEvent::Error(SyncError::QueueOverflow { dropped: 1 })
        ));

        let kept: Vec<Value> = sync
            .queued_changes()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.data["n"].clone())
            .collect();
        assert_eq!(kept, vec![json!(1), json!(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persisted_queue_survives_restart() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(OFFLINE_QUEUE_FILE);

        {
            let server = MockServer::new();
            let sync = SyncCoordinator::builder(registry(&server))
                .offline_queue(OfflineQueue::open(&path, 10).unwrap())
                .build();
            sync.queue_data_change("note", json!({"text": "kept"})).await.unwrap();
            sync.shutdown();
        }

        let server = MockServer::new();
        let sync = SyncCoordinator::builder(registry(&server))
            .offline_queue(OfflineQueue::open(&path, 10).unwrap())
            .build();
        assert_eq!(sync.queue_len(), 1);

        sync.connection().connect().await.unwrap();
        let sent = server.wait_for(kind::DATA_SYNC, 1).await;
        assert_eq!(sent[0].data["payload"]["text"], "kept");
    }

    #[test]
    fn test_entity_helpers() {
        assert_eq!(entity_id("dashboard", &json!({"id": "d1"})), Some("d1".to_string()));
        assert_eq!(entity_id("widget", &json!({"widgetId": 7})), Some("7".to_string()));
        assert_eq!(entity_id("widget", &json!({"name": "x"})), None);

        assert_eq!(entity_data(json!({"id": "d1", "changes": {"a": 1}})), json!({"a": 1}));
        assert_eq!(entity_data(json!({"id": "d1", "data": {"b": 2}})), json!({"b": 2}));
        assert_eq!(entity_data(json!({"id": "d1", "c": 3})), json!({"id": "d1", "c": 3}));
    }

    #[test]
    fn test_last_modified_sources() {
        let envelope_time = t(42);
        let update = |payload: Value, timestamp| TopicData {
            topic: "dashboard_updated".to_string(),
            payload,
            timestamp,
        };

        assert_eq!(
            last_modified(&update(json!({"lastModified": t(5).to_rfc3339()}), None)),
            t(5)
        );
        assert_eq!(
            last_modified(&update(json!({"lastModified": t(7).timestamp_millis()}), None)),
            t(7)
        );
        assert_eq!(
            last_modified(&update(json!({"lastModified": "garbage"}), Some(envelope_time))),
            envelope_time
        );
    }

    #[test]
    fn test_status_mapping() {
        use ConnectionState::*;
        assert_eq!(compute_status(Connected, true, false), SyncStatus::Connected);
        assert_eq!(compute_status(Connected, false, false), SyncStatus::Disconnected);
        assert_eq!(compute_status(Reconnecting, true, false), SyncStatus::Reconnecting);
        assert_eq!(compute_status(Error, true, false), SyncStatus::Disconnected);
        assert_eq!(compute_status(Connecting, true, false), SyncStatus::Disconnected);
        assert_eq!(compute_status(Connected, true, true), SyncStatus::Syncing);
    }
}
