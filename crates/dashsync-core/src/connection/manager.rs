//! Connection manager
//!
//! Owns one physical duplex connection. All frame handling, heartbeat ticks,
//! backoff waits and connect deadlines run inside a single spawned task; the
//! [`ConnectionManager`] handle talks to it over a command channel and
//! observes it through a status watch and an event broadcast.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::backoff::ReconnectPolicy;
use super::state::{ConnectionEvent, ConnectionState};
use super::transport::{
    connection_url, CloseInfo, Connector, Frame, Link, TransportError, WebSocketConnector,
};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{
    kind, ClientMessage, Envelope, ServerMessage, ABNORMAL_CLOSURE, HEARTBEAT_TIMEOUT,
    NORMAL_CLOSURE,
};

const COMMAND_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 256;

/// Configuration for the connection manager
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket URL
    pub url: String,
    /// Bearer token appended as the `token` query parameter
    pub token: Option<String>,
    /// Deadline for open + `connection_established`
    pub connect_timeout: Duration,
    /// Interval between `ping` envelopes
    pub heartbeat_interval: Duration,
    /// Silence longer than `heartbeat_interval × multiplier` is a dead link
    pub heartbeat_timeout_multiplier: u32,
    /// Backoff between reconnection attempts
    pub reconnect: ReconnectPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: None,
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout_multiplier: 2,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ConnectionConfig {
    /// Silence allowed before the link is considered dead
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval * self.heartbeat_timeout_multiplier.max(1)
    }
}

type ConnectReply = oneshot::Sender<SyncResult<String>>;

enum Command {
    Connect { reply: ConnectReply },
    Disconnect { reply: oneshot::Sender<()> },
    Send {
        envelope: Envelope,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    SetToken {
        token: Option<String>,
        reply: ConnectReply,
    },
    Shutdown,
}

/// Handle to a connection task
///
/// Cheap to clone; every clone drives the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    command_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    id_rx: watch::Receiver<Option<String>>,
    event_tx: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionManager {
    /// Spawn a connection task using the WebSocket transport
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_connector(config, WebSocketConnector::new())
    }

    /// Spawn a connection task using a custom transport
    pub fn with_connector(config: ConnectionConfig, connector: impl Connector) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (id_tx, id_rx) = watch::channel(None);
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let actor = Actor {
            config,
            connector: Arc::new(connector),
            commands: command_rx,
            state_tx,
            id_tx,
            events: event_tx.clone(),
            waiters: Vec::new(),
            recovering: false,
        };
        tokio::spawn(actor.run());

        Self {
            command_tx,
            state_rx,
            id_rx,
            event_tx,
        }
    }

    /// Connect and wait for the server's `connection_established`
    ///
    /// Returns the server-assigned connection ID. Resolves immediately when
    /// already connected.
    pub async fn connect(&self) -> SyncResult<String> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Connect { reply }).await?;
        rx.await.map_err(|_| SyncError::Shutdown)?
    }

    /// Close with the normal-closure code; never triggers reconnection
    pub async fn disconnect(&self) -> SyncResult<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Disconnect { reply }).await?;
        rx.await.map_err(|_| SyncError::Shutdown)
    }

    /// Send an envelope on the current epoch
    pub async fn send(&self, message: impl Into<Envelope>) -> SyncResult<()> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        let (reply, rx) = oneshot::channel();
        self.command(Command::Send {
            envelope: message.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| SyncError::Shutdown)?
    }

    /// Replace the bearer token
    ///
    /// When connected, the connection is closed normally and re-established
    /// with the new token before this returns.
    pub async fn set_token(&self, token: Option<String>) -> SyncResult<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::SetToken { token, reply }).await?;
        rx.await.map_err(|_| SyncError::Shutdown)?.map(|_| ())
    }

    /// Stop the connection task, closing any open link normally
    pub fn shutdown(&self) {
        let _ = self.command_tx.try_send(Command::Shutdown);
    }

    /// Get the current state
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Server-assigned ID of the current epoch
    pub fn connection_id(&self) -> Option<String> {
        self.id_rx.borrow().clone()
    }

    /// Watch state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Receive connection events emitted from now on
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    async fn command(&self, command: Command) -> SyncResult<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| SyncError::Shutdown)
    }
}

/// An established epoch
struct Session {
    link: Link,
    connection_id: String,
}

enum Step {
    Idle,
    Establish,
    Drive(Session),
    Reconnect,
    Exit,
}

enum Attempt {
    Established(Session),
    Failed(SyncError),
    Aborted,
    Exit,
}

enum Wait {
    Elapsed,
    Aborted,
    Exit,
}

struct Actor {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    commands: mpsc::Receiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    id_tx: watch::Sender<Option<String>>,
    events: broadcast::Sender<ConnectionEvent>,
    /// Callers waiting for the next established epoch
    waiters: Vec<ConnectReply>,
    /// The next epoch resumes one that ended abnormally or for a token refresh
    recovering: bool,
}

impl Actor {
    async fn run(mut self) {
        let mut step = Step::Idle;
        loop {
            step = match step {
                Step::Idle => self.idle().await,
                Step::Establish => self.establish().await,
                Step::Drive(session) => self.drive(session).await,
                Step::Reconnect => self.reconnect().await,
                Step::Exit => break,
            };
        }
        self.fail_waiters(SyncError::Shutdown);
        self.set_state(ConnectionState::Disconnected);
        debug!("Connection task stopped");
    }

    /// `Disconnected` or `Error`: wait for an explicit connect
    async fn idle(&mut self) -> Step {
        loop {
            match self.commands.recv().await {
                None | Some(Command::Shutdown) => return Step::Exit,
                Some(Command::Connect { reply }) => {
                    self.waiters.push(reply);
                    return Step::Establish;
                }
                Some(Command::SetToken { token, reply }) => {
                    self.config.token = token;
                    let _ = reply.send(Ok(String::new()));
                }
                Some(Command::Send { reply, .. }) => {
                    let _ = reply.send(Err(SyncError::NotConnected));
                }
                Some(Command::Disconnect { reply }) => {
                    self.recovering = false;
                    self.set_state(ConnectionState::Disconnected);
                    let _ = reply.send(());
                }
            }
        }
    }

    /// `Connecting`: one attempt on behalf of the waiting callers
    async fn establish(&mut self) -> Step {
        self.set_state(ConnectionState::Connecting);
        info!("Connecting to {}", self.config.url);

        match self.attempt().await {
            Attempt::Established(session) => {
                self.on_established(&session);
                Step::Drive(session)
            }
            Attempt::Failed(err) => {
                warn!("Connection failed: {}", err);
                self.set_state(ConnectionState::Disconnected);
                self.emit(ConnectionEvent::Error(err.to_string()));
                self.fail_waiters(err);
                Step::Idle
            }
            Attempt::Aborted => Step::Idle,
            Attempt::Exit => Step::Exit,
        }
    }

    /// `Reconnecting`: backoff and retry until attempts run out
    async fn reconnect(&mut self) -> Step {
        self.set_state(ConnectionState::Reconnecting);
        let policy = self.config.reconnect;
        let mut last_error = None;

        for (attempt, delay) in policy.schedule() {
            info!("Reconnecting in {:?} (attempt {}/{})", delay, attempt, policy.max_attempts);
            self.emit(ConnectionEvent::Reconnecting { attempt, delay });

            match self.backoff(delay).await {
                Wait::Elapsed => {}
                Wait::Aborted => return Step::Idle,
                Wait::Exit => return Step::Exit,
            }

            match self.attempt().await {
                Attempt::Established(session) => {
                    self.on_established(&session);
                    return Step::Drive(session);
                }
                Attempt::Failed(err) => {
                    debug!("Reconnection attempt {} failed: {}", attempt, err);
                    last_error = Some(err);
                }
                Attempt::Aborted => return Step::Idle,
                Attempt::Exit => return Step::Exit,
            }
        }

        warn!(
            "Giving up after {} reconnection attempts",
            policy.max_attempts
        );
        self.set_state(ConnectionState::Error);
        self.emit(ConnectionEvent::ReconnectionFailed {
            attempts: policy.max_attempts,
        });
        self.fail_waiters(last_error.unwrap_or(SyncError::NotConnected));
        Step::Idle
    }

    /// Sleep through a backoff delay while still answering commands
    ///
    /// An explicit connect cuts the wait short.
    async fn backoff(&mut self, delay: Duration) -> Wait {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return Wait::Elapsed,
                cmd = self.commands.recv() => match cmd {
                    None | Some(Command::Shutdown) => return Wait::Exit,
                    Some(Command::Connect { reply }) => {
                        self.waiters.push(reply);
                        return Wait::Elapsed;
                    }
                    Some(Command::SetToken { token, reply }) => {
                        self.config.token = token;
                        self.waiters.push(reply);
                    }
                    Some(Command::Send { reply, .. }) => {
                        let _ = reply.send(Err(SyncError::NotConnected));
                    }
                    Some(Command::Disconnect { reply }) => {
                        self.abort();
                        let _ = reply.send(());
                        return Wait::Aborted;
                    }
                },
            }
        }
    }

    /// Open a link and wait for `connection_established`, bounded by the connect deadline
    async fn attempt(&mut self) -> Attempt {
        let url = match connection_url(&self.config.url, self.config.token.as_deref()) {
            Ok(url) => url,
            Err(err) => return Attempt::Failed(err.into()),
        };

        let timeout = self.config.connect_timeout;
        let handshake = tokio::time::timeout(timeout, handshake(self.connector.clone(), url));
        tokio::pin!(handshake);

        loop {
            tokio::select! {
                result = &mut handshake => {
                    return match result {
                        Ok(Ok(session)) => Attempt::Established(session),
                        Ok(Err(err)) => Attempt::Failed(err),
                        Err(_) => Attempt::Failed(SyncError::ConnectTimeout(timeout)),
                    };
                }
                cmd = self.commands.recv() => match cmd {
                    None | Some(Command::Shutdown) => return Attempt::Exit,
                    Some(Command::Connect { reply }) => self.waiters.push(reply),
                    Some(Command::SetToken { token, reply }) => {
                        // Applies to the next attempt
                        self.config.token = token;
                        self.waiters.push(reply);
                    }
                    Some(Command::Send { reply, .. }) => {
                        let _ = reply.send(Err(SyncError::NotConnected));
                    }
                    Some(Command::Disconnect { reply }) => {
                        self.abort();
                        let _ = reply.send(());
                        return Attempt::Aborted;
                    }
                },
            }
        }
    }

    /// `Connected`: pump frames, heartbeats and commands until the epoch ends
    async fn drive(&mut self, mut session: Session) -> Step {
        let interval = self.config.heartbeat_interval;
        let dead_after = self.config.heartbeat_timeout();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_pong = Instant::now();

        loop {
            tokio::select! {
                frame = session.link.stream.next() => match frame {
                    Some(Ok(Frame::Text(text))) => self.handle_text(&text, &mut last_pong),
                    Some(Ok(Frame::Close(info))) => {
                        let info = info.unwrap_or(CloseInfo { code: 1005, reason: String::new() });
                        return self.closed(info.code, info.reason);
                    }
                    Some(Err(err)) => {
                        warn!("Connection error: {}", err);
                        self.emit(ConnectionEvent::Error(err.to_string()));
                        return self.closed(ABNORMAL_CLOSURE, err.to_string());
                    }
                    None => return self.closed(ABNORMAL_CLOSURE, "connection lost".to_string()),
                },

                _ = heartbeat.tick() => {
                    if last_pong.elapsed() >= dead_after {
                        warn!(
                            "No pong for {:?}, closing connection {}",
                            last_pong.elapsed(),
                            session.connection_id
                        );
                        let _ = session.link.sink.close().await;
                        return self.closed(HEARTBEAT_TIMEOUT, "heartbeat timeout".to_string());
                    }
                    if let Err(err) = send_envelope(&mut session, ClientMessage::Ping.into_envelope()).await {
                        warn!("Heartbeat send failed: {}", err);
                        return self.closed(ABNORMAL_CLOSURE, err.to_string());
                    }
                }

                cmd = self.commands.recv() => match cmd {
                    Some(Command::Send { envelope, reply }) => {
                        match send_envelope(&mut session, envelope).await {
                            Ok(()) => {
                                let _ = reply.send(Ok(()));
                            }
                            Err(SendError::Encode(err)) => {
                                let _ = reply.send(Err(err));
                            }
                            Err(SendError::Transport(err)) => {
                                warn!("Send failed: {}", err);
                                let _ = reply.send(Err(err.clone().into()));
                                return self.closed(ABNORMAL_CLOSURE, err.to_string());
                            }
                        }
                    }
                    Some(Command::Connect { reply }) => {
                        let _ = reply.send(Ok(session.connection_id.clone()));
                    }
                    Some(Command::Disconnect { reply }) => {
                        close_normally(&mut session, "client disconnect").await;
                        self.recovering = false;
                        let step = self.closed(NORMAL_CLOSURE, "client disconnect".to_string());
                        let _ = reply.send(());
                        return step;
                    }
                    Some(Command::SetToken { token, reply }) => {
                        info!("Token updated, re-establishing connection");
                        self.config.token = token;
                        close_normally(&mut session, "token refresh").await;
                        self.closed(NORMAL_CLOSURE, "token refresh".to_string());
                        // The next epoch resumes this one
                        self.recovering = true;
                        self.waiters.push(reply);
                        return Step::Establish;
                    }
                    None | Some(Command::Shutdown) => {
                        close_normally(&mut session, "shutdown").await;
                        self.closed(NORMAL_CLOSURE, "shutdown".to_string());
                        return Step::Exit;
                    }
                },
            }
        }
    }

    fn handle_text(&mut self, text: &str, last_pong: &mut Instant) {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("Dropping inbound frame: {}", err);
                self.emit(ConnectionEvent::Error(err.to_string()));
                return;
            }
        };

        match envelope.kind.as_str() {
            kind::PONG => *last_pong = Instant::now(),
            kind::CONNECTION_ESTABLISHED => {
                debug!("Ignoring repeated connection_established");
            }
            kind::ERROR => {
                let message = match ServerMessage::from_envelope(&envelope) {
                    Ok(ServerMessage::Error { message }) => message,
                    _ => "unspecified server error".to_string(),
                };
                warn!("Server error: {}", message);
                self.emit(ConnectionEvent::Error(message));
                self.emit(ConnectionEvent::Message(envelope));
            }
            _ => self.emit(ConnectionEvent::Message(envelope)),
        }
    }

    fn on_established(&mut self, session: &Session) {
        let connection_id = session.connection_id.clone();
        info!("Connected (connection {})", connection_id);

        self.id_tx.send_replace(Some(connection_id.clone()));
        self.set_state(ConnectionState::Connected);
        self.emit(ConnectionEvent::Connected {
            connection_id: connection_id.clone(),
        });
        if self.recovering {
            self.recovering = false;
            self.emit(ConnectionEvent::Reconnected {
                connection_id: connection_id.clone(),
            });
        }
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(connection_id.clone()));
        }
    }

    /// End the current epoch; a normal close goes idle, anything else reconnects
    fn closed(&mut self, code: u16, reason: String) -> Step {
        info!("Connection closed (code {}): {}", code, reason);
        self.id_tx.send_replace(None);
        self.emit(ConnectionEvent::Disconnected { code, reason });

        if code == NORMAL_CLOSURE {
            self.set_state(ConnectionState::Disconnected);
            Step::Idle
        } else {
            self.recovering = true;
            Step::Reconnect
        }
    }

    /// Explicit disconnect while not connected
    fn abort(&mut self) {
        self.recovering = false;
        self.set_state(ConnectionState::Disconnected);
        self.fail_waiters(SyncError::Cancelled);
    }

    fn fail_waiters(&mut self, err: SyncError) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    fn set_state(&self, to: ConnectionState) {
        let from = self.state_tx.send_replace(to);
        if from != to {
            debug!("Connection state {} -> {}", from, to);
            self.emit(ConnectionEvent::StateChanged { from, to });
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }
}

/// Open a link and read until the server assigns a connection ID
async fn handshake(connector: Arc<dyn Connector>, url: url::Url) -> SyncResult<Session> {
    let mut link = connector.connect(&url).await?;

    loop {
        match link.stream.next().await {
            Some(Ok(Frame::Text(text))) => {
                let envelope = match Envelope::decode(&text) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        warn!("Ignoring frame during handshake: {}", err);
                        continue;
                    }
                };
                match ServerMessage::from_envelope(&envelope) {
                    Ok(ServerMessage::ConnectionEstablished { connection_id }) => {
                        return Ok(Session {
                            link,
                            connection_id,
                        });
                    }
                    Ok(ServerMessage::Error { message }) => {
                        return Err(SyncError::Protocol(format!("Server error: {}", message)));
                    }
                    Ok(_) => debug!("Ignoring '{}' during handshake", envelope.kind),
                    Err(err) => return Err(err),
                }
            }
            Some(Ok(Frame::Close(_))) | None => {
                return Err(TransportError::ConnectionClosed.into());
            }
            Some(Err(err)) => return Err(err.into()),
        }
    }
}

enum SendError {
    Encode(SyncError),
    Transport(TransportError),
}

async fn send_envelope(session: &mut Session, envelope: Envelope) -> Result<(), SendError> {
    let text = envelope.encode().map_err(SendError::Encode)?;
    session
        .link
        .sink
        .send(Frame::Text(text))
        .await
        .map_err(SendError::Transport)
}

async fn close_normally(session: &mut Session, reason: &str) {
    let frame = Frame::Close(Some(CloseInfo {
        code: NORMAL_CLOSURE,
        reason: reason.to_string(),
    }));
    if let Err(err) = session.link.sink.send(frame).await {
        debug!("Close frame not delivered: {}", err);
    }
    let _ = session.link.sink.close().await;
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::Encode(err) => write!(f, "{}", err),
            SendError::Transport(err) => write!(f, "{}", err),
        }
    }
}
