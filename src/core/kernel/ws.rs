use crate::core::errors::ExchangeError;
use crate::core::kernel::codec::WsCodec;
use crate::core::kernel::listen_key::{ListenKeyHandle, SessionEvent};
use crate::core::kernel::task::ScheduledTask;
use crate::core::types::ConnectionState;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::{interval_at, sleep, sleep_until, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info, instrument, warn};

/// Server-side ping cadence of the exchange is 3 minutes; match it client-side.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3 * 60);

const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Reconnect behaviour after a close event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    /// Fixed delay before each reconnect attempt
    pub delay: Duration,
    /// Consecutive failed reconnects tolerated before giving up
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            delay: Duration::ZERO,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    pub fn enabled(delay: Duration, max_attempts: u32) -> Self {
        Self {
            enabled: true,
            delay,
            max_attempts,
        }
    }
}

/// Per-connection settings
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Exchange name for logging and tracing
    pub exchange_name: String,
    pub reconnect: ReconnectPolicy,
    /// Client ping cadence; `None` disables the heartbeat
    pub heartbeat_interval: Option<Duration>,
    /// Forced close / reopen after this long, without consuming reconnect budget
    pub max_connection_age: Option<Duration>,
}

impl WsConfig {
    pub fn new(exchange_name: impl Into<String>) -> Self {
        Self {
            exchange_name: exchange_name.into(),
            reconnect: ReconnectPolicy::default(),
            heartbeat_interval: None,
            max_connection_age: None,
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    pub fn with_max_connection_age(mut self, age: Duration) -> Self {
        self.max_connection_age = Some(age);
        self
    }
}

/// An open socket, pure transport
#[async_trait]
pub trait WsTransport: Send {
    async fn send(&mut self, message: Message) -> Result<(), ExchangeError>;

    /// Next frame; `None` once the socket is gone
    async fn next(&mut self) -> Option<Result<Message, ExchangeError>>;

    async fn close(&mut self) -> Result<(), ExchangeError>;
}

/// Opens sockets for a connection, once per (re)connect
#[async_trait]
pub trait WsConnector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Box<dyn WsTransport>, ExchangeError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Tungstenite-backed socket
pub struct TungsteniteWs {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
}

#[async_trait]
impl WsTransport for TungsteniteWs {
    async fn send(&mut self, message: Message) -> Result<(), ExchangeError> {
        self.write.send(message).await.map_err(|e| {
            ExchangeError::NetworkError(format!("Failed to send WebSocket message: {}", e))
        })
    }

    async fn next(&mut self) -> Option<Result<Message, ExchangeError>> {
        self.read.next().await.map(|frame| {
            frame.map_err(|e| ExchangeError::NetworkError(format!("WebSocket error: {}", e)))
        })
    }

    async fn close(&mut self) -> Result<(), ExchangeError> {
        self.write.close().await.map_err(|e| {
            ExchangeError::NetworkError(format!("Failed to close WebSocket: {}", e))
        })
    }
}

/// Connector for real sockets via `connect_async`
#[derive(Debug, Clone)]
pub struct TungsteniteConnector {
    exchange_name: String,
    connect_timeout: Duration,
}

impl TungsteniteConnector {
    pub fn new(exchange_name: impl Into<String>) -> Self {
        Self {
            exchange_name: exchange_name.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl WsConnector for TungsteniteConnector {
    #[instrument(skip(self, url), fields(exchange = %self.exchange_name))]
    async fn connect(&self, url: &str) -> Result<Box<dyn WsTransport>, ExchangeError> {
        let (stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| {
                ExchangeError::ConnectionTimeout("WebSocket connection timeout".to_string())
            })?
            .map_err(|e| {
                ExchangeError::NetworkError(format!("WebSocket connection failed: {}", e))
            })?;

        let (write, read) = stream.split();
        Ok(Box::new(TungsteniteWs { write, read }))
    }
}

/// Where a connection gets its URL from, re-read on every connect
#[derive(Debug, Clone)]
pub enum UrlSource {
    Static(String),
    /// `base` followed by whatever listen key is active at connect time
    ListenKey { base: String, handle: ListenKeyHandle },
}

impl UrlSource {
    pub fn resolve(&self) -> Result<String, ExchangeError> {
        match self {
            Self::Static(url) => Ok(url.clone()),
            Self::ListenKey { base, handle } => handle
                .current_key()
                .map(|key| format!("{}{}", base, key))
                .ok_or_else(|| {
                    ExchangeError::SessionTerminated(format!(
                        "No active {} listen key",
                        handle.kind()
                    ))
                }),
        }
    }
}

/// Receives decoded events of one connection, one call at a time
#[async_trait]
pub trait StreamHandler<M: Send + 'static>: Send + 'static {
    async fn on_message(&mut self, message: M);

    /// Called at most once, when the connection ends for good without being closed
    async fn on_terminated(&mut self, error: ExchangeError);
}

struct HandleInner {
    name: String,
    state: watch::Receiver<ConnectionState>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<ScheduledTask>>,
}

/// Caller side of a running connection. Clones share the connection; the
/// driver is aborted once the last clone is dropped.
#[derive(Clone)]
pub struct StreamHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

impl StreamHandle {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        !self.state().is_terminal()
    }

    /// Stop timers, close the socket and end the connection. Idempotent.
    pub async fn close(&self) {
        self.inner.shutdown.send_replace(true);
        let mut task = self.inner.task.lock().await;
        if let Some(task) = task.as_mut() {
            task.stop_within(CLOSE_GRACE).await;
        }
    }

    /// Resolve once the connection has ended, for whatever reason
    pub async fn wait(&self) {
        let mut state = self.inner.state.clone();
        let _ = state.wait_for(|state| state.is_terminal()).await;
    }
}

/// A single WebSocket stream with heartbeat and reconnect handling
pub struct StreamConnection {
    name: String,
    config: WsConfig,
    url: UrlSource,
    connector: Arc<dyn WsConnector>,
    session: Option<broadcast::Receiver<SessionEvent>>,
}

impl StreamConnection {
    pub fn new(
        name: impl Into<String>,
        config: WsConfig,
        url: UrlSource,
        connector: Arc<dyn WsConnector>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            url,
            connector,
            session: None,
        }
    }

    /// Follow listen-key lifecycle events (regeneration, rotation, termination)
    pub fn with_session_events(mut self, events: broadcast::Receiver<SessionEvent>) -> Self {
        self.session = Some(events);
        self
    }

    /// Start the connection driver
    pub fn spawn<C, H>(self, codec: C, handler: H) -> StreamHandle
    where
        C: WsCodec,
        H: StreamHandler<C::Message>,
    {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let name = self.name.clone();

        let driver = Driver {
            name: self.name,
            config: self.config,
            url: self.url,
            connector: self.connector,
            session: self.session,
            codec,
            handler,
            shutdown: shutdown_rx,
            state: state_tx,
        };

        StreamHandle {
            inner: Arc::new(HandleInner {
                name,
                state: state_rx,
                shutdown: shutdown_tx,
                task: Mutex::new(Some(ScheduledTask::spawn("stream-connection", driver.run()))),
            }),
        }
    }
}

enum Outcome {
    /// Socket closed or never opened; subject to the reconnect policy
    Closed,
    /// Planned reopen (age limit, new listen key); no reconnect budget used
    Reopen,
    Shutdown,
    Terminated(ExchangeError),
}

struct Driver<C: WsCodec, H> {
    name: String,
    config: WsConfig,
    url: UrlSource,
    connector: Arc<dyn WsConnector>,
    session: Option<broadcast::Receiver<SessionEvent>>,
    codec: C,
    handler: H,
    shutdown: watch::Receiver<bool>,
    state: watch::Sender<ConnectionState>,
}

async fn heartbeat_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn age_limit(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_session_event(
    session: &mut Option<broadcast::Receiver<SessionEvent>>,
) -> Option<SessionEvent> {
    let Some(events) = session else {
        return std::future::pending().await;
    };
    loop {
        match events.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Session events lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

impl<C: WsCodec, H: StreamHandler<C::Message>> Driver<C, H> {
    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Events already reflected in the listen-key snapshot
    fn drain_session_events(&mut self) {
        if let Some(events) = self.session.as_mut() {
            while !matches!(
                events.try_recv(),
                Err(broadcast::error::TryRecvError::Empty | broadcast::error::TryRecvError::Closed)
            ) {}
        }
    }

    #[instrument(skip_all, fields(exchange = %self.config.exchange_name, stream = %self.name))]
    async fn run(mut self) {
        let policy = self.config.reconnect;
        let mut attempts = 0u32;

        loop {
            if self.is_shutdown() {
                break;
            }
            self.state.send_replace(ConnectionState::Connecting);
            self.drain_session_events();

            let outcome = match self.url.resolve() {
                Ok(url) => self.connect_and_drive(&url, &mut attempts).await,
                Err(e) => Outcome::Terminated(e),
            };

            match outcome {
                Outcome::Shutdown => break,
                Outcome::Reopen => continue,
                Outcome::Terminated(e) => {
                    error!("Stream terminated: {}", e);
                    self.handler.on_terminated(e).await;
                    break;
                }
                Outcome::Closed if !policy.enabled => {
                    info!("Stream closed, reconnect disabled");
                    break;
                }
                Outcome::Closed if attempts < policy.max_attempts => {
                    attempts += 1;
                    info!(
                        "Reconnecting in {:?} ({}/{})...",
                        policy.delay, attempts, policy.max_attempts
                    );
                    tokio::select! {
                        _ = sleep(policy.delay) => {}
                        _ = self.shutdown.changed() => break,
                    }
                }
                Outcome::Closed => {
                    let e = ExchangeError::ReconnectExhausted {
                        attempts: policy.max_attempts,
                    };
                    error!("{}", e);
                    self.handler.on_terminated(e).await;
                    break;
                }
            }
        }

        self.state.send_replace(ConnectionState::Closed);
        info!("Stream connection ended");
    }

    async fn connect_and_drive(&mut self, url: &str, attempts: &mut u32) -> Outcome {
        info!("Connecting...");
        let connected = tokio::select! {
            result = self.connector.connect(url) => result,
            _ = self.shutdown.changed() => return Outcome::Shutdown,
        };

        match connected {
            Ok(mut transport) => {
                *attempts = 0;
                self.state.send_replace(ConnectionState::Open);
                info!("Stream opened");
                let outcome = self.drive(transport.as_mut()).await;
                if !matches!(outcome, Outcome::Closed) {
                    self.state.send_replace(ConnectionState::Closing);
                    if let Err(e) = transport.close().await {
                        debug!("Error closing socket: {}", e);
                    }
                }
                outcome
            }
            Err(e) => {
                error!("Failed to connect: {}", e);
                Outcome::Closed
            }
        }
    }

    /// Pump one open socket until it closes or the connection must reopen
    async fn drive(&mut self, transport: &mut dyn WsTransport) -> Outcome {
        let mut heartbeat = self.config.heartbeat_interval.map(|period| {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let age_deadline = self
            .config
            .max_connection_age
            .map(|age| Instant::now() + age);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.changed() => return Outcome::Shutdown,

                event = next_session_event(&mut self.session) => match event {
                    Some(SessionEvent::Regenerated { .. }) => {
                        info!("Listen key regenerated, reopening stream");
                        return Outcome::Reopen;
                    }
                    Some(SessionEvent::Rotated { reconnect: true, .. }) => {
                        info!("Listen key rotated, reopening stream");
                        return Outcome::Reopen;
                    }
                    Some(SessionEvent::Rotated { reconnect: false, .. }) => {
                        info!("Listen key rotated, new key used on next connect");
                    }
                    Some(SessionEvent::Renewed) => {}
                    Some(SessionEvent::Terminated { reason }) => {
                        return Outcome::Terminated(ExchangeError::SessionTerminated(reason));
                    }
                    None => self.session = None,
                },

                _ = heartbeat_tick(&mut heartbeat) => {
                    debug!("Sending ping");
                    if let Err(e) = transport.send(Message::Ping(Vec::new())).await {
                        warn!("Failed to send ping: {}", e);
                        return Outcome::Closed;
                    }
                }

                _ = age_limit(age_deadline) => {
                    info!("Connection reached max age, reopening");
                    return Outcome::Reopen;
                }

                frame = transport.next() => match frame {
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(e) = transport.send(Message::Pong(payload)).await {
                            warn!("Failed to send pong response: {}", e);
                        }
                    }
                    Some(Ok(Message::Pong(_))) => debug!("Received pong"),
                    Some(Ok(Message::Close(frame))) => {
                        info!("Stream closed by server: {:?}", frame);
                        return Outcome::Closed;
                    }
                    Some(Ok(message)) => match self.codec.decode_message(message) {
                        Ok(Some(decoded)) => self.handler.on_message(decoded).await,
                        Ok(None) => {}
                        Err(e) => warn!("Failed to decode message: {}", e),
                    },
                    Some(Err(e)) => error!("WebSocket error: {}", e),
                    None => {
                        info!("Stream closed");
                        return Outcome::Closed;
                    }
                },
            }
        }
    }
}
