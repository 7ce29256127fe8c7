use crate::core::config::ExchangeConfig;
use crate::core::endpoints::EndpointSet;
use crate::core::errors::ExchangeError;
use crate::core::kernel::{
    ListenKeyApi, ListenKeyManager, ListenKeyPolicy, ReconnectPolicy, ScheduledTask,
    StreamConnection, StreamHandle, StreamHandler, UrlSource, WsConfig, WsConnector,
};
use crate::core::types::StreamKind;
use crate::exchanges::binance_perp::codec::{MiniTickerCodec, UserDataCodec, UserDataEvent};
use crate::exchanges::binance_perp::types::{
    AccountUpdateEvent, MarginCallEvent, MiniTicker, OrderTradeUpdateEvent,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

/// What a ticker subscriber receives
#[derive(Debug, Clone, PartialEq)]
pub enum TickerEvent {
    Tick(MiniTicker),
    /// The stream gave up reconnecting; no further events follow
    Failed { error: String },
}

#[async_trait]
pub trait TickerCallback: Send + Sync + 'static {
    async fn on_ticker(&self, symbol: &str, event: TickerEvent);
}

/// Typed callbacks of the user-data stream
#[async_trait]
pub trait UserDataCallbacks: Send + Sync + 'static {
    async fn on_margin_call(&self, event: MarginCallEvent);

    async fn on_account_update(&self, event: AccountUpdateEvent);

    async fn on_order_update(&self, event: OrderTradeUpdateEvent);

    /// The stream ended for good: reconnects exhausted or the listen key was lost
    async fn on_fault(&self, error: ExchangeError);
}

struct TickerDispatch {
    symbol: String,
    callback: Arc<dyn TickerCallback>,
}

#[async_trait]
impl StreamHandler<MiniTicker> for TickerDispatch {
    async fn on_message(&mut self, message: MiniTicker) {
        self.callback
            .on_ticker(&self.symbol, TickerEvent::Tick(message))
            .await;
    }

    async fn on_terminated(&mut self, error: ExchangeError) {
        self.callback
            .on_ticker(
                &self.symbol,
                TickerEvent::Failed {
                    error: error.to_string(),
                },
            )
            .await;
    }
}

struct UserDataDispatch {
    kind: StreamKind,
    callbacks: Arc<dyn UserDataCallbacks>,
}

#[async_trait]
impl StreamHandler<UserDataEvent> for UserDataDispatch {
    async fn on_message(&mut self, message: UserDataEvent) {
        match message {
            UserDataEvent::MarginCall(event) => self.callbacks.on_margin_call(event).await,
            UserDataEvent::AccountUpdate(event) => self.callbacks.on_account_update(event).await,
            UserDataEvent::OrderUpdate(event) => self.callbacks.on_order_update(event).await,
            UserDataEvent::Unknown(event_type) => {
                warn!(kind = %self.kind, "Unhandled event type: {}", event_type);
            }
        }
    }

    async fn on_terminated(&mut self, error: ExchangeError) {
        self.callbacks.on_fault(error).await;
    }
}

/// Identity of a subscription; at most one live stream per key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscriptionKey {
    /// Lower-cased symbol
    MiniTicker(String),
    UserData(StreamKind),
}

impl SubscriptionKey {
    pub fn mini_ticker(symbol: &str) -> Self {
        Self::MiniTicker(symbol.to_lowercase())
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MiniTicker(symbol) => write!(f, "{}@miniTicker", symbol),
            Self::UserData(kind) => write!(f, "{} user data", kind),
        }
    }
}

/// Stream-side settings taken from the exchange configuration
#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    pub reconnect: ReconnectPolicy,
    pub heartbeat_interval: Duration,
    pub listen_key: ListenKeyPolicy,
    /// Proactively reopen sockets older than this
    pub max_connection_age: Option<Duration>,
}

impl StreamSettings {
    pub fn from_config(config: &ExchangeConfig) -> Self {
        Self {
            reconnect: config.reconnect,
            heartbeat_interval: config.heartbeat_interval,
            listen_key: config.listen_key,
            max_connection_age: config.max_connection_age,
        }
    }
}

struct Subscription {
    stream: StreamHandle,
    /// Owns the listen key and releases it once `stream` has ended
    listen_key: Option<ScheduledTask>,
}

impl Subscription {
    /// Connection first so no timer outlives the key it renews
    async fn shutdown(mut self) {
        self.stream.close().await;
        if let Some(guard) = self.listen_key.as_mut() {
            guard.join().await;
        }
    }
}

/// Tie the listen key's lifetime to the stream that uses it
fn guard_listen_key<A: ListenKeyApi>(
    stream: StreamHandle,
    mut manager: ListenKeyManager<A>,
) -> ScheduledTask {
    ScheduledTask::spawn("listen-key-guard", async move {
        stream.wait().await;
        manager.shutdown().await;
    })
}

/// Active market and user-data streams, keyed by what they carry
pub struct SubscriptionRegistry<A: ListenKeyApi> {
    endpoints: EndpointSet,
    settings: StreamSettings,
    listen_keys: Arc<A>,
    connector: Arc<dyn WsConnector>,
    subscriptions: Mutex<HashMap<SubscriptionKey, Subscription>>,
}

impl<A: ListenKeyApi> SubscriptionRegistry<A> {
    pub fn new(
        endpoints: EndpointSet,
        settings: StreamSettings,
        listen_keys: Arc<A>,
        connector: Arc<dyn WsConnector>,
    ) -> Self {
        Self {
            endpoints,
            settings,
            listen_keys,
            connector,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    fn ws_config(&self) -> WsConfig {
        let config = WsConfig::new("binance_perp").with_reconnect(self.settings.reconnect);
        match self.settings.max_connection_age {
            Some(age) => config.with_max_connection_age(age),
            None => config,
        }
    }

    /// Take a finished entry out from under `key`, or refuse if it is still live
    ///
    /// The caller shuts the returned entry down once the registry lock is released.
    fn claim(
        subscriptions: &mut HashMap<SubscriptionKey, Subscription>,
        key: &SubscriptionKey,
    ) -> Result<Option<Subscription>, ExchangeError> {
        match subscriptions.get(key) {
            Some(existing) if existing.stream.is_active() => {
                Err(ExchangeError::AlreadySubscribed(key.to_string()))
            }
            Some(_) => Ok(subscriptions.remove(key)),
            None => Ok(None),
        }
    }

    /// Open `<symbol>@miniTicker` on the combined-stream endpoint
    #[instrument(skip(self, callback), fields(exchange = "binance_perp"))]
    pub async fn subscribe_mini_ticker(
        &self,
        symbol: &str,
        callback: Arc<dyn TickerCallback>,
    ) -> Result<StreamHandle, ExchangeError> {
        let key = SubscriptionKey::mini_ticker(symbol);
        let mut subscriptions = self.subscriptions.lock().await;
        let stale = Self::claim(&mut subscriptions, &key)?;

        let url = format!("{}{}", self.endpoints.combined_stream_base(), key);
        let dispatch = TickerDispatch {
            symbol: symbol.to_uppercase(),
            callback,
        };
        let stream = StreamConnection::new(
            key.to_string(),
            self.ws_config(),
            UrlSource::Static(url),
            self.connector.clone(),
        )
        .spawn(MiniTickerCodec, dispatch);

        info!("Subscribed to {}", key);
        subscriptions.insert(
            key,
            Subscription {
                stream: stream.clone(),
                listen_key: None,
            },
        );
        drop(subscriptions);

        if let Some(stale) = stale {
            stale.shutdown().await;
        }
        Ok(stream)
    }

    /// Acquire a listen key for `kind` and open its user-data stream
    ///
    /// Fails with `TokenAcquisitionExhausted` when no key could be obtained.
    #[instrument(skip(self, callbacks), fields(exchange = "binance_perp", kind = %kind))]
    pub async fn subscribe_user_data(
        &self,
        kind: StreamKind,
        callbacks: Arc<dyn UserDataCallbacks>,
    ) -> Result<StreamHandle, ExchangeError> {
        let key = SubscriptionKey::UserData(kind);
        let stale = Self::claim(&mut *self.subscriptions.lock().await, &key)?;
        if let Some(stale) = stale {
            stale.shutdown().await;
        }

        // Acquisition may retry for a while; other subscriptions go ahead meanwhile
        let mut manager =
            ListenKeyManager::new(self.listen_keys.clone(), kind, self.settings.listen_key);
        let handle = manager.handle();
        let events = handle.subscribe();
        manager.start().await?;

        let mut subscriptions = self.subscriptions.lock().await;
        let stale = match Self::claim(&mut subscriptions, &key) {
            Ok(stale) => stale,
            Err(e) => {
                drop(subscriptions);
                warn!("Lost the race for {}, releasing the new listen key", key);
                manager.shutdown().await;
                return Err(e);
            }
        };

        let url = UrlSource::ListenKey {
            base: self.endpoints.ws_base(kind).to_string(),
            handle,
        };
        let config = self
            .ws_config()
            .with_heartbeat(self.settings.heartbeat_interval);
        let stream = StreamConnection::new(key.to_string(), config, url, self.connector.clone())
            .with_session_events(events)
            .spawn(UserDataCodec, UserDataDispatch { kind, callbacks });

        info!("Subscribed to {}", key);
        subscriptions.insert(
            key,
            Subscription {
                stream: stream.clone(),
                listen_key: Some(guard_listen_key(stream.clone(), manager)),
            },
        );
        drop(subscriptions);

        if let Some(stale) = stale {
            stale.shutdown().await;
        }
        Ok(stream)
    }

    pub async fn is_active(&self, key: &SubscriptionKey) -> bool {
        self.subscriptions
            .lock()
            .await
            .get(key)
            .is_some_and(|subscription| subscription.stream.is_active())
    }

    pub async fn keys(&self) -> Vec<SubscriptionKey> {
        self.subscriptions.lock().await.keys().cloned().collect()
    }

    /// Close one subscription; `false` if there was none
    pub async fn close(&self, key: &SubscriptionKey) -> bool {
        let removed = self.subscriptions.lock().await.remove(key);
        match removed {
            Some(subscription) => {
                subscription.shutdown().await;
                info!("Unsubscribed from {}", key);
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) {
        let drained: Vec<_> = self.subscriptions.lock().await.drain().collect();
        for (key, subscription) in drained {
            subscription.shutdown().await;
            info!("Unsubscribed from {}", key);
        }
    }
}
