use async_trait::async_trait;
use perpbot::core::endpoints::{EndpointSet, Environment};
use perpbot::core::kernel::{
    ListenKeyApi, ListenKeyPolicy, ReconnectPolicy, RestClient, WsConnector, WsTransport,
};
use perpbot::exchanges::binance_perp::connector::{
    Account, StreamSettings, SubscriptionKey, SubscriptionRegistry, Trading, UserDataCallbacks,
};
use perpbot::exchanges::binance_perp::{
    AccountUpdateEvent, MarginCallEvent, OrderTradeUpdateEvent,
};
use perpbot::strategy::{event_channel, StrategyConfig, StrategyDriver};
use perpbot::{ExchangeError, StreamKind};
use reqwest::Method;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

struct ScriptedSocket {
    incoming: mpsc::UnboundedReceiver<Message>,
}

#[async_trait]
impl WsTransport for ScriptedSocket {
    async fn send(&mut self, _message: Message) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn next(&mut self) -> Option<Result<Message, ExchangeError>> {
        self.incoming.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), ExchangeError> {
        Ok(())
    }
}

/// Hands out prepared sockets in order, refusing once none are left
#[derive(Default)]
struct ScriptedConnector {
    sockets: Mutex<VecDeque<ScriptedSocket>>,
    urls: Mutex<Vec<String>>,
}

impl ScriptedConnector {
    fn accept(&self) -> mpsc::UnboundedSender<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sockets
            .lock()
            .unwrap()
            .push_back(ScriptedSocket { incoming: rx });
        tx
    }

    fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl WsConnector for ScriptedConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn WsTransport>, ExchangeError> {
        self.urls.lock().unwrap().push(url.to_string());
        match self.sockets.lock().unwrap().pop_front() {
            Some(socket) => Ok(Box::new(socket)),
            None => Err(ExchangeError::NetworkError("connection refused".to_string())),
        }
    }
}

/// Issues `key-1`, `key-2`, ... and rejects the first keepalive as an unknown key
#[derive(Default)]
struct ExpiringListenKeys {
    issued: AtomicU32,
    keepalives: AtomicU32,
    released: Mutex<Vec<String>>,
}

#[async_trait]
impl ListenKeyApi for ExpiringListenKeys {
    async fn acquire(&self, _kind: StreamKind) -> Result<String, ExchangeError> {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("key-{}", n))
    }

    async fn keepalive(&self, _kind: StreamKind, _key: &str) -> Result<(), ExchangeError> {
        if self.keepalives.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(ExchangeError::ApiError {
                status: 400,
                code: -1125,
                message: "This listenKey does not exist.".to_string(),
            });
        }
        Ok(())
    }

    async fn release(&self, _kind: StreamKind, key: &str) -> Result<(), ExchangeError> {
        self.released.lock().unwrap().push(key.to_string());
        Ok(())
    }
}

#[derive(Clone, Default)]
struct ScriptedRest {
    replies: Arc<Mutex<VecDeque<Value>>>,
    calls: Arc<Mutex<Vec<(Method, String, Vec<(String, String)>)>>>,
}

impl ScriptedRest {
    fn reply(&self, body: Value) {
        self.replies.lock().unwrap().push_back(body);
    }
}

#[async_trait]
impl RestClient for ScriptedRest {
    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        params: &[(String, String)],
        _signed: bool,
    ) -> Result<Value, ExchangeError> {
        self.calls
            .lock()
            .unwrap()
            .push((method, endpoint.to_string(), params.to_vec()));
        Ok(self.replies.lock().unwrap().pop_front().unwrap_or(Value::Null))
    }
}

#[derive(Default)]
struct AccountUpdates {
    positions: Mutex<Vec<String>>,
}

#[async_trait]
impl UserDataCallbacks for AccountUpdates {
    async fn on_margin_call(&self, _event: MarginCallEvent) {}

    async fn on_account_update(&self, event: AccountUpdateEvent) {
        if let Some(position) = event.position("BTCUSDT") {
            self.positions
                .lock()
                .unwrap()
                .push(position.position_amount.to_string());
        }
    }

    async fn on_order_update(&self, _event: OrderTradeUpdateEvent) {}

    async fn on_fault(&self, _error: ExchangeError) {}
}

fn registry<A: ListenKeyApi>(
    api: Arc<A>,
    connector: Arc<ScriptedConnector>,
) -> SubscriptionRegistry<A> {
    let connector: Arc<dyn WsConnector> = connector;
    SubscriptionRegistry::new(
        EndpointSet::resolve(Environment::Production, &HashMap::new()).unwrap(),
        StreamSettings {
            reconnect: ReconnectPolicy::enabled(Duration::from_secs(1), 5),
            heartbeat_interval: Duration::from_secs(180),
            listen_key: ListenKeyPolicy::default(),
            max_connection_age: None,
        },
        api,
        connector,
    )
}

fn account_update(amount: &str) -> Message {
    Message::Text(format!(
        r#"{{"e":"ACCOUNT_UPDATE","E":1,"T":1,"a":{{"m":"ORDER","B":[],"P":[{{"s":"BTCUSDT","pa":"{}","ep":"37000.0","up":"0","ps":"BOTH"}}]}}}}"#,
        amount
    ))
}

fn mini_ticker(close: &str) -> Message {
    Message::Text(format!(
        r#"{{"stream":"btcusdt@miniTicker","data":{{"e":"24hrMiniTicker","E":1,"s":"BTCUSDT","c":"{}","o":"1","h":"1","l":"1","v":"1","q":"1"}}}}"#,
        close
    ))
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[cfg(test)]
mod connectivity_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_user_data_stream_follows_regenerated_key() {
        let api = Arc::new(ExpiringListenKeys::default());
        let connector = Arc::new(ScriptedConnector::default());
        let first = connector.accept();
        let second = connector.accept();
        let registry = registry(api.clone(), connector.clone());
        let updates = Arc::new(AccountUpdates::default());

        registry
            .subscribe_user_data(StreamKind::Futures, updates.clone())
            .await
            .unwrap();
        first.send(account_update("0.002")).unwrap();
        settle().await;

        // First renewal is rejected as an unknown key
        tokio::time::sleep(Duration::from_secs(15 * 60)).await;
        settle().await;
        second.send(account_update("0.004")).unwrap();
        settle().await;

        assert_eq!(
            connector.urls(),
            vec![
                "wss://fstream.binance.com/ws/key-1",
                "wss://fstream.binance.com/ws/key-2"
            ]
        );
        assert_eq!(*updates.positions.lock().unwrap(), vec!["0.002", "0.004"]);
        assert!(
            registry
                .is_active(&SubscriptionKey::UserData(StreamKind::Futures))
                .await
        );

        registry.close_all().await;
        assert!(api.released.lock().unwrap().contains(&"key-2".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_subscriptions_open_one_socket() {
        let api = Arc::new(ExpiringListenKeys::default());
        let connector = Arc::new(ScriptedConnector::default());
        let _socket = connector.accept();
        let registry = registry(api, connector.clone());
        let (forwarder, _events) = event_channel();
        let forwarder = Arc::new(forwarder);

        let (first, second) = futures::future::join(
            registry.subscribe_mini_ticker("BTCUSDT", forwarder.clone()),
            registry.subscribe_mini_ticker("btcusdt", forwarder),
        )
        .await;
        settle().await;

        assert!(first.is_ok() != second.is_ok());
        assert!(matches!(
            first.err().or(second.err()),
            Some(ExchangeError::AlreadySubscribed(_))
        ));
        assert_eq!(connector.urls().len(), 1);
        registry.close_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_drives_strategy_orders() {
        let api = Arc::new(ExpiringListenKeys::default());
        let connector = Arc::new(ScriptedConnector::default());
        let socket = connector.accept();
        let registry = registry(api, connector.clone());

        let rest = ScriptedRest::default();
        let order = json!({
            "orderId": 1, "symbol": "BTCUSDT", "status": "NEW", "clientOrderId": "x",
            "type": "MARKET", "side": "BUY"
        });
        rest.reply(order.clone());
        rest.reply(json!([{"symbol": "BTCUSDT", "positionAmt": "0.002", "entryPrice": "37010.5"}]));
        rest.reply(order);

        let config = StrategyConfig {
            symbol: "BTCUSDT".to_string(),
            step_size_percent: Decimal::ONE,
            first_order_stop_loss_percent: Decimal::ONE,
            subsequent_order_stop_loss_percent: Decimal::ONE,
            max_order_trades: 2,
            order_amount: Decimal::new(2, 3),
        };
        let driver = StrategyDriver::new(config, Trading::new(&rest, false), Account::new(&rest));
        let (forwarder, events) = event_channel();
        let bot = tokio::spawn(driver.run(events));

        registry
            .subscribe_mini_ticker("BTCUSDT", Arc::new(forwarder))
            .await
            .unwrap();
        socket.send(mini_ticker("37000.0")).unwrap();
        // Below the next step: no further orders
        socket.send(mini_ticker("37100.0")).unwrap();
        settle().await;

        registry.close_all().await;
        let state = bot.await.unwrap();

        assert_eq!(
            connector.urls(),
            vec!["wss://fstream.binance.com/stream?streams=btcusdt@miniTicker"]
        );
        let calls = rest.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2].1, "/fapi/v1/order");
        assert!(calls[2]
            .2
            .contains(&("stopPrice".to_string(), "36640.3".to_string())));
        assert_eq!(state.order_count, 1);
        assert_eq!(state.last_order_price, Some("37010.5".parse().unwrap()));
    }
}
