//! Scale-in bot with a trailing stop-loss
//!
//! The first tick opens a market position and protects it with a STOP_MARKET
//! sell. Each time the price climbs `step_size_percent` above the last entry,
//! another lot is bought and the stop is moved up. All state lives in one
//! [`StrategyDriver`]; stream callbacks only forward events into its channel,
//! so every update happens inside a single serialized handler call.

use crate::core::config::{require_env, ConfigError};
use crate::core::errors::ExchangeError;
use crate::core::kernel::RestClient;
use crate::exchanges::binance_perp::connector::{
    Account, TickerCallback, TickerEvent, Trading, UserDataCallbacks,
};
use crate::exchanges::binance_perp::types::{
    AccountUpdateEvent, MarginCallEvent, MiniTicker, OrderTradeUpdateEvent, PositionRisk,
};
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyConfig {
    /// Upper-cased trading pair, e.g. `BTCUSDT`
    pub symbol: String,
    pub step_size_percent: Decimal,
    pub first_order_stop_loss_percent: Decimal,
    pub subsequent_order_stop_loss_percent: Decimal,
    pub max_order_trades: u32,
    pub order_amount: Decimal,
}

impl StrategyConfig {
    /// Read `SYMBOL`, `STEP_SIZE_PERCENT`, `FIRST_ORDER_STOP_LOSS_PERCENT`,
    /// `SUBSEQUENT_ORDER_STOP_LOSS_PERCENT`, `MAX_ORDER_TRADES` and `ORDER_AMOUNT`
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            symbol: require_env::<String>("SYMBOL")?.to_uppercase(),
            step_size_percent: require_env("STEP_SIZE_PERCENT")?,
            first_order_stop_loss_percent: require_env("FIRST_ORDER_STOP_LOSS_PERCENT")?,
            subsequent_order_stop_loss_percent: require_env("SUBSEQUENT_ORDER_STOP_LOSS_PERCENT")?,
            max_order_trades: require_env("MAX_ORDER_TRADES")?,
            order_amount: require_env("ORDER_AMOUNT")?,
        })
    }
}

/// Bookkeeping of the position the bot is building
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BotState {
    pub order_count: u32,
    pub last_order_price: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
}

impl BotState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickDecision {
    /// No position yet: open the first lot
    OpenFirst,
    /// Price stepped up far enough: add a lot and raise the stop
    ScaleIn,
    Hold,
}

pub fn decide_on_tick(state: &BotState, config: &StrategyConfig, price: Decimal) -> TickDecision {
    if state.order_count == 0 {
        return TickDecision::OpenFirst;
    }
    if state.order_count >= config.max_order_trades {
        return TickDecision::Hold;
    }
    match state.last_order_price {
        Some(last) if price >= last + percent_of(last, config.step_size_percent) => {
            TickDecision::ScaleIn
        }
        _ => TickDecision::Hold,
    }
}

fn percent_of(price: Decimal, percent: Decimal) -> Decimal {
    price * percent / Decimal::ONE_HUNDRED
}

/// Lots of `order_amount` making up an open position, rounded up; at least one
pub fn lots_in_position(position_amt: Decimal, order_amount: Decimal) -> u32 {
    if order_amount.is_zero() {
        return 1;
    }
    (position_amt.abs() / order_amount.abs())
        .ceil()
        .to_u32()
        .unwrap_or(u32::MAX)
        .max(1)
}

/// Truncate towards negative infinity at one decimal place
pub fn floor_to_one_decimal(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(1, RoundingStrategy::ToNegativeInfinity)
}

/// `percent` below `entry`, floored to the exchange's tick
pub fn stop_loss_level(entry: Decimal, percent: Decimal) -> Decimal {
    floor_to_one_decimal(entry - percent_of(entry, percent))
}

/// Everything the driver reacts to, in arrival order
#[derive(Debug, Clone)]
pub enum StrategyEvent {
    Tick(MiniTicker),
    TickerFailed(String),
    MarginCall(MarginCallEvent),
    AccountUpdate(AccountUpdateEvent),
    OrderUpdate(OrderTradeUpdateEvent),
    Fault(String),
}

/// Stream callbacks that hand events to the driver's channel
#[derive(Debug, Clone)]
pub struct EventForwarder {
    tx: mpsc::UnboundedSender<StrategyEvent>,
}

impl EventForwarder {
    fn forward(&self, event: StrategyEvent) {
        if self.tx.send(event).is_err() {
            debug!("Strategy driver gone, event dropped");
        }
    }
}

/// Create the forwarder and the receiving end consumed by [`StrategyDriver::run`]
pub fn event_channel() -> (EventForwarder, mpsc::UnboundedReceiver<StrategyEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventForwarder { tx }, rx)
}

#[async_trait]
impl TickerCallback for EventForwarder {
    async fn on_ticker(&self, _symbol: &str, event: TickerEvent) {
        self.forward(match event {
            TickerEvent::Tick(ticker) => StrategyEvent::Tick(ticker),
            TickerEvent::Failed { error } => StrategyEvent::TickerFailed(error),
        });
    }
}

#[async_trait]
impl UserDataCallbacks for EventForwarder {
    async fn on_margin_call(&self, event: MarginCallEvent) {
        self.forward(StrategyEvent::MarginCall(event));
    }

    async fn on_account_update(&self, event: AccountUpdateEvent) {
        self.forward(StrategyEvent::AccountUpdate(event));
    }

    async fn on_order_update(&self, event: OrderTradeUpdateEvent) {
        self.forward(StrategyEvent::OrderUpdate(event));
    }

    async fn on_fault(&self, error: ExchangeError) {
        self.forward(StrategyEvent::Fault(error.to_string()));
    }
}

/// Owns the bot state and issues every order
pub struct StrategyDriver<R: RestClient> {
    config: StrategyConfig,
    trading: Trading<R>,
    account: Account<R>,
    state: BotState,
}

impl<R: RestClient> StrategyDriver<R> {
    pub fn new(config: StrategyConfig, trading: Trading<R>, account: Account<R>) -> Self {
        Self {
            config,
            trading,
            account,
            state: BotState::default(),
        }
    }

    pub fn state(&self) -> &BotState {
        &self.state
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    /// Pick up an already open position so a restart does not double the first lot
    #[instrument(skip(self), fields(symbol = %self.config.symbol))]
    pub async fn initialize(&mut self) -> Result<(), ExchangeError> {
        match self.account.open_position(&self.config.symbol).await? {
            Some(position) => {
                let lots = lots_in_position(position.position_amt, self.config.order_amount);
                self.state = BotState {
                    order_count: lots,
                    last_order_price: Some(position.entry_price),
                    stop_loss: None,
                };
                info!(
                    entry = %position.entry_price,
                    amount = %position.position_amt,
                    order_count = self.state.order_count,
                    "Resuming open position"
                );
            }
            None => {
                self.state.reset();
                info!("No open position, waiting for the first tick");
            }
        }
        Ok(())
    }

    /// Consume events until every forwarder is dropped
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<StrategyEvent>) -> BotState {
        while let Some(event) = events.recv().await {
            self.handle(event).await;
        }
        info!("Strategy driver stopped");
        self.state
    }

    pub async fn handle(&mut self, event: StrategyEvent) {
        match event {
            StrategyEvent::Tick(ticker) => {
                if ticker.symbol != self.config.symbol {
                    return;
                }
                if let Err(e) = self.on_tick(ticker.close).await {
                    error!("Error placing new order: {}", e);
                }
            }
            StrategyEvent::TickerFailed(e) => error!("Ticker stream failed: {}", e),
            StrategyEvent::MarginCall(event) => {
                warn!(positions = event.positions.len(), "Margin call received");
            }
            StrategyEvent::AccountUpdate(event) => self.on_account_update(&event),
            StrategyEvent::OrderUpdate(event) => {
                let order = &event.order;
                info!(
                    order_id = order.order_id,
                    "Order update: {} {} {} {}",
                    order.symbol,
                    order.side,
                    order.order_type,
                    order.status
                );
            }
            StrategyEvent::Fault(e) => error!("User data stream failed: {}", e),
        }
    }

    /// React to one ticker price
    pub async fn on_tick(&mut self, price: Decimal) -> Result<(), ExchangeError> {
        match decide_on_tick(&self.state, &self.config, price) {
            TickDecision::OpenFirst => {
                let percent = self.config.first_order_stop_loss_percent;
                self.open_lot(percent, false).await
            }
            TickDecision::ScaleIn => {
                let percent = self.config.subsequent_order_stop_loss_percent;
                self.open_lot(percent, true).await
            }
            TickDecision::Hold => Ok(()),
        }
    }

    async fn open_lot(&mut self, stop_percent: Decimal, replace_stop: bool) -> Result<(), ExchangeError> {
        let symbol = self.config.symbol.clone();
        self.trading
            .market_buy(&symbol, self.config.order_amount, &[])
            .await?;
        let position = self.fetch_position(&symbol).await?;

        let entry = position.entry_price;
        self.state.last_order_price = Some(entry);
        self.state.order_count += 1;

        let stop = stop_loss_level(entry, stop_percent);
        if replace_stop {
            // The old stop is gone once cancel-all goes out
            self.state.stop_loss = None;
            self.trading.cancel_all(&symbol).await?;
        }
        self.trading
            .stop_loss_sell(&symbol, position.position_amt.abs(), stop, &[])
            .await?;
        self.state.stop_loss = Some(stop);

        info!(
            order_count = self.state.order_count,
            "Open order: {} stop loss: {}", entry, stop
        );
        Ok(())
    }

    async fn fetch_position(&self, symbol: &str) -> Result<PositionRisk, ExchangeError> {
        self.account.open_position(symbol).await?.ok_or_else(|| {
            ExchangeError::Other(format!("No open {} position after market buy", symbol))
        })
    }

    /// A flat position means the stop was hit: start over on the next tick
    fn on_account_update(&mut self, event: &AccountUpdateEvent) {
        let Some(position) = event.position(&self.config.symbol) else {
            return;
        };
        if position.position_amount.is_zero() && self.state.order_count > 0 {
            info!(reason = %event.data.reason, "Position closed, state reset");
            self.state.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchanges::binance_perp::rest::tests::{order_reply, MockRest};
    use crate::exchanges::binance_perp::types::{AccountUpdateData, PositionUpdate};
    use reqwest::Method;
    use serde_json::json;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn config() -> StrategyConfig {
        StrategyConfig {
            symbol: "BTCUSDT".to_string(),
            step_size_percent: dec("0.5"),
            first_order_stop_loss_percent: dec("1"),
            subsequent_order_stop_loss_percent: dec("0.3"),
            max_order_trades: 3,
            order_amount: dec("0.002"),
        }
    }

    fn driver(rest: &MockRest) -> StrategyDriver<MockRest> {
        StrategyDriver::new(config(), Trading::new(rest, false), Account::new(rest))
    }

    fn position(amount: &str, entry: &str) -> serde_json::Value {
        json!([{"symbol": "BTCUSDT", "positionAmt": amount, "entryPrice": entry}])
    }

    fn param<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
        params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_floor_to_one_decimal() {
        assert_eq!(floor_to_one_decimal(dec("36640.395")), dec("36640.3"));
        assert_eq!(floor_to_one_decimal(dec("36640.39")), dec("36640.3"));
        assert_eq!(floor_to_one_decimal(dec("100")), dec("100"));
    }

    #[test]
    fn test_stop_loss_level() {
        assert_eq!(stop_loss_level(dec("37010.5"), dec("1")), dec("36640.3"));
        assert_eq!(stop_loss_level(dec("40000"), dec("0.3")), dec("39880"));
    }

    #[test]
    fn test_decide_on_tick() {
        let config = config();
        let mut state = BotState::default();
        assert_eq!(decide_on_tick(&state, &config, dec("1")), TickDecision::OpenFirst);

        state.order_count = 1;
        state.last_order_price = Some(dec("40000"));
        assert_eq!(decide_on_tick(&state, &config, dec("40199.9")), TickDecision::Hold);
        assert_eq!(decide_on_tick(&state, &config, dec("40200")), TickDecision::ScaleIn);

        state.order_count = 3;
        assert_eq!(decide_on_tick(&state, &config, dec("50000")), TickDecision::Hold);
    }

    #[test]
    fn test_scale_in_needs_a_reference_price() {
        let state = BotState {
            order_count: 1,
            last_order_price: None,
            stop_loss: None,
        };
        assert_eq!(decide_on_tick(&state, &config(), dec("50000")), TickDecision::Hold);
    }

    #[tokio::test]
    async fn test_first_tick_opens_and_protects() {
        let rest = MockRest::default();
        rest.reply(order_reply());
        rest.reply(position("0.002", "37010.5"));
        rest.reply(order_reply());
        let mut driver = driver(&rest);

        driver.on_tick(dec("37000")).await.unwrap();

        let calls = rest.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(param(&calls[0].params, "type"), Some("MARKET"));
        assert_eq!(param(&calls[0].params, "quantity"), Some("0.002"));
        assert_eq!(calls[1].method, Method::GET);
        assert_eq!(param(&calls[2].params, "type"), Some("STOP_MARKET"));
        assert_eq!(param(&calls[2].params, "side"), Some("SELL"));
        assert_eq!(param(&calls[2].params, "stopPrice"), Some("36640.3"));
        assert_eq!(
            driver.state(),
            &BotState {
                order_count: 1,
                last_order_price: Some(dec("37010.5")),
                stop_loss: Some(dec("36640.3")),
            }
        );
    }

    #[tokio::test]
    async fn test_scale_in_replaces_stop() {
        let rest = MockRest::default();
        rest.reply(order_reply());
        rest.reply(position("0.004", "40000"));
        rest.reply(json!({"code": 200, "msg": "done"}));
        rest.reply(order_reply());
        let mut driver = driver(&rest);
        driver.state = BotState {
            order_count: 1,
            last_order_price: Some(dec("39800")),
            stop_loss: Some(dec("39400")),
        };

        driver.on_tick(dec("40000")).await.unwrap();

        let calls = rest.calls();
        let endpoints: Vec<_> = calls.iter().map(|c| c.endpoint.as_str()).collect();
        assert_eq!(
            endpoints,
            vec![
                "/fapi/v1/order",
                "/fapi/v2/positionRisk",
                "/fapi/v1/allOpenOrders",
                "/fapi/v1/order"
            ]
        );
        assert_eq!(param(&calls[3].params, "quantity"), Some("0.004"));
        assert_eq!(
            param(&calls[3].params, "stopPrice").map(dec),
            Some(dec("39880"))
        );
        assert_eq!(driver.state().order_count, 2);
        assert_eq!(driver.state().last_order_price, Some(dec("40000")));
    }

    #[tokio::test]
    async fn test_failed_buy_leaves_state_untouched() {
        let rest = MockRest::default();
        rest.fail(ExchangeError::ApiError {
            status: 400,
            code: -2019,
            message: "Margin is insufficient.".to_string(),
        });
        let mut driver = driver(&rest);

        let ticker = MiniTicker {
            event_time: 1,
            symbol: "BTCUSDT".to_string(),
            close: dec("37000"),
            open: dec("1"),
            high: dec("1"),
            low: dec("1"),
            volume: dec("1"),
            quote_volume: dec("1"),
        };
        driver.handle(StrategyEvent::Tick(ticker)).await;

        assert_eq!(driver.state(), &BotState::default());
        assert_eq!(rest.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_initialize_from_open_position() {
        let rest = MockRest::default();
        rest.reply(position("0.006", "38000.2"));
        let mut driver = driver(&rest);

        driver.initialize().await.unwrap();
        assert_eq!(driver.state().order_count, 3);
        assert_eq!(driver.state().last_order_price, Some(dec("38000.2")));

        rest.reply(position("0", "0"));
        driver.initialize().await.unwrap();
        assert_eq!(driver.state(), &BotState::default());
    }

    #[tokio::test]
    async fn test_flat_account_update_resets_state() {
        let rest = MockRest::default();
        let mut driver = driver(&rest);
        driver.state = BotState {
            order_count: 2,
            last_order_price: Some(dec("40000")),
            stop_loss: Some(dec("39880")),
        };

        let update = |amount: &str| AccountUpdateEvent {
            event_time: 1,
            transaction_time: 1,
            data: AccountUpdateData {
                reason: "ORDER".to_string(),
                balances: Vec::new(),
                positions: vec![PositionUpdate {
                    symbol: "BTCUSDT".to_string(),
                    position_amount: dec(amount),
                    entry_price: dec("40000"),
                    unrealized_pnl: Decimal::ZERO,
                    position_side: "BOTH".to_string(),
                }],
            },
        };

        driver.handle(StrategyEvent::AccountUpdate(update("0.004"))).await;
        assert_eq!(driver.state().order_count, 2);

        driver.handle(StrategyEvent::AccountUpdate(update("0"))).await;
        assert_eq!(driver.state(), &BotState::default());
    }

    #[tokio::test]
    async fn test_run_drains_forwarded_events() {
        let rest = MockRest::default();
        let driver = driver(&rest);
        let (forwarder, events) = event_channel();

        forwarder
            .on_ticker(
                "ETHUSDT",
                TickerEvent::Failed {
                    error: "Failed to reconnect after 5 attempts.".to_string(),
                },
            )
            .await;
        forwarder
            .on_fault(ExchangeError::SessionTerminated("gone".to_string()))
            .await;
        drop(forwarder);

        let state = driver.run(events).await;
        assert_eq!(state, BotState::default());
        assert!(rest.calls().is_empty());
    }

    #[test]
    fn test_lots_in_position() {
        assert_eq!(lots_in_position(dec("0.006"), dec("0.002")), 3);
        assert_eq!(lots_in_position(dec("0.005"), dec("0.002")), 3);
        assert_eq!(lots_in_position(dec("-0.004"), dec("0.002")), 2);
        assert_eq!(lots_in_position(dec("0.001"), dec("0.002")), 1);
        assert_eq!(lots_in_position(dec("0.004"), Decimal::ZERO), 1);
    }

    #[tokio::test]
    async fn test_resumed_full_position_does_not_scale_in() {
        let rest = MockRest::default();
        rest.reply(position("0.006", "40000"));
        let mut driver = driver(&rest);

        driver.initialize().await.unwrap();
        assert_eq!(driver.state().order_count, 3);
        assert_eq!(
            decide_on_tick(driver.state(), driver.config(), dec("41000")),
            TickDecision::Hold
        );

        driver.on_tick(dec("41000")).await.unwrap();
        assert_eq!(rest.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_stop_after_cancel_clears_stop_level() {
        let rest = MockRest::default();
        rest.reply(order_reply());
        rest.reply(position("0.004", "40000"));
        rest.reply(json!({"code": 200, "msg": "done"}));
        rest.fail(ExchangeError::ApiError {
            status: 400,
            code: -2021,
            message: "Order would immediately trigger.".to_string(),
        });
        let mut driver = driver(&rest);
        driver.state = BotState {
            order_count: 1,
            last_order_price: Some(dec("39800")),
            stop_loss: Some(dec("39400")),
        };

        assert!(driver.on_tick(dec("40000")).await.is_err());

        assert_eq!(rest.calls().len(), 4);
        assert_eq!(driver.state().stop_loss, None);
        assert_eq!(driver.state().order_count, 2);
        assert_eq!(driver.state().last_order_price, Some(dec("40000")));
    }
}
