use crate::core::errors::ExchangeError;
use crate::core::kernel::codec::{frame_text, WsCodec};
use crate::exchanges::binance_perp::types::{
    AccountUpdateEvent, MarginCallEvent, MiniTicker, OrderTradeUpdateEvent,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

pub const MINI_TICKER_EVENT: &str = "24hrMiniTicker";

/// Events of the private user-data stream
#[derive(Debug, Clone, PartialEq)]
pub enum UserDataEvent {
    MarginCall(MarginCallEvent),
    AccountUpdate(AccountUpdateEvent),
    OrderUpdate(OrderTradeUpdateEvent),
    /// Any other event type, by name
    Unknown(String),
}

fn parse_json(text: &str) -> Result<Value, ExchangeError> {
    serde_json::from_str(text)
        .map_err(|e| ExchangeError::DeserializationError(format!("Failed to parse JSON: {}", e)))
}

fn parse_event<T: DeserializeOwned>(value: Value, event_type: &str) -> Result<T, ExchangeError> {
    serde_json::from_value(value).map_err(|e| {
        ExchangeError::DeserializationError(format!("Failed to parse {}: {}", event_type, e))
    })
}

fn event_type(value: &Value) -> Option<&str> {
    value.get("e").and_then(Value::as_str)
}

pub struct UserDataCodec;

impl WsCodec for UserDataCodec {
    type Message = UserDataEvent;

    fn decode_message(&self, message: Message) -> Result<Option<Self::Message>, ExchangeError> {
        let Some(text) = frame_text(message)? else {
            return Ok(None);
        };
        let value = parse_json(&text)?;

        let Some(kind) = event_type(&value).map(str::to_string) else {
            return Err(ExchangeError::DeserializationError(
                "User data message without event type".to_string(),
            ));
        };

        let event = match kind.as_str() {
            "MARGIN_CALL" => UserDataEvent::MarginCall(parse_event(value, &kind)?),
            "ACCOUNT_UPDATE" => UserDataEvent::AccountUpdate(parse_event(value, &kind)?),
            "ORDER_TRADE_UPDATE" => UserDataEvent::OrderUpdate(parse_event(value, &kind)?),
            _ => UserDataEvent::Unknown(kind),
        };
        Ok(Some(event))
    }
}

/// Mini-ticker frames from a combined (`{"stream", "data"}`) or raw stream
pub struct MiniTickerCodec;

impl WsCodec for MiniTickerCodec {
    type Message = MiniTicker;

    fn decode_message(&self, message: Message) -> Result<Option<Self::Message>, ExchangeError> {
        let Some(text) = frame_text(message)? else {
            return Ok(None);
        };
        let mut value = parse_json(&text)?;
        if let Some(data) = value.get_mut("data") {
            value = data.take();
        }

        match event_type(&value) {
            Some(MINI_TICKER_EVENT) => parse_event(value, MINI_TICKER_EVENT).map(Some),
            other => {
                debug!("Ignoring non mini-ticker payload: {:?}", other);
                Ok(None)
            }
        }
    }
}
