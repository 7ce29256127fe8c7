use crate::core::errors::ExchangeError;
use tokio_tungstenite::tungstenite::Message;

/// Codec trait for turning raw WebSocket frames into typed stream events
///
/// Streams here are addressed by URL, so a codec only decodes. Control
/// frames (ping, pong, close) never reach it; the connection handles them.
pub trait WsCodec: Send + Sync + 'static {
    /// The type representing parsed messages from this stream
    type Message: Send + 'static;

    /// Decode a raw WebSocket message into a typed message
    ///
    /// # Returns
    /// - `Ok(Some(message))` - Successfully decoded message
    /// - `Ok(None)` - Message was ignored/filtered by codec
    /// - `Err(error)` - Failed to decode message
    fn decode_message(&self, message: Message) -> Result<Option<Self::Message>, ExchangeError>;
}

/// Extract the text payload of a data frame
pub fn frame_text(message: Message) -> Result<Option<String>, ExchangeError> {
    match message {
        Message::Text(text) => Ok(Some(text)),
        Message::Binary(data) => String::from_utf8(data).map(Some).map_err(|e| {
            ExchangeError::DeserializationError(format!("Invalid UTF-8 in binary message: {}", e))
        }),
        _ => Ok(None),
    }
}
