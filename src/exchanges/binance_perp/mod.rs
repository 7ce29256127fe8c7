// Core modules - one responsibility per file
pub mod codec; // impl WsCodec (WebSocket dialect)
pub mod rest; // thin typed wrapper around RestClient
pub mod types; // serde structs ← raw JSON

// Sub-components organized by responsibility
pub mod builder;
pub mod connector;

// Re-export main types for easier importing
pub use builder::{build_connector, LiveConnector};
pub use codec::{MiniTickerCodec, UserDataCodec, UserDataEvent};
pub use connector::{
    BinancePerpConnector, SubscriptionKey, SubscriptionRegistry, TickerCallback, TickerEvent,
    UserDataCallbacks,
};
pub use rest::{BinancePerpRestClient, ListenKeyEndpoint, ListenKeyRest};
pub use types::*;
