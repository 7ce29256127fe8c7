//! # Transport kernel
//!
//! Exchange-agnostic building blocks that every connector is assembled from:
//!
//! - [`Signer`] – request authentication (HMAC-SHA256 query signing)
//! - [`RestClient`] – the single `request` primitive typed REST calls build on
//! - [`WsCodec`] – raw WebSocket frames to typed events
//! - [`ListenKeyManager`] – acquisition, renewal and rotation of listen keys
//! - [`StreamConnection`] – one socket with heartbeat and reconnect handling
//! - [`ScheduledTask`] – background timers that die with their owner
//!
//! Exchange modules provide the dialect (endpoints, payloads, codecs); the
//! kernel owns the lifecycle.
//!
//! ## Wiring a stream
//! ```rust,no_run
//! use perpbot::core::kernel::*;
//! use std::sync::Arc;
//!
//! # fn wire<C: WsCodec, H: StreamHandler<C::Message>>(codec: C, handler: H) {
//! let config = WsConfig::new("binance_perp")
//!     .with_reconnect(ReconnectPolicy::enabled(std::time::Duration::from_secs(1), 5));
//! let handle = StreamConnection::new(
//!     "btcusdt@miniTicker",
//!     config,
//!     UrlSource::Static("wss://fstream.binance.com/stream?streams=btcusdt@miniTicker".into()),
//!     Arc::new(TungsteniteConnector::new("binance_perp")),
//! )
//! .spawn(codec, handler);
//! # let _ = handle;
//! # }
//! ```
pub mod codec;
pub mod listen_key;
pub mod rest;
pub mod signer;
pub mod task;
pub mod ws;

// Re-export key types for convenience
pub use codec::WsCodec;
pub use listen_key::{
    ListenKeyApi, ListenKeyHandle, ListenKeyManager, ListenKeyPolicy, ListenKeySnapshot,
    ListenKeyState, RenewalExhaustedAction, RotationPolicy, SessionEvent,
};
pub use rest::{ReqwestRest, RestClient, RestClientBuilder, RestClientConfig};
pub use signer::{HmacSigner, SignedRequest, Signer};
pub use task::ScheduledTask;
pub use ws::{
    ReconnectPolicy, StreamConnection, StreamHandle, StreamHandler, TungsteniteConnector,
    UrlSource, WsConfig, WsConnector, WsTransport,
};
