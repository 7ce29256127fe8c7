use crate::core::config::ExchangeConfig;
use crate::core::errors::ExchangeError;
use crate::core::kernel::{
    HmacSigner, ReqwestRest, RestClientBuilder, RestClientConfig, Signer, TungsteniteConnector,
    WsConnector,
};
use crate::core::types::StreamKind;
use crate::exchanges::binance_perp::connector::{
    BinancePerpConnector, StreamSettings, SubscriptionRegistry,
};
use crate::exchanges::binance_perp::rest::{ListenKeyEndpoint, ListenKeyRest};
use std::sync::Arc;
use std::time::Duration;

const EXCHANGE_NAME: &str = "binance_perp";
const WS_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connector over the production HTTP and WebSocket transports
pub type LiveConnector = BinancePerpConnector<ReqwestRest, ListenKeyRest<ReqwestRest>>;

fn rest_client(
    base_url: &str,
    signer: Option<&Arc<dyn Signer>>,
    recv_window: Option<u64>,
) -> Result<ReqwestRest, ExchangeError> {
    let mut rest_config = RestClientConfig::new(base_url.to_string(), EXCHANGE_NAME.to_string());
    if let Some(recv_window) = recv_window {
        rest_config = rest_config.with_recv_window(recv_window);
    }

    let mut builder = RestClientBuilder::new(rest_config);
    if let Some(signer) = signer {
        builder = builder.with_signer(signer.clone());
    }
    builder.build()
}

/// Create a Binance USDT-margined futures connector
///
/// Without credentials only public streams work; signed calls fail with
/// `AuthError`.
pub fn build_connector(config: &ExchangeConfig) -> Result<LiveConnector, ExchangeError> {
    let endpoints = config.endpoints()?;

    // Add authentication if credentials are provided
    let signer: Option<Arc<dyn Signer>> = if config.has_credentials() {
        Some(Arc::new(HmacSigner::new(
            config.api_key().to_string(),
            config.secret_key().to_string(),
        )?))
    } else {
        None
    };

    let futures = rest_client(
        endpoints.rest_base(StreamKind::Futures),
        signer.as_ref(),
        Some(config.recv_window_ms),
    )?;
    // Spot listen keys live on the spot host
    let spot = rest_client(endpoints.rest_base(StreamKind::Spot), signer.as_ref(), None)?;

    let listen_keys = Arc::new(ListenKeyRest::new(
        ListenKeyEndpoint {
            rest: futures.clone(),
            path: endpoints.listen_key_path(StreamKind::Futures).to_string(),
        },
        ListenKeyEndpoint {
            rest: spot,
            path: endpoints.listen_key_path(StreamKind::Spot).to_string(),
        },
    ));

    let ws: Arc<dyn WsConnector> =
        Arc::new(TungsteniteConnector::new(EXCHANGE_NAME).with_connect_timeout(WS_CONNECT_TIMEOUT));

    let streams = SubscriptionRegistry::new(
        endpoints,
        StreamSettings::from_config(config),
        listen_keys,
        ws,
    );

    Ok(BinancePerpConnector::new(futures, config.hedge_mode, streams))
}
