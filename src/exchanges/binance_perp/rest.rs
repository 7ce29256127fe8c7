use crate::core::errors::ExchangeError;
use crate::core::kernel::listen_key::ListenKeyApi;
use crate::core::kernel::rest::decode;
use crate::core::kernel::RestClient;
use crate::core::types::StreamKind;
use crate::exchanges::binance_perp::types::{
    CancelAllResponse, ListenKeyResponse, OrderResponse, PositionRisk,
};
use async_trait::async_trait;
use reqwest::Method;
use tracing::instrument;

const ORDER: &str = "/fapi/v1/order";
const ALL_OPEN_ORDERS: &str = "/fapi/v1/allOpenOrders";
const POSITION_RISK: &str = "/fapi/v2/positionRisk";

fn pair(key: &str, value: impl ToString) -> (String, String) {
    (key.to_string(), value.to_string())
}

/// Typed USDT-margined futures operations over a `RestClient`
#[derive(Clone)]
pub struct BinancePerpRestClient<R: RestClient> {
    rest: R,
}

impl<R: RestClient> BinancePerpRestClient<R> {
    pub fn new(rest: R) -> Self {
        Self { rest }
    }

    /// Place a new order (authenticated). `params` are sent as given.
    #[instrument(skip(self, params), fields(exchange = "binance_perp"))]
    pub async fn place_order(
        &self,
        params: &[(String, String)],
    ) -> Result<OrderResponse, ExchangeError> {
        decode(self.rest.request(Method::POST, ORDER, params, true).await?)
    }

    /// Cancel an order (authenticated)
    #[instrument(skip(self), fields(exchange = "binance_perp", symbol = %symbol))]
    pub async fn cancel_order(
        &self,
        symbol: &str,
        order_id: u64,
    ) -> Result<OrderResponse, ExchangeError> {
        let params = [pair("symbol", symbol.to_uppercase()), pair("orderId", order_id)];
        decode(self.rest.request(Method::DELETE, ORDER, &params, true).await?)
    }

    /// Cancel every open order on a symbol (authenticated)
    #[instrument(skip(self), fields(exchange = "binance_perp", symbol = %symbol))]
    pub async fn cancel_all_orders(&self, symbol: &str) -> Result<CancelAllResponse, ExchangeError> {
        let params = [pair("symbol", symbol.to_uppercase())];
        decode(
            self.rest
                .request(Method::DELETE, ALL_OPEN_ORDERS, &params, true)
                .await?,
        )
    }

    /// Position risk for one symbol, or every symbol (authenticated)
    #[instrument(skip(self), fields(exchange = "binance_perp"))]
    pub async fn position_risk(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<PositionRisk>, ExchangeError> {
        let params: Vec<(String, String)> = symbol
            .map(|symbol| pair("symbol", symbol.to_uppercase()))
            .into_iter()
            .collect();
        decode(
            self.rest
                .request(Method::GET, POSITION_RISK, &params, true)
                .await?,
        )
    }
}

/// Listen-key endpoints of one stream kind
#[derive(Clone)]
pub struct ListenKeyEndpoint<R: RestClient> {
    pub rest: R,
    pub path: String,
}

/// Listen-key lifecycle calls for both the futures and spot families,
/// which live on different hosts
#[derive(Clone)]
pub struct ListenKeyRest<R: RestClient> {
    futures: ListenKeyEndpoint<R>,
    spot: ListenKeyEndpoint<R>,
}

impl<R: RestClient> ListenKeyRest<R> {
    pub fn new(futures: ListenKeyEndpoint<R>, spot: ListenKeyEndpoint<R>) -> Self {
        Self { futures, spot }
    }

    fn endpoint(&self, kind: StreamKind) -> &ListenKeyEndpoint<R> {
        match kind {
            StreamKind::Futures => &self.futures,
            StreamKind::Spot => &self.spot,
        }
    }

    #[instrument(skip(self), fields(exchange = "binance_perp", kind = %kind))]
    pub async fn create_listen_key(&self, kind: StreamKind) -> Result<String, ExchangeError> {
        let endpoint = self.endpoint(kind);
        let value = endpoint
            .rest
            .request(Method::POST, &endpoint.path, &[], false)
            .await?;
        decode::<ListenKeyResponse>(value).map(|response| response.listen_key)
    }

    #[instrument(skip(self, key), fields(exchange = "binance_perp", kind = %kind))]
    pub async fn keepalive_listen_key(
        &self,
        kind: StreamKind,
        key: &str,
    ) -> Result<(), ExchangeError> {
        let endpoint = self.endpoint(kind);
        endpoint
            .rest
            .request(Method::PUT, &endpoint.path, &[pair("listenKey", key)], false)
            .await
            .map(|_| ())
    }

    #[instrument(skip(self, key), fields(exchange = "binance_perp", kind = %kind))]
    pub async fn close_listen_key(&self, kind: StreamKind, key: &str) -> Result<(), ExchangeError> {
        let endpoint = self.endpoint(kind);
        endpoint
            .rest
            .request(Method::DELETE, &endpoint.path, &[pair("listenKey", key)], false)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl<R: RestClient + 'static> ListenKeyApi for ListenKeyRest<R> {
    async fn acquire(&self, kind: StreamKind) -> Result<String, ExchangeError> {
        self.create_listen_key(kind).await
    }

    async fn keepalive(&self, kind: StreamKind, key: &str) -> Result<(), ExchangeError> {
        self.keepalive_listen_key(kind, key).await
    }

    async fn release(&self, kind: StreamKind, key: &str) -> Result<(), ExchangeError> {
        self.close_listen_key(kind, key).await
    }
}
