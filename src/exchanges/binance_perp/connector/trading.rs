use crate::core::{
    errors::ExchangeError,
    kernel::RestClient,
    types::{OrderSide, OrderType, TimeInForce},
};
use crate::exchanges::binance_perp::rest::BinancePerpRestClient;
use crate::exchanges::binance_perp::types::{CancelAllResponse, OrderRequest, OrderResponse};
use rust_decimal::Decimal;
use tracing::{info, instrument};

/// Assemble the wire parameters of a new order
///
/// Order: `symbol`, `side`, `quantity`, `type`, then the optional fields, then
/// overrides. An override naming an existing field replaces it in place.
pub fn build_order_params(request: &OrderRequest, hedge_mode: bool) -> Vec<(String, String)> {
    let order_type = request.order_type.unwrap_or(if request.price.is_some() {
        OrderType::Limit
    } else {
        OrderType::Market
    });

    let mut params = vec![
        ("symbol".to_string(), request.symbol.to_uppercase()),
        ("side".to_string(), request.side.as_str().to_string()),
        ("quantity".to_string(), request.quantity.to_string()),
        ("type".to_string(), order_type.as_str().to_string()),
    ];

    if let Some(price) = request.price {
        params.push(("price".to_string(), price.to_string()));
    }
    if let Some(stop_price) = request.stop_price {
        params.push(("stopPrice".to_string(), stop_price.to_string()));
    }

    let time_in_force = request
        .time_in_force
        .or((order_type == OrderType::Limit).then_some(TimeInForce::GTC));
    if let Some(tif) = time_in_force {
        params.push(("timeInForce".to_string(), tif.as_str().to_string()));
    }

    let position_side = request
        .position_side
        .or(hedge_mode.then(|| request.side.hedge_position_side()));
    if let Some(side) = position_side {
        params.push(("positionSide".to_string(), side.as_str().to_string()));
    }

    for (key, value) in &request.overrides {
        match params.iter_mut().find(|(k, _)| k == key) {
            Some(existing) => existing.1 = value.clone(),
            None => params.push((key.clone(), value.clone())),
        }
    }

    params
}

/// Order placement for USDT-margined futures
#[derive(Clone)]
pub struct Trading<R: RestClient> {
    rest: BinancePerpRestClient<R>,
    hedge_mode: bool,
}

impl<R: RestClient> Trading<R> {
    pub fn new(rest: &R, hedge_mode: bool) -> Self
    where
        R: Clone,
    {
        Self {
            rest: BinancePerpRestClient::new(rest.clone()),
            hedge_mode,
        }
    }

    pub fn hedge_mode(&self) -> bool {
        self.hedge_mode
    }

    #[instrument(skip(self), fields(exchange = "binance_perp", symbol = %request.symbol, side = %request.side.as_str()))]
    pub async fn place(&self, request: OrderRequest) -> Result<OrderResponse, ExchangeError> {
        let params = build_order_params(&request, self.hedge_mode);
        let response = self.rest.place_order(&params).await?;
        info!(
            order_id = response.order_id,
            status = %response.status,
            "Order placed: {} {} {}",
            response.side,
            response.orig_qty,
            response.order_type
        );
        Ok(response)
    }

    pub async fn market_buy(
        &self,
        symbol: &str,
        quantity: Decimal,
        overrides: &[(&str, &str)],
    ) -> Result<OrderResponse, ExchangeError> {
        self.place(
            OrderRequest::new(symbol, OrderSide::Buy, quantity)
                .with_overrides(overrides)
                .order_type(OrderType::Market),
        )
        .await
    }

    pub async fn market_sell(
        &self,
        symbol: &str,
        quantity: Decimal,
        overrides: &[(&str, &str)],
    ) -> Result<OrderResponse, ExchangeError> {
        self.place(
            OrderRequest::new(symbol, OrderSide::Sell, quantity)
                .with_overrides(overrides)
                .order_type(OrderType::Market),
        )
        .await
    }

    pub async fn limit_buy(
        &self,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
        overrides: &[(&str, &str)],
    ) -> Result<OrderResponse, ExchangeError> {
        self.place(
            OrderRequest::new(symbol, OrderSide::Buy, quantity)
                .with_overrides(overrides)
                .order_type(OrderType::Limit)
                .price(price),
        )
        .await
    }

    pub async fn limit_sell(
        &self,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
        overrides: &[(&str, &str)],
    ) -> Result<OrderResponse, ExchangeError> {
        self.place(
            OrderRequest::new(symbol, OrderSide::Sell, quantity)
                .with_overrides(overrides)
                .order_type(OrderType::Limit)
                .price(price),
        )
        .await
    }

    /// STOP_MARKET buy, closing a short once `stop_price` is touched
    pub async fn stop_loss_buy(
        &self,
        symbol: &str,
        quantity: Decimal,
        stop_price: Decimal,
        overrides: &[(&str, &str)],
    ) -> Result<OrderResponse, ExchangeError> {
        self.place(
            OrderRequest::new(symbol, OrderSide::Buy, quantity)
                .with_overrides(overrides)
                .order_type(OrderType::StopMarket)
                .stop_price(stop_price),
        )
        .await
    }

    /// STOP_MARKET sell, closing a long once `stop_price` is touched
    pub async fn stop_loss_sell(
        &self,
        symbol: &str,
        quantity: Decimal,
        stop_price: Decimal,
        overrides: &[(&str, &str)],
    ) -> Result<OrderResponse, ExchangeError> {
        self.place(
            OrderRequest::new(symbol, OrderSide::Sell, quantity)
                .with_overrides(overrides)
                .order_type(OrderType::StopMarket)
                .stop_price(stop_price),
        )
        .await
    }

    pub async fn take_profit_buy(
        &self,
        symbol: &str,
        quantity: Decimal,
        stop_price: Decimal,
        overrides: &[(&str, &str)],
    ) -> Result<OrderResponse, ExchangeError> {
        self.place(
            OrderRequest::new(symbol, OrderSide::Buy, quantity)
                .with_overrides(overrides)
                .order_type(OrderType::TakeProfitMarket)
                .stop_price(stop_price),
        )
        .await
    }

    pub async fn take_profit_sell(
        &self,
        symbol: &str,
        quantity: Decimal,
        stop_price: Decimal,
        overrides: &[(&str, &str)],
    ) -> Result<OrderResponse, ExchangeError> {
        self.place(
            OrderRequest::new(symbol, OrderSide::Sell, quantity)
                .with_overrides(overrides)
                .order_type(OrderType::TakeProfitMarket)
                .stop_price(stop_price),
        )
        .await
    }

    pub async fn cancel(&self, symbol: &str, order_id: u64) -> Result<OrderResponse, ExchangeError> {
        self.rest.cancel_order(symbol, order_id).await
    }

    pub async fn cancel_all(&self, symbol: &str) -> Result<CancelAllResponse, ExchangeError> {
        let response = self.rest.cancel_all_orders(symbol).await?;
        info!(symbol = %symbol, "All open orders cancelled: {}", response.msg);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchanges::binance_perp::rest::tests::{order_reply, MockRest};
    use reqwest::Method;

    fn keys(params: &[(String, String)]) -> Vec<&str> {
        params.iter().map(|(k, _)| k.as_str()).collect()
    }

    fn value<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
        params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_market_order_defaults() {
        let request = OrderRequest::new("btcusdt", OrderSide::Buy, Decimal::new(2, 3));
        let params = build_order_params(&request, false);

        assert_eq!(keys(&params), vec!["symbol", "side", "quantity", "type"]);
        assert_eq!(value(&params, "symbol"), Some("BTCUSDT"));
        assert_eq!(value(&params, "quantity"), Some("0.002"));
        assert_eq!(value(&params, "type"), Some("MARKET"));
    }

    #[test]
    fn test_price_implies_limit_gtc() {
        let request =
            OrderRequest::new("ETHUSDT", OrderSide::Sell, Decimal::ONE).price(Decimal::new(20005, 1));
        let params = build_order_params(&request, false);

        assert_eq!(value(&params, "type"), Some("LIMIT"));
        assert_eq!(value(&params, "price"), Some("2000.5"));
        assert_eq!(value(&params, "timeInForce"), Some("GTC"));
    }

    #[test]
    fn test_explicit_time_in_force_kept() {
        let request = OrderRequest::new("ETHUSDT", OrderSide::Sell, Decimal::ONE)
            .price(Decimal::TEN)
            .time_in_force(TimeInForce::IOC);
        let params = build_order_params(&request, false);
        assert_eq!(value(&params, "timeInForce"), Some("IOC"));
    }

    #[test]
    fn test_stop_market_has_no_time_in_force() {
        let request = OrderRequest::new("BTCUSDT", OrderSide::Sell, Decimal::ONE)
            .order_type(OrderType::StopMarket)
            .stop_price(Decimal::new(365, 1));
        let params = build_order_params(&request, false);

        assert_eq!(value(&params, "type"), Some("STOP_MARKET"));
        assert_eq!(value(&params, "stopPrice"), Some("36.5"));
        assert_eq!(value(&params, "timeInForce"), None);
    }

    #[test]
    fn test_hedge_mode_position_side() {
        let buy = OrderRequest::new("BTCUSDT", OrderSide::Buy, Decimal::ONE);
        let sell = OrderRequest::new("BTCUSDT", OrderSide::Sell, Decimal::ONE);

        assert_eq!(value(&build_order_params(&buy, true), "positionSide"), Some("LONG"));
        assert_eq!(value(&build_order_params(&sell, true), "positionSide"), Some("SHORT"));
        assert_eq!(value(&build_order_params(&sell, false), "positionSide"), None);
    }

    #[test]
    fn test_overrides_replace_in_place_and_append() {
        let request = OrderRequest::new("BTCUSDT", OrderSide::Buy, Decimal::ONE)
            .with_overrides(&[("quantity", "5"), ("reduceOnly", "true")]);
        let params = build_order_params(&request, false);

        assert_eq!(
            keys(&params),
            vec!["symbol", "side", "quantity", "type", "reduceOnly"]
        );
        assert_eq!(value(&params, "quantity"), Some("5"));
    }

    #[tokio::test]
    async fn test_stop_loss_sell_posts_signed_order() {
        let rest = MockRest::default();
        rest.reply(order_reply());
        let trading = Trading::new(&rest, false);

        trading
            .stop_loss_sell("btcusdt", Decimal::new(2, 3), Decimal::new(365000, 1), &[])
            .await
            .unwrap();

        let call = &rest.calls()[0];
        assert_eq!(call.method, Method::POST);
        assert_eq!(call.endpoint, "/fapi/v1/order");
        assert!(call.signed);
        assert_eq!(value(&call.params, "side"), Some("SELL"));
        assert_eq!(value(&call.params, "stopPrice"), Some("36500.0"));
    }

    #[tokio::test]
    async fn test_rejection_is_surfaced() {
        let rest = MockRest::default();
        rest.fail(ExchangeError::ApiError {
            status: 400,
            code: -2019,
            message: "Margin is insufficient.".to_string(),
        });
        let trading = Trading::new(&rest, false);

        let err = trading
            .market_buy("BTCUSDT", Decimal::ONE, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::ApiError { code: -2019, .. }));
    }
}
