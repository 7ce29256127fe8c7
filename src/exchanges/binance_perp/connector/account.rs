use crate::core::{errors::ExchangeError, kernel::RestClient};
use crate::exchanges::binance_perp::{rest::BinancePerpRestClient, types::PositionRisk};
use tracing::instrument;

/// Position queries for USDT-margined futures
#[derive(Clone)]
pub struct Account<R: RestClient> {
    rest: BinancePerpRestClient<R>,
}

impl<R: RestClient> Account<R> {
    pub fn new(rest: &R) -> Self
    where
        R: Clone,
    {
        Self {
            rest: BinancePerpRestClient::new(rest.clone()),
        }
    }

    pub async fn position_risk(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<PositionRisk>, ExchangeError> {
        self.rest.position_risk(symbol).await
    }

    /// First non-flat position on `symbol`, if any
    #[instrument(skip(self), fields(exchange = "binance_perp", symbol = %symbol))]
    pub async fn open_position(&self, symbol: &str) -> Result<Option<PositionRisk>, ExchangeError> {
        let symbol = symbol.to_uppercase();
        let positions = self.rest.position_risk(Some(&symbol)).await?;
        Ok(positions
            .into_iter()
            .find(|position| position.symbol == symbol && position.is_open()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchanges::binance_perp::rest::tests::MockRest;
    use serde_json::json;

    #[tokio::test]
    async fn test_open_position_skips_flat_entries() {
        let rest = MockRest::default();
        rest.reply(json!([
            {"symbol": "BTCUSDT", "positionAmt": "0", "entryPrice": "0.0", "positionSide": "LONG"},
            {"symbol": "BTCUSDT", "positionAmt": "0.004", "entryPrice": "37010.5", "positionSide": "BOTH"}
        ]));
        let account = Account::new(&rest);

        let position = account.open_position("btcusdt").await.unwrap().unwrap();
        assert_eq!(position.entry_price.to_string(), "37010.5");
    }

    #[tokio::test]
    async fn test_no_open_position() {
        let rest = MockRest::default();
        rest.reply(json!([
            {"symbol": "BTCUSDT", "positionAmt": "0.000", "entryPrice": "0.0"}
        ]));
        let account = Account::new(&rest);

        assert!(account.open_position("BTCUSDT").await.unwrap().is_none());
    }
}
