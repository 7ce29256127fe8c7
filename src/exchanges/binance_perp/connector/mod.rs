use crate::core::kernel::{ListenKeyApi, RestClient};

pub mod account;
pub mod streams;
pub mod trading;

pub use account::Account;
pub use streams::{
    StreamSettings, SubscriptionKey, SubscriptionRegistry, TickerCallback, TickerEvent,
    UserDataCallbacks,
};
pub use trading::{build_order_params, Trading};

/// Binance USDT-margined futures connector composed of its sub-components
pub struct BinancePerpConnector<R: RestClient, A: ListenKeyApi> {
    pub trading: Trading<R>,
    pub account: Account<R>,
    pub streams: SubscriptionRegistry<A>,
}

impl<R: RestClient + Clone, A: ListenKeyApi> BinancePerpConnector<R, A> {
    pub fn new(rest: R, hedge_mode: bool, streams: SubscriptionRegistry<A>) -> Self {
        Self {
            trading: Trading::new(&rest, hedge_mode),
            account: Account::new(&rest),
            streams,
        }
    }

    /// Close every open stream and release its listen key
    pub async fn shutdown(&self) {
        self.streams.close_all().await;
    }
}
