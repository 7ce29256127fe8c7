pub mod core;
pub mod exchanges;
pub mod strategy;

pub use core::{config::ExchangeConfig, errors::ExchangeError, types::*};
pub use exchanges::binance_perp::{build_connector, BinancePerpConnector};
pub use strategy::{StrategyConfig, StrategyDriver};
