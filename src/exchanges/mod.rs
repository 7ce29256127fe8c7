pub mod binance_perp;
