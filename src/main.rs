use anyhow::Context;
use perpbot::core::config::ExchangeConfig;
use perpbot::core::kernel::ScheduledTask;
use perpbot::core::types::StreamKind;
use perpbot::exchanges::binance_perp::build_connector;
use perpbot::strategy::{event_channel, StrategyConfig, StrategyDriver};
use std::sync::Arc;
use tracing::info;
use tracing::level_filters::LevelFilter;

#[cfg(feature = "env-file")]
fn load_config() -> anyhow::Result<ExchangeConfig> {
    Ok(ExchangeConfig::from_env_file("BINANCE")?)
}

#[cfg(not(feature = "env-file"))]
fn load_config() -> anyhow::Result<ExchangeConfig> {
    Ok(ExchangeConfig::from_env("BINANCE")?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(LevelFilter::INFO)
        .init();

    let config = load_config().context("loading exchange configuration")?;
    let strategy = StrategyConfig::from_env().context("loading strategy configuration")?;
    info!(
        environment = %config.environment,
        hedge_mode = config.hedge_mode,
        symbol = %strategy.symbol,
        "Starting perpbot"
    );

    let connector = build_connector(&config)?;
    let symbol = strategy.symbol.clone();

    let mut driver = StrategyDriver::new(
        strategy,
        connector.trading.clone(),
        connector.account.clone(),
    );
    driver
        .initialize()
        .await
        .context("reading the open position")?;

    let (forwarder, events) = event_channel();
    let forwarder = Arc::new(forwarder);
    let mut bot = ScheduledTask::spawn("strategy-driver", driver.run(events));

    connector
        .streams
        .subscribe_user_data(StreamKind::Futures, forwarder.clone())
        .await?;
    connector
        .streams
        .subscribe_mini_ticker(&symbol, forwarder.clone())
        .await?;
    // The registry's dispatchers hold the remaining forwarder clones
    drop(forwarder);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    connector.shutdown().await;

    if let Some(state) = bot.join().await {
        info!(
            order_count = state.order_count,
            last_order_price = ?state.last_order_price,
            "Final state"
        );
    }
    Ok(())
}
