use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{error, info};

use trade_dispatcher::broker::{BrokerClient, KiteBrokerClient, MockBrokerClient};
use trade_dispatcher::config::Config;
use trade_dispatcher::dispatcher::Dispatcher;
use trade_dispatcher::ingester::Ingester;
use trade_dispatcher::market_clock::MarketClock;
use trade_dispatcher::rate_gate::RateGate;
use trade_dispatcher::source_reader::CsvSourceReader;
use trade_dispatcher::store::{OrderStore, RedisOrderStore};
use trade_dispatcher::supervisor::Supervisor;
use trade_dispatcher::telemetry;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Runs the spreadsheet-polling ingest loop only.
    Ingester,
    /// Runs the due-order dispatch loop only.
    Dispatcher,
}

#[derive(Debug, Parser)]
#[command(name = "trade-dispatcher", about = "Scheduled trade dispatcher")]
struct Cli {
    #[arg(value_enum)]
    mode: Mode,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    telemetry::init_tracing();

    if let Ok(addr) = std::env::var("METRICS_LISTEN_ADDR") {
        match addr.parse() {
            Ok(addr) => {
                if let Err(e) = telemetry::install_metrics_recorder(addr) {
                    error!(error = %e, "failed to install metrics recorder");
                }
            }
            Err(e) => error!(error = %e, %addr, "invalid METRICS_LISTEN_ADDR"),
        }
    }

    let cli = Cli::parse();
    let config = Config::load().context("loading configuration")?;

    let exit_code = match run(cli.mode, config).await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "fatal error during startup");
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run(mode: Mode, config: Config) -> Result<()> {
    let store: Arc<dyn OrderStore> = Arc::new(RedisOrderStore::connect(&config.store).context("connecting to order store")?);

    // Must exceed the broker call deadline (30s) or it can't bound a real drain.
    let supervisor = Supervisor::new(Duration::from_secs(35));
    let cancel = supervisor.cancellation_token();

    let shutdown_signal = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to install shutdown signal handler");
            }
            info!("shutdown signal received");
            cancel.cancel();
        })
    };

    match mode {
        Mode::Ingester => {
            let clock = build_market_clock(&config)?;
            // The real spreadsheet-backed SourceReader is an external
            // collaborator (out of scope here); CsvSourceReader stands in
            // for local runs and demos, reading from SOURCE_BUY_CSV_PATH /
            // SOURCE_SELL_CSV_PATH.
            let source = Arc::new(CsvSourceReader::new(buy_path(), sell_path()));
            let ingester = Arc::new(Ingester::new(source, Arc::clone(&store), clock, config.grace()));
            let interval = Duration::from_secs(config.source.refresh_interval_seconds.max(1));
            supervisor.run_ingester(ingester, interval).await;
        }
        Mode::Dispatcher => {
            let broker = build_broker(&config)?;
            let rate_gate = Arc::new(RateGate::new(
                config.broker.rate.requests_per_second.max(0.01),
                config.broker.rate.burst.max(1),
            ));
            let dispatcher = Arc::new(Dispatcher::with_grace(
                Arc::clone(&store),
                broker,
                rate_gate,
                config.dispatcher.worker_pool_size.max(1),
                Duration::from_secs(30),
                config.grace(),
            ));
            supervisor
                .run_dispatcher(dispatcher, config.check_interval(), config.health_interval())
                .await;
        }
    }

    shutdown_signal.abort();
    Ok(())
}

fn build_market_clock(config: &Config) -> Result<MarketClock> {
    Ok(MarketClock::new(
        config.market_timezone()?,
        config.market_open()?,
        config.market_close()?,
    ))
}

fn build_broker(config: &Config) -> Result<Arc<dyn BrokerClient>> {
    match config.broker.broker_type.as_str() {
        "mock" | "" => Ok(Arc::new(MockBrokerClient::new())),
        _ => Ok(Arc::new(KiteBrokerClient::new(
            config.broker.base_url.clone(),
            config.broker.api_key.clone(),
            config.broker.access_token.clone(),
        )?)),
    }
}

fn buy_path() -> String {
    std::env::var("SOURCE_BUY_CSV_PATH").unwrap_or_else(|_| "buy_orders.csv".to_string())
}

fn sell_path() -> String {
    std::env::var("SOURCE_SELL_CSV_PATH").unwrap_or_else(|_| "sell_orders.csv".to_string())
}
