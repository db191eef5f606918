use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes the process-wide tracing subscriber from `RUST_LOG`, defaulting
/// to `info` for this crate and `warn` for dependencies.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,trade_dispatcher=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}

/// Installs a Prometheus exporter on the given address, returning the handle
/// that must be kept alive for the duration of the process.
pub fn install_metrics_recorder(listen_addr: std::net::SocketAddr) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(listen_addr)
        .install()?;
    Ok(())
}
