use std::env;
use std::fs;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StoreConfig {
    pub address: String,
    pub password: Option<String>,
    pub database: u8,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RateConfig {
    pub requests_per_second: f64,
    pub burst: u32,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct BrokerConfig {
    pub broker_type: String,
    pub api_key: String,
    pub access_token: String,
    pub base_url: String,
    pub rate: RateConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SourceConfig {
    pub credentials_path: String,
    pub document_id: String,
    pub buy_range: String,
    pub sell_range: String,
    pub refresh_interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub worker_pool_size: usize,
    pub check_interval_ms: u64,
    pub health_interval_seconds: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 5,
            check_interval_ms: 1_000,
            health_interval_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    pub timezone: String,
    pub open: String,
    pub close: String,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            timezone: "Asia/Kolkata".to_string(),
            open: "09:00:00".to_string(),
            close: "15:30:00".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrderConfig {
    pub grace_seconds: i64,
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self { grace_seconds: 10 }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub broker: BrokerConfig,
    pub source: SourceConfig,
    pub dispatcher: DispatcherConfig,
    pub market: MarketConfig,
    pub order: OrderConfig,
}

impl Config {
    /// Loads defaults, then `config.toml` (path from `CONFIG_PATH`, default
    /// `./config.toml`) if present, then environment variable overrides —
    /// in that precedence, matching the source's "env overrides file" rule.
    pub fn load() -> Result<Self> {
        let mut config = Config::default();

        let path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
        if let Ok(raw) = fs::read_to_string(&path) {
            config = toml::from_str(&raw).with_context(|| format!("parsing {path}"))?;
        }

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        macro_rules! override_str {
            ($field:expr, $key:expr) => {
                if let Ok(v) = env::var($key) {
                    $field = v;
                }
            };
        }
        macro_rules! override_parsed {
            ($field:expr, $key:expr) => {
                if let Ok(v) = env::var($key) {
                    if let Ok(parsed) = v.parse() {
                        $field = parsed;
                    }
                }
            };
        }

        override_str!(self.store.address, "STORE_ADDRESS");
        if let Ok(v) = env::var("STORE_PASSWORD") {
            self.store.password = Some(v);
        }
        override_parsed!(self.store.database, "STORE_DATABASE");

        override_str!(self.broker.broker_type, "BROKER_TYPE");
        override_str!(self.broker.api_key, "BROKER_API_KEY");
        override_str!(self.broker.access_token, "BROKER_ACCESS_TOKEN");
        override_str!(self.broker.base_url, "BROKER_BASE_URL");
        override_parsed!(self.broker.rate.requests_per_second, "BROKER_RATE_REQUESTS_PER_SECOND");
        override_parsed!(self.broker.rate.burst, "BROKER_RATE_BURST");

        override_str!(self.source.credentials_path, "SOURCE_CREDENTIALS_PATH");
        override_str!(self.source.document_id, "SOURCE_DOCUMENT_ID");
        override_str!(self.source.buy_range, "SOURCE_BUY_RANGE");
        override_str!(self.source.sell_range, "SOURCE_SELL_RANGE");
        override_parsed!(self.source.refresh_interval_seconds, "SOURCE_REFRESH_INTERVAL_SECONDS");

        override_parsed!(self.dispatcher.worker_pool_size, "DISPATCHER_WORKER_POOL_SIZE");
        override_parsed!(self.dispatcher.check_interval_ms, "DISPATCHER_CHECK_INTERVAL_MS");
        override_parsed!(self.dispatcher.health_interval_seconds, "DISPATCHER_HEALTH_INTERVAL_SECONDS");

        override_str!(self.market.timezone, "MARKET_TIMEZONE");
        override_str!(self.market.open, "MARKET_OPEN");
        override_str!(self.market.close, "MARKET_CLOSE");

        override_parsed!(self.order.grace_seconds, "ORDER_GRACE_SECONDS");
    }

    pub fn market_timezone(&self) -> Result<Tz> {
        self.market
            .timezone
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid market.timezone: {}", self.market.timezone))
    }

    pub fn market_open(&self) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(&self.market.open, "%H:%M:%S")
            .with_context(|| format!("invalid market.open: {}", self.market.open))
    }

    pub fn market_close(&self) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(&self.market.close, "%H:%M:%S")
            .with_context(|| format!("invalid market.close: {}", self.market.close))
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.dispatcher.check_interval_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.dispatcher.health_interval_seconds)
    }

    pub fn grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.order.grace_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // Config::load() reads process-global env vars, so both scenarios run
    // in one test to avoid two tests racing on the same env keys under the
    // default parallel test runner.
    #[test]
    fn load_precedence_and_fallback() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [broker]
            broker_type = "kite"
            api_key = "file-key"
            base_url = "https://file.example"

            [dispatcher]
            worker_pool_size = 3
            "#
        )
        .unwrap();

        std::env::set_var("CONFIG_PATH", file.path());
        std::env::set_var("BROKER_API_KEY", "env-key");
        std::env::remove_var("DISPATCHER_WORKER_POOL_SIZE");

        let with_file = Config::load().unwrap();

        // Env var wins over the file value.
        assert_eq!(with_file.broker.api_key, "env-key");
        // File value stands where no env override exists.
        assert_eq!(with_file.broker.broker_type, "kite");
        assert_eq!(with_file.broker.base_url, "https://file.example");
        assert_eq!(with_file.dispatcher.worker_pool_size, 3);

        std::env::remove_var("BROKER_API_KEY");
        std::env::set_var("CONFIG_PATH", "/nonexistent/path/config.toml");

        let without_file = Config::load().unwrap();
        assert_eq!(without_file.dispatcher.worker_pool_size, 5);
        assert_eq!(without_file.market.timezone, "Asia/Kolkata");
        assert_eq!(without_file.broker.api_key, "");

        std::env::remove_var("CONFIG_PATH");
    }
}
