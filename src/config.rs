// Process configuration: defaults, then an optional file, then
// `DEPTHWATCH__*` environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

use crate::market_data::auth::Credentials;
use crate::market_data::session::SessionSettings;
use crate::market_data::types::ExchangeEndpoint;

pub const ENV_PREFIX: &str = "DEPTHWATCH";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub url: String,
    pub exchange: String,
    pub channel: String,
    pub api_key: Option<String>,
    pub private_key_pem: Option<String>,
    pub receive_timeout_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: "wss://ws-feed.exchange.coinbase.com".into(),
            exchange: "coinbase".into(),
            channel: "level2".into(),
            api_key: None,
            private_key_pem: None,
            receive_timeout_ms: 30_000,
            backoff_initial_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

impl StreamConfig {
    /// `None` unless both the key id and the private key are set.
    pub fn credentials(&self) -> Option<Credentials> {
        Credentials::from_parts(self.api_key.clone(), self.private_key_pem.clone())
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            receive_timeout: Duration::from_millis(self.receive_timeout_ms),
            backoff_initial: Duration::from_millis(self.backoff_initial_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    pub watch_list: Vec<String>,
    pub quote: String,
    pub interval_ms: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            watch_list: ["BTC", "ETH", "SOL", "XRP"].map(String::from).to_vec(),
            quote: "USDT".into(),
            interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub symbols: Vec<String>,
    pub poll_interval_ms: u64,
    pub fetch_timeout_ms: u64,
    pub depth_limit: u32,
    pub exchanges: Vec<ExchangeEndpoint>,
    pub stream: StreamConfig,
    pub push: PushConfig,
    pub listen: SocketAddr,
    /// Prometheus exporter port, used with the `metrics-exporter` feature.
    pub metrics_port: u16,
    pub store: StoreKind,
    pub database_url: String,
}

fn endpoint(id: &str, name: &str, location: &str, lat: f64, lon: f64) -> ExchangeEndpoint {
    ExchangeEndpoint {
        id: id.into(),
        display_name: name.into(),
        location: location.into(),
        lat,
        lon,
        rest_url: None,
    }
}

pub fn default_exchanges() -> Vec<ExchangeEndpoint> {
    const TOKYO: (&str, f64, f64) = ("Tokyo, Japan", 35.6762, 139.6503);
    const SF: (&str, f64, f64) = ("San Francisco, USA", 37.7749, -122.4194);
    const SINGAPORE: (&str, f64, f64) = ("Singapore", 1.3521, 103.8198);
    const HONG_KONG: (&str, f64, f64) = ("Hong Kong", 22.3964, 114.1095);

    [
        ("binance", "Binance", TOKYO),
        ("coinbase", "Coinbase", SF),
        ("kraken", "Kraken", SF),
        ("kucoin", "KuCoin", SINGAPORE),
        ("huobi", "Huobi", TOKYO),
        ("bitfinex", "Bitfinex", HONG_KONG),
        ("bybit", "Bybit", SINGAPORE),
        ("okx", "OKX", TOKYO),
        ("gate", "Gate.io", TOKYO),
        ("mexc", "MEXC", SINGAPORE),
    ]
    .into_iter()
    .map(|(id, name, (location, lat, lon))| endpoint(id, name, location, lat, lon))
    .collect()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            symbols: ["BTC/USDT", "ETH/USDT", "SOL/USDT", "XRP/USDT", "DOGE/USDT"].map(String::from).to_vec(),
            poll_interval_ms: 5_000,
            fetch_timeout_ms: 10_000,
            depth_limit: 100,
            exchanges: default_exchanges(),
            stream: StreamConfig::default(),
            push: PushConfig::default(),
            listen: SocketAddr::from(([0, 0, 0, 0], 5000)),
            metrics_port: 9000,
            store: StoreKind::Sqlite,
            database_url: "sqlite://crypto_orderbook.db".into(),
        }
    }
}

impl AppConfig {
    /// Layer the file at `path` (extension optional, missing file allowed)
    /// and the environment over the defaults.
    pub fn load(path: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("symbols")
                    .with_list_parse_key("push.watch_list"),
            )
            .build()?
            .try_deserialize()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn push_interval(&self) -> Duration {
        Duration::from_millis(self.push.interval_ms)
    }

    /// Filesystem path for the sqlite store; accepts a bare path or a
    /// `sqlite://` URL.
    pub fn sqlite_path(&self) -> &str {
        self.database_url.strip_prefix("sqlite://").unwrap_or(&self.database_url)
    }
}
