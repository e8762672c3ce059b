//! Environment configuration surface.
//!
//! All runtime parameters come from environment variables (loaded from
//! `.env` by the binary before this module runs). Missing credentials for a
//! selected source leave that source's config as `None`; the supervisor
//! skips it with a warning. Missing infrastructure config (the causal API
//! URL) is fatal at startup.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::connectors::accuweather::AccuweatherConfig;
use crate::connectors::binance_ws::{BinanceConfig, STREAM_AGG_TRADE, STREAM_TRADE};
use crate::connectors::bloomberg::BloombergConfig;
use crate::connectors::polygon_ws::PolygonConfig;
use crate::error::FeedError;

/// Which connector pipelines to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorKind {
    Binance,
    Polygon,
    Accuweather,
    Bloomberg,
    /// The two streaming feeds.
    Both,
    /// Every configured source.
    All,
}

impl ConnectorKind {
    /// Source names this selector enables, in startup order.
    pub fn sources(&self) -> &'static [&'static str] {
        match self {
            ConnectorKind::Binance => &["binance"],
            ConnectorKind::Polygon => &["polygon"],
            ConnectorKind::Accuweather => &["accuweather"],
            ConnectorKind::Bloomberg => &["bloomberg"],
            ConnectorKind::Both => &["polygon", "binance"],
            ConnectorKind::All => &["polygon", "binance", "accuweather", "bloomberg"],
        }
    }
}

impl FromStr for ConnectorKind {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binance" => Ok(ConnectorKind::Binance),
            "polygon" => Ok(ConnectorKind::Polygon),
            "accuweather" => Ok(ConnectorKind::Accuweather),
            "bloomberg" => Ok(ConnectorKind::Bloomberg),
            "both" => Ok(ConnectorKind::Both),
            "all" => Ok(ConnectorKind::All),
            other => Err(FeedError::Config(format!(
                "unknown connector kind '{other}' \
                 (expected binance|polygon|accuweather|bloomberg|both|all)"
            ))),
        }
    }
}

impl std::fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectorKind::Binance => "binance",
            ConnectorKind::Polygon => "polygon",
            ConnectorKind::Accuweather => "accuweather",
            ConnectorKind::Bloomberg => "bloomberg",
            ConnectorKind::Both => "both",
            ConnectorKind::All => "all",
        };
        f.write_str(s)
    }
}

/// Fully resolved runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub connector: ConnectorKind,
    pub causal_url: String,
    pub causal_univariate_url: String,
    pub causal_api_key: Option<String>,
    pub dispatch_interval: Duration,
    pub health_interval: Duration,
    pub binance: Option<BinanceConfig>,
    pub polygon: Option<PolygonConfig>,
    pub accuweather: Option<AccuweatherConfig>,
    pub bloomberg: Option<BloombergConfig>,
}

impl Settings {
    pub fn from_env(connector: ConnectorKind) -> Result<Self, FeedError> {
        let causal_url = env::var("CAUSAL_API_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| FeedError::Config("CAUSAL_API_URL is required".to_string()))?;
        let causal_univariate_url = env::var("CAUSAL_API_UNIVARIATE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| causal_url.clone());
        let causal_api_key = env::var("CAUSAL_API_KEY").ok().filter(|v| !v.is_empty());

        let dispatch_interval = Duration::from_secs(env_parse("DISPATCH_INTERVAL_SECS", 60));
        let health_interval = Duration::from_secs(env_parse("HEALTH_INTERVAL_SECS", 30));

        // Public market data: no credentials needed.
        let stream = env::var("BINANCE_STREAM").unwrap_or_else(|_| STREAM_AGG_TRADE.to_string());
        let binance = match stream.as_str() {
            STREAM_TRADE | STREAM_AGG_TRADE => Some(BinanceConfig {
                // Trade events carry uppercased symbols regardless of how the
                // stream name is spelled.
                symbols: env_list("BINANCE_SYMBOLS", &["BTCUSDT"])
                    .into_iter()
                    .map(|s| s.to_uppercase())
                    .collect(),
                stream,
                ..BinanceConfig::default()
            }),
            other => {
                return Err(FeedError::Config(format!(
                    "BINANCE_STREAM must be {STREAM_TRADE} or {STREAM_AGG_TRADE}, got '{other}'"
                )))
            }
        };

        let polygon = env::var("POLYGON_API_KEY")
            .ok()
            .filter(|v| !v.is_empty())
            .map(|key| {
                let mut config = PolygonConfig::new(key, env_list("POLYGON_SYMBOLS", &["AAPL"]));
                config.backfill_enabled = env_flag("POLYGON_BACKFILL", true);
                config.gap_threshold =
                    Duration::from_secs(env_parse("POLYGON_GAP_THRESHOLD_SECS", 60));
                config
            });

        let accuweather = match (
            env::var("ACCUWEATHER_API_KEY").ok().filter(|v| !v.is_empty()),
            env::var("ACCUWEATHER_LOCATION_KEY")
                .ok()
                .filter(|v| !v.is_empty()),
        ) {
            (Some(api_key), Some(location_key)) => {
                let mut config = AccuweatherConfig::new(api_key, location_key);
                config.poll_interval =
                    Duration::from_secs(env_parse("ACCUWEATHER_POLL_INTERVAL_SECS", 300));
                Some(config)
            }
            _ => None,
        };

        // The mock session needs no credentials, so this source is always
        // available.
        let mut bloomberg =
            BloombergConfig::new(env_list("BLOOMBERG_SECURITIES", &["IBM US Equity"]));
        bloomberg.server_host =
            env::var("BLOOMBERG_HOST").unwrap_or_else(|_| bloomberg.server_host);
        bloomberg.server_port = env_parse("BLOOMBERG_PORT", bloomberg.server_port);

        Ok(Self {
            connector,
            causal_url,
            causal_univariate_url,
            causal_api_key,
            dispatch_interval,
            health_interval,
            binance,
            polygon,
            accuweather,
            bloomberg: Some(bloomberg),
        })
    }
}

fn env_parse<T: FromStr + Copy>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

fn env_list(name: &str, defaults: &[&str]) -> Vec<String> {
    env::var(name)
        .ok()
        .map(|raw| parse_list(&raw))
        .filter(|list| !list.is_empty())
        .unwrap_or_else(|| defaults.iter().map(|s| s.to_string()).collect())
}

/// Comma-separated list, trimmed, empties dropped.
fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
