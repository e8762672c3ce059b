use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FeedError;

/// A single normalized observation from any upstream source.
///
/// Immutable after construction; producers hand owned copies to the
/// aggregator and never touch them again.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    /// Vendor-supplied trade/observation time (UTC).
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    /// Trade size / volume contribution. Sources without a size omit it.
    pub size: Option<f64>,
    pub symbol: String,
    /// Upstream source name, e.g. "binance" or "polygon".
    pub source: &'static str,
}

impl Tick {
    pub fn new(
        timestamp: DateTime<Utc>,
        price: f64,
        size: Option<f64>,
        symbol: impl Into<String>,
        source: &'static str,
    ) -> Self {
        Self {
            timestamp,
            price,
            size,
            symbol: symbol.into(),
            source,
        }
    }
}

/// Anything the rolling buffer can hold needs a window-start datetime.
pub trait Timestamped {
    fn datetime(&self) -> DateTime<Utc>;
}

/// A finalized OHLC candle for one timeframe window.
///
/// `datetime` is the window start, aligned to a multiple of the timeframe's
/// second count from the epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub datetime: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Timestamped for Candle {
    fn datetime(&self) -> DateTime<Utc> {
        self.datetime
    }
}

/// A finalized univariate sample: the last observed value in the window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub datetime: DateTime<Utc>,
    pub value: f64,
}

impl Timestamped for Sample {
    fn datetime(&self) -> DateTime<Utc> {
        self.datetime
    }
}

/// Response from the causal intelligence service, plus a local receipt stamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainDetection {
    pub datetime: DateTime<Utc>,
    /// Direction of an emerging structural shift: -1, 0 or +1.
    pub chain_detected: i8,
    pub received_at: DateTime<Utc>,
}

/// One aggregation window size within a timeframe network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeframe {
    pub seconds: u64,
    /// Unique human-readable label, e.g. "15s", "1m", "1h".
    pub label: String,
    /// Rolling-buffer capacity for this timeframe.
    pub capacity: usize,
}

pub const DEFAULT_BUFFER_CAPACITY: usize = 5000;

impl Timeframe {
    pub fn new(seconds: u64, label: impl Into<String>, capacity: usize) -> Result<Self, FeedError> {
        let label = label.into();
        if seconds == 0 {
            return Err(FeedError::Config(format!(
                "timeframe '{label}' must span at least one second"
            )));
        }
        if capacity == 0 {
            return Err(FeedError::Config(format!(
                "timeframe '{label}' needs a positive buffer capacity"
            )));
        }
        Ok(Self {
            seconds,
            label,
            capacity,
        })
    }

    /// Parse a `<count><unit>` label (unit: s/m/h) into a timeframe with the
    /// default buffer capacity.
    pub fn from_label(label: &str) -> Result<Self, FeedError> {
        let split = label
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| FeedError::Config(format!("timeframe label '{label}' has no unit")))?;
        let (count, unit) = label.split_at(split);
        let count: u64 = count
            .parse()
            .map_err(|_| FeedError::Config(format!("malformed timeframe label '{label}'")))?;
        let per_unit = match unit {
            "s" => 1,
            "m" => 60,
            "h" => 3600,
            _ => {
                return Err(FeedError::Config(format!(
                    "timeframe label '{label}' has unknown unit '{unit}'"
                )))
            }
        };
        Self::new(count * per_unit, label, DEFAULT_BUFFER_CAPACITY)
    }

    /// Start of the window containing `timestamp`, as aligned epoch seconds.
    pub fn window_start_secs(&self, timestamp: DateTime<Utc>) -> i64 {
        let secs = self.seconds as i64;
        timestamp.timestamp().div_euclid(secs) * secs
    }
}

/// A non-empty ordered set of timeframes with unique labels.
#[derive(Debug, Clone)]
pub struct TimeframeNetwork {
    timeframes: Vec<Timeframe>,
}

impl TimeframeNetwork {
    pub fn new(timeframes: Vec<Timeframe>) -> Result<Self, FeedError> {
        if timeframes.is_empty() {
            return Err(FeedError::Config(
                "timeframe network must contain at least one timeframe".to_string(),
            ));
        }
        for (i, tf) in timeframes.iter().enumerate() {
            if timeframes[..i].iter().any(|other| other.label == tf.label) {
                return Err(FeedError::Config(format!(
                    "duplicate timeframe label '{}' in network",
                    tf.label
                )));
            }
        }
        Ok(Self { timeframes })
    }

    /// Canonical intraday network for equities/crypto streams.
    pub fn intraday() -> Self {
        Self::from_labels(&["1s", "5s", "15s", "1m", "5m", "15m", "1h"])
    }

    /// Canonical network for the slow-moving weather source.
    pub fn weather() -> Self {
        Self::from_labels(&["1m", "5m", "15m", "1h"])
    }

    fn from_labels(labels: &[&str]) -> Self {
        let timeframes = labels
            .iter()
            .map(|l| Timeframe::from_label(l))
            .collect::<Result<Vec<_>, _>>()
            .expect("canonical timeframe labels are well-formed");
        Self { timeframes }
    }

    pub fn timeframes(&self) -> &[Timeframe] {
        &self.timeframes
    }

    pub fn labels(&self) -> Vec<String> {
        self.timeframes.iter().map(|tf| tf.label.clone()).collect()
    }

    pub fn get(&self, label: &str) -> Option<&Timeframe> {
        self.timeframes.iter().find(|tf| tf.label == label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timeframe_label_parsing() {
        assert_eq!(Timeframe::from_label("15s").unwrap().seconds, 15);
        assert_eq!(Timeframe::from_label("1m").unwrap().seconds, 60);
        assert_eq!(Timeframe::from_label("4h").unwrap().seconds, 14_400);

        assert!(Timeframe::from_label("1d").is_err());
        assert!(Timeframe::from_label("m").is_err());
        assert!(Timeframe::from_label("0s").is_err());
        assert!(Timeframe::from_label("15").is_err());
    }

    #[test]
    fn test_window_start_alignment() {
        let tf = Timeframe::from_label("5s").unwrap();
        let ts = Utc.timestamp_millis_opt(1_700_000_003_700).unwrap();
        let start = tf.window_start_secs(ts);
        assert_eq!(start % 5, 0);
        assert!(start <= ts.timestamp());
        assert!(ts.timestamp() - start < 5);
    }

    #[test]
    fn test_network_rejects_duplicate_labels() {
        let dup = vec![
            Timeframe::from_label("1m").unwrap(),
            Timeframe::from_label("1m").unwrap(),
        ];
        assert!(TimeframeNetwork::new(dup).is_err());
        assert!(TimeframeNetwork::new(Vec::new()).is_err());
    }

    #[test]
    fn test_canonical_networks() {
        let intraday = TimeframeNetwork::intraday();
        assert_eq!(intraday.timeframes().len(), 7);
        assert_eq!(intraday.get("1h").unwrap().seconds, 3600);

        let weather = TimeframeNetwork::weather();
        assert_eq!(weather.timeframes()[0].label, "1m");
        for tf in weather.timeframes() {
            assert_eq!(tf.capacity, DEFAULT_BUFFER_CAPACITY);
        }
    }
}
