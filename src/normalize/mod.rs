//! Per-source tick normalizers.
//!
//! Each upstream vendor speaks its own JSON dialect; a normalizer turns one
//! raw message into the common [`Tick`] shape or skips it. Normalization is
//! pure: the same raw message always yields the same tick, and anything with
//! a missing symbol/price/timestamp or an unrecognized event kind yields
//! `None`.

pub mod accuweather;
pub mod binance;
pub mod bloomberg;
pub mod polygon;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

use crate::models::Tick;

pub use accuweather::AccuweatherNormalizer;
pub use binance::BinanceNormalizer;
pub use bloomberg::BloombergNormalizer;
pub use polygon::PolygonNormalizer;

/// Decodes vendor-specific messages into the common tick shape.
pub trait TickNormalizer: Send + Sync {
    /// Source name stamped onto produced ticks.
    fn source(&self) -> &'static str;

    /// Decode one raw message. `None` means the message carried no tick
    /// (unrecognized kind, status/control frame, or missing fields).
    fn normalize(&self, raw: &Value) -> Option<Tick>;
}

/// Numeric field that may arrive as a JSON number or a numeric string.
pub(crate) fn number(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

/// Non-negative size field; negative or non-numeric values are dropped.
pub(crate) fn size_field(value: Option<&Value>) -> Option<f64> {
    value.and_then(number).filter(|v| *v >= 0.0)
}

pub(crate) fn utc_from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

pub(crate) fn utc_from_secs(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

/// ISO-8601 string to UTC. Offset-carrying strings are converted; naive
/// local-time strings are read as UTC, which is what the vendors here
/// document (or leave unsaid).
pub(crate) fn utc_from_iso(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}
