use serde_json::Value;

use super::{number, size_field, utc_from_iso, utc_from_millis, TickNormalizer};
use crate::models::Tick;

pub const SOURCE: &str = "bloomberg";

/// Normalizer for subscription-session market-data events.
///
/// The connector resolves correlation ids back to security strings and hands
/// over an envelope of the form
/// `{"security": "...", "fields": {...}, "timestamp": ...}`. Price is the
/// first non-null of LAST_TRADE, LAST_PRICE, BID, ASK; VOLUME is the size.
#[derive(Debug, Default)]
pub struct BloombergNormalizer;

const PRICE_FIELDS: &[&str] = &["LAST_TRADE", "LAST_PRICE", "BID", "ASK"];

impl TickNormalizer for BloombergNormalizer {
    fn source(&self) -> &'static str {
        SOURCE
    }

    fn normalize(&self, raw: &Value) -> Option<Tick> {
        let security = raw.get("security").and_then(Value::as_str)?;
        let fields = raw.get("fields")?;

        let price = PRICE_FIELDS
            .iter()
            .filter_map(|name| fields.get(*name))
            .find_map(number)?;

        let timestamp = match raw.get("timestamp") {
            Some(Value::Number(n)) => n.as_i64().and_then(utc_from_millis)?,
            Some(Value::String(s)) => utc_from_iso(s)?,
            _ => return None,
        };

        let size = size_field(fields.get("VOLUME"));

        Some(Tick::new(timestamp, price, size, security, SOURCE))
    }
}
