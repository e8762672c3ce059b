use serde_json::Value;

use super::{number, size_field, utc_from_millis, TickNormalizer};
use crate::models::Tick;

pub const SOURCE: &str = "polygon";

/// Normalizer for Polygon equities trade events (`ev == "T"`).
///
/// Status frames (`ev == "status"`) belong to the connection lifecycle and
/// are handled by the connector; here they simply yield no tick.
#[derive(Debug, Default)]
pub struct PolygonNormalizer;

impl TickNormalizer for PolygonNormalizer {
    fn source(&self) -> &'static str {
        SOURCE
    }

    fn normalize(&self, raw: &Value) -> Option<Tick> {
        if raw.get("ev").and_then(Value::as_str) != Some("T") {
            return None;
        }

        let symbol = raw.get("sym").and_then(Value::as_str)?;
        let price = raw.get("p").and_then(number)?;
        let timestamp = raw
            .get("t")
            .and_then(Value::as_i64)
            .and_then(utc_from_millis)?;
        let size = size_field(raw.get("s"));

        Some(Tick::new(timestamp, price, size, symbol, SOURCE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_trade_event() {
        let raw = json!({
            "ev": "T",
            "sym": "AAPL",
            "x": 4,
            "i": "52983525029461",
            "z": 3,
            "p": 187.53,
            "s": 100,
            "t": 1_735_700_400_250_i64,
            "q": 1063
        });

        let tick = PolygonNormalizer.normalize(&raw).unwrap();
        assert_eq!(tick.symbol, "AAPL");
        assert_eq!(tick.price, 187.53);
        assert_eq!(tick.size, Some(100.0));
        assert_eq!(tick.source, "polygon");
        assert_eq!(tick.timestamp.timestamp_millis(), 1_735_700_400_250);
    }

    #[test]
    fn test_status_event_yields_none() {
        let raw = json!({
            "ev": "status",
            "status": "auth_success",
            "message": "authenticated"
        });
        assert!(PolygonNormalizer.normalize(&raw).is_none());
    }

    #[test]
    fn test_missing_fields_skipped() {
        assert!(PolygonNormalizer
            .normalize(&json!({"ev": "T", "sym": "AAPL", "p": 187.53}))
            .is_none());
        assert!(PolygonNormalizer
            .normalize(&json!({"ev": "T", "p": 187.53, "t": 1_i64}))
            .is_none());
    }

    #[test]
    fn test_string_price_parsed() {
        let raw = json!({
            "ev": "T",
            "sym": "MSFT",
            "p": "430.10",
            "t": 1_735_700_400_000_i64
        });
        assert_eq!(PolygonNormalizer.normalize(&raw).unwrap().price, 430.10);
    }
}
