use serde_json::Value;

use super::{number, size_field, utc_from_millis, TickNormalizer};
use crate::models::Tick;

pub const SOURCE: &str = "binance";

/// Normalizer for Binance trade / aggTrade stream messages.
///
/// Multiplexed connections wrap every payload in a `{stream, data}` envelope;
/// raw single-stream connections deliver the payload bare. Both are handled.
#[derive(Debug, Default)]
pub struct BinanceNormalizer;

impl TickNormalizer for BinanceNormalizer {
    fn source(&self) -> &'static str {
        SOURCE
    }

    fn normalize(&self, raw: &Value) -> Option<Tick> {
        let payload = raw.get("data").unwrap_or(raw);

        match payload.get("e").and_then(Value::as_str) {
            Some("trade") | Some("aggTrade") => {}
            _ => return None,
        }

        let symbol = payload.get("s").and_then(Value::as_str)?;
        let price = payload.get("p").and_then(number)?;
        // Trade time is the vendor's execution time; event time is when the
        // payload left the server. Prefer the former.
        let millis = payload
            .get("T")
            .and_then(Value::as_i64)
            .or_else(|| payload.get("E").and_then(Value::as_i64))?;
        let timestamp = utc_from_millis(millis)?;
        let size = size_field(payload.get("q"));

        Some(Tick::new(timestamp, price, size, symbol, SOURCE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_agg_trade_in_stream_envelope() {
        let raw = json!({
            "stream": "btcusdt@aggTrade",
            "data": {
                "e": "aggTrade",
                "E": 1_735_700_400_123_i64,
                "s": "BTCUSDT",
                "a": 5933014,
                "p": "97201.50",
                "q": "0.042",
                "f": 100,
                "l": 105,
                "T": 1_735_700_400_100_i64,
                "m": true
            }
        });

        let tick = BinanceNormalizer.normalize(&raw).unwrap();
        assert_eq!(tick.symbol, "BTCUSDT");
        assert_eq!(tick.price, 97201.5);
        assert_eq!(tick.size, Some(0.042));
        assert_eq!(tick.source, "binance");
        // Trade time preferred over event time.
        assert_eq!(tick.timestamp.timestamp_millis(), 1_735_700_400_100);
    }

    #[test]
    fn test_bare_trade_event() {
        let raw = json!({
            "e": "trade",
            "E": 1_735_700_401_000_i64,
            "s": "ETHUSDT",
            "t": 12345,
            "p": "3410.01",
            "q": "1.5",
            "T": 1_735_700_400_990_i64,
            "m": false
        });

        let tick = BinanceNormalizer.normalize(&raw).unwrap();
        assert_eq!(tick.symbol, "ETHUSDT");
        assert_eq!(tick.size, Some(1.5));
    }

    #[test]
    fn test_unrecognized_event_kinds_skipped() {
        let depth = json!({
            "e": "depthUpdate",
            "E": 1_735_700_400_000_i64,
            "s": "BTCUSDT",
            "b": [],
            "a": []
        });
        assert!(BinanceNormalizer.normalize(&depth).is_none());

        // Subscription acks have no event field at all.
        let ack = json!({"result": null, "id": 1});
        assert!(BinanceNormalizer.normalize(&ack).is_none());
    }

    #[test]
    fn test_missing_price_skipped() {
        let raw = json!({
            "e": "trade",
            "s": "BTCUSDT",
            "T": 1_735_700_400_000_i64
        });
        assert!(BinanceNormalizer.normalize(&raw).is_none());
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let raw = json!({
            "e": "trade",
            "s": "BTCUSDT",
            "p": "97000",
            "q": "0.1",
            "T": 1_735_700_400_000_i64
        });
        let a = BinanceNormalizer.normalize(&raw).unwrap();
        let b = BinanceNormalizer.normalize(&raw).unwrap();
        assert_eq!(a, b);
    }
}
