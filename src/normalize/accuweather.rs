use serde_json::Value;

use super::{number, size_field, utc_from_iso, utc_from_secs, TickNormalizer};
use crate::models::Tick;

pub const SOURCE: &str = "accuweather";

/// Normalizer for AccuWeather current-conditions responses.
///
/// The endpoint returns an array of observations; only the first element is
/// used. Metric temperature maps to the price axis and relative humidity to
/// the (optional) size axis, which keeps the downstream pipeline shape
/// identical to the market sources.
#[derive(Debug)]
pub struct AccuweatherNormalizer {
    /// Location key the poll was issued for; observations carry no symbol.
    location: String,
}

impl AccuweatherNormalizer {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
        }
    }
}

impl TickNormalizer for AccuweatherNormalizer {
    fn source(&self) -> &'static str {
        SOURCE
    }

    fn normalize(&self, raw: &Value) -> Option<Tick> {
        let observation = match raw {
            Value::Array(items) => items.first()?,
            _ => raw,
        };

        let price = observation
            .pointer("/Temperature/Metric/Value")
            .and_then(number)?;

        // EpochTime is the vendor's observation instant; the local string is
        // a fallback only.
        let timestamp = observation
            .get("EpochTime")
            .and_then(Value::as_i64)
            .and_then(utc_from_secs)
            .or_else(|| {
                observation
                    .get("LocalObservationDateTime")
                    .and_then(Value::as_str)
                    .and_then(utc_from_iso)
            })?;

        let size = size_field(observation.get("RelativeHumidity"));

        Some(Tick::new(
            timestamp,
            price,
            size,
            self.location.clone(),
            SOURCE,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixture() -> Value {
        json!([{
            "LocalObservationDateTime": "2025-01-01T10:05:00+01:00",
            "EpochTime": 1_735_722_300_i64,
            "WeatherText": "Partly cloudy",
            "WeatherIcon": 3,
            "HasPrecipitation": false,
            "Temperature": {
                "Metric": { "Value": 21.5, "Unit": "C", "UnitType": 17 },
                "Imperial": { "Value": 70.0, "Unit": "F", "UnitType": 18 }
            },
            "RelativeHumidity": 56
        }])
    }

    #[test]
    fn test_first_array_element_used() {
        let norm = AccuweatherNormalizer::new("335315");
        let tick = norm.normalize(&fixture()).unwrap();
        assert_eq!(tick.symbol, "335315");
        assert_eq!(tick.price, 21.5);
        assert_eq!(tick.size, Some(56.0));
        assert_eq!(tick.source, "accuweather");
        assert_eq!(tick.timestamp.timestamp(), 1_735_722_300);
    }

    #[test]
    fn test_iso_fallback_when_epoch_missing() {
        let mut raw = fixture();
        raw[0].as_object_mut().unwrap().remove("EpochTime");
        let tick = AccuweatherNormalizer::new("335315").normalize(&raw).unwrap();
        // +01:00 offset converted to UTC.
        assert_eq!(tick.timestamp.to_rfc3339(), "2025-01-01T09:05:00+00:00");
    }

    #[test]
    fn test_missing_temperature_skipped() {
        let raw = json!([{ "EpochTime": 1_735_722_300_i64, "RelativeHumidity": 56 }]);
        assert!(AccuweatherNormalizer::new("335315").normalize(&raw).is_none());
    }

    #[test]
    fn test_empty_array_skipped() {
        assert!(AccuweatherNormalizer::new("335315")
            .normalize(&json!([]))
            .is_none());
    }

    #[test]
    fn test_humidity_optional() {
        let mut raw = fixture();
        raw[0].as_object_mut().unwrap().remove("RelativeHumidity");
        let tick = AccuweatherNormalizer::new("335315").normalize(&raw).unwrap();
        assert_eq!(tick.size, None);
    }
}
