//! Causal Intelligence API dispatcher.
//!
//! When a rolling buffer has accumulated a full window of finalized records,
//! the dispatcher serializes it as CSV and POSTs it to the remote
//! chain-detection service. The payload is `row_count + 1` physical lines:
//! a header, `row_count - 1` data rows, and one placeholder row whose
//! datetime is the next theoretical window start with all numeric fields
//! zero. The service answers with a chain signal in {-1, 0, +1}.

use std::fmt::Write as _;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::aggregate::BufferHandle;
use crate::error::FeedError;
use crate::models::{Candle, ChainDetection, Sample};

pub const DEFAULT_ROW_COUNT: usize = 5000;

pub struct CausalApiClient {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    row_count: usize,
}

#[derive(Debug, Deserialize)]
struct CausalResponse {
    datetime: DateTime<Utc>,
    chain_detected: i8,
}

impl CausalApiClient {
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        Self::with_row_count(url, api_key, DEFAULT_ROW_COUNT)
    }

    pub fn with_row_count(
        url: impl Into<String>,
        api_key: Option<String>,
        row_count: usize,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("failed to build causal api client")?;
        Ok(Self {
            client,
            url: url.into(),
            api_key,
            row_count,
        })
    }

    /// Dispatch one OHLC buffer. `Ok(None)` when the buffer is not yet full
    /// enough or the service rejected the payload.
    pub async fn send_candles(
        &self,
        buffer: &BufferHandle<Candle>,
        label: &str,
        tf_seconds: u64,
    ) -> Result<Option<ChainDetection>> {
        let needed = self.row_count - 1;
        let records = {
            let buffer = buffer.lock();
            if buffer.len() < needed {
                debug!(
                    label,
                    have = buffer.len(),
                    needed,
                    "buffer below dispatch threshold"
                );
                return Ok(None);
            }
            buffer.get_last(needed)
        };

        let body = candle_csv(&records, tf_seconds);
        self.post_csv(body, label).await
    }

    /// Univariate counterpart of [`CausalApiClient::send_candles`].
    pub async fn send_samples(
        &self,
        buffer: &BufferHandle<Sample>,
        label: &str,
        tf_seconds: u64,
    ) -> Result<Option<ChainDetection>> {
        let needed = self.row_count - 1;
        let records = {
            let buffer = buffer.lock();
            if buffer.len() < needed {
                debug!(
                    label,
                    have = buffer.len(),
                    needed,
                    "buffer below dispatch threshold"
                );
                return Ok(None);
            }
            buffer.get_last(needed)
        };

        let body = sample_csv(&records, tf_seconds);
        self.post_csv(body, label).await
    }

    async fn post_csv(&self, body: String, label: &str) -> Result<Option<ChainDetection>> {
        let mut request = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "text/csv")
            .body(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("causal api request for {label} failed"))?;

        let status = response.status();
        if !status.is_success() {
            let err = FeedError::RemoteApi {
                status: status.as_u16(),
            };
            warn!(label, error = %err, "dispatch dropped, next cycle retries");
            return Ok(None);
        }

        let parsed: CausalResponse = response
            .json()
            .await
            .context("failed to parse causal api response")?;
        Ok(Some(ChainDetection {
            datetime: parsed.datetime,
            chain_detected: parsed.chain_detected,
            received_at: Utc::now(),
        }))
    }
}

fn format_datetime(datetime: DateTime<Utc>) -> String {
    datetime.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// `datetime,open,high,low,close` CSV with the zero placeholder row appended.
pub(crate) fn candle_csv(records: &[Candle], tf_seconds: u64) -> String {
    debug_assert!(!records.is_empty());
    let mut out = String::with_capacity(records.len() * 48 + 64);
    out.push_str("datetime,open,high,low,close\n");
    for candle in records {
        let _ = writeln!(
            out,
            "{},{},{},{},{}",
            format_datetime(candle.datetime),
            candle.open,
            candle.high,
            candle.low,
            candle.close
        );
    }
    if let Some(last) = records.last() {
        let placeholder = last.datetime + chrono::Duration::seconds(tf_seconds as i64);
        let _ = writeln!(out, "{},0,0,0,0", format_datetime(placeholder));
    }
    out
}

/// `datetime,value` CSV with the zero placeholder row appended.
pub(crate) fn sample_csv(records: &[Sample], tf_seconds: u64) -> String {
    debug_assert!(!records.is_empty());
    let mut out = String::with_capacity(records.len() * 32 + 32);
    out.push_str("datetime,value\n");
    for sample in records {
        let _ = writeln!(out, "{},{}", format_datetime(sample.datetime), sample.value);
    }
    if let Some(last) = records.last() {
        let placeholder = last.datetime + chrono::Duration::seconds(tf_seconds as i64);
        let _ = writeln!(out, "{},0", format_datetime(placeholder));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::RollingBuffer;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn minute_candles(count: usize, end: DateTime<Utc>) -> Vec<Candle> {
        (0..count)
            .map(|i| {
                let datetime = end - chrono::Duration::minutes((count - 1 - i) as i64);
                Candle {
                    datetime,
                    open: 100.0 + i as f64,
                    high: 101.0 + i as f64,
                    low: 99.0 + i as f64,
                    close: 100.5 + i as f64,
                    volume: 10.0,
                }
            })
            .collect()
    }

    #[test]
    fn test_payload_line_count() {
        let end = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        let records = minute_candles(4999, end);
        let csv = candle_csv(&records, 60);

        // Header + 4999 data rows + placeholder = row_count + 1 lines.
        assert_eq!(csv.trim_end().lines().count(), 5001);
        assert!(csv.starts_with("datetime,open,high,low,close\n"));
    }

    #[test]
    fn test_placeholder_row_is_next_window_start() {
        let end = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        let records = minute_candles(4999, end);
        let csv = candle_csv(&records, 60);

        let last_line = csv.trim_end().lines().last().unwrap();
        assert_eq!(last_line, "2025-01-01T10:01:00Z,0,0,0,0");

        // Placeholder is one timeframe after the final data row.
        let second_to_last = csv.trim_end().lines().rev().nth(1).unwrap();
        assert!(second_to_last.starts_with("2025-01-01T10:00:00Z,"));
    }

    #[test]
    fn test_sample_csv_shape() {
        let end = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        let records: Vec<Sample> = (0..3)
            .map(|i| Sample {
                datetime: end + chrono::Duration::minutes(i),
                value: 21.0 + i as f64,
            })
            .collect();
        let csv = sample_csv(&records, 60);

        let lines: Vec<&str> = csv.trim_end().lines().collect();
        assert_eq!(lines[0], "datetime,value");
        assert_eq!(lines[1], "2025-01-01T10:00:00Z,21");
        assert_eq!(lines[4], "2025-01-01T10:03:00Z,0");
    }

    fn buffer_of(records: Vec<Candle>) -> BufferHandle<Candle> {
        let mut buffer = RollingBuffer::new(records.len().max(1));
        for record in records {
            buffer.push(record);
        }
        Arc::new(Mutex::new(buffer))
    }

    #[tokio::test]
    async fn test_under_filled_buffer_skips_dispatch() {
        let server = MockServer::start().await;
        // No mock mounted: any request would 404 and fail the test below.
        let client =
            CausalApiClient::with_row_count(format!("{}/analyze", server.uri()), None, 100)
                .unwrap();

        let end = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        let buffer = buffer_of(minute_candles(42, end));
        let result = client.send_candles(&buffer, "1m", 60).await.unwrap();
        assert!(result.is_none());
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/analyze"))
            .and(header("content-type", "text/csv"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "datetime": "2025-01-01T10:00:00Z",
                "chain_detected": 1
            })))
            .mount(&server)
            .await;

        let client = CausalApiClient::with_row_count(
            format!("{}/analyze", server.uri()),
            Some("secret".to_string()),
            6,
        )
        .unwrap();

        let end = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        let buffer = buffer_of(minute_candles(5, end));
        let detection = client
            .send_candles(&buffer, "1m", 60)
            .await
            .unwrap()
            .expect("service answered");
        assert_eq!(detection.chain_detected, 1);
        assert_eq!(
            detection.datetime,
            Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap()
        );

        // Body shape: row_count + 1 physical lines.
        let requests = server.received_requests().await.unwrap();
        let body = String::from_utf8(requests[0].body.clone()).unwrap();
        assert_eq!(body.trim_end().lines().count(), 7);
        assert!(body.trim_end().ends_with(",0,0,0,0"));
    }

    #[tokio::test]
    async fn test_non_2xx_is_dropped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/analyze"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client =
            CausalApiClient::with_row_count(format!("{}/analyze", server.uri()), None, 6).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        let buffer = buffer_of(minute_candles(5, end));

        let result = client.send_candles(&buffer, "1m", 60).await.unwrap();
        assert!(result.is_none());
    }
}
