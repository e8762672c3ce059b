//! AccuWeather polling REST connector.
//!
//! The slowest source in the pipeline: current conditions are fetched on a
//! fixed cadence (default 5 minutes) and fed to a univariate aggregator.
//! Each polling tick retries a bounded number of times; the next tick is
//! always scheduled at the cadence, so a run of failures never causes a
//! catch-up burst. Documented `RateLimit-*` headers are surfaced in the
//! health snapshot and HTTP 429 is honored via `Retry-After`.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{retry_after, ConnectionStatus, Connector, HealthSnapshot, HealthState};
use crate::aggregate::UnivariateAggregator;
use crate::error::FeedError;
use crate::normalize::{AccuweatherNormalizer, TickNormalizer};

pub const DEFAULT_API_BASE: &str = "http://dataservice.accuweather.com";

#[derive(Debug, Clone)]
pub struct AccuweatherConfig {
    pub api_base: String,
    pub api_key: String,
    pub location_key: String,
    pub poll_interval: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl AccuweatherConfig {
    pub fn new(api_key: impl Into<String>, location_key: impl Into<String>) -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: api_key.into(),
            location_key: location_key.into(),
            poll_interval: Duration::from_secs(300),
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

pub struct AccuweatherConnector {
    config: AccuweatherConfig,
    client: reqwest::Client,
    aggregator: Arc<Mutex<UnivariateAggregator>>,
    health: Arc<HealthState>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AccuweatherConnector {
    pub fn new(
        config: AccuweatherConfig,
        aggregator: Arc<Mutex<UnivariateAggregator>>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build accuweather client")?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            config,
            client,
            aggregator,
            health: Arc::new(HealthState::new()),
            shutdown_tx,
            task: Mutex::new(None),
        })
    }

    fn poll_context(&self) -> PollContext {
        PollContext {
            config: self.config.clone(),
            client: self.client.clone(),
            normalizer: AccuweatherNormalizer::new(self.config.location_key.clone()),
            aggregator: self.aggregator.clone(),
            health: self.health.clone(),
            shutdown: self.shutdown_tx.subscribe(),
        }
    }
}

#[async_trait]
impl Connector for AccuweatherConnector {
    fn name(&self) -> &'static str {
        "accuweather"
    }

    async fn connect(&self) -> Result<()> {
        let mut task = self.task.lock();
        if task.is_some() {
            return Ok(());
        }

        info!(
            location = %self.config.location_key,
            interval_secs = self.config.poll_interval.as_secs(),
            "🔌 starting accuweather polling"
        );

        let mut ctx = self.poll_context();
        let mut shutdown = self.shutdown_tx.subscribe();
        *task = Some(tokio::spawn(async move {
            let mut ticker = interval(ctx.config.poll_interval);
            // Cadence over catch-up: a slow or failed tick skips, it never
            // bursts.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = ctx.poll_once() => {}
                            _ = shutdown.changed() => break,
                        }
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("accuweather polling stopped");
        }));
        Ok(())
    }

    fn health(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if task.await.is_err() {
                warn!("accuweather polling task aborted uncleanly");
            }
        }
        self.health.set_status(ConnectionStatus::Disconnected);
    }
}

/// State owned by the polling task.
struct PollContext {
    config: AccuweatherConfig,
    client: reqwest::Client,
    normalizer: AccuweatherNormalizer,
    aggregator: Arc<Mutex<UnivariateAggregator>>,
    health: Arc<HealthState>,
    shutdown: watch::Receiver<bool>,
}

impl PollContext {
    /// One polling tick: up to `max_retries` attempts, spaced by
    /// `retry_delay` (or the vendor's `Retry-After` when rate limited).
    async fn poll_once(&mut self) -> bool {
        for attempt in 1..=self.config.max_retries {
            match self.fetch_conditions().await {
                Ok(raw) => {
                    match self.normalizer.normalize(&raw) {
                        Some(tick) => {
                            debug!(
                                location = %self.config.location_key,
                                value = tick.price,
                                "weather observation"
                            );
                            self.health.record_message();
                            self.aggregator.lock().add_tick(&tick);
                        }
                        None => {
                            warn!("accuweather response carried no usable observation");
                            self.health.record_error();
                        }
                    }
                    self.health.set_status(ConnectionStatus::Connected);
                    return true;
                }
                Err(e) => {
                    self.health.record_error();
                    if !e.is_retryable() {
                        // A malformed body will not get better within this
                        // tick; the next scheduled poll is the retry.
                        warn!(error = %e, "accuweather poll failed, giving up this tick");
                        break;
                    }
                    let delay = match &e {
                        FeedError::RateLimit { retry_after } => {
                            retry_after.unwrap_or(self.config.retry_delay)
                        }
                        _ => self.config.retry_delay,
                    };
                    warn!(
                        attempt,
                        max = self.config.max_retries,
                        error = %e,
                        "accuweather poll attempt failed"
                    );
                    if attempt < self.config.max_retries {
                        tokio::select! {
                            _ = sleep(delay) => {}
                            _ = self.shutdown.changed() => return false,
                        }
                    }
                }
            }
        }

        self.health.set_status(ConnectionStatus::Error);
        false
    }

    async fn fetch_conditions(&self) -> std::result::Result<serde_json::Value, FeedError> {
        let url = format!(
            "{}/currentconditions/v1/{}",
            self.config.api_base, self.config.location_key
        );
        let response = self
            .client
            .get(&url)
            .query(&[("apikey", self.config.api_key.as_str()), ("details", "true")])
            .send()
            .await
            .map_err(|e| FeedError::Transient(e.to_string()))?;

        let remaining = response
            .headers()
            .get("RateLimit-Remaining")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok());
        let reset = response
            .headers()
            .get("RateLimit-Reset")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        if remaining.is_some() || reset.is_some() {
            self.health.set_rate_limit(remaining, reset);
        }

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(FeedError::RateLimit {
                retry_after: retry_after(response.headers()),
            });
        }
        if !status.is_success() {
            return Err(FeedError::Transient(format!("http {status}")));
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| FeedError::InvalidMessage(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TimeframeNetwork;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn conditions_body() -> serde_json::Value {
        serde_json::json!([{
            "EpochTime": 1_735_722_300_i64,
            "Temperature": { "Metric": { "Value": 21.5, "Unit": "C" } },
            "RelativeHumidity": 56
        }])
    }

    fn connector(server_uri: &str, max_retries: u32) -> AccuweatherConnector {
        let mut config = AccuweatherConfig::new("test-key", "335315");
        config.api_base = server_uri.to_string();
        config.max_retries = max_retries;
        config.retry_delay = Duration::from_millis(50);
        let aggregator = Arc::new(Mutex::new(UnivariateAggregator::new(
            "335315",
            TimeframeNetwork::weather(),
        )));
        AccuweatherConnector::new(config, aggregator).unwrap()
    }

    #[tokio::test]
    async fn test_poll_feeds_aggregator_and_captures_rate_limit_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/currentconditions/v1/335315"))
            .and(query_param("apikey", "test-key"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("RateLimit-Remaining", "42")
                    .insert_header("RateLimit-Reset", "1735722600")
                    .set_body_json(conditions_body()),
            )
            .mount(&server)
            .await;

        let connector = connector(&server.uri(), 3);
        assert!(connector.poll_context().poll_once().await);

        let snapshot = connector.health();
        assert_eq!(snapshot.status, ConnectionStatus::Connected);
        assert_eq!(snapshot.rate_limit.as_ref().unwrap().remaining, Some(42));
        assert!(snapshot.last_message_time.is_some());

        // The observation really reached the univariate pipeline.
        connector.aggregator.lock().force_finalize_all();
        let buffer = connector.aggregator.lock().buffer("1m").unwrap();
        let samples = buffer.lock().get_last(1);
        assert_eq!(samples[0].value, 21.5);
    }

    #[tokio::test]
    async fn test_retry_after_replaces_default_spacing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/currentconditions/v1/335315"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/currentconditions/v1/335315"))
            .respond_with(ResponseTemplate::new(200).set_body_json(conditions_body()))
            .mount(&server)
            .await;

        let connector = connector(&server.uri(), 3);
        let started = std::time::Instant::now();
        assert!(connector.poll_context().poll_once().await);
        // Retried after the vendor's 1s, not the 50ms default.
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_undecodable_body_gives_up_the_tick() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/currentconditions/v1/335315"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
            .mount(&server)
            .await;

        let connector = connector(&server.uri(), 3);
        assert!(!connector.poll_context().poll_once().await);

        // Not retryable within the tick: one request, one error.
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
        assert_eq!(connector.health().error_count, 1);
        assert_eq!(connector.health().status, ConnectionStatus::Error);
    }

    #[tokio::test]
    async fn test_exhausted_retries_mark_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/currentconditions/v1/335315"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let connector = connector(&server.uri(), 2);
        assert!(!connector.poll_context().poll_once().await);

        let snapshot = connector.health();
        assert_eq!(snapshot.status, ConnectionStatus::Error);
        assert_eq!(snapshot.error_count, 2);
    }
}
