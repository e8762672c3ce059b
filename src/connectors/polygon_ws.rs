//! Polygon equities streaming connector.
//!
//! Lifecycle: open the socket, authenticate with the API key, wait for
//! `auth_success`, then subscribe `T.<SYMBOL>` trade channels. Inbound frames
//! are JSON arrays carrying one or many events; trades go through the
//! normalizer, status events are logged here.
//!
//! On disconnect the connector can backfill the gap from the range-trade REST
//! endpoint before streaming resumes, so short outages do not punch holes in
//! the candle history.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::{
    retry_after, BackoffCalculator, ConnectionStatus, Connector, HealthSnapshot, HealthState,
    HeartbeatAction, HeartbeatMonitor, SessionState, SessionTracker, StreamSettings,
    TransitionReason,
};
use crate::aggregate::OhlcAggregator;
use crate::models::Tick;
use crate::normalize::{polygon, PolygonNormalizer, TickNormalizer};

pub const DEFAULT_WS_URL: &str = "wss://socket.polygon.io/stocks";
pub const DEFAULT_REST_BASE: &str = "https://api.polygon.io";

/// Maximum rows per range-trade page; the vendor caps at 50000.
const BACKFILL_PAGE_LIMIT: usize = 50_000;
/// Hard ceiling on pages per gap, against runaway ranges.
const BACKFILL_MAX_PAGES: usize = 200;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, Clone)]
pub struct PolygonConfig {
    pub ws_url: String,
    pub rest_base: String,
    pub api_key: String,
    pub symbols: Vec<String>,
    /// Replay missed trades from REST after a disconnect.
    pub backfill_enabled: bool,
    /// Minimum outage length worth a backfill request.
    pub gap_threshold: Duration,
    pub settings: StreamSettings,
}

impl PolygonConfig {
    pub fn new(api_key: impl Into<String>, symbols: Vec<String>) -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            rest_base: DEFAULT_REST_BASE.to_string(),
            api_key: api_key.into(),
            // Tickers arrive uppercased on the wire; store them that way so
            // the aggregator's symbol filter matches.
            symbols: symbols.into_iter().map(|s| s.to_uppercase()).collect(),
            backfill_enabled: true,
            gap_threshold: Duration::from_secs(60),
            settings: StreamSettings::default(),
        }
    }
}

/// Outbound `{"action": ..., "params": ...}` frame (auth and subscriptions).
#[derive(Debug, Clone, Serialize)]
struct ActionFrame {
    action: &'static str,
    params: String,
}

/// Inbound status event; trades are handled by the normalizer instead.
#[derive(Debug, Deserialize)]
struct StatusEvent {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
}

pub struct PolygonConnector {
    config: PolygonConfig,
    symbols: Arc<Mutex<Vec<String>>>,
    aggregators: Vec<Arc<Mutex<OhlcAggregator>>>,
    health: Arc<HealthState>,
    session: Arc<SessionTracker>,
    backfill: Arc<GapBackfill>,
    shutdown_tx: watch::Sender<bool>,
    control_tx: mpsc::UnboundedSender<ActionFrame>,
    control_rx: Mutex<Option<mpsc::UnboundedReceiver<ActionFrame>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PolygonConnector {
    pub fn new(
        config: PolygonConfig,
        aggregators: Vec<Arc<Mutex<OhlcAggregator>>>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build polygon REST client")?;
        let backfill = Arc::new(GapBackfill {
            client,
            rest_base: config.rest_base.clone(),
            api_key: config.api_key.clone(),
            page_limit: BACKFILL_PAGE_LIMIT,
            max_retries: 3,
        });
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            symbols: Arc::new(Mutex::new(config.symbols.clone())),
            config,
            aggregators,
            health: Arc::new(HealthState::new()),
            session: Arc::new(SessionTracker::new("polygon")),
            backfill,
            shutdown_tx,
            control_tx,
            control_rx: Mutex::new(Some(control_rx)),
            task: Mutex::new(None),
        })
    }

    fn channel_params(symbols: &[String]) -> String {
        symbols
            .iter()
            .map(|s| format!("T.{}", s.to_uppercase()))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn send_control(&self, action: &'static str, params: String) -> Result<()> {
        if self.session.state() != SessionState::Receiving {
            debug!(action, "not connected, subscription change deferred to reconnect");
            return Ok(());
        }
        self.control_tx
            .send(ActionFrame { action, params })
            .context("polygon control channel closed")
    }
}

#[async_trait]
impl Connector for PolygonConnector {
    fn name(&self) -> &'static str {
        "polygon"
    }

    async fn connect(&self) -> Result<()> {
        let mut task = self.task.lock();
        if task.is_some() {
            return Ok(());
        }
        let control_rx = self
            .control_rx
            .lock()
            .take()
            .context("polygon connector already consumed its control channel")?;

        let ctx = RunContext {
            config: self.config.clone(),
            symbols: self.symbols.clone(),
            aggregators: self.aggregators.clone(),
            health: self.health.clone(),
            session: self.session.clone(),
            backfill: self.backfill.clone(),
            shutdown: self.shutdown_tx.subscribe(),
            control_rx,
        };
        info!(url = %self.config.ws_url, "🔌 starting polygon stream");
        *task = Some(tokio::spawn(ctx.run()));
        Ok(())
    }

    fn health(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    async fn shutdown(&self) {
        self.session
            .transition(SessionState::Terminating, TransitionReason::ShutdownRequested);
        let _ = self.shutdown_tx.send(true);

        let task = self.task.lock().take();
        if let Some(task) = task {
            if task.await.is_err() {
                warn!("polygon stream task aborted uncleanly");
            }
        }
        self.health.set_status(ConnectionStatus::Disconnected);
        self.session
            .transition(SessionState::Closed, TransitionReason::ShutdownRequested);
    }

    async fn add_symbols(&self, symbols: &[String]) -> Result<()> {
        let added: Vec<String> = {
            let mut current = self.symbols.lock();
            let new: Vec<String> = symbols
                .iter()
                .filter(|s| !current.contains(s))
                .cloned()
                .collect();
            current.extend(new.iter().cloned());
            new
        };
        if added.is_empty() {
            return Ok(());
        }
        self.send_control("subscribe", Self::channel_params(&added))
    }

    async fn remove_symbols(&self, symbols: &[String]) -> Result<()> {
        {
            let mut current = self.symbols.lock();
            current.retain(|s| !symbols.contains(s));
        }
        self.send_control("unsubscribe", Self::channel_params(symbols))
    }
}

struct RunContext {
    config: PolygonConfig,
    symbols: Arc<Mutex<Vec<String>>>,
    aggregators: Vec<Arc<Mutex<OhlcAggregator>>>,
    health: Arc<HealthState>,
    session: Arc<SessionTracker>,
    backfill: Arc<GapBackfill>,
    shutdown: watch::Receiver<bool>,
    control_rx: mpsc::UnboundedReceiver<ActionFrame>,
}

impl RunContext {
    async fn run(mut self) {
        let mut backoff = BackoffCalculator::new(&self.config.settings);

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            self.session
                .transition(SessionState::Connecting, TransitionReason::Started);

            let reason = match timeout(
                self.config.settings.connect_timeout,
                connect_async(self.config.ws_url.as_str()),
            )
            .await
            {
                Ok(Ok((ws, _response))) => {
                    let (mut write, mut read) = ws.split();
                    match self.authenticate(&mut write, &mut read).await {
                        Ok(()) => {
                            backoff.reset();
                            self.health.set_status(ConnectionStatus::Connected);
                            let reason = self.stream_loop(&mut write, &mut read).await;
                            self.health.set_status(ConnectionStatus::Disconnected);
                            reason
                        }
                        Err(reason) => {
                            self.health.record_error();
                            self.health.set_status(ConnectionStatus::Error);
                            reason
                        }
                    }
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "polygon connect failed");
                    self.health.record_error();
                    self.health.set_status(ConnectionStatus::Error);
                    TransitionReason::NetworkError
                }
                Err(_) => {
                    warn!(
                        timeout_secs = self.config.settings.connect_timeout.as_secs(),
                        "polygon connect timed out"
                    );
                    self.health.record_error();
                    self.health.set_status(ConnectionStatus::Error);
                    TransitionReason::ConnectTimeout
                }
            };

            if reason == TransitionReason::ShutdownRequested || *self.shutdown.borrow() {
                break;
            }

            // The feed is down; recover what the outage dropped before the
            // next attempt. Shutdown must not wait on a REST crawl.
            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = self.backfill_gap() => {}
                _ = shutdown.changed() => break,
            }

            match backoff.next_backoff() {
                Some(delay) => {
                    self.session.transition(SessionState::Reconnecting, reason);
                    debug!(delay_ms = delay.as_millis() as u64, "polygon reconnect backoff");
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = self.shutdown.changed() => break,
                    }
                }
                None => {
                    error!(
                        attempts = backoff.attempt(),
                        "polygon reconnect attempts exhausted, giving up"
                    );
                    self.session
                        .transition(SessionState::Closed, TransitionReason::AttemptsExhausted);
                    self.health.set_status(ConnectionStatus::Error);
                    return;
                }
            }
        }

        self.session
            .transition(SessionState::Closed, TransitionReason::ShutdownRequested);
    }

    /// Auth handshake: send the key, wait for `auth_success`, then subscribe.
    async fn authenticate(
        &mut self,
        write: &mut WsSink,
        read: &mut WsSource,
    ) -> std::result::Result<(), TransitionReason> {
        self.session
            .transition(SessionState::Authenticating, TransitionReason::ConnectSuccess);

        let auth = ActionFrame {
            action: "auth",
            params: self.config.api_key.clone(),
        };
        let json = serde_json::to_string(&auth).expect("auth frame serializes");
        if write.send(Message::Text(json)).await.is_err() {
            return Err(TransitionReason::NetworkError);
        }

        let deadline = self.config.settings.connect_timeout;
        let wait = timeout(deadline, async {
            while let Some(message) = read.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => return Err(TransitionReason::NetworkError),
                    _ => continue,
                };
                let events: Vec<serde_json::Value> =
                    serde_json::from_str(&text).unwrap_or_default();
                for event in &events {
                    if event.get("ev").and_then(serde_json::Value::as_str) != Some("status") {
                        continue;
                    }
                    let status: StatusEvent =
                        serde_json::from_value(event.clone()).unwrap_or(StatusEvent {
                            status: String::new(),
                            message: String::new(),
                        });
                    match status.status.as_str() {
                        "auth_success" => {
                            info!("✅ polygon authenticated");
                            return Ok(());
                        }
                        "auth_failed" => {
                            error!(message = %status.message, "polygon auth rejected");
                            return Err(TransitionReason::AuthRejected);
                        }
                        other => debug!(status = other, message = %status.message, "polygon status"),
                    }
                }
            }
            Err(TransitionReason::NetworkError)
        })
        .await;

        match wait {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => return Err(reason),
            Err(_) => {
                warn!("polygon auth timed out");
                return Err(TransitionReason::AuthTimeout);
            }
        }

        self.session
            .transition(SessionState::Subscribing, TransitionReason::AuthSuccess);
        let channels = PolygonConnector::channel_params(&self.symbols.lock());
        let subscribe = ActionFrame {
            action: "subscribe",
            params: channels.clone(),
        };
        let json = serde_json::to_string(&subscribe).expect("subscribe frame serializes");
        if write.send(Message::Text(json)).await.is_err() {
            return Err(TransitionReason::NetworkError);
        }
        info!(channels = %channels, "📡 polygon subscribed");
        self.session
            .transition(SessionState::Receiving, TransitionReason::SubscribeSent);
        Ok(())
    }

    async fn stream_loop(
        &mut self,
        write: &mut WsSink,
        read: &mut WsSource,
    ) -> TransitionReason {
        let mut heartbeat = HeartbeatMonitor::new(self.config.settings.ping_interval);
        heartbeat.reset();
        let mut heartbeat_timer = interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        heartbeat.record_frame();
                        self.handle_frame(&text);
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        heartbeat.record_frame();
                        if write.send(Message::Pong(payload)).await.is_err() {
                            self.health.record_error();
                            return TransitionReason::NetworkError;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => heartbeat.record_frame(),
                    Some(Ok(Message::Close(frame))) => {
                        info!(?frame, "polygon stream closed by server");
                        return TransitionReason::ServerClose;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "polygon read error");
                        self.health.record_error();
                        return TransitionReason::NetworkError;
                    }
                    None => return TransitionReason::ServerClose,
                },
                frame = self.control_rx.recv() => {
                    if let Some(frame) = frame {
                        match serde_json::to_string(&frame) {
                            Ok(json) => {
                                info!(action = frame.action, params = %frame.params,
                                    "📡 subscription change");
                                if write.send(Message::Text(json)).await.is_err() {
                                    self.health.record_error();
                                    return TransitionReason::NetworkError;
                                }
                            }
                            Err(e) => warn!(error = %e, "failed to encode action frame"),
                        }
                    }
                }
                _ = heartbeat_timer.tick() => match heartbeat.check() {
                    HeartbeatAction::Ok => {}
                    HeartbeatAction::SendPing => {
                        if write.send(Message::Ping(Vec::new())).await.is_err() {
                            self.health.record_error();
                            return TransitionReason::NetworkError;
                        }
                        heartbeat.record_ping_sent();
                    }
                    HeartbeatAction::ForceReconnect => {
                        warn!("no polygon frames for 3x the ping interval, forcing reconnect");
                        self.health.record_error();
                        let _ = write.send(Message::Close(None)).await;
                        return TransitionReason::StaleData;
                    }
                },
                _ = self.shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return TransitionReason::ShutdownRequested;
                }
            }
        }
    }

    /// One inbound frame: an array of one or many events.
    fn handle_frame(&self, text: &str) {
        let events: Vec<serde_json::Value> = match serde_json::from_str(text) {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "dropping undecodable polygon frame");
                self.health.record_error();
                return;
            }
        };

        for event in &events {
            if event.get("ev").and_then(serde_json::Value::as_str) == Some("status") {
                let status = event.get("status").and_then(serde_json::Value::as_str);
                let message = event.get("message").and_then(serde_json::Value::as_str);
                info!(status = ?status, message = ?message, "polygon status event");
                continue;
            }
            match PolygonNormalizer.normalize(event) {
                Some(tick) => {
                    self.health.record_message();
                    for aggregator in &self.aggregators {
                        aggregator.lock().add_tick(&tick);
                    }
                }
                None => debug!("skipping unrecognized polygon event"),
            }
        }
    }

    /// Replay trades dropped during the outage, oldest first.
    async fn backfill_gap(&self) {
        if !self.config.backfill_enabled {
            return;
        }
        let Some(last_message) = self.health.last_message_time() else {
            return;
        };
        let Some((from, to)) = gap_range(last_message, Utc::now(), self.config.gap_threshold)
        else {
            return;
        };

        let symbols = self.symbols.lock().clone();
        info!(
            from = %from,
            to = %to,
            symbols = symbols.len(),
            "⏪ backfilling gap from range-trade endpoint"
        );

        for symbol in symbols {
            match self.backfill.fetch_range(&symbol, from, to).await {
                Ok(ticks) => {
                    info!(symbol = %symbol, count = ticks.len(), "backfill replay");
                    for tick in &ticks {
                        for aggregator in &self.aggregators {
                            aggregator.lock().add_tick(tick);
                        }
                    }
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "backfill failed, continuing without it");
                    self.health.record_error();
                }
            }
        }
    }
}

/// Gap worth backfilling, as `(from, to)` bounds. `None` when the outage was
/// shorter than the threshold.
pub(crate) fn gap_range(
    last_message: DateTime<Utc>,
    now: DateTime<Utc>,
    threshold: Duration,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let gap = now.signed_duration_since(last_message);
    if gap > chrono::Duration::from_std(threshold).ok()? {
        Some((last_message, now))
    } else {
        None
    }
}

/// Range-trade REST client used to recover ticks missed during an outage.
pub struct GapBackfill {
    client: reqwest::Client,
    rest_base: String,
    api_key: String,
    page_limit: usize,
    max_retries: u32,
}

#[derive(Debug, Deserialize)]
struct TradesPage {
    #[serde(default)]
    results: Vec<RestTrade>,
}

#[derive(Debug, Deserialize)]
struct RestTrade {
    #[serde(default)]
    participant_timestamp: Option<i64>,
    #[serde(default)]
    sip_timestamp: Option<i64>,
    price: f64,
    #[serde(default)]
    size: Option<f64>,
}

impl RestTrade {
    fn timestamp_ns(&self) -> Option<i64> {
        self.participant_timestamp.or(self.sip_timestamp)
    }
}

impl GapBackfill {
    /// All trades for `symbol` in `[from, to]`, sorted by timestamp.
    ///
    /// Pages with `timestamp.gte`/`timestamp.lte` filters, advancing the
    /// lower bound past the last observed timestamp so a full page can never
    /// loop forever.
    pub async fn fetch_range(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Tick>> {
        let mut gte_ns = from
            .timestamp_nanos_opt()
            .context("backfill range start out of nanosecond range")?;
        let lte_ns = to
            .timestamp_nanos_opt()
            .context("backfill range end out of nanosecond range")?;

        let mut ticks: Vec<Tick> = Vec::new();

        for _page in 0..BACKFILL_MAX_PAGES {
            let page = self.fetch_page(symbol, gte_ns, lte_ns).await?;
            let count = page.results.len();

            let mut max_ts_ns = gte_ns;
            for trade in &page.results {
                let Some(ts_ns) = trade.timestamp_ns() else {
                    continue;
                };
                max_ts_ns = max_ts_ns.max(ts_ns);
                ticks.push(Tick::new(
                    Utc.timestamp_nanos(ts_ns),
                    trade.price,
                    trade.size.filter(|s| *s >= 0.0),
                    symbol,
                    polygon::SOURCE,
                ));
            }

            if count < self.page_limit {
                break;
            }
            gte_ns = max_ts_ns.saturating_add(1);
            if gte_ns > lte_ns {
                break;
            }
        }

        ticks.sort_by_key(|t| t.timestamp);
        Ok(ticks)
    }

    async fn fetch_page(&self, symbol: &str, gte_ns: i64, lte_ns: i64) -> Result<TradesPage> {
        let url = format!("{}/v3/trades/{}", self.rest_base, symbol);
        let mut attempt: u32 = 0;

        loop {
            let result = self
                .client
                .get(&url)
                .query(&[
                    ("timestamp.gte", gte_ns.to_string()),
                    ("timestamp.lte", lte_ns.to_string()),
                    ("limit", self.page_limit.to_string()),
                    ("apiKey", self.api_key.clone()),
                ])
                .send()
                .await;

            let retry_delay = match result {
                Ok(response) if response.status().is_success() => {
                    return response
                        .json::<TradesPage>()
                        .await
                        .context("failed to parse range-trade page");
                }
                Ok(response) if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS => {
                    let delay =
                        retry_after(response.headers()).unwrap_or(Duration::from_secs(5));
                    warn!(delay_secs = delay.as_secs(), "backfill rate limited");
                    delay
                }
                Ok(response) => {
                    let status = response.status();
                    warn!(%status, "backfill request failed");
                    Duration::from_secs(1 << attempt.min(4))
                }
                Err(e) => {
                    warn!(error = %e, "backfill request error");
                    Duration::from_secs(1 << attempt.min(4))
                }
            };

            attempt += 1;
            if attempt > self.max_retries {
                bail!("backfill for {symbol} failed after {attempt} attempts");
            }
            sleep(retry_delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TimeframeNetwork;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn connector(symbols: &[&str]) -> PolygonConnector {
        let config = PolygonConfig::new("test-key", symbols.iter().map(|s| s.to_string()).collect());
        let aggregators = symbols
            .iter()
            .map(|s| {
                Arc::new(Mutex::new(OhlcAggregator::new(
                    s.to_string(),
                    TimeframeNetwork::intraday(),
                )))
            })
            .collect();
        PolygonConnector::new(config, aggregators).unwrap()
    }

    #[test]
    fn test_action_frame_shapes() {
        let auth = ActionFrame {
            action: "auth",
            params: "secret".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&auth).unwrap(),
            r#"{"action":"auth","params":"secret"}"#
        );

        let channels = PolygonConnector::channel_params(&[
            "aapl".to_string(),
            "MSFT".to_string(),
        ]);
        assert_eq!(channels, "T.AAPL,T.MSFT");
    }

    #[test]
    fn test_gap_range_threshold() {
        let t = Utc.timestamp_opt(1_735_700_400, 0).unwrap();

        // 70s outage with a 60s threshold: backfill [T, T+70].
        let range = gap_range(t, t + chrono::Duration::seconds(70), Duration::from_secs(60));
        let (from, to) = range.unwrap();
        assert_eq!(from, t);
        assert_eq!(to, t + chrono::Duration::seconds(70));

        // Short outage: no request.
        assert!(gap_range(t, t + chrono::Duration::seconds(30), Duration::from_secs(60)).is_none());
    }

    #[test]
    fn test_array_frame_feeds_trades_and_logs_status() {
        let c = connector(&["AAPL"]);
        let ctx = RunContext {
            config: c.config.clone(),
            symbols: c.symbols.clone(),
            aggregators: c.aggregators.clone(),
            health: c.health.clone(),
            session: c.session.clone(),
            backfill: c.backfill.clone(),
            shutdown: c.shutdown_tx.subscribe(),
            control_rx: c.control_rx.lock().take().unwrap(),
        };

        ctx.handle_frame(
            r#"[{"ev":"status","status":"connected","message":"Connected Successfully"},
                {"ev":"T","sym":"AAPL","p":187.53,"s":100,"t":1735700400250},
                {"ev":"T","sym":"AAPL","p":187.60,"s":50,"t":1735700400900}]"#,
        );

        assert!(c.health.last_message_time().is_some());
        assert_eq!(c.health.error_count(), 0);
    }

    #[tokio::test]
    async fn test_backfill_paginates_and_sorts() {
        let server = MockServer::start().await;
        let from = Utc.timestamp_opt(1_735_700_400, 0).unwrap();
        let to = from + chrono::Duration::seconds(70);
        let base_ns = from.timestamp_nanos_opt().unwrap();

        // First page is full (page_limit = 2), deliberately out of order.
        Mock::given(method("GET"))
            .and(path("/v3/trades/AAPL"))
            .and(query_param("timestamp.gte", base_ns.to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [
                    {"participant_timestamp": base_ns + 2_000_000_000i64, "price": 187.6, "size": 50.0},
                    {"participant_timestamp": base_ns + 1_000_000_000i64, "price": 187.5, "size": 100.0}
                ]
            })))
            .mount(&server)
            .await;

        // Second page starts past the last observed timestamp and is short,
        // ending the pagination.
        Mock::given(method("GET"))
            .and(path("/v3/trades/AAPL"))
            .and(query_param(
                "timestamp.gte",
                (base_ns + 2_000_000_001i64).to_string(),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [
                    {"participant_timestamp": base_ns + 3_000_000_000i64, "price": 187.7}
                ]
            })))
            .mount(&server)
            .await;

        let backfill = GapBackfill {
            client: reqwest::Client::new(),
            rest_base: server.uri(),
            api_key: "test-key".to_string(),
            page_limit: 2,
            max_retries: 3,
        };

        let ticks = backfill.fetch_range("AAPL", from, to).await.unwrap();
        assert_eq!(ticks.len(), 3);
        let prices: Vec<f64> = ticks.iter().map(|t| t.price).collect();
        assert_eq!(prices, vec![187.5, 187.6, 187.7]);
        assert!(ticks.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(ticks[2].size, None);
        assert_eq!(ticks[0].source, "polygon");
    }

    #[tokio::test]
    async fn test_backfill_honors_retry_after_on_429() {
        let server = MockServer::start().await;
        let from = Utc.timestamp_opt(1_735_700_400, 0).unwrap();
        let to = from + chrono::Duration::seconds(70);

        Mock::given(method("GET"))
            .and(path("/v3/trades/MSFT"))
            .respond_with(
                ResponseTemplate::new(429).insert_header("Retry-After", "1"),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v3/trades/MSFT"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [
                    {"sip_timestamp": from.timestamp_nanos_opt().unwrap() + 1, "price": 430.1, "size": 10.0}
                ]
            })))
            .mount(&server)
            .await;

        let backfill = GapBackfill {
            client: reqwest::Client::new(),
            rest_base: server.uri(),
            api_key: "test-key".to_string(),
            page_limit: 100,
            max_retries: 3,
        };

        let started = std::time::Instant::now();
        let ticks = backfill.fetch_range("MSFT", from, to).await.unwrap();
        assert_eq!(ticks.len(), 1);
        assert!(started.elapsed() >= Duration::from_secs(1));
    }
}
