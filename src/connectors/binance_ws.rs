//! Binance crypto streaming connector.
//!
//! Connects to the multiplexed stream endpoint
//! (`wss://…/stream?streams=btcusdt@aggTrade/…`), feeds trade events through
//! the normalizer into the pipeline's aggregators, and keeps the connection
//! alive with protocol pings. Dynamic symbol changes go out as
//! SUBSCRIBE/UNSUBSCRIBE control frames with a client-chosen id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::{
    BackoffCalculator, ConnectionStatus, Connector, HealthSnapshot, HealthState, HeartbeatAction,
    HeartbeatMonitor, SessionState, SessionTracker, StreamSettings, TransitionReason,
};
use crate::aggregate::OhlcAggregator;
use crate::normalize::{BinanceNormalizer, TickNormalizer};

pub const DEFAULT_WS_BASE: &str = "wss://stream.binance.com:9443";

/// Stream kinds this connector subscribes to per symbol.
pub const STREAM_TRADE: &str = "trade";
pub const STREAM_AGG_TRADE: &str = "aggTrade";

#[derive(Debug, Clone)]
pub struct BinanceConfig {
    pub ws_base: String,
    pub symbols: Vec<String>,
    /// Stream kind appended to each symbol, e.g. `aggTrade`.
    pub stream: String,
    pub settings: StreamSettings,
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            ws_base: DEFAULT_WS_BASE.to_string(),
            symbols: vec!["BTCUSDT".to_string()],
            stream: STREAM_AGG_TRADE.to_string(),
            settings: StreamSettings::default(),
        }
    }
}

/// SUBSCRIBE / UNSUBSCRIBE control frame.
#[derive(Debug, Clone, Serialize)]
struct ControlFrame {
    method: &'static str,
    params: Vec<String>,
    id: u64,
}

pub struct BinanceConnector {
    config: BinanceConfig,
    symbols: Arc<Mutex<Vec<String>>>,
    aggregators: Vec<Arc<Mutex<OhlcAggregator>>>,
    health: Arc<HealthState>,
    session: Arc<SessionTracker>,
    shutdown_tx: watch::Sender<bool>,
    control_tx: mpsc::UnboundedSender<ControlFrame>,
    control_rx: Mutex<Option<mpsc::UnboundedReceiver<ControlFrame>>>,
    next_id: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BinanceConnector {
    pub fn new(config: BinanceConfig, aggregators: Vec<Arc<Mutex<OhlcAggregator>>>) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            symbols: Arc::new(Mutex::new(config.symbols.clone())),
            config,
            aggregators,
            health: Arc::new(HealthState::new()),
            session: Arc::new(SessionTracker::new("binance")),
            shutdown_tx,
            control_tx,
            control_rx: Mutex::new(Some(control_rx)),
            next_id: AtomicU64::new(1),
            task: Mutex::new(None),
        }
    }

    /// Multiplexed stream URL for the current symbol set.
    fn stream_url(&self) -> String {
        let streams: Vec<String> = self
            .symbols
            .lock()
            .iter()
            .map(|s| format!("{}@{}", s.to_lowercase(), self.config.stream))
            .collect();
        format!("{}/stream?streams={}", self.config.ws_base, streams.join("/"))
    }

    fn stream_params(&self, symbols: &[String]) -> Vec<String> {
        symbols
            .iter()
            .map(|s| format!("{}@{}", s.to_lowercase(), self.config.stream))
            .collect()
    }

    fn send_control(&self, method: &'static str, params: Vec<String>) -> Result<()> {
        if self.session.state() != SessionState::Receiving {
            debug!(method, "not connected, subscription change deferred to reconnect");
            return Ok(());
        }
        let frame = ControlFrame {
            method,
            params,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };
        self.control_tx
            .send(frame)
            .context("binance control channel closed")
    }
}

#[async_trait]
impl Connector for BinanceConnector {
    fn name(&self) -> &'static str {
        "binance"
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
            .context("binance connector already consumed its control channel")?;

        let ctx = RunContext {
            url_base: self.config.ws_base.clone(),
            stream: self.config.stream.clone(),
            symbols: self.symbols.clone(),
            settings: self.config.settings.clone(),
            aggregators: self.aggregators.clone(),
            health: self.health.clone(),
            session: self.session.clone(),
            shutdown: self.shutdown_tx.subscribe(),
            control_rx,
        };
        info!(url = %self.stream_url(), "🔌 starting binance stream");
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
                warn!("binance stream task aborted uncleanly");
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
        self.send_control("SUBSCRIBE", self.stream_params(&added))
    }

    async fn remove_symbols(&self, symbols: &[String]) -> Result<()> {
        {
            let mut current = self.symbols.lock();
            current.retain(|s| !symbols.contains(s));
        }
        self.send_control("UNSUBSCRIBE", self.stream_params(symbols))
    }
}

/// Everything the spawned stream task owns.
struct RunContext {
    url_base: String,
    stream: String,
    symbols: Arc<Mutex<Vec<String>>>,
    settings: StreamSettings,
    aggregators: Vec<Arc<Mutex<OhlcAggregator>>>,
    health: Arc<HealthState>,
    session: Arc<SessionTracker>,
    shutdown: watch::Receiver<bool>,
    control_rx: mpsc::UnboundedReceiver<ControlFrame>,
}

impl RunContext {
    fn url(&self) -> String {
        let streams: Vec<String> = self
            .symbols
            .lock()
            .iter()
            .map(|s| format!("{}@{}", s.to_lowercase(), self.stream))
            .collect();
        format!("{}/stream?streams={}", self.url_base, streams.join("/"))
    }

    async fn run(mut self) {
        let mut backoff = BackoffCalculator::new(&self.settings);

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            self.session
                .transition(SessionState::Connecting, TransitionReason::Started);
            let url = self.url();

            let reason = match timeout(self.settings.connect_timeout, connect_async(url.as_str())).await
            {
                Ok(Ok((ws, response))) => {
                    info!(status = %response.status(), "✅ binance stream connected");
                    backoff.reset();
                    self.health.set_status(ConnectionStatus::Connected);
                    self.session
                        .transition(SessionState::Receiving, TransitionReason::ConnectSuccess);

                    let reason = self.stream_loop(ws).await;
                    self.health.set_status(ConnectionStatus::Disconnected);
                    reason
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "binance connect failed");
                    self.health.record_error();
                    self.health.set_status(ConnectionStatus::Error);
                    TransitionReason::NetworkError
                }
                Err(_) => {
                    warn!(
                        timeout_secs = self.settings.connect_timeout.as_secs(),
                        "binance connect timed out"
                    );
                    self.health.record_error();
                    self.health.set_status(ConnectionStatus::Error);
                    TransitionReason::ConnectTimeout
                }
            };

            if reason == TransitionReason::ShutdownRequested || *self.shutdown.borrow() {
                break;
            }

            match backoff.next_backoff() {
                Some(delay) => {
                    self.session.transition(SessionState::Reconnecting, reason);
                    debug!(delay_ms = delay.as_millis() as u64, "binance reconnect backoff");
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = self.shutdown.changed() => break,
                    }
                }
                None => {
                    error!(
                        attempts = backoff.attempt(),
                        "binance reconnect attempts exhausted, giving up"
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

    async fn stream_loop(
        &mut self,
        ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) -> TransitionReason {
        let (mut write, mut read) = ws.split();
        let mut heartbeat = HeartbeatMonitor::new(self.settings.ping_interval);
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
                        info!(?frame, "binance stream closed by server");
                        return TransitionReason::ServerClose;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "binance read error");
                        self.health.record_error();
                        return TransitionReason::NetworkError;
                    }
                    None => return TransitionReason::ServerClose,
                },
                frame = self.control_rx.recv() => {
                    if let Some(frame) = frame {
                        match serde_json::to_string(&frame) {
                            Ok(json) => {
                                info!(method = frame.method, params = ?frame.params, id = frame.id,
                                    "📡 subscription change");
                                if write.send(Message::Text(json)).await.is_err() {
                                    self.health.record_error();
                                    return TransitionReason::NetworkError;
                                }
                            }
                            Err(e) => warn!(error = %e, "failed to encode control frame"),
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
                        warn!("no binance frames for 3x the ping interval, forcing reconnect");
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

    /// One inbound text frame: a control ack or an event payload.
    fn handle_frame(&self, text: &str) {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "dropping undecodable binance frame");
                self.health.record_error();
                return;
            }
        };

        // Control acks look like {"result": null, "id": 3}.
        if value.get("id").is_some() && value.get("e").is_none() && value.get("data").is_none() {
            debug!(frame = %text, "binance control ack");
            return;
        }

        match BinanceNormalizer.normalize(&value) {
            Some(tick) => {
                self.health.record_message();
                for aggregator in &self.aggregators {
                    aggregator.lock().add_tick(&tick);
                }
            }
            None => debug!("skipping non-trade binance event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TimeframeNetwork;

    fn connector(symbols: &[&str]) -> BinanceConnector {
        let config = BinanceConfig {
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        let aggregators = config
            .symbols
            .iter()
            .map(|s| Arc::new(Mutex::new(OhlcAggregator::new(s.clone(), TimeframeNetwork::intraday()))))
            .collect();
        BinanceConnector::new(config, aggregators)
    }

    #[test]
    fn test_multiplexed_stream_url() {
        let c = connector(&["BTCUSDT", "ETHUSDT"]);
        assert_eq!(
            c.stream_url(),
            "wss://stream.binance.com:9443/stream?streams=btcusdt@aggTrade/ethusdt@aggTrade"
        );
    }

    #[test]
    fn test_control_frame_shape() {
        let frame = ControlFrame {
            method: "SUBSCRIBE",
            params: vec!["solusdt@aggTrade".to_string()],
            id: 7,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(
            json,
            r#"{"method":"SUBSCRIBE","params":["solusdt@aggTrade"],"id":7}"#
        );
    }

    #[tokio::test]
    async fn test_subscription_change_is_noop_while_disconnected() {
        let c = connector(&["BTCUSDT"]);
        // Not connected: must not error, must still track the symbol for the
        // next (re)connect URL.
        c.add_symbols(&["SOLUSDT".to_string()]).await.unwrap();
        assert!(c.stream_url().contains("solusdt@aggTrade"));

        c.remove_symbols(&["SOLUSDT".to_string()]).await.unwrap();
        assert!(!c.stream_url().contains("solusdt"));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let c = connector(&["BTCUSDT"]);
        c.shutdown().await;
        c.shutdown().await;
        assert_eq!(c.health().status, ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_inbound_event_reaches_aggregator() {
        let c = connector(&["BTCUSDT"]);
        let ctx = RunContext {
            url_base: c.config.ws_base.clone(),
            stream: c.config.stream.clone(),
            symbols: c.symbols.clone(),
            settings: c.config.settings.clone(),
            aggregators: c.aggregators.clone(),
            health: c.health.clone(),
            session: c.session.clone(),
            shutdown: c.shutdown_tx.subscribe(),
            control_rx: c.control_rx.lock().take().unwrap(),
        };

        ctx.handle_frame(
            r#"{"stream":"btcusdt@aggTrade","data":{"e":"aggTrade","E":1735700400123,"s":"BTCUSDT","p":"97000.5","q":"0.25","T":1735700400100}}"#,
        );
        // Control ack must not count as a message.
        ctx.handle_frame(r#"{"result":null,"id":1}"#);

        assert!(c.health.last_message_time().is_some());

        // The trade opened a window; finalizing lands it in the 1s buffer.
        c.aggregators[0].lock().force_finalize_all();
        let buffer = c.aggregators[0].lock().buffer("1s").unwrap();
        let candles = buffer.lock().get_last(1);
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].close, 97000.5);
        assert_eq!(candles[0].volume, 0.25);
    }
}
