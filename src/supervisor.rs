//! Supervising runtime.
//!
//! Builds one pipeline per selected source (aggregators + connector +
//! dispatcher), runs the periodic dispatch and health-report loops, and owns
//! graceful shutdown: on SIGINT/SIGTERM every aggregator force-finalizes its
//! open candles, every connector is shut down best-effort, and the loops are
//! stopped.

use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::aggregate::{BufferHandle, OhlcAggregator, UnivariateAggregator};
use crate::causal::CausalApiClient;
use crate::config::Settings;
use crate::connectors::accuweather::AccuweatherConnector;
use crate::connectors::binance_ws::BinanceConnector;
use crate::connectors::bloomberg::BloombergConnector;
use crate::connectors::polygon_ws::PolygonConnector;
use crate::connectors::Connector;
use crate::error::FeedError;
use crate::models::{Candle, Sample, TimeframeNetwork};

/// Dispatch work for one pipeline: every (buffer, label, seconds) triple the
/// causal client should visit per cycle.
struct DispatchSet {
    client: Arc<CausalApiClient>,
    candles: Vec<(BufferHandle<Candle>, String, u64)>,
    samples: Vec<(BufferHandle<Sample>, String, u64)>,
}

struct Pipeline {
    name: &'static str,
    connector: Arc<dyn Connector>,
    ohlc: Vec<Arc<Mutex<OhlcAggregator>>>,
    univariate: Vec<Arc<Mutex<UnivariateAggregator>>>,
    dispatch: DispatchSet,
}

pub struct Supervisor {
    settings: Settings,
    pipelines: Vec<Pipeline>,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("pipelines", &self.pipelines.len())
            .finish()
    }
}

impl Supervisor {
    pub fn new(settings: Settings) -> Result<Self> {
        let mut pipelines = Vec::new();

        for source in settings.connector.sources() {
            match *source {
                "binance" => match &settings.binance {
                    Some(config) => pipelines.push(build_binance(&settings, config.clone())?),
                    None => warn!("binance selected but not configured, skipping"),
                },
                "polygon" => match &settings.polygon {
                    Some(config) => pipelines.push(build_polygon(&settings, config.clone())?),
                    None => warn!("polygon selected but POLYGON_API_KEY is missing, skipping"),
                },
                "accuweather" => match &settings.accuweather {
                    Some(config) => pipelines.push(build_accuweather(&settings, config.clone())?),
                    None => warn!(
                        "accuweather selected but ACCUWEATHER_API_KEY/ACCUWEATHER_LOCATION_KEY \
                         are missing, skipping"
                    ),
                },
                "bloomberg" => match &settings.bloomberg {
                    Some(config) => pipelines.push(build_bloomberg(&settings, config.clone())?),
                    None => warn!("bloomberg selected but not configured, skipping"),
                },
                other => unreachable!("unknown source '{other}'"),
            }
        }

        if pipelines.is_empty() {
            return Err(FeedError::Config(format!(
                "no connector could be constructed for '{}'",
                settings.connector
            ))
            .into());
        }

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            settings,
            pipelines,
            shutdown_tx,
        })
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    /// Bring every pipeline online and run until SIGINT/SIGTERM.
    pub async fn run(self) -> Result<()> {
        for pipeline in &self.pipelines {
            pipeline
                .connector
                .connect()
                .await
                .with_context(|| format!("failed to start {} connector", pipeline.name))?;
        }
        info!(
            pipelines = self.pipelines.len(),
            kind = %self.settings.connector,
            "🚀 ingestion pipelines online"
        );

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        for pipeline in &self.pipelines {
            tasks.push(tokio::spawn(dispatch_loop(
                pipeline.name,
                DispatchSet {
                    client: pipeline.dispatch.client.clone(),
                    candles: pipeline.dispatch.candles.clone(),
                    samples: pipeline.dispatch.samples.clone(),
                },
                self.settings.dispatch_interval,
                self.shutdown_tx.subscribe(),
            )));
            tasks.push(tokio::spawn(health_loop(
                pipeline.name,
                pipeline.connector.clone(),
                self.settings.health_interval,
                self.shutdown_tx.subscribe(),
            )));
        }

        wait_for_termination().await?;
        info!("🛑 termination signal received, shutting down");
        let _ = self.shutdown_tx.send(true);

        // Flush open windows first so the final candles are not lost, then
        // close the sources.
        for pipeline in &self.pipelines {
            for aggregator in &pipeline.ohlc {
                aggregator.lock().force_finalize_all();
            }
            for aggregator in &pipeline.univariate {
                aggregator.lock().force_finalize_all();
            }
        }
        for pipeline in &self.pipelines {
            pipeline.connector.shutdown().await;
            info!(connector = pipeline.name, "connector stopped");
        }
        for task in tasks {
            task.abort();
        }

        info!("shutdown complete");
        Ok(())
    }
}

fn build_binance(
    settings: &Settings,
    config: crate::connectors::binance_ws::BinanceConfig,
) -> Result<Pipeline> {
    let network = TimeframeNetwork::intraday();
    let ohlc = ohlc_aggregators(&config.symbols, &network);
    let connector = Arc::new(BinanceConnector::new(config, ohlc.clone()));
    let client = Arc::new(CausalApiClient::new(
        settings.causal_url.clone(),
        settings.causal_api_key.clone(),
    )?);
    Ok(Pipeline {
        name: "binance",
        connector,
        dispatch: DispatchSet {
            client,
            candles: candle_targets(&ohlc, &network),
            samples: Vec::new(),
        },
        ohlc,
        univariate: Vec::new(),
    })
}

fn build_polygon(
    settings: &Settings,
    config: crate::connectors::polygon_ws::PolygonConfig,
) -> Result<Pipeline> {
    let network = TimeframeNetwork::intraday();
    let ohlc = ohlc_aggregators(&config.symbols, &network);
    let connector = Arc::new(PolygonConnector::new(config, ohlc.clone())?);
    let client = Arc::new(CausalApiClient::new(
        settings.causal_url.clone(),
        settings.causal_api_key.clone(),
    )?);
    Ok(Pipeline {
        name: "polygon",
        connector,
        dispatch: DispatchSet {
            client,
            candles: candle_targets(&ohlc, &network),
            samples: Vec::new(),
        },
        ohlc,
        univariate: Vec::new(),
    })
}

fn build_accuweather(
    settings: &Settings,
    config: crate::connectors::accuweather::AccuweatherConfig,
) -> Result<Pipeline> {
    let network = TimeframeNetwork::weather();
    let aggregator = Arc::new(Mutex::new(UnivariateAggregator::new(
        config.location_key.clone(),
        network.clone(),
    )));
    let connector = Arc::new(AccuweatherConnector::new(config, aggregator.clone())?);
    let client = Arc::new(CausalApiClient::new(
        settings.causal_univariate_url.clone(),
        settings.causal_api_key.clone(),
    )?);

    let mut samples = Vec::new();
    {
        let aggregator = aggregator.lock();
        for tf in network.timeframes() {
            if let Some(buffer) = aggregator.buffer(&tf.label) {
                samples.push((buffer, tf.label.clone(), tf.seconds));
            }
        }
    }

    Ok(Pipeline {
        name: "accuweather",
        connector,
        dispatch: DispatchSet {
            client,
            candles: Vec::new(),
            samples,
        },
        ohlc: Vec::new(),
        univariate: vec![aggregator],
    })
}

fn build_bloomberg(
    settings: &Settings,
    config: crate::connectors::bloomberg::BloombergConfig,
) -> Result<Pipeline> {
    let network = TimeframeNetwork::intraday();
    let ohlc = ohlc_aggregators(&config.securities, &network);
    let connector = Arc::new(BloombergConnector::new(config, ohlc.clone()));
    let client = Arc::new(CausalApiClient::new(
        settings.causal_url.clone(),
        settings.causal_api_key.clone(),
    )?);
    Ok(Pipeline {
        name: "bloomberg",
        connector,
        dispatch: DispatchSet {
            client,
            candles: candle_targets(&ohlc, &network),
            samples: Vec::new(),
        },
        ohlc,
        univariate: Vec::new(),
    })
}

fn ohlc_aggregators(
    symbols: &[String],
    network: &TimeframeNetwork,
) -> Vec<Arc<Mutex<OhlcAggregator>>> {
    symbols
        .iter()
        .map(|symbol| {
            Arc::new(Mutex::new(OhlcAggregator::new(
                symbol.clone(),
                network.clone(),
            )))
        })
        .collect()
}

fn candle_targets(
    aggregators: &[Arc<Mutex<OhlcAggregator>>],
    network: &TimeframeNetwork,
) -> Vec<(BufferHandle<Candle>, String, u64)> {
    let mut targets = Vec::new();
    for aggregator in aggregators {
        let aggregator = aggregator.lock();
        for tf in network.timeframes() {
            if let Some(buffer) = aggregator.buffer(&tf.label) {
                targets.push((buffer, tf.label.clone(), tf.seconds));
            }
        }
    }
    targets
}

/// Periodic dispatch: one independent causal-API call per timeframe buffer.
/// A failed call is dropped; the next cycle is its retry.
async fn dispatch_loop(
    name: &'static str,
    set: DispatchSet,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for (buffer, label, seconds) in &set.candles {
                    match set.client.send_candles(buffer, label, *seconds).await {
                        Ok(Some(detection)) if detection.chain_detected != 0 => info!(
                            pipeline = name,
                            timeframe = %label,
                            signal = detection.chain_detected,
                            at = %detection.datetime,
                            "⚡ causal chain detected"
                        ),
                        Ok(Some(_)) => debug!(pipeline = name, timeframe = %label, "no chain"),
                        Ok(None) => {}
                        Err(e) => warn!(
                            pipeline = name,
                            timeframe = %label,
                            error = %e,
                            "dispatch failed"
                        ),
                    }
                }
                for (buffer, label, seconds) in &set.samples {
                    match set.client.send_samples(buffer, label, *seconds).await {
                        Ok(Some(detection)) if detection.chain_detected != 0 => info!(
                            pipeline = name,
                            timeframe = %label,
                            signal = detection.chain_detected,
                            at = %detection.datetime,
                            "⚡ causal chain detected"
                        ),
                        Ok(Some(_)) => debug!(pipeline = name, timeframe = %label, "no chain"),
                        Ok(None) => {}
                        Err(e) => warn!(
                            pipeline = name,
                            timeframe = %label,
                            error = %e,
                            "dispatch failed"
                        ),
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Periodic health report per connector.
async fn health_loop(
    name: &'static str,
    connector: Arc<dyn Connector>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let health = connector.health();
                info!(
                    connector = name,
                    status = %health.status,
                    errors = health.error_count,
                    uptime_ms = health.uptime_ms,
                    last_message = ?health.last_message_time,
                    rate_limit_remaining = health
                        .rate_limit
                        .as_ref()
                        .and_then(|rl| rl.remaining),
                    "health"
                );
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn wait_for_termination() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("failed to listen for ctrl-c")?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for ctrl-c")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectorKind;
    use crate::connectors::bloomberg::BloombergConfig;

    fn base_settings(kind: ConnectorKind) -> Settings {
        Settings {
            connector: kind,
            causal_url: "http://localhost:9000/analyze".to_string(),
            causal_univariate_url: "http://localhost:9000/analyze/univariate".to_string(),
            causal_api_key: None,
            dispatch_interval: Duration::from_secs(60),
            health_interval: Duration::from_secs(30),
            binance: Some(Default::default()),
            polygon: None,
            accuweather: None,
            bloomberg: Some(BloombergConfig::new(vec!["IBM US Equity".to_string()])),
        }
    }

    #[test]
    fn test_missing_credentials_skip_sources() {
        // `all` with polygon/accuweather unconfigured: two pipelines remain.
        let supervisor = Supervisor::new(base_settings(ConnectorKind::All)).unwrap();
        assert_eq!(supervisor.pipeline_count(), 2);
    }

    #[test]
    fn test_unconstructible_selection_is_fatal() {
        let settings = base_settings(ConnectorKind::Polygon);
        let err = Supervisor::new(settings).unwrap_err();
        assert!(err.to_string().contains("no connector"));
    }

    #[test]
    fn test_both_builds_available_streams() {
        // `both` = polygon + binance; polygon is unconfigured here.
        let supervisor = Supervisor::new(base_settings(ConnectorKind::Both)).unwrap();
        assert_eq!(supervisor.pipeline_count(), 1);
    }

    #[test]
    fn test_dispatch_targets_cover_every_timeframe() {
        let supervisor = Supervisor::new(base_settings(ConnectorKind::Binance)).unwrap();
        let pipeline = &supervisor.pipelines[0];
        // One symbol x seven intraday timeframes.
        assert_eq!(pipeline.dispatch.candles.len(), 7);
        assert!(pipeline.dispatch.samples.is_empty());
    }
}
