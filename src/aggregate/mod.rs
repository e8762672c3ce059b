//! Multi-timeframe tick aggregation.
//!
//! Each aggregator owns one rolling buffer per configured timeframe and at
//! most one in-progress record per timeframe. A tick whose window differs
//! from the open one (later, or earlier for the rare out-of-order case)
//! finalizes the open record first; finalized candles are never back-patched.
//!
//! Completion listeners run synchronously on the ingest path, after the
//! buffer push. They must not call back into the same aggregator.

pub mod buffer;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use tracing::trace;

pub use buffer::RollingBuffer;

use crate::models::{Candle, Sample, Tick, TimeframeNetwork};

/// Shared handle to one timeframe's buffer. Held briefly for push/get_last.
pub type BufferHandle<T> = Arc<Mutex<RollingBuffer<T>>>;

type Listener<T> = Box<dyn Fn(&T, &str) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct OpenCandle {
    window_start: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    tick_count: u64,
}

impl OpenCandle {
    fn start(window_start: i64, price: f64, size: Option<f64>) -> Self {
        Self {
            window_start,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: size.unwrap_or(0.0),
            tick_count: 1,
        }
    }

    fn apply(&mut self, price: f64, size: Option<f64>) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += size.unwrap_or(0.0);
        self.tick_count += 1;
    }

    fn finalize(&self) -> Candle {
        Candle {
            datetime: Utc
                .timestamp_opt(self.window_start, 0)
                .single()
                .unwrap_or_else(Utc::now),
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }
}

/// Folds normalized ticks into OHLC candles across a timeframe network.
pub struct OhlcAggregator {
    symbol: String,
    network: TimeframeNetwork,
    open_candles: HashMap<String, OpenCandle>,
    buffers: HashMap<String, BufferHandle<Candle>>,
    listeners: Vec<Listener<Candle>>,
}

impl OhlcAggregator {
    pub fn new(symbol: impl Into<String>, network: TimeframeNetwork) -> Self {
        let buffers = network
            .timeframes()
            .iter()
            .map(|tf| {
                (
                    tf.label.clone(),
                    Arc::new(Mutex::new(RollingBuffer::new(tf.capacity))),
                )
            })
            .collect();
        Self {
            symbol: symbol.into(),
            network,
            open_candles: HashMap::new(),
            buffers,
            listeners: Vec::new(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn network(&self) -> &TimeframeNetwork {
        &self.network
    }

    /// Register a callback invoked with `(candle, timeframe_label)` after a
    /// finalized candle lands in its buffer.
    pub fn on_complete(&mut self, listener: impl Fn(&Candle, &str) + Send + Sync + 'static) {
        self.listeners.push(Box::new(listener));
    }

    pub fn buffer(&self, label: &str) -> Option<BufferHandle<Candle>> {
        self.buffers.get(label).cloned()
    }

    /// Fold one tick into every configured timeframe.
    pub fn add_tick(&mut self, tick: &Tick) {
        if tick.symbol != self.symbol {
            trace!(
                got = %tick.symbol,
                expected = %self.symbol,
                "dropping tick for foreign symbol"
            );
            return;
        }

        let windows: Vec<(String, i64)> = self
            .network
            .timeframes()
            .iter()
            .map(|tf| (tf.label.clone(), tf.window_start_secs(tick.timestamp)))
            .collect();

        for (label, window_start) in windows {
            match self.open_candles.get_mut(&label) {
                Some(open) if open.window_start == window_start => {
                    open.apply(tick.price, tick.size);
                }
                Some(_) => {
                    // Window changed (forward or out-of-order): the open
                    // candle is done.
                    let finished = self.open_candles.remove(&label).map(|c| c.finalize());
                    if let Some(candle) = finished {
                        self.commit(&label, candle);
                    }
                    self.open_candles
                        .insert(label, OpenCandle::start(window_start, tick.price, tick.size));
                }
                None => {
                    self.open_candles
                        .insert(label, OpenCandle::start(window_start, tick.price, tick.size));
                }
            }
        }
    }

    /// Finalize every in-progress candle. Idempotent; used on shutdown.
    pub fn force_finalize_all(&mut self) {
        let labels = self.network.labels();
        for label in labels {
            if let Some(open) = self.open_candles.remove(&label) {
                self.commit(&label, open.finalize());
            }
        }
    }

    fn commit(&self, label: &str, candle: Candle) {
        if let Some(buffer) = self.buffers.get(label) {
            buffer.lock().push(candle.clone());
        }
        for listener in &self.listeners {
            listener(&candle, label);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct OpenSample {
    window_start: i64,
    value: f64,
    // Running sum/count are kept for a potential mean-of-window variant;
    // finalization carries the last observation forward.
    sum: f64,
    count: u64,
}

impl OpenSample {
    fn start(window_start: i64, value: f64) -> Self {
        Self {
            window_start,
            value,
            sum: value,
            count: 1,
        }
    }

    fn apply(&mut self, value: f64) {
        self.value = value;
        self.sum += value;
        self.count += 1;
    }

    fn finalize(&self) -> Sample {
        Sample {
            datetime: Utc
                .timestamp_opt(self.window_start, 0)
                .single()
                .unwrap_or_else(Utc::now),
            value: self.value,
        }
    }
}

/// Univariate counterpart of [`OhlcAggregator`] for single-value sources.
pub struct UnivariateAggregator {
    symbol: String,
    network: TimeframeNetwork,
    open_samples: HashMap<String, OpenSample>,
    buffers: HashMap<String, BufferHandle<Sample>>,
    listeners: Vec<Listener<Sample>>,
}

impl UnivariateAggregator {
    pub fn new(symbol: impl Into<String>, network: TimeframeNetwork) -> Self {
        let buffers = network
            .timeframes()
            .iter()
            .map(|tf| {
                (
                    tf.label.clone(),
                    Arc::new(Mutex::new(RollingBuffer::new(tf.capacity))),
                )
            })
            .collect();
        Self {
            symbol: symbol.into(),
            network,
            open_samples: HashMap::new(),
            buffers,
            listeners: Vec::new(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn network(&self) -> &TimeframeNetwork {
        &self.network
    }

    pub fn on_complete(&mut self, listener: impl Fn(&Sample, &str) + Send + Sync + 'static) {
        self.listeners.push(Box::new(listener));
    }

    pub fn buffer(&self, label: &str) -> Option<BufferHandle<Sample>> {
        self.buffers.get(label).cloned()
    }

    pub fn add_tick(&mut self, tick: &Tick) {
        if tick.symbol != self.symbol {
            trace!(
                got = %tick.symbol,
                expected = %self.symbol,
                "dropping tick for foreign symbol"
            );
            return;
        }

        let windows: Vec<(String, i64)> = self
            .network
            .timeframes()
            .iter()
            .map(|tf| (tf.label.clone(), tf.window_start_secs(tick.timestamp)))
            .collect();

        for (label, window_start) in windows {
            match self.open_samples.get_mut(&label) {
                Some(open) if open.window_start == window_start => {
                    open.apply(tick.price);
                }
                Some(_) => {
                    let finished = self.open_samples.remove(&label).map(|s| s.finalize());
                    if let Some(sample) = finished {
                        self.commit(&label, sample);
                    }
                    self.open_samples
                        .insert(label, OpenSample::start(window_start, tick.price));
                }
                None => {
                    self.open_samples
                        .insert(label, OpenSample::start(window_start, tick.price));
                }
            }
        }
    }

    pub fn force_finalize_all(&mut self) {
        let labels = self.network.labels();
        for label in labels {
            if let Some(open) = self.open_samples.remove(&label) {
                self.commit(&label, open.finalize());
            }
        }
    }

    fn commit(&self, label: &str, sample: Sample) {
        if let Some(buffer) = self.buffers.get(label) {
            buffer.lock().push(sample.clone());
        }
        for listener in &self.listeners {
            listener(&sample, label);
        }
    }
}
