//! ChainFlow Backend Library
//!
//! Real-time market-data ingestion: heterogeneous upstream sources are
//! normalized into one tick shape, aggregated into multi-timeframe rolling
//! windows, and periodically dispatched to a remote causal-intelligence
//! service for chain detection.

pub mod aggregate;
pub mod causal;
pub mod config;
pub mod connectors;
pub mod error;
pub mod models;
pub mod normalize;
pub mod supervisor;

// Re-export the types most callers touch.
pub use aggregate::{BufferHandle, OhlcAggregator, RollingBuffer, UnivariateAggregator};
pub use causal::CausalApiClient;
pub use config::{ConnectorKind, Settings};
pub use connectors::{ConnectionStatus, Connector, HealthSnapshot};
pub use error::FeedError;
pub use models::{Candle, ChainDetection, Sample, Tick, Timeframe, TimeframeNetwork};
pub use supervisor::Supervisor;
