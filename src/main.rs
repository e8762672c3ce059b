//! ChainFlow - Real-time market-data ingestion for causal chain detection
//! Mission: One normalized pipeline from heterogeneous feeds to the causal API
//! Philosophy: Never lose a window. Degrade gracefully, reconnect relentlessly.

use anyhow::Result;
use clap::Parser;
use dotenv::dotenv;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chainflow_backend::config::{ConnectorKind, Settings};
use chainflow_backend::supervisor::Supervisor;

#[derive(Debug, Parser)]
#[command(
    name = "chainflow",
    about = "Market-data ingestion, multi-timeframe aggregation and causal-API dispatch"
)]
struct Cli {
    /// Connector pipelines to run: binance|polygon|accuweather|bloomberg|both|all
    #[arg(long, env = "CONNECTOR", default_value = "all")]
    connector: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let kind: ConnectorKind = cli.connector.parse()?;
    let settings = Settings::from_env(kind)?;

    info!(connector = %kind, "🚀 chainflow starting");
    let supervisor = Supervisor::new(settings)?;
    supervisor.run().await
}
