//! Forecast Supervisor
//!
//! Runs the configured trading agents against the simulation collaborators:
//! - Drift-controlled forecasts per (instrument, timeframe)
//! - Risk-gated paper entries and trailing exits
//! - Bounded, admission-controlled retraining

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use forecast_supervisor::config::AppConfig;
use forecast_supervisor::sim::{SimMarket, SimModel};
use forecast_supervisor::supervisor::Supervisor;
use forecast_supervisor::telemetry::{init_logging, init_metrics};
use forecast_supervisor::utils::types::TradingMode;

/// Forecast Supervisor - drift-controlled trading agents
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Force simulation mode
    #[arg(long, conflicts_with = "trade")]
    simulation: bool,

    /// Force trade mode
    #[arg(long)]
    trade: bool,

    /// Override log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(&args.config)?;

    // Apply CLI overrides
    if args.simulation {
        config.mode = TradingMode::Simulation;
    }
    if args.trade {
        config.mode = TradingMode::Trade;
    }
    if let Some(level) = args.log_level {
        config.telemetry.log_level = level;
    }

    // Keep the guard alive so buffered file logs are flushed on exit
    let _log_guard = init_logging(&config.telemetry)?;

    info!("Starting Forecast Supervisor v{}", env!("CARGO_PKG_VERSION"));
    info!("Mode: {}", config.mode);
    info!("Trading allowed: {}", config.trading_allowed);

    #[cfg(feature = "paper-only")]
    anyhow::ensure!(
        config.mode == TradingMode::Simulation,
        "built with paper-only, refusing to start in trade mode"
    );

    if config.telemetry.enable_metrics {
        init_metrics(config.telemetry.metrics_port)?;
        info!("Metrics server started on port {}", config.telemetry.metrics_port);
    }

    let market = Arc::new(SimMarket::new(config.simulation.clone()));
    let model = Arc::new(SimModel::new(market.clone()));

    let mut supervisor = Supervisor::new(config, model, market.clone(), market);
    let _handle = supervisor.spawn();

    // Wait for shutdown signal
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received, gracefully stopping...");
        }
        Err(err) => {
            error!("Error listening for shutdown signal: {}", err);
        }
    }

    let closed = supervisor.shutdown().await?;
    info!("Forecast Supervisor stopped, {} positions closed", closed);
    Ok(())
}
