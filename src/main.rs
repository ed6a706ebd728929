// =============================================================================
// candle-feed — Main Entry Point
// =============================================================================
//
// Backfills the configured series once, then (with --live) streams until
// Ctrl+C. Configuration errors exit non-zero before any network activity.
// =============================================================================

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use candle_feed::{
    Candle, CliArgs, CsvSnapshotWriter, ReqwestHttpClient, Session, StreamerConfig,
    TungsteniteTransport,
};

#[derive(Debug, Parser)]
#[command(name = "candle-feed", version, about = "Stream OHLCV candles from crypto exchanges")]
struct Cli {
    #[command(flatten)]
    args: CliArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = StreamerConfig::from_args(&cli.args).inspect_err(|e| {
        error!(error = %e, "invalid configuration");
    })?;

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        candle-feed — Starting Up                         ║");
    info!("╚══════════════════════════════════════════════════════════╝");
    info!(
        symbol = %config.symbol,
        exchange = %config.exchange,
        timeframe = %config.timeframe,
        bars = config.bars,
        live = config.live,
        output = %config.output_dir.display(),
        "configuration"
    );

    // ── 2. Session ───────────────────────────────────────────────────────
    let http = ReqwestHttpClient::new().context("failed to initialise HTTP client")?;
    let mut session = Session::new(&config, Arc::new(CsvSnapshotWriter));
    session.on_candle(|c: &Candle| {
        info!(
            time = %c.timestamp,
            open = c.open,
            high = c.high,
            low = c.low,
            close = c.close,
            volume = c.volume,
            confirmed = c.confirmed,
            "candle"
        );
    });

    // ── 3. Historical backfill ───────────────────────────────────────────
    let loaded = session.sync_historical(&http, config.bars).await;
    info!(count = loaded.len(), "backfill complete");

    if !config.live {
        return Ok(());
    }

    // ── 4. Live stream until Ctrl+C ──────────────────────────────────────
    session.start_live(Arc::new(TungsteniteTransport));
    info!("streaming live candles, press Ctrl+C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    info!("shutdown signal received");

    session.stop().await;
    info!(candles = session.candles().len(), "candle-feed stopped");
    Ok(())
}
