/*
[INPUT]:  CLI arguments, YAML configuration file, OS shutdown signals
[OUTPUT]: A running engine (paper mode) with graceful shutdown
[POS]:    Binary entry point
[UPDATE]: When changing CLI flags, startup flow, or shutdown handling
*/

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use rand::Rng;
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use perpmaker_engine::{EngineConfig, MakerEngine};
use perpmaker_exchange::PaperExchange;

#[derive(Parser, Debug)]
#[command(name = "perpmaker", version, about = "Futures market-making engine runner")]
struct Cli {
    #[arg(long = "config", value_name = "PATH")]
    config_path: PathBuf,
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    log_level: String,
    /// Run against the in-process paper venue with a synthetic book
    #[arg(long = "paper")]
    paper: bool,
    #[arg(long = "dry-run")]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(&args.log_level)?;

    info!(
        config_path = %args.config_path.display(),
        paper = args.paper,
        dry_run = args.dry_run,
        "starting perpmaker"
    );

    let config = load_config(&args.config_path)?;
    info!(symbol = %config.symbol, mode = ?config.mode, "configuration loaded");

    if args.dry_run {
        info!("dry-run requested; configuration validated");
        return Ok(());
    }

    if !args.paper {
        bail!("no live venue adapter is wired into this binary; run with --paper");
    }

    let venue = Arc::new(PaperExchange::new(&config.symbol));
    let engine = MakerEngine::new(config.clone(), venue.clone());
    let shutdown = engine.shutdown_token();
    setup_signal_handlers(shutdown.clone());

    let feed_handle = tokio::spawn(drive_paper_feeds(venue, config, shutdown.clone()));

    let result = engine.run().await;
    shutdown.cancel();
    let _ = feed_handle.await;
    info!("engine shutdown complete");
    result
}

/// Synthetic random-walk book so paper mode exercises the full loop.
async fn drive_paper_feeds(
    venue: Arc<PaperExchange>,
    config: EngineConfig,
    shutdown: CancellationToken,
) {
    let tick = config.price_tick;
    let mut mid = Decimal::from(100);
    let level_qty = config.trade_amount * Decimal::from(50);
    let period = Duration::from_millis(config.refresh_interval_ms / 2).max(Duration::from_millis(50));

    loop {
        if shutdown.is_cancelled() {
            return;
        }

        let step: i64 = rand::thread_rng().gen_range(-2..=2);
        mid += tick * Decimal::from(step);
        if mid < tick * Decimal::from(10) {
            mid = tick * Decimal::from(10);
        }

        let bids: Vec<(Decimal, Decimal)> = (1..=10)
            .map(|i| (mid - tick * Decimal::from(i), level_qty))
            .collect();
        let asks: Vec<(Decimal, Decimal)> = (1..=10)
            .map(|i| (mid + tick * Decimal::from(i), level_qty))
            .collect();

        venue.push_depth(bids, asks);
        venue.push_ticker(mid);
        venue.publish_account();
        venue.publish_open_orders();

        tokio::time::sleep(period).await;
    }
}

fn init_tracing(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level).context("invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|err| anyhow!(err))
        .context("initialize tracing subscriber")?;
    Ok(())
}

fn load_config(path: &PathBuf) -> Result<EngineConfig> {
    let path_str = path.to_str().context("config path must be valid utf-8")?;
    EngineConfig::from_file(path_str).context("load config")
}

fn setup_signal_handlers(shutdown: CancellationToken) {
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install SIGINT handler");
            return;
        }
        info!("received SIGINT");
        shutdown_clone.cancel();
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                    info!("received SIGTERM");
                    shutdown.cancel();
                }
                Err(err) => {
                    warn!(error = %err, "failed to install SIGTERM handler");
                }
            }
        });
    }
}
