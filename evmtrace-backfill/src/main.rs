use anyhow::{Context, Result};
use clap::Parser;
use evmtrace_core::{
    parse_event_names,
    validation::{validate_contract_address, BackfillConfig},
    Database, EventCatalog, EventTracker, JsonRpcClient, LogDecoder, Metrics, TrackerConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Evmtrace Backfill - catch an event store up to the current chain head
#[derive(Parser)]
#[command(name = "evmtrace-backfill")]
#[command(about = "Backfill historical EVM contract events from RPC", long_about = None)]
struct Cli {
    /// Name the events and watermark are stored under
    #[arg(short, long, env = "APP_NAME", default_value = "event-tracker")]
    app_name: String,

    /// EVM JSON-RPC HTTP URL
    #[arg(short, long, env = "RPC_URL")]
    rpc_url: String,

    /// Address of the contract to backfill
    #[arg(short, long, env = "CONTRACT_ADDRESS")]
    contract_address: String,

    /// Path to the contract ABI
    #[arg(long, env = "CONTRACT_ABI_PATH")]
    abi_path: String,

    /// Comma-separated event names (empty backfills every ABI event)
    #[arg(short, long, env = "CONTRACT_EVENT_NAMES", default_value = "")]
    events: String,

    /// First block to backfill when no watermark exists
    #[arg(short, long, env = "STARTING_BLOCK_NUMBER", default_value = "0")]
    start_block: u64,

    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:./evmtrace.db")]
    db_url: String,

    /// Blocks per eth_getLogs query
    #[arg(short, long, env = "BATCH_SIZE", default_value = "1000")]
    batch_size: u64,

    /// Delay between batches (milliseconds)
    #[arg(long, env = "BATCH_DELAY_MS", default_value = "0")]
    batch_delay: u64,

    #[arg(long, env = "RPC_TIMEOUT_MS", default_value = "30000")]
    rpc_timeout: u64,

    #[arg(long, env = "RPC_MAX_RETRIES", default_value = "3")]
    rpc_max_retries: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_file = match std::env::var("APP_ENV").as_deref() {
        Ok("production") => ".env.production",
        _ => ".env.development",
    };
    if dotenv::from_filename(env_file).is_err() {
        dotenv::dotenv().ok();
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    run_backfill(cli).await?;

    Ok(())
}

async fn run_backfill(cli: Cli) -> Result<()> {
    BackfillConfig {
        app_name: cli.app_name.clone(),
        rpc_url: cli.rpc_url.clone(),
        contract_address: cli.contract_address.clone(),
        abi_path: cli.abi_path.clone(),
        db_url: cli.db_url.clone(),
        batch_size: cli.batch_size,
        rpc_timeout_ms: cli.rpc_timeout,
    }
    .validate()
    .context("Invalid configuration")?;

    info!("Starting Evmtrace Backfill for '{}'", cli.app_name);
    info!("RPC URL: {}", cli.rpc_url);
    info!("Batch size: {}", cli.batch_size);

    let contract_address = validate_contract_address(&cli.contract_address)?;
    let wanted = parse_event_names(&cli.events);
    let catalog = EventCatalog::load_from_file(&cli.abi_path, &wanted)
        .with_context(|| format!("Failed to load ABI from {}", cli.abi_path))?;
    info!("Loaded {} event(s) from {}", catalog.len(), cli.abi_path);

    let metrics = Arc::new(Metrics::new());
    let client = JsonRpcClient::new(
        &cli.rpc_url,
        Duration::from_millis(cli.rpc_timeout),
        cli.rpc_max_retries,
    )?
    .with_metrics(metrics.clone());

    let db = Database::new(&cli.db_url).await?;
    info!("Database connected: {}", cli.db_url);

    let mut config = TrackerConfig::new(cli.app_name.clone(), contract_address);
    config.start_block = cli.start_block;
    config.batch_size = cli.batch_size;
    config.batch_delay = Duration::from_millis(cli.batch_delay);

    let tracker = EventTracker::new(
        config,
        Arc::new(client),
        db.clone(),
        LogDecoder::new(Arc::new(catalog)),
        metrics.clone(),
    );

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current batch...");
            token.cancel();
        }
    });

    let result = async {
        let start = tracker.initialize().await?;
        tracker.backfill(start, &cancel).await
    }
    .await;
    db.close().await;
    let summary = match result {
        Ok(summary) => summary,
        Err(e) if e.is_fatal() => {
            error!("Refusing to backfill: {}", e);
            return Err(e.into());
        }
        Err(e) => {
            error!("Backfill failed: {}", e);
            return Err(e.into());
        }
    };

    info!("Backfill {}!", if summary.interrupted { "interrupted" } else { "complete" });
    info!("Blocks: {} to {}", summary.start_block, summary.head_block);
    info!("Batches processed: {}", summary.ranges);
    info!("Logs found: {}", summary.stats.logs_found);
    info!("Events stored: {}", summary.stats.stored);
    info!("Duplicates skipped: {}", summary.stats.duplicates);
    info!("Unrecognized events: {}", summary.stats.unrecognized);
    info!("Watermark: {}", tracker.watermark().await);
    metrics.log_summary();

    Ok(())
}
