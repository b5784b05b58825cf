use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use evmtrace_core::{
    validation::{validate_contract_address, BackfillConfig, LiveConfig},
    Database, EventCatalog, EventTracker, JsonRpcClient, LogDecoder, Metrics, TrackerConfig,
    parse_event_names,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Evmtrace Live - keeps a database in sync with an EVM contract's events
#[derive(Parser)]
#[command(name = "evmtrace-live")]
#[command(about = "Track EVM contract events into a database", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize database schema
    Init {
        #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:./evmtrace.db")]
        db_url: String,
    },
    /// Backfill, then follow new blocks until interrupted
    Run(RunArgs),
    /// Print watermark and stored event totals as JSON
    Status(StoreArgs),
    /// Print stored events as JSON
    Events {
        #[command(flatten)]
        store: StoreArgs,

        /// Only events with this name
        #[arg(short, long)]
        name: Option<String>,

        /// First block (inclusive)
        #[arg(long, default_value = "0")]
        from: u64,

        /// Last block (inclusive), defaults to the latest stored block
        #[arg(long)]
        to: Option<u64>,
    },
}

#[derive(Args)]
struct StoreArgs {
    #[arg(short, long, env = "APP_NAME", default_value = "event-tracker")]
    app_name: String,

    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:./evmtrace.db")]
    db_url: String,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Name the events and watermark are stored under
    #[arg(short, long, env = "APP_NAME", default_value = "event-tracker")]
    app_name: String,

    /// EVM JSON-RPC HTTP URL
    #[arg(short, long, env = "RPC_URL")]
    rpc_url: String,

    /// Address of the contract to track
    #[arg(short, long, env = "CONTRACT_ADDRESS")]
    contract_address: String,

    /// Path to the contract ABI (plain array, Etherscan response or compiler artifact)
    #[arg(long, env = "CONTRACT_ABI_PATH")]
    abi_path: String,

    /// Comma-separated event names to track (empty tracks every ABI event)
    #[arg(short, long, env = "CONTRACT_EVENT_NAMES", default_value = "")]
    events: String,

    /// First block to track
    #[arg(short, long, env = "STARTING_BLOCK_NUMBER", default_value = "0")]
    start_block: u64,

    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:./evmtrace.db")]
    db_url: String,

    /// Blocks per eth_getLogs query during backfill
    #[arg(short, long, env = "BATCH_SIZE", default_value = "1000")]
    batch_size: u64,

    /// Delay between backfill batches (milliseconds)
    #[arg(long, env = "BATCH_DELAY_MS", default_value = "0")]
    batch_delay: u64,

    /// Head poll interval (milliseconds)
    #[arg(long, env = "POLL_INTERVAL_MS", default_value = "60000")]
    poll_interval: u64,

    /// Re-read recent blocks periodically
    #[arg(long, env = "RESCAN")]
    rescan: bool,

    /// Rescan interval (milliseconds), must exceed the poll interval
    #[arg(long, env = "RESCAN_TIMER", default_value = "600000")]
    rescan_timer: u64,

    /// Blocks below the watermark covered by each rescan
    #[arg(long, env = "RESCAN_WINDOW", default_value = "100")]
    rescan_window: u64,

    /// New-block watch interval (milliseconds)
    #[arg(long, env = "BLOCK_POLL_INTERVAL_MS", default_value = "4000")]
    block_poll_interval: u64,

    /// Delay before resubscribing after the block stream ends (milliseconds)
    #[arg(long, env = "RESUBSCRIBE_DELAY_MS", default_value = "5000")]
    resubscribe_delay: u64,

    #[arg(long, env = "RPC_TIMEOUT_MS", default_value = "30000")]
    rpc_timeout: u64,

    #[arg(long, env = "RPC_MAX_RETRIES", default_value = "3")]
    rpc_max_retries: u32,
}

/// `.env.production` when APP_ENV=production, `.env.development` otherwise, then `.env`
fn load_env() {
    let env_file = match std::env::var("APP_ENV").as_deref() {
        Ok("production") => ".env.production",
        _ => ".env.development",
    };

    if dotenv::from_filename(env_file).is_err() {
        dotenv::dotenv().ok();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url } => init_db(&db_url).await?,
        Commands::Run(args) => run_tracker(args).await?,
        Commands::Status(store) => show_status(&store).await?,
        Commands::Events {
            store,
            name,
            from,
            to,
        } => list_events(&store, name, from, to).await?,
    }

    Ok(())
}

async fn init_db(db_url: &str) -> Result<()> {
    info!("Initializing database...");

    let db = Database::new(db_url).await?;
    db.close().await;
    info!("Database initialized successfully at: {}", db_url);

    Ok(())
}

async fn run_tracker(args: RunArgs) -> Result<()> {
    let config = LiveConfig {
        backfill: BackfillConfig {
            app_name: args.app_name.clone(),
            rpc_url: args.rpc_url.clone(),
            contract_address: args.contract_address.clone(),
            abi_path: args.abi_path.clone(),
            db_url: args.db_url.clone(),
            batch_size: args.batch_size,
            rpc_timeout_ms: args.rpc_timeout,
        },
        poll_interval_ms: args.poll_interval,
        rescan_interval_ms: args.rescan_timer,
        rescan_window: args.rescan_window,
        block_poll_interval_ms: args.block_poll_interval,
    };
    config.validate().context("Invalid configuration")?;

    info!("Starting Evmtrace Live for '{}'", args.app_name);
    info!("RPC URL: {}", args.rpc_url);
    info!("Contract: {}", args.contract_address);
    info!(
        "Poll every {} ms, rescan {} (every {} ms, window {} blocks)",
        args.poll_interval,
        if args.rescan { "enabled" } else { "disabled" },
        args.rescan_timer,
        args.rescan_window
    );

    let contract_address = validate_contract_address(&args.contract_address)?;
    let wanted = parse_event_names(&args.events);
    let catalog = EventCatalog::load_from_file(&args.abi_path, &wanted)
        .with_context(|| format!("Failed to load ABI from {}", args.abi_path))?;

    info!("Tracking {} event(s):", catalog.len());
    for definition in catalog.definitions() {
        info!("  - {} ({})", definition.signature, definition.signature_hash);
    }

    let metrics = Arc::new(Metrics::new());
    let client = JsonRpcClient::new(
        &args.rpc_url,
        Duration::from_millis(args.rpc_timeout),
        args.rpc_max_retries,
    )?
    .with_block_poll_interval(Duration::from_millis(args.block_poll_interval))
    .with_metrics(metrics.clone());

    let db = Database::new(&args.db_url).await?;
    info!("Database connected: {}", args.db_url);

    let mut tracker_config = TrackerConfig::new(args.app_name.clone(), contract_address);
    tracker_config.start_block = args.start_block;
    tracker_config.batch_size = args.batch_size;
    tracker_config.batch_delay = Duration::from_millis(args.batch_delay);
    tracker_config.poll_interval = Duration::from_millis(args.poll_interval);
    tracker_config.rescan_enabled = args.rescan;
    tracker_config.rescan_interval = Duration::from_millis(args.rescan_timer);
    tracker_config.rescan_window = args.rescan_window;
    tracker_config.resubscribe_delay = Duration::from_millis(args.resubscribe_delay);

    let tracker = EventTracker::new(
        tracker_config,
        Arc::new(client),
        db.clone(),
        LogDecoder::new(Arc::new(catalog)),
        metrics,
    );

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, stopping tracker...");
        token.cancel();
    });

    let result = tracker.run(cancel).await;
    db.close().await;

    match result {
        Ok(()) => {
            info!("Evmtrace Live stopped");
            Ok(())
        }
        Err(e) if e.is_fatal() => {
            error!("Refusing to start: {}", e);
            Err(e.into())
        }
        Err(e) => {
            error!("Tracker failed: {}", e);
            Err(e.into())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn show_status(store: &StoreArgs) -> Result<()> {
    let db = Database::new(&store.db_url).await?;

    let watermark = db.get_watermark(&store.app_name).await?;
    let max_block = db.max_block_number(&store.app_name).await?;
    let event_count = db.count_events(&store.app_name).await?;
    db.close().await;

    let status = serde_json::json!({
        "app_name": store.app_name,
        "watermark": watermark,
        "max_stored_block": max_block,
        "event_count": event_count,
    });
    println!("{}", serde_json::to_string_pretty(&status)?);

    Ok(())
}

async fn list_events(
    store: &StoreArgs,
    name: Option<String>,
    from: u64,
    to: Option<u64>,
) -> Result<()> {
    let db = Database::new(&store.db_url).await?;

    let records = match name {
        Some(name) => db.get_events_by_name(&store.app_name, &name).await?,
        None => {
            let to = match to {
                Some(to) => to,
                None => db.max_block_number(&store.app_name).await?.unwrap_or(0),
            };
            db.get_events_by_block_range(&store.app_name, from, to).await?
        }
    };
    db.close().await;

    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}
