//! Plebeian Market background worker
//!
//! Runs one of the two marketplace processors: settling bids from the
//! Lightning node's invoice stream, or fanning out notifications.

mod config;
mod shutdown;

use clap::{Parser, Subcommand};
use config::{ConfigLoader, LoadedConfig, get_database_url};
use pmkt_core::delivery::{ActionDispatch, DeliveryExecutor};
use pmkt_core::notifications::NotificationCatalog;
use pmkt_core::payment_source::build_payment_source;
use pmkt_core::processors::{NotificationFanout, SettlementReconciler};
use pmkt_core::store::{PgStateStore, StateStore};
use shutdown::spawn_shutdown_handler;
use sqlx::postgres::PgPoolOptions;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Plebeian Market worker - settlement and notification processors
#[derive(Parser, Debug)]
#[command(name = "pmkt-worker")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "PMKT_CONFIG", default_value = "./pmkt-config.toml")]
    config: PathBuf,

    /// Run database migrations on startup
    #[arg(long, default_value = "false")]
    migrate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Apply settled invoices from the Lightning node to bids and auctions
    SettleBids,
    /// Record and deliver notifications for followed auctions
    ProcessNotifications,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    init_tracing();

    // Parse command line arguments
    let args = Args::parse();

    tracing::info!(
        command = ?args.command,
        "Starting pmkt-worker v{}",
        env!("CARGO_PKG_VERSION")
    );

    // Load configuration
    let loaded_config = ConfigLoader::new(&args.config).load().map_err(|e| {
        tracing::error!("Failed to load configuration: {}", e);
        e
    })?;
    tracing::info!("Configuration loaded from {:?}", args.config);

    // Get database URL from environment
    let database_url = get_database_url().map_err(|e| {
        tracing::error!("DATABASE_URL environment variable not set");
        e
    })?;

    // Create database connection pool
    tracing::info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .map_err(|e| {
            tracing::error!("Failed to connect to database: {}", e);
            e
        })?;
    tracing::info!("Database connection established");

    // Run migrations if requested
    if args.migrate {
        tracing::info!("Running database migrations...");
        sqlx::migrate!("../migrations")
            .run(&db_pool)
            .await
            .map_err(|e| {
                tracing::error!("Failed to run migrations: {}", e);
                e
            })?;
        tracing::info!("Migrations completed successfully");
    }

    let store: Arc<dyn StateStore> = Arc::new(PgStateStore::new(db_pool.clone()));
    let shutdown_rx = spawn_shutdown_handler();

    let result = match args.command {
        Command::SettleBids => settle_bids(store, &loaded_config, shutdown_rx).await,
        Command::ProcessNotifications => {
            process_notifications(store, &loaded_config, shutdown_rx).await
        }
    };

    // Close database connections gracefully
    tracing::info!("Closing database connections...");
    db_pool.close().await;
    tracing::info!("Worker shutdown complete");

    result
}

async fn settle_bids(
    store: Arc<dyn StateStore>,
    config: &LoadedConfig,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let source = build_payment_source(&config.lnd, store.clone())?;
    SettlementReconciler::new(store, source, config.reconciler, shutdown_rx)
        .run()
        .await?;
    Ok(())
}

async fn process_notifications(
    store: Arc<dyn StateStore>,
    config: &LoadedConfig,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let dispatch = ActionDispatch::from_config(&config.twitter)?;
    tracing::info!(channels = ?dispatch, "Notification channels configured");

    let catalog = NotificationCatalog::standard(config.fanout.ending_soon_window);
    let executor = DeliveryExecutor::new(store.clone(), dispatch);
    NotificationFanout::new(store, catalog, executor, config.fanout, shutdown_rx)
        .run()
        .await?;
    Ok(())
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
