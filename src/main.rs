mod chain;
mod config;
mod donation;
mod entities;
mod http;
mod mirror;
mod models;
mod rpc;
mod state;
mod store;

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use crate::config::ApiConfig;
use crate::mirror::EventMirror;
use crate::rpc::RpcChainClient;
use crate::state::{ApiCache, AppState, ChainSyncMode};
use crate::store::PgDonationStore;
use anyhow::{Context, Result};
use axum::Router;
use migration::MigratorTrait;
use sea_orm::ConnectOptions;
use sea_orm::Database;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = ApiConfig::load().context("Failed to load configuration")?;
    let database = connect_database(&config).await?;
    run_migrations(&database).await?;

    let cache = Arc::new(ApiCache::new(&config.cache));
    let last_processed_block = Arc::new(AtomicU64::new(0));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sync = start_chain_sync(
        &config,
        PgDonationStore::new(database.clone()),
        Arc::clone(&cache),
        Arc::clone(&last_processed_block),
        shutdown_rx,
    )
    .await;

    let app_state = AppState::new(
        database.clone(),
        Arc::clone(&cache),
        sync.client,
        sync.mode,
        Arc::clone(&last_processed_block),
    );

    let listener = TcpListener::bind(config.server.address())
        .await
        .context("Failed to bind HTTP listener")?;
    let local_addr = listener
        .local_addr()
        .context("Failed to obtain listener address")?;
    info!("Donations API listening on {local_addr}");

    let router: Router = http::router(app_state, &config.server.allowed_origins);
    let server = axum::serve(listener, router.into_make_service());
    server
        .with_graceful_shutdown(shutdown_signal(shutdown_tx.clone()))
        .await
        .context("HTTP server exited with error")?;

    shutdown_tx.send(true).ok();
    if let Some(handle) = sync.handle {
        if let Err(join_err) = handle.await {
            error!("Event mirror task join error: {join_err}");
        }
    }

    Ok(())
}

struct ChainSync {
    client: Option<RpcChainClient>,
    mode: ChainSyncMode,
    handle: Option<JoinHandle<()>>,
}

impl ChainSync {
    fn disabled(reason: String) -> Self {
        warn!("Chain sync disabled, running in API-only mode: {reason}");
        Self {
            client: None,
            mode: ChainSyncMode::Disabled(reason),
            handle: None,
        }
    }
}

/// Missing configuration or an unreachable node only disables the mirror;
/// the API keeps serving either way.
async fn start_chain_sync(
    config: &ApiConfig,
    store: PgDonationStore,
    cache: Arc<ApiCache>,
    cursor: Arc<AtomicU64>,
    shutdown: watch::Receiver<bool>,
) -> ChainSync {
    let target = match config.chain.sync_target() {
        Ok(target) => target,
        Err(issue) => return ChainSync::disabled(issue.to_string()),
    };

    let client = match RpcChainClient::connect(&target, config.chain.request_timeout()).await {
        Ok(client) => client,
        Err(err) => {
            return ChainSync::disabled(format!(
                "cannot reach chain node at {}: {err}",
                target.rpc_url
            ));
        }
    };

    let mirror = match EventMirror::start(
        Arc::new(client.clone()),
        Arc::new(store),
        config.mirror.clone(),
        cursor,
    )
    .await
    {
        Ok(mirror) => mirror.with_cache(cache),
        Err(err) => return ChainSync::disabled(format!("event mirror failed to start: {err}")),
    };

    info!(
        "Chain sync enabled for contract {} via {}",
        target.contract_address, target.rpc_url
    );
    let handle = tokio::spawn(mirror.run(shutdown));
    ChainSync {
        client: Some(client),
        mode: ChainSyncMode::Active,
        handle: Some(handle),
    }
}

fn init_tracing() {
    let default_filter = "info";
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string());
    assert!(!filter.is_empty(), "Tracing filter must not be empty");
    assert!(filter.len() < 256, "Tracing filter length exceeds bounds");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .compact()
        .init();
}

async fn connect_database(config: &ApiConfig) -> Result<sea_orm::DatabaseConnection> {
    let mut options = ConnectOptions::new(config.database.url.clone());
    options
        .max_connections(config.database.max_connections)
        .sqlx_logging(true)
        .sqlx_logging_level(tracing::log::LevelFilter::Debug)
        .acquire_timeout(Duration::from_secs(10));

    if let Some(min) = config.database.min_connections {
        options.min_connections(min);
    }

    assert!(
        config.database.max_connections >= config.database.min_connections.unwrap_or(1),
        "Max connections must be >= min connections"
    );
    assert!(
        config.database.max_connections <= 128,
        "Connection pool oversized"
    );

    Database::connect(options)
        .await
        .context("Failed to connect to PostgreSQL")
}

async fn run_migrations(database: &sea_orm::DatabaseConnection) -> Result<()> {
    migration::Migrator::up(database, None)
        .await
        .context("Database migrations failed")
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {err}");
        return;
    }
    shutdown_tx.send(true).ok();
    info!("Shutdown signal dispatched");
}
