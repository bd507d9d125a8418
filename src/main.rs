//! imagevault: hierarchical image derivation cache.

mod backend;
mod config;
mod derive;
mod error;
mod handle;
mod master;
mod metrics;
mod name;
mod routes;
mod state;
mod tier;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use clap::{Parser, Subcommand};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::backend::{MemoryObjectStore, ObjectStoreClient, RealImageBackend, S3ObjectStoreClient};
use crate::config::Config;
use crate::master::Master;
use crate::metrics::Metrics;
use crate::state::AppState;

#[derive(Parser)]
#[command(name = "imagevault", about = "Hierarchical image derivation cache")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server (default).
    Serve {
        /// Use an in-process object store instead of S3; for local development.
        #[arg(long)]
        no_remote: bool,
    },
    /// Cache inspection and maintenance commands.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Print per-tier occupancy.
    Stats,
    /// Run eviction on every tier immediately.
    Gc,
    /// Force a name into the permanent remote store.
    MakePersistent {
        /// Canonical derivation name, e.g. `abc123+size(200,200).jpg`.
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        None => run_server(false).await,
        Some(Commands::Serve { no_remote }) => run_server(no_remote).await,
        Some(Commands::Cache { action }) => run_cache_command(action).await,
    }
}

async fn build_master(no_remote: bool) -> Result<(Arc<Master>, Config)> {
    let config = Config::from_env().context("failed to load configuration")?;
    let backend = Arc::new(RealImageBackend::new());
    let store: Arc<dyn ObjectStoreClient> = if no_remote {
        Arc::new(MemoryObjectStore::new())
    } else {
        Arc::new(S3ObjectStoreClient::from_env().await)
    };
    let master = Master::new(&config, backend, store)
        .await
        .context("failed to initialize cache")?;
    Ok((master, config))
}

async fn run_server(no_remote: bool) -> Result<()> {
    info!("starting imagevault");

    let (master, config) = build_master(no_remote).await?;
    let metrics = Metrics::new();
    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(master, config, metrics);

    let cors = CorsLayer::permissive();

    let app = Router::new()
        .merge(routes::images::router())
        .merge(routes::health::router())
        .merge(routes::metrics::router())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            routes::guard::error_threshold_guard,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state.clone());

    let addr: SocketAddr = bind_addr
        .parse()
        .context("invalid IMAGEVAULT_BIND_ADDR")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind to address")?;
    info!(%addr, "server listening");

    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_state))
        .await
        .context("server error")?;

    Ok(())
}

async fn shutdown_signal(state: AppState) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received, flushing cache tiers");
    if let Err(e) = state.master().shutdown().await {
        tracing::error!(error = %e, "error flushing cache tiers during shutdown");
    }
}

async fn run_cache_command(action: CacheAction) -> Result<()> {
    let (master, _config) = build_master(false).await?;
    match action {
        CacheAction::Stats => {
            let stats = master.stats().await;
            println!("{stats:#?}");
        }
        CacheAction::Gc => {
            master.gc().await?;
            println!("gc complete");
        }
        CacheAction::MakePersistent { name } => {
            master.make_persistent(&name).await?;
            println!("{name} is now persistent");
        }
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

