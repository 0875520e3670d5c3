//! Refract image server
//!
//! Dynamic image derivative generation, caching, and background tasks.

mod cache;
mod codec;
mod colour;
mod config;
mod db;
mod error;
mod icc;
mod manager;
mod metrics;
mod middleware;
mod models;
mod permissions;
mod routes;
mod spec;
mod state;
mod stats;
mod storage;
mod tasks;
mod template;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::Router;
use clap::{Parser, Subcommand};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::state::AppState;
use crate::tasks::TaskRunner;

#[derive(Parser)]
#[command(name = "refract", about = "Refract image server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server (default).
    Serve,
    /// Start the background task server.
    Tasks,
    /// Drop every cached derivative and exit.
    FlushCache,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Commands::Serve) => run_server().await,
        Some(Commands::Tasks) => run_task_server().await,
        Some(Commands::FlushCache) => run_flush_cache().await,
    }
}

/// Run the HTTP server.
async fn run_server() -> Result<()> {
    info!("Starting Refract image server");

    let config = Config::from_env().context("failed to load configuration")?;
    info!(port = config.port, "Configuration loaded");

    let state = AppState::new(&config)
        .await
        .context("failed to initialize application state")?;

    info!("Database and cache connections established");

    // Periodic housekeeping; the task queue deduplicates across workers.
    state.spawn_housekeeping();

    let app = Router::new()
        .merge(routes::image::router())
        .merge(routes::admin_files::router())
        .merge(routes::admin_images::router())
        .merge(routes::admin_permissions::router())
        .merge(routes::tasks::router())
        .merge(routes::admin_cache::router())
        .merge(routes::health::router())
        .merge(routes::metrics::router())
        // Middleware layers (last added = first executed in request flow):
        // TraceLayer -> request metrics -> api token -> routes
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::middleware::authenticate_api_token,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::middleware::track_requests,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind to address")?;

    info!(%addr, "Server listening");

    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}

/// Run the task-server process.
async fn run_task_server() -> Result<()> {
    info!("Starting Refract task server");

    let config = Config::from_env().context("failed to load configuration")?;
    let state = AppState::new(&config)
        .await
        .context("failed to initialize application state")?;

    let runner = TaskRunner::new(
        state.tasks().clone(),
        state.task_context(),
        std::sync::Arc::clone(state.metrics()),
        config.task_workers,
        config.task_server_port,
    );

    runner.run().await
}

/// Flush the derivative cache from the command line.
async fn run_flush_cache() -> Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;
    let state = AppState::new(&config)
        .await
        .context("failed to initialize application state")?;

    state.cache().flush().await.context("cache flush failed")?;
    println!("Cache flushed");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,sqlx=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
