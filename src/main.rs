mod archive;
mod config;
mod forge;
mod health;
mod http;
mod metrics;
mod publish;
mod store;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, StoreBackend};
use crate::forge::github::GitHubClient;
use crate::forge::rate_limit::RateLimitState;
use crate::metrics::MetricsRegistry;
use crate::store::{KeyDbStore, MemoryStore, RecordStore};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "forgepush", about = "Archive upload and GitHub push service")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/forgepush/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn RecordStore>,
    pub metrics: MetricsRegistry,
    pub http_client: reqwest::Client,
    /// Last rate-limit headers seen from GitHub, across all callers.
    pub rate_limit: RateLimitState,
}

impl AppState {
    /// A GitHub client acting with the caller's token.
    pub fn github(&self, token: &str) -> GitHubClient {
        GitHubClient::new(
            self.http_client.clone(),
            &self.config.upstream.api_url,
            token,
            self.rate_limit.clone(),
            Arc::clone(&self.metrics.metrics),
        )
    }
}

async fn build_store(config: &Config) -> Result<Arc<dyn RecordStore>> {
    match config.store.backend {
        StoreBackend::Memory => {
            tracing::warn!("using in-memory record store; uploads are lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Keydb => {
            let keydb = config
                .store
                .keydb
                .as_ref()
                .context("store.keydb is required for the keydb backend")?;
            Ok(Arc::new(KeyDbStore::connect(keydb).await?))
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState) -> Result<()> {
    let listen_addr: std::net::SocketAddr = state
        .config
        .server
        .listen
        .parse()
        .context("invalid server.listen address")?;
    let app = http::handler::create_router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = Arc::new(config::load_config(&cli.config)?);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = %cli.config, "starting forgepush");

    // ---- Clients ----
    let http_client = reqwest::Client::builder()
        .user_agent(&config.upstream.user_agent)
        .timeout(Duration::from_secs(config.upstream.request_timeout_secs))
        .build()
        .context("failed to build reqwest client")?;

    let store = build_store(&config).await?;
    tracing::info!(backend = ?config.store.backend, "record store initialised");

    // ---- App state ----
    let state = AppState {
        config,
        store,
        metrics: MetricsRegistry::new(),
        http_client,
        rate_limit: RateLimitState::new(),
    };

    run_http_server(state).await?;

    tracing::info!("forgepush shut down cleanly");
    Ok(())
}
