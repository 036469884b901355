// The key-watcher's watch() is the long-poll primitive consumed by the
// surrounding deployment's endpoints; its API surface is wired up by callers
// outside this binary. Allow dead_code until those routes are connected.
#![allow(dead_code)]

mod config;
mod coordination;
mod git;
mod health;
mod http;
mod metrics;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fred::clients::Pool;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::coordination::KeyWatcher;
use crate::metrics::MetricsRegistry;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "gitshuttle", about = "Git smart-HTTP acceleration proxy")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/gitshuttle/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers and background tasks.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Pool,
    pub http_client: reqwest::Client,
    pub metrics: MetricsRegistry,
    pub key_watcher: Arc<KeyWatcher>,
}

impl AppState {
    /// State for router-level tests: clients are constructed but never
    /// connected.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        let config = Config {
            proxy: config::ProxyConfig {
                http_listen: "127.0.0.1:0".to_string(),
                response_write_timeout: 600,
            },
            backend: config::BackendConfig {
                url: "http://127.0.0.1:0".to_string(),
            },
            store: config::StoreConfig {
                endpoint: "redis://127.0.0.1:6379".to_string(),
                tls: false,
                auth_token_env: "GITSHUTTLE_STORE_TOKEN".to_string(),
            },
        };
        let store = fred::types::Builder::default_centralized()
            .build_pool(1)
            .expect("build test pool");
        let metrics = MetricsRegistry::new();
        let key_watcher = KeyWatcher::new(
            store.clone(),
            fred::types::config::Config::default(),
            metrics.clone(),
        );
        Self {
            config: Arc::new(config),
            store,
            http_client: reqwest::Client::new(),
            metrics,
            key_watcher,
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP server
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState) -> Result<()> {
    let app = http::handler::create_router(Arc::new(state.clone()));

    let listen_addr: std::net::SocketAddr = state
        .config
        .proxy
        .http_listen
        .parse()
        .context("invalid http_listen address")?;

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
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
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
    let config = config::load_config(&cli.config)?;
    let config = Arc::new(config);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = %cli.config, "starting gitshuttle");

    // ---- Store clients ----
    let store_config = coordination::redis::client_config(&config.store)?;
    let store = coordination::redis::create_pool(store_config.clone()).await?;

    // ---- Backend HTTP client ----
    let http_client = reqwest::Client::builder()
        .user_agent(http::preauth::BACKEND_USER_AGENT)
        .build()
        .context("failed to build backend HTTP client")?;

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Key watcher ----
    let key_watcher = KeyWatcher::new(store.clone(), store_config, metrics.clone());
    let publisher = key_watcher.spawn_publisher();

    // ---- App state ----
    let state = AppState {
        config: Arc::clone(&config),
        store,
        http_client,
        metrics,
        key_watcher: Arc::clone(&key_watcher),
    };

    // ---- Serve until shutdown ----
    run_http_server(state).await?;

    key_watcher.shutdown();
    let _ = publisher.await;

    tracing::info!("gitshuttle shut down cleanly");
    Ok(())
}
