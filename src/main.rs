//! onegate - HTTP directory browser for a OneDrive account
//!
//! Serves folder listings and cached file downloads for a single account,
//! keeping its OAuth token pair fresh in the background.

mod auth;
mod cache;
mod clock;
mod config;
mod gateway;
mod graph;
mod http;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use auth::{CoordinatorConfig, TokenCoordinator, TokenStore};
use cache::content::DEFAULT_GRACE;
use cache::{ContentCache, ListingCache};
use config::Config;
use gateway::DriveGateway;
use graph::GraphClient;
use http::AppState;

/// HTTP directory browser for a OneDrive account
#[derive(Debug, Parser)]
#[command(name = "onegate", version)]
struct Cli {
    /// Path to the JSON config file
    #[arg(short, long)]
    config: PathBuf,

    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    listen: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let settings = Config::load(&cli.config)?.validate()?;

    let client = Arc::new(GraphClient::new(
        &settings.client_id,
        &settings.client_secret,
        &settings.redirect_url,
    )?);

    let store = TokenStore::new(&settings.token_dir, &settings.client_id);
    let initial = match store.load() {
        Ok(pair) => pair,
        Err(e) => {
            warn!(path = %store.path().display(), error = %e, "Failed to read token file");
            None
        }
    };

    let coordinator = Arc::new(TokenCoordinator::new(
        client.clone(),
        Some(store),
        CoordinatorConfig {
            refresh_margin: settings.refresh_margin,
            ..CoordinatorConfig::default()
        },
    ));
    match initial {
        Some(pair) => coordinator.restart(pair).await,
        None => info!("No stored token, open /?auth=<password> to connect the account"),
    }

    let listings = ListingCache::new(settings.cache_size, settings.cache_ttl);
    let content = Arc::new(ContentCache::open(
        settings.cache_dir.clone(),
        settings.prefetch_bytes,
        DEFAULT_GRACE,
    )?);
    let gateway = DriveGateway::new(coordinator.clone(), listings, content, client.clone());

    let state = Arc::new(AppState {
        authorize_url: client.authorize_url(),
        settings,
        gateway,
    });

    let listener = TcpListener::bind(&cli.listen)
        .await
        .with_context(|| format!("Failed to bind {}", cli.listen))?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        info!("Received shutdown signal");
        signal.cancel();
    });

    let served = http::serve(listener, state, shutdown).await;

    coordinator.shutdown().await;
    info!("Shutdown complete.");
    served
}
