// ABOUTME: Parley server binary
// ABOUTME: Loads configuration, wires services, and serves the HTTP API until shutdown
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

//! # Parley Server Binary
//!
//! Starts the streaming turn API backed by `SQLite` and Gemini.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use parley_server::{
    config::environment::ServerConfig,
    database::SqliteConversationStore,
    llm::GeminiClient,
    logging::LoggingConfig,
    rate_limiting::{PressureGauge, PressureMonitor, ProcMeminfoSampler},
    server::{self, ServerResources},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "parley-server")]
#[command(about = "Parley - streaming conversation turns over SSE")]
pub struct Args {
    /// Override HTTP port
    #[arg(long)]
    http_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    LoggingConfig::from_env().init()?;

    let mut config = ServerConfig::from_env()?;
    if let Some(http_port) = args.http_port {
        config.http_port = http_port;
    }
    info!("{}", config.summary());

    ensure_database_dir(&config.database.url)?;
    let store = SqliteConversationStore::connect(&config.database.url)
        .await
        .context("Failed to open conversation store")?;

    let client = GeminiClient::new(config.llm.gemini()?).context("Failed to build Gemini client")?;

    let gauge = Arc::new(PressureGauge::new());
    let resources = Arc::new(ServerResources::new(
        Arc::new(store),
        Arc::new(client),
        &config,
        gauge.clone(),
    ));

    let shutdown = CancellationToken::new();
    let monitor = PressureMonitor::new(
        gauge,
        Arc::new(ProcMeminfoSampler),
        config.rate_limit.thresholds(),
        config.rate_limit.pressure_interval(),
    )
    .spawn(shutdown.clone());

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                signal_shutdown.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    let served = server::serve(resources, config.http_port, shutdown.clone()).await;
    shutdown.cancel();
    if tokio::time::timeout(Duration::from_secs(5), monitor).await.is_err() {
        error!("Pressure monitor did not stop in time");
    }

    served
}

/// Create the parent directory of a file-backed `SQLite` URL
fn ensure_database_dir(url: &str) -> Result<()> {
    if url.contains(":memory:") || url.contains("mode=memory") {
        return Ok(());
    }
    let path = url
        .trim_start_matches("sqlite:")
        .trim_start_matches("//")
        .split('?')
        .next()
        .unwrap_or_default();
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create database directory {}", parent.display()))?;
    }
    Ok(())
}
