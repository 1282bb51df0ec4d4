// ABOUTME: Shared server resources and the HTTP server entry point
// ABOUTME: Wires store, generation client, orchestrator, and admission control into one router
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

//! # Server
//!
//! [`ServerResources`] is built once at startup and shared by every handler
//! through axum state. Nothing in it is global; tests build their own with
//! in-memory stores and scripted clients.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::environment::ServerConfig;
use crate::database::ConversationStore;
use crate::llm::GenerationClient;
use crate::rate_limiting::{AdmissionController, PressureGauge};
use crate::routes::{ChatRoutes, HealthRoutes};
use crate::services::{ConversationLocks, StreamingOrchestrator, TokenAccountant};

/// Collaborators shared by all request handlers
pub struct ServerResources {
    /// Conversation persistence
    pub store: Arc<dyn ConversationStore>,
    /// Remote model
    pub client: Arc<dyn GenerationClient>,
    /// Token counting and running totals
    pub accountant: Arc<TokenAccountant>,
    /// Turn execution
    pub orchestrator: Arc<StreamingOrchestrator>,
    /// Request and token gating
    pub admission: Arc<AdmissionController>,
    /// Degradation level published by the pressure monitor
    pub gauge: Arc<PressureGauge>,
}

impl ServerResources {
    /// Wire every service from a store, a client, and the loaded configuration
    #[must_use]
    pub fn new(
        store: Arc<dyn ConversationStore>,
        client: Arc<dyn GenerationClient>,
        config: &ServerConfig,
        gauge: Arc<PressureGauge>,
    ) -> Self {
        let locks = ConversationLocks::new();
        let accountant = Arc::new(TokenAccountant::new(
            client.clone(),
            store.clone(),
            locks.clone(),
        ));
        let orchestrator = Arc::new(StreamingOrchestrator::new(
            store.clone(),
            client.clone(),
            accountant.clone(),
            locks,
            config.orchestrator_settings(),
        ));
        let admission = Arc::new(AdmissionController::new(
            config.rate_limit.clone(),
            gauge.clone(),
        ));

        Self {
            store,
            client,
            accountant,
            orchestrator,
            admission,
            gauge,
        }
    }
}

/// Full application router with request tracing
pub fn router(resources: Arc<ServerResources>) -> Router {
    Router::new()
        .merge(HealthRoutes::routes(resources.clone()))
        .merge(ChatRoutes::routes(resources))
        .layer(TraceLayer::new_for_http())
}

/// Serve HTTP on `port` until `shutdown` fires
///
/// In-flight turns see their connections close and are cancelled through the
/// usual disconnect path.
///
/// # Errors
///
/// Fails when the port cannot be bound or the server loop errors.
pub async fn serve(
    resources: Arc<ServerResources>,
    port: u16,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind HTTP port {port}"))?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, router(resources))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server failed")?;

    info!("HTTP server stopped");
    Ok(())
}
