// ABOUTME: Health check route for liveness probes
// ABOUTME: Reports service status together with the current degradation level
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};

use crate::constants::service_names;
use crate::server::ServerResources;

/// Health routes implementation
pub struct HealthRoutes;

impl HealthRoutes {
    /// Create the health check routes
    pub fn routes(resources: Arc<ServerResources>) -> Router {
        Router::new()
            .route("/health", get(Self::health))
            .with_state(resources)
    }

    async fn health(State(resources): State<Arc<ServerResources>>) -> Json<Value> {
        let level = resources.gauge.level();
        Json(json!({
            "status": "healthy",
            "service": service_names::PARLEY_SERVER,
            "version": env!("CARGO_PKG_VERSION"),
            "model": resources.client.model(),
            "degradation": level,
            "ceiling_factor": level.factor(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))
    }
}
