// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{Registry, TextEncoder};

use crate::health::{HealthRegistry, HealthReport};

pub const METRICS_ROUTE: &str = "/metrics";
pub const HEALTH_ROUTE: &str = "/health";

#[derive(Clone)]
struct AppState {
    registry: Registry,
    health: HealthRegistry,
}

/// Serves `/metrics` (prometheus text format) and `/health` (component
/// status JSON) on `addr`. Runs until the process exits.
pub async fn start_observability_server(
    addr: SocketAddr,
    registry: Registry,
    health: HealthRegistry,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route(METRICS_ROUTE, get(metrics))
        .route(HEALTH_ROUTE, get(health_report))
        .with_state(AppState { registry, health });
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(address = %addr, "observability server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn metrics(State(state): State<AppState>) -> (StatusCode, String) {
    let metric_families = state.registry.gather();
    match TextEncoder::new().encode_to_string(&metric_families) {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("unable to encode metrics: {e}"),
        ),
    }
}

async fn health_report(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let report = state.health.report();
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}
