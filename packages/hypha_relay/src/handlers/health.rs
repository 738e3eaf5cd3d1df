//! Observability endpoints.

use axum::{Json, extract::State, response::IntoResponse};
use serde::Serialize;

use hypha_engine::Engine;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub sessions: usize,
    pub transports: usize,
}

/// Health check: server status plus session/attachment counts.
pub async fn health_handler<E: Engine>(State(state): State<AppState<E>>) -> impl IntoResponse {
    Json(HealthStatus {
        status: "ok",
        sessions: state.registry.len().await,
        transports: state.registry.attachment_total().await,
    })
}

/// List hosted sessions.
pub async fn sessions_handler<E: Engine>(State(state): State<AppState<E>>) -> impl IntoResponse {
    Json(state.registry.list().await)
}
