//! Health check endpoint
//!
//! Reports signaling counters and the feed bridge slot for health checks.

use axum::{extract::State, routing::get, Json, Router};
use roomcast_livestream::FeedStatus;
use roomcast_sfu::ManagerStats;
use serde::Serialize;

use crate::http::AppState;

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub sfu: ManagerStats,
    pub feed: FeedStatus,
}

/// Health check router
pub fn create_health_router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthReport> {
    Json(HealthReport {
        status: "ok",
        sfu: state.manager.stats(),
        feed: state.feed.status(),
    })
}
