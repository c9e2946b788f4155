// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// A read-only window onto the published snapshot for dashboards and sibling
// services. Every handler serves a copy of already-published data; nothing
// here can mutate engine state, so no endpoint requires authentication.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::tracker::PortfolioTracker;

// =============================================================================
// Router construction
// =============================================================================

/// Build the read-only REST router with CORS middleware and shared state.
pub fn router(tracker: Arc<PortfolioTracker>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/snapshot", get(snapshot))
        .route("/api/v1/snapshot/last-good", get(last_good))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/positions/active", get(active_positions))
        .route("/api/v1/positions/redeemable", get(redeemable_positions))
        .route("/api/v1/summary", get(summary))
        .route("/api/v1/recovery", get(recovery))
        .route("/api/v1/self-heal", get(self_heal))
        .route("/api/v1/metrics", get(metrics))
        .route("/api/v1/candidates/liquidation", get(liquidation_candidates))
        .route(
            "/api/v1/candidates/profit-liquidation",
            get(profit_liquidation_candidates),
        )
        .layer(cors)
        .with_state(tracker)
}

// =============================================================================
// Handlers
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    last_cycle_id: u64,
    snapshot_age_ms: Option<i64>,
    stale: Option<bool>,
    server_time: i64,
}

async fn health(State(tracker): State<Arc<PortfolioTracker>>) -> impl IntoResponse {
    let now = chrono::Utc::now().timestamp_millis();
    let snapshot = tracker.get_snapshot();
    let resp = HealthResponse {
        status: "ok",
        last_cycle_id: tracker.get_refresh_metrics().last_cycle_id,
        snapshot_age_ms: snapshot.as_ref().map(|s| now - s.fetched_at_ms),
        stale: snapshot.as_ref().map(|s| s.stale),
        server_time: now,
    };
    Json(resp)
}

async fn snapshot(State(tracker): State<Arc<PortfolioTracker>>) -> impl IntoResponse {
    Json(tracker.get_snapshot().map(|s| (*s).clone()))
}

async fn last_good(State(tracker): State<Arc<PortfolioTracker>>) -> impl IntoResponse {
    Json(tracker.get_last_good_snapshot().map(|s| (*s).clone()))
}

async fn positions(State(tracker): State<Arc<PortfolioTracker>>) -> impl IntoResponse {
    Json(tracker.get_positions())
}

async fn active_positions(State(tracker): State<Arc<PortfolioTracker>>) -> impl IntoResponse {
    Json(tracker.get_active_positions())
}

async fn redeemable_positions(State(tracker): State<Arc<PortfolioTracker>>) -> impl IntoResponse {
    Json(tracker.get_redeemable_positions())
}

async fn summary(State(tracker): State<Arc<PortfolioTracker>>) -> impl IntoResponse {
    Json(tracker.get_position_summary())
}

async fn recovery(State(tracker): State<Arc<PortfolioTracker>>) -> impl IntoResponse {
    Json(tracker.get_recovery_status())
}

async fn self_heal(State(tracker): State<Arc<PortfolioTracker>>) -> impl IntoResponse {
    Json(tracker.get_self_heal_status())
}

async fn metrics(State(tracker): State<Arc<PortfolioTracker>>) -> impl IntoResponse {
    Json(tracker.get_refresh_metrics())
}

fn default_min_loss_pct() -> f64 {
    10.0
}

fn default_min_profit_pct() -> f64 {
    10.0
}

fn default_min_hold_sec() -> i64 {
    300
}

#[derive(Deserialize)]
struct LiquidationParams {
    #[serde(default = "default_min_loss_pct")]
    min_loss_pct: f64,
    #[serde(default = "default_min_hold_sec")]
    min_hold_sec: i64,
}

async fn liquidation_candidates(
    State(tracker): State<Arc<PortfolioTracker>>,
    Query(params): Query<LiquidationParams>,
) -> impl IntoResponse {
    Json(tracker.get_liquidation_candidates(params.min_loss_pct, params.min_hold_sec))
}

#[derive(Deserialize)]
struct ProfitLiquidationParams {
    #[serde(default = "default_min_profit_pct")]
    min_profit_pct: f64,
    #[serde(default = "default_min_hold_sec")]
    min_hold_sec: i64,
}

async fn profit_liquidation_candidates(
    State(tracker): State<Arc<PortfolioTracker>>,
    Query(params): Query<ProfitLiquidationParams>,
) -> impl IntoResponse {
    Json(tracker.get_profit_liquidation_candidates(params.min_profit_pct, params.min_hold_sec))
}
