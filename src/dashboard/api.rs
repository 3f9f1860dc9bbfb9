//! Dashboard HTTP API

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};

use super::{ApiResponse, DashboardState};
use crate::engine::TradingStateView;
use crate::persistence::{PositionRecord, TradingDecisionRecord};

const DEFAULT_DECISION_LIMIT: usize = 50;
const MAX_DECISION_LIMIT: usize = 500;

/// Create the API router with all endpoints
pub fn create_router(state: DashboardState) -> Router {
    Router::new()
        .route("/api/state", get(get_states))
        .route("/api/state/:symbol", get(get_state))
        .route("/api/decisions", get(get_decisions))
        .route("/api/positions/:symbol", get(get_positions))
        .with_state(state)
        // CORS for frontend
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

// ─────────────────────────────────────────────────────────────────
// API Handlers
// ─────────────────────────────────────────────────────────────────

/// GET /api/state - Every symbol's published state
async fn get_states(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.board.all().await))
}

/// GET /api/state/:symbol
async fn get_state(
    State(state): State<DashboardState>,
    Path(symbol): Path<String>,
) -> impl IntoResponse {
    let symbol = symbol.to_uppercase();
    match state.board.get(&symbol).await {
        Some(view) => (StatusCode::OK, Json(ApiResponse::success(view))),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::<TradingStateView>::error(format!(
                "unknown symbol {symbol}"
            ))),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct DecisionsQuery {
    symbol: Option<String>,
    limit: Option<usize>,
}

/// GET /api/decisions?symbol=&limit= - Most recent decisions first
async fn get_decisions(
    State(state): State<DashboardState>,
    Query(query): Query<DecisionsQuery>,
) -> impl IntoResponse {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_DECISION_LIMIT)
        .min(MAX_DECISION_LIMIT);
    let symbol = query.symbol.map(|s| s.to_uppercase());
    match state.store.recent_decisions(symbol.as_deref(), limit).await {
        Ok(decisions) => (StatusCode::OK, Json(ApiResponse::success(decisions))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::<Vec<TradingDecisionRecord>>::error(e.to_string())),
        ),
    }
}

/// GET /api/positions/:symbol - Position records, oldest first
async fn get_positions(
    State(state): State<DashboardState>,
    Path(symbol): Path<String>,
) -> impl IntoResponse {
    match state.store.positions(&symbol.to_uppercase()).await {
        Ok(positions) => (StatusCode::OK, Json(ApiResponse::success(positions))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::<Vec<PositionRecord>>::error(e.to_string())),
        ),
    }
}
