// =============================================================================
// Observer REST Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/` and are read-only: health, trade
// queries, and the WebSocket upgrade for the push feed. CORS is configured
// permissively for development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::binance::user_stream::UserDataStream;
use crate::notice::ClientNoticeService;
use crate::trade::service::{TradeQuery, TradeService};

// =============================================================================
// Shared state
// =============================================================================

/// Handles shared with every observer handler.
#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<TradeService>,
    pub notices: Arc<ClientNoticeService>,
    pub user_stream: Arc<UserDataStream>,
}

// =============================================================================
// Router construction
// =============================================================================

/// Build the observer router with CORS middleware and shared state.
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/trades", get(list_trades))
        .route("/api/v1/trades/:trade_id", get(get_trade))
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    user_stream_connected: bool,
    last_user_event_age_ms: u64,
    active_trades: usize,
    server_time: i64,
}

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        user_stream_connected: state.user_stream.is_connected(),
        last_user_event_age_ms: state.user_stream.last_event_age().as_millis() as u64,
        active_trades: state.service.active_trade_count(),
        server_time: chrono::Utc::now().timestamp_millis(),
    };
    Json(resp)
}

// =============================================================================
// Trades
// =============================================================================

#[derive(Deserialize)]
struct TradeQueryParams {
    symbol: Option<String>,
    #[serde(default)]
    include_archived: bool,
}

async fn list_trades(
    State(state): State<ApiState>,
    Query(params): Query<TradeQueryParams>,
) -> impl IntoResponse {
    let trades = state.service.query(&TradeQuery {
        symbol: params.symbol,
        include_archived: params.include_archived,
    });
    Json(trades)
}

async fn get_trade(
    State(state): State<ApiState>,
    Path(trade_id): Path<String>,
) -> impl IntoResponse {
    match state.service.get(&trade_id) {
        Some(trade) => Json(trade).into_response(),
        None => (StatusCode::NOT_FOUND, "trade not found").into_response(),
    }
}
