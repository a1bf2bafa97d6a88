// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. `health` and `market_symbols` are
// public. Session control (`start_market_stream`, `stop_market_stream`) and
// the preferences/drawings surface require a valid Bearer token, checked via
// the `AuthBearer` extractor.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::controller::StartArgs;
use crate::error::PipelineError;
use crate::exchange::ExchangeClient;
use crate::persistence::{Drawing, DrawingScope, MarketPreferences};
use crate::types::MarketKind;

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        .route("/api/v1/market_symbols", get(market_symbols))
        // ── Session control (authenticated) ──────────────────────────
        .route("/api/v1/start_market_stream", post(start_market_stream))
        .route("/api/v1/stop_market_stream", post(stop_market_stream))
        .route("/api/v1/market_stream_status", get(market_stream_status))
        // ── Preferences / drawings (authenticated) ───────────────────
        .route("/api/v1/preferences", get(get_preferences))
        .route("/api/v1/preferences", put(set_preferences))
        .route("/api/v1/drawings", get(list_drawings))
        .route("/api/v1/drawings", post(upsert_drawing))
        .route("/api/v1/drawings/:id", delete(delete_drawing))
        // ── WebSocket (handled separately in ws module, mounted here) ─
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    server_time: i64,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Symbol directory (public)
// =============================================================================

#[derive(Deserialize)]
struct SymbolsQuery {
    market_kind: Option<MarketKind>,
}

async fn market_symbols(Query(query): Query<SymbolsQuery>) -> impl IntoResponse {
    let market_kind = query.market_kind.unwrap_or_default();
    let client = match ExchangeClient::new(market_kind) {
        Ok(c) => c,
        Err(e) => return pipeline_error_response(&PipelineError::InternalInvariant { reason: e.to_string() }),
    };
    match client.fetch_symbols().await {
        Ok(symbols) => Json(symbols).into_response(),
        Err(e) => pipeline_error_response(&PipelineError::NetworkTransient { reason: e.to_string() }),
    }
}

// =============================================================================
// Session control (authenticated)
// =============================================================================

async fn start_market_stream(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(args): Json<StartArgs>,
) -> impl IntoResponse {
    match state.controller.start(args).await {
        Ok(session) => Json(session).into_response(),
        Err(e) => pipeline_error_response(&e),
    }
}

async fn stop_market_stream(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stopped = state.controller.stop().await;
    Json(serde_json::json!({ "stopped": stopped }))
}

async fn market_stream_status(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.controller.status())
}

/// Maps the command-visible error kinds to HTTP status; everything else
/// (transient network issues, sequence gaps) is never produced by the
/// Controller's own validation path, but is handled defensively the same way.
fn pipeline_error_response(err: &PipelineError) -> axum::response::Response {
    let status = match err {
        PipelineError::InvalidArgs { .. } => StatusCode::BAD_REQUEST,
        PipelineError::AlreadyStarting => StatusCode::CONFLICT,
        PipelineError::FatalRejection { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}

// =============================================================================
// Preferences (authenticated)
// =============================================================================

async fn get_preferences(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.preferences.get_preferences() {
        Ok(prefs) => Json(prefs).into_response(),
        Err(e) => {
            warn!(error = %e, "failed to read preferences");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "error": e.to_string() }))).into_response()
        }
    }
}

async fn set_preferences(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(prefs): Json<MarketPreferences>,
) -> impl IntoResponse {
    match state.preferences.set_preferences(prefs.clone()) {
        Ok(()) => Json(prefs).into_response(),
        Err(e) => {
            warn!(error = %e, "failed to persist preferences");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "error": e.to_string() }))).into_response()
        }
    }
}

// =============================================================================
// Drawings (authenticated)
// =============================================================================

#[derive(Deserialize)]
struct DrawingsQuery {
    market_kind: MarketKind,
    symbol: String,
    timeframe: crate::types::Timeframe,
}

async fn list_drawings(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(query): Query<DrawingsQuery>,
) -> impl IntoResponse {
    let scope = DrawingScope {
        market_kind: query.market_kind,
        symbol: query.symbol,
        timeframe: query.timeframe,
    };
    match state.preferences.list_drawings(&scope) {
        Ok(drawings) => Json(drawings).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "error": e.to_string() }))).into_response(),
    }
}

#[derive(Deserialize)]
struct UpsertDrawingRequest {
    scope: DrawingScope,
    drawing: Drawing,
}

async fn upsert_drawing(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<UpsertDrawingRequest>,
) -> impl IntoResponse {
    match state.preferences.upsert_drawing(req.scope, req.drawing) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "error": e.to_string() }))).into_response(),
    }
}

async fn delete_drawing(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    axum::extract::Path(id): axum::extract::Path<String>,
    Query(query): Query<DrawingsQuery>,
) -> impl IntoResponse {
    let scope = DrawingScope {
        market_kind: query.market_kind,
        symbol: query.symbol,
        timeframe: query.timeframe,
    };
    match state.preferences.delete_drawing(&scope, &id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "error": e.to_string() }))).into_response(),
    }
}
