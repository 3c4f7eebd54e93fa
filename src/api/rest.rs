// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. The route set mirrors the control
// verbs of the engine:
//
//   system  — start / stop / status
//   session — status (full or delta-cursor export)
//   data    — add-symbol / remove-symbol / list-dynamic
//
// HTTP statuses express the exit-code contract: 200 success, 422 validation
// failure, 500 runtime failure.
//
// CORS is configured permissively for development; tighten the allowed
// origins in production.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::coordinator::AddOutcome;
use crate::error::CoreError;
use crate::system::{SystemManager, SystemState};
use crate::types::AddedBy;

/// How long a synchronous caller waits for a mid-session request to drain.
const PENDING_REPLY_TIMEOUT: Duration = Duration::from_secs(60);

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(manager: Arc<SystemManager>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/system/start", post(system_start))
        .route("/api/v1/system/stop", post(system_stop))
        .route("/api/v1/system/status", get(system_status))
        .route("/api/v1/session/status", get(session_status))
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/data/symbols", post(add_symbol))
        .route("/api/v1/data/symbols/:symbol", delete(remove_symbol))
        .route("/api/v1/data/dynamic", get(list_dynamic))
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(manager)
}

// =============================================================================
// Health
// =============================================================================

async fn health(State(manager): State<Arc<SystemManager>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "state": manager.state().to_string(),
        "session_version": manager.session_version(),
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

// =============================================================================
// System control
// =============================================================================

async fn system_start(State(manager): State<Arc<SystemManager>>) -> impl IntoResponse {
    match manager.start() {
        Ok(()) => {
            info!("system start requested via API");
            (StatusCode::OK, Json(manager.status_json())).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn system_stop(State(manager): State<Arc<SystemManager>>) -> impl IntoResponse {
    manager.stop().await;
    info!("system stop requested via API");
    (StatusCode::OK, Json(manager.status_json())).into_response()
}

async fn system_status(State(manager): State<Arc<SystemManager>>) -> impl IntoResponse {
    let status = manager.status_json();
    // A failed system reports its terminal state with a runtime-failure
    // status, matching the exit-code contract.
    let code = if manager.state() == SystemState::Failed {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    (code, Json(status)).into_response()
}

// =============================================================================
// Session status
// =============================================================================

#[derive(Deserialize)]
struct SessionStatusQuery {
    #[serde(default)]
    full: bool,
}

async fn session_status(
    State(manager): State<Arc<SystemManager>>,
    Query(query): Query<SessionStatusQuery>,
) -> impl IntoResponse {
    Json(manager.export_state(query.full))
}

async fn full_state(State(manager): State<Arc<SystemManager>>) -> impl IntoResponse {
    Json(manager.export_state(true))
}

// =============================================================================
// Data operations
// =============================================================================

#[derive(Deserialize)]
struct AddSymbolRequest {
    symbol: String,
}

async fn add_symbol(
    State(manager): State<Arc<SystemManager>>,
    Json(request): Json<AddSymbolRequest>,
) -> impl IntoResponse {
    let symbol = request.symbol.trim().to_uppercase();
    if symbol.is_empty() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({ "error": "symbol must not be empty" })),
        )
            .into_response();
    }

    let reply = match manager.add_symbol(&symbol, AddedBy::Strategy) {
        Ok(rx) => rx,
        Err(e) => return error_response(e),
    };

    match tokio::time::timeout(PENDING_REPLY_TIMEOUT, reply).await {
        Ok(Ok(Ok(outcome))) => {
            info!(symbol = %symbol, outcome = ?outcome, "symbol added via API");
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "symbol": symbol,
                    "outcome": outcome_tag(outcome),
                })),
            )
                .into_response()
        }
        Ok(Ok(Err(e))) => error_response(e),
        Ok(Err(_)) | Err(_) => {
            warn!(symbol = %symbol, "add-symbol request timed out or was dropped");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "request was not processed" })),
            )
                .into_response()
        }
    }
}

async fn remove_symbol(
    State(manager): State<Arc<SystemManager>>,
    Path(symbol): Path<String>,
) -> impl IntoResponse {
    let symbol = symbol.trim().to_uppercase();
    let reply = match manager.remove_symbol(&symbol) {
        Ok(rx) => rx,
        Err(e) => return error_response(e),
    };

    match tokio::time::timeout(PENDING_REPLY_TIMEOUT, reply).await {
        Ok(Ok(Ok(_))) => (
            StatusCode::OK,
            Json(serde_json::json!({ "symbol": symbol, "outcome": "removed" })),
        )
            .into_response(),
        Ok(Ok(Err(e))) => error_response(e),
        Ok(Err(_)) | Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": "request was not processed" })),
        )
            .into_response(),
    }
}

async fn list_dynamic(State(manager): State<Arc<SystemManager>>) -> impl IntoResponse {
    Json(serde_json::json!({ "symbols": manager.dynamic_symbols() }))
}

// =============================================================================
// Helpers
// =============================================================================

fn outcome_tag(outcome: AddOutcome) -> &'static str {
    match outcome {
        AddOutcome::Provisioned => "provisioned",
        AddOutcome::AlreadyPresent => "already_present",
        AddOutcome::Upgraded => "upgraded",
        AddOutcome::Removed => "removed",
    }
}

fn error_response(e: CoreError) -> axum::response::Response {
    let status = match &e {
        CoreError::Validation { .. } | CoreError::Config(_) | CoreError::UnknownSymbol(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": e.to_string() }))).into_response()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_statuses_follow_the_exit_code_contract() {
        let validation = CoreError::Validation {
            symbol: "X".into(),
            reason: "no source".into(),
        };
        let resp = error_response(validation);
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let runtime = CoreError::data("boom");
        let resp = error_response(runtime);
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn outcome_tags_are_stable() {
        assert_eq!(outcome_tag(AddOutcome::Provisioned), "provisioned");
        assert_eq!(outcome_tag(AddOutcome::AlreadyPresent), "already_present");
        assert_eq!(outcome_tag(AddOutcome::Upgraded), "upgraded");
        assert_eq!(outcome_tag(AddOutcome::Removed), "removed");
    }
}
