//! Liveness and readiness probes.
//!
//! Liveness only proves the process is serving requests. Readiness is a pure
//! function of the publisher's state and a time-bounded store ping, so an
//! orchestrator stops routing traffic the moment either collaborator drops.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::warn;

use crate::state::AppState;

pub async fn live() -> Response {
    (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
}

pub async fn ready(State(state): State<AppState>) -> Response {
    if !state.publisher.ready() {
        warn!(event = "publisher_not_ready");
        return (StatusCode::SERVICE_UNAVAILABLE, "Publisher not ready").into_response();
    }

    match tokio::time::timeout(state.readiness_ping_timeout, state.store.ping()).await {
        Err(_elapsed) => {
            warn!(event = "db_ping_timeout");
            (StatusCode::SERVICE_UNAVAILABLE, "Database not ready").into_response()
        }
        Ok(Err(err)) => {
            warn!(event = "db_not_ready", error = %err);
            (StatusCode::SERVICE_UNAVAILABLE, "Database not ready").into_response()
        }
        Ok(Ok(())) => (StatusCode::OK, "OK").into_response(),
    }
}
