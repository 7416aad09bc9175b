use axum::{extract::State, Json};
use serde_json::{json, Value as JsonValue};

use crate::{ApiError, AppState};

/// Liveness plus queue store reachability. Returns 503 when the store is down.
pub async fn health_check(State(state): State<AppState>) -> Result<Json<JsonValue>, ApiError> {
    state.jobs.health().await?;
    Ok(Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "queue": "reachable",
    })))
}
