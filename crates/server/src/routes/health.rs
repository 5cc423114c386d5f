use axum::{extract::State, http::StatusCode};

use crate::AppState;

/// Liveness probe: 503 until the first successful sync, 200 forever after.
pub async fn liveness(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.is_ready() {
        (StatusCode::OK, "OK\n")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "waiting for first sync\n")
    }
}
