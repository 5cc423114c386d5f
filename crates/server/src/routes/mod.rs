use axum::{Router, http::StatusCode, routing::get};

use crate::AppState;

pub mod health;
pub mod metrics;

pub fn router(state: AppState) -> Router {
    let mut router = Router::new().route("/", get(health::liveness));
    if state.metrics_enabled() {
        router = router.route("/metrics", get(metrics::render));
    }
    if state.pprof_enabled() {
        // Accepted for compatibility; there is no pprof runtime to expose.
        router = router.route("/debug/pprof/{*rest}", get(pprof_unsupported));
    }
    router.with_state(state)
}

async fn pprof_unsupported() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "pprof is not supported\n")
}
