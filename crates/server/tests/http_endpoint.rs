use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use server::{AppState, routes};
use tower::util::ServiceExt;

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn liveness_flips_with_readiness_and_stays_up() {
    let state = AppState::new(false, false);
    let app = routes::router(state.clone());

    let res = app.clone().oneshot(get("/")).await.unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

    state.set_ready();
    let res = app.clone().oneshot(get("/")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    // Readiness is monotonic; a second set is a no-op.
    state.set_ready();
    let res = app.oneshot(get("/")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn metrics_route_only_exists_when_enabled() {
    let app = routes::router(AppState::new(false, false));
    let res = app.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    // Touch a counter so the registry has something to render.
    services::services::metrics::FETCH_TOTAL.inc();
    let app = routes::router(AppState::new(true, false));
    let res = app.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    assert!(
        String::from_utf8_lossy(&body).contains("gitsync_fetch_total"),
        "metrics body should carry gitsync counters"
    );
}

#[tokio::test]
async fn pprof_stub_answers_when_enabled() {
    let app = routes::router(AppState::new(false, true));
    let res = app.oneshot(get("/debug/pprof/heap")).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}
