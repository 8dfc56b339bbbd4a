// tests/metrics.rs
use axum::body::{self, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use tower::ServiceExt;

// Build full in-process app with /metrics mounted.
async fn build_app() -> Router {
    std::env::set_var("DEBUG_ROUTES", "1");
    std::env::remove_var("AI_TEST_MODE");
    plan_completeness_analyzer::app()
        .await
        .expect("app() should build Router in tests")
}

async fn post_analyze(app: &Router, payload: &'static str) -> StatusCode {
    app.clone()
        .oneshot(
            Request::post("/analyze")
                .header("content-type", "application/json")
                .body(Body::from(payload))
                .unwrap(),
        )
        .await
        .unwrap()
        .status()
}

async fn scrape(app: &Router) -> String {
    let resp = app
        .clone()
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    // axum::body::to_bytes requires an explicit limit
    let body = body::to_bytes(resp.into_body(), 1_048_576).await.unwrap(); // 1 MiB
    String::from_utf8(body.to_vec()).unwrap()
}

#[tokio::test]
async fn miss_then_hit_shows_up_in_exposition() {
    let app = build_app().await;
    let payload = r#"{"text":"来期に新商品を発売し市場シェア拡大を目指す"}"#;

    assert_eq!(post_analyze(&app, payload).await, StatusCode::OK);
    assert_eq!(post_analyze(&app, payload).await, StatusCode::OK);

    let text = scrape(&app).await;
    for needle in [
        "completeness_cache_hits_total",
        "completeness_cache_misses_total",
        "completeness_provider_unavailable_total",
        "completeness_analyze_duration_ms",
        "completeness_cache_ttl_ms",
    ] {
        assert!(
            text.contains(needle),
            "metrics exposition missing '{needle}'\n{text}"
        );
    }
}
