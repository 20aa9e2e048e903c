//! HTTP-level tests for stats, cleanup and the health endpoint.

mod common;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use common::*;
use tower::ServiceExt;

#[tokio::test]
async fn health_reports_ok_with_online_provider() {
    let app = default_app();
    let response = get(&app, "/health").await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
    assert_eq!(json["providers_online"], 1);
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let app = default_app();
    let response = get(&app, "/this-route-does-not-exist").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn response_contains_x_request_id_header() {
    let app = default_app();
    let response = get(&app, "/health").await;
    assert!(response.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn cors_preflight_allows_configured_origin() {
    let app = default_app();
    let request = Request::builder()
        .method(Method::OPTIONS)
        .uri("/generate")
        .header("origin", "http://localhost:5173")
        .header("access-control-request-method", "POST")
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();

    assert_eq!(
        response.headers()["access-control-allow-origin"],
        "http://localhost:5173"
    );
}

#[tokio::test]
async fn stats_reflect_completed_jobs() {
    let app = default_app();
    let job_id = submit(&app, generate_body("a kite")).await;
    wait_terminal(&app, &job_id).await;

    let json = body_json(get(&app, "/stats").await).await;
    assert_eq!(json["data"]["queue"]["completed"], 1);
    assert_eq!(json["data"]["queue"]["waiting"], 0);
    assert_eq!(json["data"]["cache"]["entry_count"], 1);
    assert_eq!(json["data"]["subscribers"], 0);
}

#[tokio::test]
async fn cleanup_accepts_empty_body_and_invalidates_tags() {
    let app = default_app();
    let job_id = submit(&app, generate_body("a lantern")).await;
    wait_terminal(&app, &job_id).await;

    let response = post_empty(&app, "/cleanup").await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["cache_invalidated"], 0);
    assert_eq!(json["data"]["queue"]["remaining"], 1);

    let response = post_json(
        &app,
        "/cleanup",
        serde_json::json!({ "invalidate_tags": ["provider:local"] }),
    )
    .await;
    let json = body_json(response).await;
    assert_eq!(json["data"]["cache_invalidated"], 1);
}

#[tokio::test]
async fn cleanup_rejects_malformed_body() {
    let app = default_app();
    let response = post_json(&app, "/cleanup", serde_json::json!({ "invalidate_tags": 5 })).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
