use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use paragon_app::server::build_health_router;

#[tokio::test]
async fn health_returns_ok_json() {
    let app = build_health_router();
    let response = app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/health")
                .body(Body::empty())
                .expect("request builder should not fail"),
        )
        .await
        .expect("health handler should respond");

    assert_eq!(response.status(), StatusCode::OK);

    let body_bytes = response
        .into_body()
        .collect()
        .await
        .expect("response body must be readable")
        .to_bytes();
    let value: Value =
        serde_json::from_slice(body_bytes.as_ref()).expect("health response must be valid JSON");

    assert_eq!(value["status"], "ok");
    assert_eq!(value["service"], "paragon");
    assert!(value["timestamp"].is_i64(), "timestamp must be epoch millis");
}
