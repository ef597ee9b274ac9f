//! Integration tests for the health endpoint.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

#[tokio::test]
async fn test_health_returns_200_with_status_ok() {
    // Arrange
    let app = omnicron_server::app(common::ticker_state());
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();

    // Act
    let response = app.oneshot(request).await.unwrap();

    // Assert
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
    assert_eq!(json["streamTypes"], serde_json::json!(["ticker"]));
}

#[tokio::test]
async fn test_unknown_route_returns_404() {
    let app = omnicron_server::app(common::ticker_state());
    let request = Request::builder()
        .uri("/api/v1/nonexistent")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_plain_get_on_websocket_endpoint_is_rejected() {
    let app = omnicron_server::app(common::ticker_state());
    let request = Request::builder().uri("/ws").body(Body::empty()).unwrap();

    let response = app.oneshot(request).await.unwrap();

    assert!(response.status().is_client_error());
}
