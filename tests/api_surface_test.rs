mod common;

use axum::http::{Method, StatusCode};
use common::TestApp;

#[tokio::test]
async fn health_reports_the_database() {
    let app = TestApp::new().await;

    let (status, body) = app.request(Method::GET, "/health", None, None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "up");
    assert_eq!(body["database"], "up");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn openapi_document_is_served() {
    let app = TestApp::new().await;

    let (status, body) = app
        .request(Method::GET, "/api-docs/openapi.json", None, None)
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["info"]["title"], "Storefront API");
    assert!(body["paths"]["/api/v1/orders/cancel"].is_object());
}

#[tokio::test]
async fn metrics_are_exposed_as_text() {
    let app = TestApp::new().await;
    storefront_api::metrics::register_metrics();

    let (status, body) = app.request(Method::GET, "/metrics", None, None).await;

    assert_eq!(status, StatusCode::OK);
    assert!(body.as_str().unwrap_or_default().contains("returns_expired_total"));
}

#[tokio::test]
async fn garbage_tokens_are_rejected() {
    let app = TestApp::new().await;

    let (status, body) = app
        .request(
            Method::POST,
            "/api/v1/orders/returns",
            Some(serde_json::json!({})),
            Some("not-a-jwt"),
        )
        .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"]["code"].is_string());
}
