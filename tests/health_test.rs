mod common;

use axum::http::StatusCode;
use common::*;
use serde_json::json;

#[tokio::test]
async fn test_health_check() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(
        test_config(dir.path()),
        real_pipeline(StubClassifier::returning(&[])),
    );

    let response = send(&app, get("/health")).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"status": "healthy"}));
}

#[tokio::test]
async fn test_openapi_document_lists_routes() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(
        test_config(dir.path()),
        real_pipeline(StubClassifier::returning(&[])),
    );

    let response = send(&app, get("/api-docs/openapi.json")).await;

    assert_eq!(response.status(), StatusCode::OK);
    let doc = body_json(response).await;
    for path in ["/health", "/process", "/download/{filename}"] {
        assert!(doc["paths"].get(path).is_some(), "missing {path}");
    }
}
