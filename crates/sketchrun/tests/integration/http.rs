use std::sync::Arc;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use sketchrun::{AppState, router};
use tower::ServiceExt;

use super::{queue, test_config};

async fn post_code(code: &str) -> (StatusCode, Value) {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path()).await;
    let state = AppState::new(Arc::new(queue(&config)), config.server.request_timeout());
    let app = router(state, &config.server.allowed_origins);

    let response = app
        .oneshot(
            Request::post("/run")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({ "code": code }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_run_hi() {
    let (status, body) = post_code(r#"void setup(){ Serial.println("hi"); } void loop(){}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"output": "hi"}));
}

#[tokio::test]
async fn test_run_compile_error() {
    let (status, body) = post_code("void setup(){} void loop(").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["error"].as_str().unwrap().contains("expected"));
    assert!(body.get("output").is_none());
}

#[tokio::test]
async fn test_run_timeout() {
    let (status, body) = post_code("void setup(){} void loop(){ for(;;){} }").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"error": "execution timed out"}));
}
