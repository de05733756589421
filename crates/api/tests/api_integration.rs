//! Integration tests for the API server.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use metrics_exporter_prometheus::PrometheusHandle;
use orchestrator::{OrchestratorConfig, SagaHost};
use saga_store::InMemorySagaStore;
use tower::ServiceExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

async fn setup() -> (axum::Router, SagaHost<InMemorySagaStore>) {
    let config = OrchestratorConfig {
        relay_poll_interval: Duration::from_millis(50),
        ..OrchestratorConfig::default()
    };
    let (state, host) = api::create_default_state(InMemorySagaStore::new(), config)
        .await
        .unwrap();
    let app = api::create_app(Arc::clone(&state), get_metrics_handle());
    (app, host)
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn post_order(body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/orders")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health_check() {
    let (app, host) = setup().await;

    let response = app.oneshot(get("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["status"], "ok");
    host.shutdown().await;
}

#[tokio::test]
async fn test_submit_order_is_accepted() {
    let (app, host) = setup().await;

    let response = app
        .oneshot(post_order(serde_json::json!({ "amount_cents": 4999 })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = json_body(response).await;
    let key = json["correlation_key"].as_str().unwrap();
    assert!(uuid::Uuid::parse_str(key).is_ok());
    host.shutdown().await;
}

#[tokio::test]
async fn test_submitted_order_completes() {
    let (app, host) = setup().await;

    let response = app
        .clone()
        .oneshot(post_order(serde_json::json!({
            "customer_id": uuid::Uuid::new_v4().to_string(),
            "amount_cents": 2500,
            "item_ids": [uuid::Uuid::new_v4()]
        })))
        .await
        .unwrap();
    let key = json_body(response).await["correlation_key"]
        .as_str()
        .unwrap()
        .to_string();

    let mut status = serde_json::Value::Null;
    for _ in 0..100 {
        let response = app
            .clone()
            .oneshot(get(&format!("/orders/{key}")))
            .await
            .unwrap();
        if response.status() == StatusCode::OK {
            status = json_body(response).await;
            if status["state"] == "Completed" {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(status["state"], "Completed");
    assert_eq!(status["correlation_key"], key);
    assert_eq!(status["amount_cents"], 2500);
    assert!(status["payment_reference"].as_str().is_some());
    assert!(status["failure_reason"].is_null());
    host.shutdown().await;
}

#[tokio::test]
async fn test_get_unknown_order() {
    let (app, host) = setup().await;
    let key = uuid::Uuid::new_v4();

    let response = app.oneshot(get(&format!("/orders/{key}"))).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    host.shutdown().await;
}

#[tokio::test]
async fn test_get_with_malformed_key() {
    let (app, host) = setup().await;

    let response = app.oneshot(get("/orders/not-a-uuid")).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = json_body(response).await;
    assert!(json["error"].as_str().unwrap().contains("Invalid correlation key"));
    host.shutdown().await;
}

#[tokio::test]
async fn test_submit_rejects_non_positive_amount() {
    let (app, host) = setup().await;

    let response = app
        .oneshot(post_order(serde_json::json!({ "amount_cents": 0 })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    host.shutdown().await;
}

#[tokio::test]
async fn test_submit_rejects_malformed_customer() {
    let (app, host) = setup().await;

    let response = app
        .oneshot(post_order(serde_json::json!({
            "customer_id": "someone",
            "amount_cents": 100
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    host.shutdown().await;
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let (app, host) = setup().await;

    app.clone()
        .oneshot(post_order(serde_json::json!({ "amount_cents": 100 })))
        .await
        .unwrap();

    let response = app.oneshot(get("/metrics")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.contains("text/plain"));
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("api_orders_submitted_total"));
    host.shutdown().await;
}
