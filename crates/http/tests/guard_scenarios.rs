//! End-to-end request guard scenarios driven through the middleware
//! pipeline with a paused clock.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::Request;
use axum::http::header::CONTENT_TYPE;
use axum::http::{Method, StatusCode};
use axum::response::Response;
use http_body_util::BodyExt;
use serde_json::json;

use medigate_http::{MiddlewarePipeline, RequestGuard, RequestRegistry, RequestStatus};

fn pipeline(registry: Arc<RequestRegistry>) -> MiddlewarePipeline {
    MiddlewarePipeline::new().add(RequestGuard::with_service_defaults(registry))
}

fn request(path: &str) -> Request {
    Request::builder()
        .method(Method::GET)
        .uri(path)
        .body(Body::empty())
        .unwrap()
}

fn ok_json(body: serde_json::Value) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn header(response: &Response, name: &str) -> String {
    response
        .headers()
        .get(name)
        .expect("header present")
        .to_str()
        .unwrap()
        .to_string()
}

/// A slow handler gets cut off at its class budget, its eventual finish
/// is recorded against the same request, and the record is evicted
/// after the grace window.
#[tokio::test(start_paused = true)]
async fn slow_handler_times_out_then_resolves_late() {
    let registry = Arc::new(RequestRegistry::new(Duration::from_secs(30)));
    let pipeline = pipeline(Arc::clone(&registry));

    // queue-display carries a 5s budget; the handler needs 6s
    let response = pipeline
        .execute(request("/api/queue/display"), |_req| async move {
            tokio::time::sleep(Duration::from_secs(6)).await;
            ok_json(json!({"success": true, "queue": []}))
        })
        .await;

    assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    let id = header(&response, "x-request-id");

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let payload: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(payload["success"], json!(false));
    assert_eq!(payload["timeout_ms"], json!(5000));
    assert_eq!(payload["request_id"], json!(id));

    let record = registry.get(&id).unwrap();
    assert_eq!(record.status, RequestStatus::TimedOut);
    assert_eq!(registry.timeouts(), 1);

    // one more second and the handler finishes; the watcher records
    // the real outcome without another counter bump
    tokio::time::sleep(Duration::from_secs(2)).await;
    let record = registry.get(&id).unwrap();
    assert_eq!(record.status, RequestStatus::Completed);
    assert_eq!(record.response_status, Some(200));
    assert_eq!(registry.timeouts(), 1);
    assert_eq!(registry.errors(), 0);

    // the record survives the grace window, then disappears
    tokio::time::sleep(Duration::from_secs(28)).await;
    assert!(registry.get(&id).is_some());
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(registry.get(&id).is_none());

    // counters outlive the record
    assert_eq!(registry.total(), 1);
    assert_eq!(registry.timeouts(), 1);
}

/// A fast handler passes through untouched apart from the telemetry
/// headers, and its record reaches `completed` exactly once.
#[tokio::test]
async fn fast_handler_completes_with_telemetry() {
    let registry = Arc::new(RequestRegistry::default());
    let pipeline = pipeline(Arc::clone(&registry));

    let response = pipeline
        .execute(request("/api/patients/77"), |_req| async move {
            ok_json(json!({"success": true, "data": {"id": 77}}))
        })
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-api-type"), "patient-lookup");
    // duration is a bare integer millisecond value
    assert!(header(&response, "x-request-duration").parse::<u64>().is_ok());

    let id = header(&response, "x-request-id");
    let record = registry.get(&id).unwrap();
    assert_eq!(record.status, RequestStatus::Completed);
    assert_eq!(record.api_class, "patient-lookup");
    assert_eq!(registry.total(), 1);
    assert_eq!(registry.timeouts(), 0);
    assert_eq!(registry.errors(), 0);

    // the body the client sees is the handler's, byte for byte
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let payload: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(payload["data"]["id"], json!(77));
}

/// An application-level failure under a 200 status still counts as an
/// error in the aggregate stats.
#[tokio::test]
async fn payload_failure_is_counted_without_changing_the_response() {
    let registry = Arc::new(RequestRegistry::default());
    let pipeline = pipeline(Arc::clone(&registry));

    let response = pipeline
        .execute(request("/api/requisitions"), |_req| async move {
            ok_json(json!({"success": false, "message": "lab closed"}))
        })
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(registry.errors(), 1);

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let payload: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(payload["message"], json!("lab closed"));
}

/// Concurrent requests in different classes get their own budgets and
/// are tracked independently.
#[tokio::test(start_paused = true)]
async fn per_class_budgets_apply_independently() {
    let registry = Arc::new(RequestRegistry::default());

    // 12s handler: over queue-display's 5s budget, under save-record's 30s
    let queue_pipeline = pipeline(Arc::clone(&registry));
    let save_pipeline = pipeline(Arc::clone(&registry));

    let queue = tokio::spawn(async move {
        queue_pipeline
            .execute(request("/api/queue/display"), |_req| async move {
                tokio::time::sleep(Duration::from_secs(12)).await;
                ok_json(json!({"success": true}))
            })
            .await
    });
    let save = tokio::spawn(async move {
        save_pipeline
            .execute(request("/api/patients/save"), |_req| async move {
                tokio::time::sleep(Duration::from_secs(12)).await;
                ok_json(json!({"success": true}))
            })
            .await
    });

    let (queue, save) = (queue.await.unwrap(), save.await.unwrap());
    assert_eq!(queue.status(), StatusCode::REQUEST_TIMEOUT);
    assert_eq!(save.status(), StatusCode::OK);
    assert_eq!(header(&save, "x-api-type"), "save-record");
    assert_eq!(registry.timeouts(), 1);
}
