//! Request guard middleware
//!
//! Bounds every request's client-observable lifetime. The handler runs
//! on its own task; the guard races it against the class timeout
//! budget. When the budget expires the client gets a 408 immediately
//! while the handler keeps running to completion, and its real outcome
//! is recorded against the same request record afterwards.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::Request;
use axum::http::header::{HeaderValue, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use http_body::Body as _;
use http_body_util::BodyExt;
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::classify::{ApiClassifier, Classification};
use crate::middleware::{Middleware, Next, NextFuture};
use crate::registry::{RequestRecord, RequestRegistry};

/// Largest JSON body buffered for the success-flag check; bigger or
/// unsized bodies stream through untouched
const BODY_INSPECT_LIMIT: u64 = 64 * 1024;

/// Request id carried as an axum request extension so handlers can
/// correlate their own logs with the guard's telemetry
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Marks the record as abandoned if the guard future is dropped before
/// reaching a terminal transition, which happens when the client hangs
/// up mid-request. Stays armed until the transition has actually been
/// written, so a disconnect during response body buffering still
/// terminates the record.
struct TransportGuard {
    registry: Arc<RequestRegistry>,
    id: String,
    armed: bool,
}

impl TransportGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TransportGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self.registry.complete(&self.id, None, false) {
            warn!(request_id = %self.id, "client disconnected before response");
            // only schedule cleanup if a runtime is still around
            if tokio::runtime::Handle::try_current().is_ok() {
                self.registry.schedule_eviction(&self.id);
            }
        }
    }
}

/// Concurrency guard middleware: classification, timeout budget and
/// completion telemetry for every request that passes through it
pub struct RequestGuard {
    registry: Arc<RequestRegistry>,
    classifier: ApiClassifier,
}

impl RequestGuard {
    pub fn new(registry: Arc<RequestRegistry>, classifier: ApiClassifier) -> Self {
        Self {
            registry,
            classifier,
        }
    }

    /// Guard with the production classification table
    pub fn with_service_defaults(registry: Arc<RequestRegistry>) -> Self {
        Self::new(registry, ApiClassifier::service_defaults())
    }

    pub fn registry(&self) -> &Arc<RequestRegistry> {
        &self.registry
    }
}

impl Middleware for RequestGuard {
    fn handle(&self, mut request: Request, next: Next) -> NextFuture<'static> {
        let registry = Arc::clone(&self.registry);
        let path = request.uri().path().to_string();
        let method = request.method().to_string();
        let classification = self.classifier.classify(&path);

        Box::pin(async move {
            let id = Uuid::new_v4().to_string();
            let record = RequestRecord::new(
                id.clone(),
                method.clone(),
                path.clone(),
                classification.class.clone(),
                classification.timeout,
            );
            registry.register(record);
            request.extensions_mut().insert(RequestId(id.clone()));

            debug!(
                request_id = %id,
                method = %method,
                path = %path,
                api_class = %classification.class,
                timeout_ms = classification.timeout.as_millis() as u64,
                "request admitted"
            );

            let mut transport = TransportGuard {
                registry: Arc::clone(&registry),
                id: id.clone(),
                armed: true,
            };

            // the handler owns its task so an expired budget never
            // cancels in-flight work
            let mut handler = tokio::spawn(next.run(request));

            tokio::select! {
                outcome = &mut handler => {
                    match outcome {
                        Ok(response) => {
                            finish_response(
                                &registry,
                                &id,
                                &classification.class,
                                response,
                                &mut transport,
                            )
                            .await
                        }
                        Err(join_error) => {
                            error!(request_id = %id, error = %join_error, "handler task failed");
                            registry.complete(&id, Some(500), true);
                            transport.disarm();
                            registry.schedule_eviction(&id);
                            let response = error_response(
                                StatusCode::INTERNAL_SERVER_ERROR,
                                "internal server error",
                                &id,
                            );
                            stamp_headers(response, &id, &classification.class, &registry)
                        }
                    }
                }
                _ = tokio::time::sleep(classification.timeout) => {
                    let response =
                        on_timeout(Arc::clone(&registry), id.clone(), classification, handler);
                    transport.disarm();
                    response
                }
            }
        })
    }

    fn name(&self) -> &'static str {
        "RequestGuard"
    }
}

/// Terminal path for a handler that beat its budget. The transport
/// guard is disarmed only once the record is terminal.
async fn finish_response(
    registry: &Arc<RequestRegistry>,
    id: &str,
    api_class: &str,
    response: Response,
    transport: &mut TransportGuard,
) -> Response {
    let status = response.status();
    let status_error = status.is_client_error() || status.is_server_error();

    // only JSON bodies with a known size under the cap are buffered for
    // the success-flag check; anything else streams through untouched
    let inspectable = is_json(response.headers())
        && response
            .body()
            .size_hint()
            .upper()
            .is_some_and(|n| n <= BODY_INSPECT_LIMIT);

    if !inspectable {
        registry.complete(id, Some(status.as_u16()), status_error);
        transport.disarm();
        registry.schedule_eviction(id);
        log_completion(registry, id, api_class, status, status_error);
        return stamp_headers(response, id, api_class, registry);
    }

    let (parts, body) = response.into_parts();
    let bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            warn!(request_id = %id, error = %err, "failed to read response body");
            registry.complete(id, Some(status.as_u16()), true);
            transport.disarm();
            registry.schedule_eviction(id);
            let response = error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "response body unavailable",
                id,
            );
            return stamp_headers(response, id, api_class, registry);
        }
    };

    let payload_error = status_error || payload_reports_failure(&bytes);
    registry.complete(id, Some(status.as_u16()), payload_error);
    transport.disarm();
    registry.schedule_eviction(id);
    log_completion(registry, id, api_class, status, payload_error);

    stamp_headers(
        Response::from_parts(parts, Body::from(bytes)),
        id,
        api_class,
        registry,
    )
}

/// Terminal path for an expired budget. The handler task keeps running;
/// a watcher records its eventual outcome against the same record.
fn on_timeout(
    registry: Arc<RequestRegistry>,
    id: String,
    classification: Classification,
    handler: tokio::task::JoinHandle<Response>,
) -> Response {
    let timeout_ms = classification.timeout.as_millis() as u64;
    registry.time_out(&id);
    warn!(
        request_id = %id,
        api_class = %classification.class,
        timeout_ms,
        "request exceeded its timeout budget"
    );

    let watcher_registry = Arc::clone(&registry);
    let watcher_id = id.clone();
    tokio::spawn(async move {
        match handler.await {
            Ok(late) => {
                let status = late.status().as_u16();
                if watcher_registry.record_late_completion(&watcher_id, Some(status)) {
                    info!(
                        request_id = %watcher_id,
                        status,
                        "handler finished after timeout"
                    );
                }
            }
            Err(join_error) => {
                error!(
                    request_id = %watcher_id,
                    error = %join_error,
                    "timed-out handler task failed"
                );
            }
        }
        watcher_registry.schedule_eviction(&watcher_id);
    });

    let body = json!({
        "success": false,
        "message": "request timed out",
        "request_id": id,
        "timeout_ms": timeout_ms,
    });
    let response = Response::builder()
        .status(StatusCode::REQUEST_TIMEOUT)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| Response::new(Body::empty()));
    stamp_headers(response, &id, &classification.class, &registry)
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/json"))
        .unwrap_or(false)
}

/// Whether a JSON payload carries an explicit `"success": false`
fn payload_reports_failure(bytes: &[u8]) -> bool {
    serde_json::from_slice::<serde_json::Value>(bytes)
        .ok()
        .and_then(|value| value.get("success").and_then(|s| s.as_bool()))
        .map(|success| !success)
        .unwrap_or(false)
}

fn log_completion(
    registry: &Arc<RequestRegistry>,
    id: &str,
    api_class: &str,
    status: StatusCode,
    payload_error: bool,
) {
    if let Some(duration_ms) = registry.get(id).and_then(|r| r.duration_ms) {
        info!(
            request_id = %id,
            api_class = %api_class,
            status = status.as_u16(),
            duration_ms,
            payload_error,
            "request completed"
        );
    }
}

fn stamp_headers(
    mut response: Response,
    id: &str,
    api_class: &str,
    registry: &Arc<RequestRegistry>,
) -> Response {
    if let Ok(value) = HeaderValue::from_str(id) {
        response.headers_mut().insert("x-request-id", value);
    }
    if let Ok(value) = HeaderValue::from_str(api_class) {
        response.headers_mut().insert("x-api-type", value);
    }
    if let Some(duration_ms) = registry.get(id).and_then(|r| r.duration_ms) {
        if let Ok(value) = HeaderValue::from_str(&duration_ms.to_string()) {
            response.headers_mut().insert("x-request-duration", value);
        }
    }
    response
}

fn error_response(status: StatusCode, message: &str, id: &str) -> Response {
    let body = json!({
        "success": false,
        "message": message,
        "request_id": id,
    });
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}
