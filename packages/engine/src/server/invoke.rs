// packages/engine/src/server/invoke.rs
//! Invocation adapter
//!
//! ```text
//! POST /invoke
//! {"name": "resize", "code": "export default async (input) => ...", "input": {...}}
//! ```
//!
//! The worker receives `{"input": ...}` and its reply is passed through with
//! its own status. Engine failures map onto HTTP statuses:
//!
//! | kind                           | status |
//! |--------------------------------|--------|
//! | invalid_request                | 400    |
//! | body over `max_body_bytes`     | 413    |
//! | worker_unavailable             | 502    |
//! | health_timeout, shutting_down  | 503    |
//! | request_timeout                | 504    |
//! | anything else                  | 500    |

use crate::runtime::{Fingerprint, ProcessManager};
use crate::server::{error_response, with_content_type, HttpHandler};
use crate::utils::errors::EngineError;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Incoming};
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

/// Response header carrying the worker fingerprint
pub const FINGERPRINT_HEADER: &str = "x-skyhook-fingerprint";

const ROUTE: &str = "/invoke";

const ANONYMOUS: &str = "anonymous";

/// Inbound invocation
#[derive(Debug, Deserialize)]
pub struct InvokeRequest {
    /// Log label only
    #[serde(default)]
    pub name: Option<String>,
    pub code: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

pub struct InvokeService {
    manager: Arc<ProcessManager>,
    max_body_bytes: usize,
}

impl InvokeService {
    pub fn new(manager: Arc<ProcessManager>, max_body_bytes: usize) -> Self {
        Self {
            manager,
            max_body_bytes,
        }
    }

    /// Route one request
    pub async fn route<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if req.uri().path() != ROUTE {
            return error_response(StatusCode::NOT_FOUND, "not_found", "no such route");
        }
        if req.method() != Method::POST {
            return error_response(StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed", "use POST");
        }

        let body = match Limited::new(req.into_body(), self.max_body_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                return error_response(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    "payload_too_large",
                    &format!("body exceeds {} bytes", self.max_body_bytes),
                );
            }
            Err(e) => {
                return failure(&EngineError::InvalidRequest(format!("reading body: {}", e)));
            }
        };

        let request = match parse(&body) {
            Ok(request) => request,
            Err(e) => return failure(&e),
        };
        let name = request.name.as_deref().unwrap_or(ANONYMOUS);

        let payload = match serde_json::to_vec(&serde_json::json!({ "input": request.input })) {
            Ok(payload) => Bytes::from(payload),
            Err(e) => return failure(&EngineError::InvalidRequest(e.to_string())),
        };

        let fingerprint = Fingerprint::of(&request.code);
        debug!(
            function = name,
            fingerprint = %fingerprint.short(),
            bytes = payload.len(),
            "Forwarding invocation"
        );

        let mut response = match self.manager.invoke(name, &request.code, payload).await {
            Ok(reply) => {
                let mut response = with_content_type(reply.status, reply.body, "application/json");
                if let Some(content_type) = reply
                    .content_type
                    .as_deref()
                    .and_then(|v| HeaderValue::from_str(v).ok())
                {
                    response.headers_mut().insert(CONTENT_TYPE, content_type);
                }
                response
            }
            Err(e) => failure(&e),
        };

        if let Ok(value) = HeaderValue::from_str(fingerprint.as_str()) {
            response
                .headers_mut()
                .insert(HeaderName::from_static(FINGERPRINT_HEADER), value);
        }
        response
    }
}

#[async_trait]
impl HttpHandler for InvokeService {
    async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        self.route(req).await
    }
}

fn parse(body: &[u8]) -> Result<InvokeRequest, EngineError> {
    let request: InvokeRequest = serde_json::from_slice(body)
        .map_err(|e| EngineError::InvalidRequest(format!("malformed JSON: {}", e)))?;

    if request.code.trim().is_empty() {
        return Err(EngineError::InvalidRequest("code cannot be empty".to_string()));
    }
    Ok(request)
}

/// HTTP status for an engine error
pub fn status_for(error: &EngineError) -> StatusCode {
    match error {
        EngineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        EngineError::WorkerUnavailable { .. } => StatusCode::BAD_GATEWAY,
        EngineError::HealthTimeout { .. } | EngineError::ShuttingDown => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        EngineError::RequestTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        EngineError::Spawn(_)
        | EngineError::Eviction(_)
        | EngineError::Config(_)
        | EngineError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failure(error: &EngineError) -> Response<Full<Bytes>> {
    error_response(status_for(error), error.kind(), &error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::{MockProber, MockSpawner, ProbeScript, StubWorker};
    use crate::runtime::ManagerSettings;
    use std::time::Duration;

    async fn service(stub: &StubWorker) -> InvokeService {
        let manager = ProcessManager::with_components(
            ManagerSettings::default(),
            Arc::new(MockSpawner::new().with_endpoint(stub.addr)),
            Arc::new(MockProber::new(ProbeScript::Ready)),
        );
        InvokeService::new(Arc::new(manager), 1024)
    }

    fn post(body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::POST)
            .uri("/invoke")
            .body(Full::new(Bytes::copy_from_slice(body.as_bytes())))
            .unwrap()
    }

    async fn body_json(response: Response<Full<Bytes>>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_invoke_passes_input_through() {
        let stub = StubWorker::start(Duration::ZERO).await;
        let service = service(&stub).await;
        let code = "export default (x) => x";

        let response = service
            .route(post(
                &serde_json::json!({"name": "id", "code": code, "input": {"n": 1}}).to_string(),
            ))
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(FINGERPRINT_HEADER).unwrap(),
            Fingerprint::of(code).as_str()
        );
        assert_eq!(body_json(response).await, serde_json::json!({"input": {"n": 1}}));
    }

    #[tokio::test]
    async fn test_malformed_json_is_400() {
        let stub = StubWorker::start(Duration::ZERO).await;
        let service = service(&stub).await;

        let response = service.route(post("{not json")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["kind"], "invalid_request");
    }

    #[tokio::test]
    async fn test_empty_code_is_400() {
        let stub = StubWorker::start(Duration::ZERO).await;
        let service = service(&stub).await;

        let response = service.route(post(r#"{"code": "  ", "input": 1}"#)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_oversized_body_is_413() {
        let stub = StubWorker::start(Duration::ZERO).await;
        let service = service(&stub).await;

        let big = format!(r#"{{"code": "x", "input": "{}"}}"#, "a".repeat(4096));
        let response = service.route(post(&big)).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_unknown_route_and_method() {
        let stub = StubWorker::start(Duration::ZERO).await;
        let service = service(&stub).await;

        let response = service
            .route(Request::get("/other").body(Full::new(Bytes::new())).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = service
            .route(Request::get("/invoke").body(Full::new(Bytes::new())).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn test_status_mapping() {
        let endpoint = "127.0.0.1:1".parse().unwrap();
        let cases = [
            (EngineError::InvalidRequest("x".into()), 400),
            (EngineError::Spawn("x".into()), 500),
            (
                EngineError::WorkerUnavailable {
                    endpoint,
                    reason: "x".into(),
                },
                502,
            ),
            (
                EngineError::HealthTimeout {
                    endpoint,
                    waited: Duration::from_secs(1),
                },
                503,
            ),
            (EngineError::ShuttingDown, 503),
            (
                EngineError::RequestTimeout {
                    endpoint,
                    timeout: Duration::from_secs(1),
                },
                504,
            ),
        ];

        for (error, status) in cases {
            assert_eq!(status_for(&error).as_u16(), status, "{}", error.kind());
        }
    }
}
