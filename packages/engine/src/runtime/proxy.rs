// packages/engine/src/runtime/proxy.rs
//! Forwards invocation payloads to a leased worker

use crate::observability::names;
use crate::runtime::worker::WorkerLease;
use crate::utils::errors::{EngineError, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::error::Error as _;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Worker reply, passed through verbatim
#[derive(Debug, Clone)]
pub struct WorkerResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// HTTP forwarder with a pooled client per manager
pub struct RequestProxy {
    client: Client<HttpConnector, Full<Bytes>>,
    path: String,
}

impl RequestProxy {
    pub fn new(path: impl Into<String>) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);

        Self {
            client: Client::builder(TokioExecutor::new()).build(connector),
            path: path.into(),
        }
    }

    /// POST `payload` to the leased worker
    ///
    /// `timeout` covers connect, the request and collecting the response
    /// body. The lease is only borrowed; releasing it stays with the caller.
    pub async fn invoke(
        &self,
        lease: &WorkerLease,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<WorkerResponse> {
        let endpoint = lease.endpoint();
        let started = Instant::now();

        let result = match tokio::time::timeout(timeout, self.send(endpoint, payload)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::RequestTimeout { endpoint, timeout }),
        };

        let timed_out = matches!(result, Err(EngineError::RequestTimeout { .. }));
        lease.handle().record_outcome(timed_out);

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        metrics::histogram!(names::INVOCATION_SECONDS, "outcome" => outcome)
            .record(started.elapsed().as_secs_f64());

        match &result {
            Ok(response) => debug!(
                fingerprint = %lease.fingerprint().short(),
                %endpoint,
                status = response.status.as_u16(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Worker responded"
            ),
            Err(e) => warn!(
                fingerprint = %lease.fingerprint().short(),
                %endpoint,
                error = %e,
                "Worker request failed"
            ),
        }

        result
    }

    async fn send(&self, endpoint: SocketAddr, payload: Bytes) -> Result<WorkerResponse> {
        let uri = format!("http://{}{}", endpoint, self.path);
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(payload))
            .map_err(|e| {
                EngineError::InvalidRequest(format!("cannot build worker request: {}", e))
            })?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| {
                let reason = match e.source() {
                    Some(source) => format!("{}: {}", e, source),
                    None => e.to_string(),
                };
                EngineError::WorkerUnavailable { endpoint, reason }
            })?;

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| EngineError::WorkerUnavailable {
                endpoint,
                reason: format!("reading response body: {}", e),
            })?
            .to_bytes();

        Ok(WorkerResponse {
            status: parts.status,
            content_type: parts
                .headers
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            body,
        })
    }
}
