// packages/engine/src/runtime/health.rs
//! Readiness probing
//!
//! A freshly spawned worker is polled with `GET {path}` until it answers
//! 2xx. Connection refusals and resets are expected while the runtime boots
//! and are swallowed; only the overall deadline turns into an error.

use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Empty;
use hyper::{Method, Request};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Lower bound for a single probe request
const MIN_PROBE_TIMEOUT: Duration = Duration::from_millis(250);

/// Waits for a worker endpoint to become ready
#[async_trait]
pub trait Prober: Send + Sync {
    /// Poll `endpoint` every `poll_interval` until it is ready or `deadline` elapses
    async fn wait_until_ready(
        &self,
        endpoint: SocketAddr,
        poll_interval: Duration,
        deadline: Duration,
    ) -> Result<()>;
}

/// HTTP readiness prober
pub struct HttpProber {
    client: Client<HttpConnector, Empty<Bytes>>,
    path: String,
}

impl HttpProber {
    pub fn new(path: impl Into<String>) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);

        // Probes must not reuse a connection from a previous attempt
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        Self {
            client,
            path: path.into(),
        }
    }

    async fn probe_once(&self, endpoint: SocketAddr) -> std::result::Result<(), String> {
        let uri = format!("http://{}{}", endpoint, self.path);
        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Empty::new())
            .map_err(|e| e.to_string())?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| e.to_string())?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("status {}", response.status()))
        }
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn wait_until_ready(
        &self,
        endpoint: SocketAddr,
        poll_interval: Duration,
        deadline: Duration,
    ) -> Result<()> {
        let started = Instant::now();
        let per_probe = poll_interval.max(MIN_PROBE_TIMEOUT);

        let polling = async {
            let mut attempts: u32 = 0;
            loop {
                attempts += 1;
                match tokio::time::timeout(per_probe, self.probe_once(endpoint)).await {
                    Ok(Ok(())) => return attempts,
                    Ok(Err(reason)) => trace!(%endpoint, attempts, %reason, "Worker not ready"),
                    Err(_) => trace!(%endpoint, attempts, "Readiness probe timed out"),
                }
                tokio::time::sleep(poll_interval).await;
            }
        };

        match tokio::time::timeout(deadline, polling).await {
            Ok(attempts) => {
                debug!(
                    %endpoint,
                    attempts,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Worker passed readiness probe"
                );
                Ok(())
            }
            Err(_) => Err(EngineError::HealthTimeout {
                endpoint,
                waited: deadline,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::{closed_endpoint, StubWorker};

    #[tokio::test]
    async fn test_ready_endpoint() {
        let stub = StubWorker::start(Duration::ZERO).await;
        let prober = HttpProber::new("/health");

        prober
            .wait_until_ready(stub.addr, Duration::from_millis(20), Duration::from_secs(2))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_dead_endpoint_times_out() {
        let endpoint = closed_endpoint();
        let prober = HttpProber::new("/health");

        let started = std::time::Instant::now();
        let err = prober
            .wait_until_ready(endpoint, Duration::from_millis(20), Duration::from_millis(300))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "health_timeout");
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_late_listener_becomes_ready() {
        let endpoint = closed_endpoint();
        let prober = HttpProber::new("/health");

        let late = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let listener = tokio::net::TcpListener::bind(endpoint).await.unwrap();
            let (stream, _) = listener.accept().await.unwrap();
            let service = hyper::service::service_fn(|_req| async {
                Ok::<_, std::convert::Infallible>(hyper::Response::new(Empty::<Bytes>::new()))
            });
            let _ = hyper::server::conn::http1::Builder::new()
                .serve_connection(hyper_util::rt::TokioIo::new(stream), service)
                .await;
        });

        prober
            .wait_until_ready(endpoint, Duration::from_millis(20), Duration::from_secs(3))
            .await
            .unwrap();
        late.abort();
    }
}
