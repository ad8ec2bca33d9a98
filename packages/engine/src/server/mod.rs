// packages/engine/src/server/mod.rs
//! HTTP adapters in front of the process manager
//!
//! - **invoke**: `POST /invoke` runs a code unit
//! - **health**: liveness, readiness, worker listing and Prometheus metrics
//!
//! Both listen on their own socket and share the accept loop below.

pub mod health;
pub mod invoke;

pub use health::HealthService;
pub use invoke::InvokeService;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace};

/// A request handler served by [`serve`]
#[async_trait]
pub trait HttpHandler: Send + Sync + 'static {
    async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>>;
}

/// Accept connections until `shutdown` fires
///
/// Open connections finish their in-flight request and then close. Returns
/// once every connection task has ended.
pub async fn serve<H: HttpHandler>(
    listener: TcpListener,
    name: &'static str,
    handler: Arc<H>,
    shutdown: CancellationToken,
) {
    match listener.local_addr() {
        Ok(addr) => info!("{} server listening on {}", name, addr),
        Err(_) => info!("{} server listening", name),
    }

    let connections = TaskTracker::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("{} server stopped accepting connections", name);
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                };

                let handler = Arc::clone(&handler);
                let shutdown = shutdown.clone();

                connections.spawn(async move {
                    trace!("Accepted connection from {}", peer);

                    let service = service_fn(move |req| {
                        let handler = Arc::clone(&handler);
                        async move { Ok::<_, Infallible>(handler.handle(req).await) }
                    });

                    let conn = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service);
                    tokio::pin!(conn);

                    let mut closing = false;
                    loop {
                        tokio::select! {
                            result = conn.as_mut() => {
                                if let Err(e) = result {
                                    debug!("Connection error from {}: {}", peer, e);
                                }
                                break;
                            }
                            _ = shutdown.cancelled(), if !closing => {
                                closing = true;
                                conn.as_mut().graceful_shutdown();
                            }
                        }
                    }
                });
            }
        }
    }

    connections.close();
    if !connections.is_empty() {
        debug!("{} server waiting for {} connections", name, connections.len());
    }
    connections.wait().await;
}

/// JSON response with the given status
pub(crate) fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => with_content_type(status, Bytes::from(body), "application/json"),
        Err(e) => {
            error!("Failed to serialize response: {}", e);
            with_content_type(
                StatusCode::INTERNAL_SERVER_ERROR,
                Bytes::from_static(
                    br#"{"error":{"kind":"internal","message":"serialization failed"}}"#,
                ),
                "application/json",
            )
        }
    }
}

pub(crate) fn with_content_type(
    status: StatusCode,
    body: Bytes,
    content_type: &'static str,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Error body shared by both adapters
pub(crate) fn error_response(
    status: StatusCode,
    kind: &str,
    message: &str,
) -> Response<Full<Bytes>> {
    json_response(
        status,
        &serde_json::json!({ "error": { "kind": kind, "message": message } }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use hyper_util::client::legacy::Client;
    use hyper_util::rt::TokioExecutor;
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl HttpHandler for Echo {
        async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
            with_content_type(
                StatusCode::OK,
                Bytes::from(req.uri().path().to_string()),
                "text/plain",
            )
        }
    }

    #[tokio::test]
    async fn test_serve_and_stop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve(listener, "test", Arc::new(Echo), shutdown.clone()));

        let client = Client::builder(TokioExecutor::new()).build_http::<Full<Bytes>>();
        let uri: hyper::Uri = format!("http://{}/ping", addr).parse().unwrap();
        let response = client.get(uri).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"/ping");

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap();
    }

    struct Slow;

    #[async_trait]
    impl HttpHandler for Slow {
        async fn handle(&self, _req: Request<Incoming>) -> Response<Full<Bytes>> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            with_content_type(StatusCode::OK, Bytes::from_static(b"done"), "text/plain")
        }
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let mut server = tokio::spawn(serve(listener, "test", Arc::new(Slow), shutdown.clone()));

        let client = Client::builder(TokioExecutor::new()).build_http::<Full<Bytes>>();
        let uri: hyper::Uri = format!("http://{}/slow", addr).parse().unwrap();
        let request = tokio::spawn(async move { client.get(uri).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();

        // Still serving the request
        assert!(tokio::time::timeout(Duration::from_millis(50), &mut server)
            .await
            .is_err());

        let response = request.await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"done");

        tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_error_response_shape() {
        let response = error_response(StatusCode::BAD_REQUEST, "invalid_request", "nope");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }
}
