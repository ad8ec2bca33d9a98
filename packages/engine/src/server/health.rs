// packages/engine/src/server/health.rs
//! Health adapter
//!
//! - `GET /healthz`: process is up
//! - `GET /readyz`: accepting invocations (503 once shutdown starts)
//! - `GET /workers`: worker snapshot
//! - `GET /metrics`: Prometheus exposition

use crate::runtime::ProcessManager;
use crate::server::{error_response, json_response, with_content_type, HttpHandler};
use crate::BuildInfo;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use std::sync::Arc;

pub struct HealthService {
    manager: Arc<ProcessManager>,
    metrics: Option<PrometheusHandle>,
}

impl HealthService {
    pub fn new(manager: Arc<ProcessManager>, metrics: Option<PrometheusHandle>) -> Self {
        Self { manager, metrics }
    }

    pub fn route<B>(&self, req: &Request<B>) -> Response<Full<Bytes>> {
        if req.method() != Method::GET {
            return error_response(StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed", "use GET");
        }

        match req.uri().path() {
            "/healthz" => json_response(StatusCode::OK, &json!({ "status": "ok" })),
            "/readyz" => self.readiness(),
            "/workers" => json_response(StatusCode::OK, &self.manager.snapshot()),
            "/metrics" => match &self.metrics {
                Some(handle) => with_content_type(
                    StatusCode::OK,
                    Bytes::from(handle.render()),
                    "text/plain; version=0.0.4",
                ),
                None => error_response(StatusCode::NOT_FOUND, "not_found", "metrics disabled"),
            },
            _ => error_response(StatusCode::NOT_FOUND, "not_found", "no such route"),
        }
    }

    fn readiness(&self) -> Response<Full<Bytes>> {
        let build = BuildInfo::current();
        let (status, label) = if self.manager.is_shutting_down() {
            (StatusCode::SERVICE_UNAVAILABLE, "shutting_down")
        } else {
            (StatusCode::OK, "ready")
        };

        json_response(
            status,
            &json!({
                "status": label,
                "version": build.version,
                "git_hash": build.git_hash,
                "workers": self.manager.summary(),
            }),
        )
    }
}

#[async_trait]
impl HttpHandler for HealthService {
    async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        self.route(&req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::{MockProber, MockSpawner, ProbeScript, StubWorker};
    use crate::runtime::ManagerSettings;
    use http_body_util::BodyExt;
    use std::time::Duration;

    fn get(path: &str) -> Request<()> {
        Request::get(path).body(()).unwrap()
    }

    async fn json_body(response: Response<Full<Bytes>>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn manager(stub: &StubWorker) -> Arc<ProcessManager> {
        Arc::new(ProcessManager::with_components(
            ManagerSettings::default(),
            Arc::new(MockSpawner::new().with_endpoint(stub.addr)),
            Arc::new(MockProber::new(ProbeScript::Ready)),
        ))
    }

    #[tokio::test]
    async fn test_liveness() {
        let stub = StubWorker::start(Duration::ZERO).await;
        let service = HealthService::new(manager(&stub), None);

        let response = service.route(&get("/healthz"));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_readiness_flips_on_shutdown() {
        let stub = StubWorker::start(Duration::ZERO).await;
        let manager = manager(&stub);
        let service = HealthService::new(Arc::clone(&manager), None);

        let response = service.route(&get("/readyz"));
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ready");
        assert_eq!(body["workers"]["total"], 0);

        manager.shutdown().await;
        let response = service.route(&get("/readyz"));
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_workers_listing() {
        let stub = StubWorker::start(Duration::ZERO).await;
        let manager = manager(&stub);
        manager
            .invoke("listed", "export default 1", Bytes::from_static(b"{}"))
            .await
            .unwrap();

        let service = HealthService::new(manager, None);
        let body = json_body(service.route(&get("/workers"))).await;
        let workers = body.as_array().unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0]["state"], "ready");
        assert_eq!(workers[0]["invocations"], 1);
    }

    #[tokio::test]
    async fn test_metrics_disabled_and_unknown_route() {
        let stub = StubWorker::start(Duration::ZERO).await;
        let service = HealthService::new(manager(&stub), None);

        assert_eq!(service.route(&get("/metrics")).status(), StatusCode::NOT_FOUND);
        assert_eq!(service.route(&get("/nope")).status(), StatusCode::NOT_FOUND);
    }
}
