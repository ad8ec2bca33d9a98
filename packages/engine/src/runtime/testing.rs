// packages/engine/src/runtime/testing.rs
//! Test doubles: counting spawner, scripted prober, stub HTTP worker

use crate::runtime::health::Prober;
use crate::runtime::spawner::{ProcessId, SpawnRequest, SpawnedWorker, Spawner, StopOutcome};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Spawner that launches nothing and counts calls
pub(crate) struct MockSpawner {
    spawn_delay: Duration,
    endpoint: Option<SocketAddr>,
    fail: bool,
    spawns: AtomicUsize,
    stops: AtomicUsize,
    live: Mutex<HashSet<ProcessId>>,
    next_id: AtomicU64,
}

impl MockSpawner {
    pub(crate) fn new() -> Self {
        Self {
            spawn_delay: Duration::ZERO,
            endpoint: None,
            fail: false,
            spawns: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            live: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.spawn_delay = delay;
        self
    }

    /// Report this endpoint for every spawn
    pub(crate) fn with_endpoint(mut self, endpoint: SocketAddr) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub(crate) fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub(crate) fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub(crate) fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub(crate) fn live_count(&self) -> usize {
        self.live.lock().len()
    }
}

#[async_trait]
impl Spawner for MockSpawner {
    async fn spawn(&self, _request: SpawnRequest<'_>) -> Result<SpawnedWorker> {
        self.spawns.fetch_add(1, Ordering::SeqCst);

        if !self.spawn_delay.is_zero() {
            tokio::time::sleep(self.spawn_delay).await;
        }
        if self.fail {
            return Err(EngineError::Spawn("mock spawn failure".to_string()));
        }

        let raw = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let process_id = ProcessId::new(raw);
        self.live.lock().insert(process_id);

        let endpoint = self
            .endpoint
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 40_000 + raw as u16)));

        Ok(SpawnedWorker {
            endpoint,
            process_id,
            os_pid: None,
        })
    }

    async fn stop(&self, process_id: ProcessId, _grace: Duration) -> Result<StopOutcome> {
        if self.live.lock().remove(&process_id) {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(StopOutcome::Terminated)
        } else {
            Ok(StopOutcome::AlreadyStopped)
        }
    }
}

/// Scripted readiness behaviour
#[derive(Debug, Clone, Copy)]
pub(crate) enum ProbeScript {
    Ready,
    ReadyAfter(Duration),
    Never,
}

pub(crate) struct MockProber {
    script: ProbeScript,
}

impl MockProber {
    pub(crate) fn new(script: ProbeScript) -> Self {
        Self { script }
    }
}

#[async_trait]
impl Prober for MockProber {
    async fn wait_until_ready(
        &self,
        endpoint: SocketAddr,
        _poll_interval: Duration,
        deadline: Duration,
    ) -> Result<()> {
        match self.script {
            ProbeScript::Ready => Ok(()),
            ProbeScript::ReadyAfter(delay) if delay < deadline => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            ProbeScript::ReadyAfter(_) | ProbeScript::Never => {
                tokio::time::sleep(deadline).await;
                Err(EngineError::HealthTimeout {
                    endpoint,
                    waited: deadline,
                })
            }
        }
    }
}

/// Loopback HTTP server that echoes request bodies after a delay
pub(crate) struct StubWorker {
    pub(crate) addr: SocketAddr,
    task: JoinHandle<()>,
}

impl StubWorker {
    pub(crate) async fn start(delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| async move {
                        let body = req
                            .into_body()
                            .collect()
                            .await
                            .map(|b| b.to_bytes())
                            .unwrap_or_default();
                        tokio::time::sleep(delay).await;
                        Ok::<_, Infallible>(Response::new(Full::new(body)))
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { addr, task }
    }
}

impl Drop for StubWorker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A loopback address nothing is listening on
pub(crate) fn closed_endpoint() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}
