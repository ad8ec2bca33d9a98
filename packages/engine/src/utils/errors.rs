// packages/engine/src/utils/errors.rs
//! Error taxonomy for the engine
//!
//! Every error that can reach an invocation caller is a variant of
//! [`EngineError`]. The type is `Clone` because a single spawn outcome is
//! handed to every caller coalesced onto that spawn.

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the engine
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine errors
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Working directory, executable lookup, port allocation or process launch failed
    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    /// Worker never answered its readiness probe
    #[error("worker at {endpoint} did not become ready within {waited:?}")]
    HealthTimeout { endpoint: SocketAddr, waited: Duration },

    /// Invocation exceeded its deadline; the worker is left running
    #[error("request to worker at {endpoint} timed out after {timeout:?}")]
    RequestTimeout { endpoint: SocketAddr, timeout: Duration },

    /// Worker endpoint unreachable or connection dropped mid-response
    #[error("worker at {endpoint} is unavailable: {reason}")]
    WorkerUnavailable { endpoint: SocketAddr, reason: String },

    /// Termination did not complete cleanly
    #[error("eviction failed: {0}")]
    Eviction(String),

    /// Registry is closed for new acquisitions
    #[error("process manager is shutting down")]
    ShuttingDown,

    /// Invalid or unloadable configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed inbound request
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl EngineError {
    /// Stable identifier for adapters and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Spawn(_) => "spawn",
            EngineError::HealthTimeout { .. } => "health_timeout",
            EngineError::RequestTimeout { .. } => "request_timeout",
            EngineError::WorkerUnavailable { .. } => "worker_unavailable",
            EngineError::Eviction(_) => "eviction",
            EngineError::ShuttingDown => "shutting_down",
            EngineError::Config(_) => "config",
            EngineError::InvalidRequest(_) => "invalid_request",
            EngineError::Io(_) => "io",
        }
    }

    /// Whether the caller may reasonably retry the same invocation
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::RequestTimeout { .. } | EngineError::WorkerUnavailable { .. }
        )
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err.to_string())
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_stable() {
        let endpoint: SocketAddr = "127.0.0.1:3000".parse().unwrap();
        assert_eq!(EngineError::Spawn("x".into()).kind(), "spawn");
        assert_eq!(
            EngineError::HealthTimeout { endpoint, waited: Duration::from_secs(1) }.kind(),
            "health_timeout"
        );
        assert_eq!(
            EngineError::RequestTimeout { endpoint, timeout: Duration::from_millis(100) }.kind(),
            "request_timeout"
        );
        assert_eq!(EngineError::ShuttingDown.kind(), "shutting_down");
    }

    #[test]
    fn test_retryable() {
        let endpoint: SocketAddr = "127.0.0.1:3000".parse().unwrap();
        assert!(EngineError::RequestTimeout { endpoint, timeout: Duration::ZERO }.is_retryable());
        assert!(!EngineError::Spawn("no node".into()).is_retryable());
    }

    #[test]
    fn test_io_conversion_keeps_message() {
        let err: EngineError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err.kind(), "io");
        assert!(err.to_string().contains("gone"));
    }
}
