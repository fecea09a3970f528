//! Pooled HTTP client for forwarding requests to preview backends
//!
//! Connections to each backend address are kept alive and reused across
//! requests, so a busy preview does not pay a TCP handshake per request.

use crate::error::ResponseBody;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response, Uri, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("backend request failed: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("invalid backend request: {0}")]
    RequestBuild(String),
}

/// Forwarding counters
#[derive(Debug, Default)]
pub struct PoolStats {
    forwarded: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`PoolStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatsSnapshot {
    pub forwarded: u64,
    pub failed: u64,
}

impl PoolStats {
    pub fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            forwarded: self.forwarded(),
            failed: self.failed(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections kept per backend address
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Keep-alive HTTP/1.1 client shared by all routed requests
pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Forwarding pool initialized"
        );

        Self {
            client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Send `req` to the backend at `address` (`ip:port`)
    ///
    /// Method, headers, path, query and body are passed through as is; only
    /// the request target is rewritten. The response body streams back.
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        address: &str,
    ) -> Result<Response<ResponseBody>, PoolError> {
        let (mut parts, body) = req.into_parts();
        parts.uri = backend_uri(address, &parts.uri)?;
        // Backends speak HTTP/1.1 regardless of the client's protocol
        parts.version = Version::HTTP_11;

        self.stats.record_forwarded();

        match self.client.request(Request::from_parts(parts, body)).await {
            Ok(response) => Ok(response.map(|body| body.boxed())),
            Err(e) => {
                self.stats.record_failure();
                Err(e.into())
            }
        }
    }
}

fn backend_uri(address: &str, original: &Uri) -> Result<Uri, PoolError> {
    let path = original
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    format!("http://{}{}", address, path)
        .parse()
        .map_err(|e: hyper::http::uri::InvalidUri| PoolError::RequestBuild(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_pool_stats() {
        let stats = PoolStats::default();
        assert_eq!(stats.snapshot(), PoolStatsSnapshot { forwarded: 0, failed: 0 });

        stats.record_forwarded();
        stats.record_forwarded();
        stats.record_failure();

        assert_eq!(stats.forwarded(), 2);
        assert_eq!(stats.failed(), 1);
    }

    #[test]
    fn test_backend_uri_keeps_path_and_query() {
        let original: Uri = "/posts/hello?draft=1&lang=en".parse().unwrap();
        let uri = backend_uri("172.17.0.3:8000", &original).unwrap();
        assert_eq!(uri.to_string(), "http://172.17.0.3:8000/posts/hello?draft=1&lang=en");

        let absolute: Uri = "http://pr-1.example.com:8000/a?b=c".parse().unwrap();
        let uri = backend_uri("10.0.0.1:8000", &absolute).unwrap();
        assert_eq!(uri.to_string(), "http://10.0.0.1:8000/a?b=c");
    }

    #[test]
    fn test_backend_uri_rejects_bad_address() {
        let original: Uri = "/".parse().unwrap();
        assert!(matches!(
            backend_uri("not an address", &original),
            Err(PoolError::RequestBuild(_))
        ));
    }

    #[tokio::test]
    async fn test_pool_creation() {
        let pool = ConnectionPool::new(PoolConfig {
            max_idle_per_host: 5,
            idle_timeout: Duration::from_secs(30),
        });
        assert_eq!(pool.config().max_idle_per_host, 5);
        assert_eq!(pool.config().idle_timeout, Duration::from_secs(30));
        assert_eq!(pool.stats().forwarded(), 0);
    }
}
