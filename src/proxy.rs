//! Public listener: webhook deliveries and Host-based routing
//!
//! Every request except those to [`WEBHOOK_PATH`] is resolved against the
//! registry by its Host header and forwarded to the preview backend. The
//! registry is read on every request and never written here.

use crate::error::{error_response, ErrorCode, ResponseBody};
use crate::pool::ConnectionPool;
use crate::registry::{RoutingKey, SharedRegistry};
use crate::webhooks::{WebhookEndpoint, WEBHOOK_PATH};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Headers that describe a single connection and must not be forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Resolves requests to preview backends
pub struct Router {
    registry: SharedRegistry,
    pool: Arc<ConnectionPool>,
    webhooks: Arc<WebhookEndpoint>,
    default_port: u16,
    request_timeout: Duration,
}

impl Router {
    pub fn new(
        registry: SharedRegistry,
        pool: Arc<ConnectionPool>,
        webhooks: Arc<WebhookEndpoint>,
        default_port: u16,
        request_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            pool,
            webhooks,
            default_port,
            request_timeout,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub async fn handle(&self, mut req: Request<Incoming>, client_addr: SocketAddr) -> Response<ResponseBody> {
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if req.uri().path() == WEBHOOK_PATH {
            debug!(request_id, method = %req.method(), "Webhook delivery");
            return self.webhooks.handle(req).await;
        }

        let key = match request_host(&req).and_then(|h| RoutingKey::from_host(h, self.default_port)) {
            Some(key) => key,
            None => {
                return error_response(
                    ErrorCode::MissingHostHeader,
                    "Missing or invalid Host header",
                );
            }
        };

        let record = match self.registry.get(&key).await {
            Some(record) => record,
            None => {
                debug!(key = %key, request_id, "No preview registered for host");
                return error_response(ErrorCode::UnknownHost, "no preview environment for host");
            }
        };

        prepare_forward_headers(&mut req, &request_id, client_addr);

        debug!(
            key = %key,
            address = %record.address,
            method = %req.method(),
            uri = %req.uri(),
            request_id,
            "Forwarding request"
        );

        match tokio::time::timeout(self.request_timeout, self.pool.send_request(req, &record.address)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                error!(key = %key, address = %record.address, error = %e, "Failed to forward request");
                error_response(ErrorCode::ConnectionFailed, "Failed to connect to backend")
            }
            Err(_) => {
                warn!(
                    key = %key,
                    address = %record.address,
                    timeout_secs = self.request_timeout.as_secs(),
                    "Request timed out"
                );
                error_response(
                    ErrorCode::RequestTimeout,
                    format!(
                        "Request timed out after {} seconds",
                        self.request_timeout.as_secs()
                    ),
                )
            }
        }
    }
}

/// Host the client addressed: the Host header, or the URI authority for HTTP/2
fn request_host<B>(req: &Request<B>) -> Option<&str> {
    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
}

/// Remove hop-by-hop headers, including any named in `Connection`
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Rewrite headers for the backend hop
///
/// X-Forwarded-* values are overwritten, not appended: this gateway is the
/// first trusted hop. The client's Host is kept.
fn prepare_forward_headers<B>(req: &mut Request<B>, request_id: &str, client_addr: SocketAddr) {
    let host = request_host(req).and_then(|h| HeaderValue::from_str(h).ok());
    let headers = req.headers_mut();

    strip_hop_by_hop(headers);

    if let Some(host) = host {
        headers.insert(X_FORWARDED_HOST, host.clone());
        headers.entry(HOST).or_insert(host);
    }
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
}

/// The public HTTP listener
pub struct ProxyServer {
    bind_addr: SocketAddr,
    router: Arc<Router>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(bind_addr: SocketAddr, router: Arc<Router>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            router,
            shutdown_rx,
        }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind proxy to {}: {}", self.bind_addr, e))?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let router = Arc::clone(&self.router);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, router).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, router: Arc<Router>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let router = Arc::clone(&router);
        async move { Ok::<_, Infallible>(router.handle(req, addr).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(host: Option<&str>, uri: &str) -> Request<()> {
        let mut builder = Request::builder().uri(uri);
        if let Some(host) = host {
            builder = builder.header(HOST, host);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_request_host_prefers_header() {
        let req = request(Some("pr-1.example.com:8000"), "http://other.example.com/");
        assert_eq!(request_host(&req), Some("pr-1.example.com:8000"));
    }

    #[test]
    fn test_request_host_falls_back_to_authority() {
        let req = request(None, "http://pr-2.example.com:8000/index.html");
        assert_eq!(request_host(&req), Some("pr-2.example.com:8000"));

        let req = request(None, "/index.html");
        assert_eq!(request_host(&req), None);
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, "keep-alive, X-Session-Trace".parse().unwrap());
        headers.insert("keep-alive", "timeout=5".parse().unwrap());
        headers.insert("x-session-trace", "abc".parse().unwrap());
        headers.insert("upgrade", "websocket".parse().unwrap());
        headers.insert("te", "trailers".parse().unwrap());
        headers.insert("accept", "text/html".parse().unwrap());
        headers.insert("cookie", "a=b".parse().unwrap());

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get("accept").unwrap(), "text/html");
        assert_eq!(headers.get("cookie").unwrap(), "a=b");
    }

    #[test]
    fn test_prepare_forward_headers_overwrites_forwarded_values() {
        let mut req = request(Some("pr-3.example.com:8000"), "/");
        req.headers_mut()
            .insert(X_FORWARDED_FOR, "6.6.6.6".parse().unwrap());
        let client: SocketAddr = "192.0.2.10:51234".parse().unwrap();

        prepare_forward_headers(&mut req, "req-1", client);

        let headers = req.headers();
        assert_eq!(headers.get(X_FORWARDED_FOR).unwrap(), "192.0.2.10");
        assert_eq!(headers.get(X_FORWARDED_HOST).unwrap(), "pr-3.example.com:8000");
        assert_eq!(headers.get(X_FORWARDED_PROTO).unwrap(), "http");
        assert_eq!(headers.get(X_REQUEST_ID).unwrap(), "req-1");
        assert_eq!(headers.get(HOST).unwrap(), "pr-3.example.com:8000");
    }

    #[test]
    fn test_prepare_forward_headers_sets_host_from_authority() {
        let mut req = request(None, "http://pr-4.example.com:8000/");
        let client: SocketAddr = "[2001:db8::1]:4000".parse().unwrap();

        prepare_forward_headers(&mut req, "req-2", client);

        assert_eq!(req.headers().get(HOST).unwrap(), "pr-4.example.com:8000");
        assert_eq!(req.headers().get(X_FORWARDED_FOR).unwrap(), "2001:db8::1");
    }
}
