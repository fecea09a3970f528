use crate::pool::PoolStats;
use crate::registry::SharedRegistry;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// What the admin API can see
pub struct AdminState {
    registry: SharedRegistry,
    pool_stats: Arc<PoolStats>,
    auth_token: String,
}

impl AdminState {
    pub fn new(registry: SharedRegistry, pool_stats: Arc<PoolStats>, auth_token: String) -> Self {
        Self {
            registry,
            pool_stats,
            auth_token,
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }
}

/// Admin API server for inspecting running previews
pub struct AdminServer {
    bind_addr: SocketAddr,
    state: Arc<AdminState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(bind_addr: SocketAddr, state: Arc<AdminState>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind admin API to {}: {}", self.bind_addr, e))?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Admin API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(stream: TcpStream, state: Arc<AdminState>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { Ok::<_, Infallible>(handle_admin_request(req, &state).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

async fn handle_admin_request<B>(req: Request<B>, state: &AdminState) -> Response<Full<Bytes>> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Admin API request");

    match (method, path) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        (&Method::GET, "/previews") | (&Method::GET, "/stats") if !check_auth(&req, &state.auth_token) => {
            warn!(path, "Unauthorized admin API request");
            response(StatusCode::UNAUTHORIZED, "unauthorized")
        }

        (&Method::GET, "/previews") => match state.registry.list().await {
            Ok(entries) => {
                let previews: Vec<serde_json::Value> = entries
                    .into_iter()
                    .map(|(key, record)| {
                        serde_json::json!({
                            "key": key,
                            "id": record.id,
                            "host": record.address,
                        })
                    })
                    .collect();
                let body = serde_json::json!({
                    "count": previews.len(),
                    "previews": previews,
                });
                json_response(StatusCode::OK, body.to_string())
            }
            Err(e) => {
                error!(error = %e, "Failed to list previews");
                response(StatusCode::SERVICE_UNAVAILABLE, "registry unavailable")
            }
        },

        (&Method::GET, "/stats") => {
            let previews = state.registry.list().await.ok().map(|entries| entries.len());
            let body = serde_json::json!({
                "forwarding": state.pool_stats.snapshot(),
                "previews": previews,
            });
            json_response(StatusCode::OK, body.to_string())
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{BackendRecord, MemoryRegistry, Registry, RoutingKey};
    use crate::testing::FlakyRegistry;
    use http_body_util::BodyExt;

    fn state_with(registry: SharedRegistry) -> AdminState {
        AdminState::new(registry, Arc::new(PoolStats::default()), "secret-token".to_string())
    }

    fn get(path: &str, token: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().method(Method::GET).uri(path);
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(()).unwrap()
    }

    async fn json(response: Response<Full<Bytes>>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_and_version_need_no_auth() {
        let state = state_with(Arc::new(MemoryRegistry::new()));

        let health = handle_admin_request(get("/health", None), &state).await;
        assert_eq!(health.status(), StatusCode::OK);

        let version = handle_admin_request(get("/version", None), &state).await;
        assert_eq!(version.status(), StatusCode::OK);
        let body = json(version).await;
        assert_eq!(body["name"], PKG_NAME);
        assert_eq!(body["version"], VERSION);
    }

    #[tokio::test]
    async fn test_previews_requires_token() {
        let state = state_with(Arc::new(MemoryRegistry::new()));

        let response = handle_admin_request(get("/previews", None), &state).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = handle_admin_request(get("/previews", Some("wrong")), &state).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = handle_admin_request(get("/stats", None), &state).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_previews_lists_registry() {
        let registry = Arc::new(MemoryRegistry::new());
        registry
            .set(
                &RoutingKey::for_pull_request(42, "example.com", 8000),
                &BackendRecord {
                    id: "abc123".to_string(),
                    address: "172.17.0.2:8000".to_string(),
                },
            )
            .await
            .unwrap();
        let state = state_with(registry);

        let response = handle_admin_request(get("/previews", Some("secret-token")), &state).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = json(response).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["previews"][0]["key"], "pr-42.example.com:8000");
        assert_eq!(body["previews"][0]["id"], "abc123");
        assert_eq!(body["previews"][0]["host"], "172.17.0.2:8000");
    }

    #[tokio::test]
    async fn test_previews_reports_store_failure() {
        let registry = Arc::new(FlakyRegistry::new());
        registry.fail_reads(true);
        let state = state_with(registry);

        let response = handle_admin_request(get("/previews", Some("secret-token")), &state).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = handle_admin_request(get("/stats", Some("secret-token")), &state).await;
        let body = json(response).await;
        assert!(body["previews"].is_null());
        assert_eq!(body["forwarding"]["forwarded"], 0);
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let state = state_with(Arc::new(MemoryRegistry::new()));
        let response = handle_admin_request(get("/backends", Some("secret-token")), &state).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
