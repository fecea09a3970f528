//! Pull request webhooks
//!
//! [`WebhookEndpoint`] validates deliveries posted to [`WEBHOOK_PATH`] and
//! hands pull request events to the [`EventProcessor`], which drives the
//! preview lifecycle and keeps the registry in step with it.

use crate::config::WebhookConfig;
use crate::error::{error_response, full_body, ErrorCode, ResponseBody};
use crate::lifecycle::{LifecycleError, LifecycleManager};
use crate::registry::{BackendRecord, Lookup, RegistryError, RoutingKey, SharedRegistry};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::HeaderMap;
use hyper::{Method, Request, Response, StatusCode};
use serde::Deserialize;
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Path the public listener reserves for webhook deliveries
pub const WEBHOOK_PATH: &str = "/_webhooks";

const EVENT_HEADER: &str = "x-github-event";
const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// Pull request action as sent by the code host
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum PullRequestAction {
    Opened,
    Reopened,
    Synchronize,
    Closed,
    Other(String),
}

impl From<String> for PullRequestAction {
    fn from(action: String) -> Self {
        match action.as_str() {
            "opened" => PullRequestAction::Opened,
            "reopened" => PullRequestAction::Reopened,
            "synchronize" => PullRequestAction::Synchronize,
            "closed" => PullRequestAction::Closed,
            _ => PullRequestAction::Other(action),
        }
    }
}

impl fmt::Display for PullRequestAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PullRequestAction::Opened => write!(f, "opened"),
            PullRequestAction::Reopened => write!(f, "reopened"),
            PullRequestAction::Synchronize => write!(f, "synchronize"),
            PullRequestAction::Closed => write!(f, "closed"),
            PullRequestAction::Other(action) => write!(f, "{}", action),
        }
    }
}

/// Pull request event payload (only the fields previews need)
#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestEvent {
    pub action: PullRequestAction,
    pub number: u64,
    pub repository: Repository,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Repository {
    pub clone_url: String,
    #[serde(default)]
    pub full_name: Option<String>,
}

impl PullRequestEvent {
    /// Decode and validate a delivery body
    pub fn from_slice(body: &[u8]) -> Result<Self, WebhookError> {
        let event: Self = serde_json::from_slice(body)?;
        if event.number == 0 {
            return Err(WebhookError::Invalid(
                "pull request number must be positive".to_string(),
            ));
        }
        Ok(event)
    }
}

/// Delivery type announced in the `X-GitHub-Event` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryKind {
    Ping,
    PullRequest,
    Unsupported(String),
}

impl DeliveryKind {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let event = headers
            .get(EVENT_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .trim();

        match event {
            "ping" => DeliveryKind::Ping,
            "pull_request" => DeliveryKind::PullRequest,
            other => DeliveryKind::Unsupported(other.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("method {0} not allowed, deliveries must be POSTed")]
    MethodNotAllowed(String),

    #[error("unsupported event type '{0}'")]
    UnsupportedEvent(String),

    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("failed to read request body: {0}")]
    Body(String),

    #[error("missing or invalid X-Hub-Signature-256")]
    InvalidSignature,

    #[error("invalid pull request event: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid pull request event: {0}")]
    Invalid(String),

    #[error("unsupported pull request action '{0}'")]
    UnsupportedAction(String),

    #[error("preview already running for {0}")]
    AlreadyRunning(RoutingKey),

    #[error("no preview running for {0}")]
    NotFound(RoutingKey),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("event handling aborted: {0}")]
    Aborted(String),
}

impl WebhookError {
    pub fn code(&self) -> ErrorCode {
        match self {
            WebhookError::AlreadyRunning(_) => ErrorCode::PreviewExists,
            WebhookError::NotFound(_) => ErrorCode::UnknownPreview,
            WebhookError::Lifecycle(_) | WebhookError::Registry(_) | WebhookError::Aborted(_) => {
                ErrorCode::ProvisioningFailed
            }
            _ => ErrorCode::InvalidDelivery,
        }
    }
}

/// Verify a `sha256=<hex>` signature over the raw delivery body
pub fn verify_signature(secret: &str, payload: &[u8], signature: Option<&str>) -> bool {
    let Some(signature_hex) = signature.and_then(|s| s.trim().strip_prefix("sha256=")) else {
        return false;
    };
    let Ok(provided) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&provided).is_ok()
}

/// Per-key async locks serializing transitions for one pull request
///
/// Entries are dropped once no task holds or awaits them.
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: DashMap<RoutingKey, Arc<Mutex<()>>>,
}

/// Held lock for one key, or a pending acquisition of it
///
/// Created before waiting so that a cancelled waiter still runs the
/// cleanup in `Drop`.
pub struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: RoutingKey,
    mutex: Option<Arc<Mutex<()>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &RoutingKey) -> KeyGuard<'_> {
        let mutex = self.locks.entry(key.clone()).or_default().value().clone();
        let mut key_guard = KeyGuard {
            locks: self,
            key: key.clone(),
            mutex: Some(Arc::clone(&mutex)),
            guard: None,
        };
        key_guard.guard = Some(mutex.lock_owned().await);
        key_guard
    }

    /// Keys with a live lock entry
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        drop(self.mutex.take());
        self.locks
            .locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Result of a handled pull request event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Launched { key: RoutingKey, record: BackendRecord },
    Destroyed { key: RoutingKey, record: BackendRecord },
    Ignored,
}

/// Maps pull request actions to lifecycle and registry operations
pub struct EventProcessor {
    registry: SharedRegistry,
    lifecycle: Arc<LifecycleManager>,
    domain: String,
    port: u16,
    locks: KeyLocks,
}

impl EventProcessor {
    pub fn new(
        registry: SharedRegistry,
        lifecycle: Arc<LifecycleManager>,
        domain: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            registry,
            lifecycle,
            domain: domain.into(),
            port,
            locks: KeyLocks::new(),
        }
    }

    pub fn routing_key(&self, number: u64) -> RoutingKey {
        RoutingKey::for_pull_request(number, &self.domain, self.port)
    }

    pub async fn process(&self, event: &PullRequestEvent) -> Result<Outcome, WebhookError> {
        match &event.action {
            PullRequestAction::Opened | PullRequestAction::Reopened => self.open(event).await,
            PullRequestAction::Closed => self.close(event).await,
            PullRequestAction::Synchronize => {
                info!(
                    number = event.number,
                    action = %event.action,
                    "Transition not handled, preview left unchanged"
                );
                Ok(Outcome::Ignored)
            }
            PullRequestAction::Other(action) => Err(WebhookError::UnsupportedAction(action.clone())),
        }
    }

    async fn open(&self, event: &PullRequestEvent) -> Result<Outcome, WebhookError> {
        let key = self.routing_key(event.number);
        let _guard = self.locks.lock(&key).await;

        match self.registry.lookup(&key).await {
            Lookup::Found(record) => {
                warn!(key = %key, container_id = %record.id, "Preview already running");
                return Err(WebhookError::AlreadyRunning(key));
            }
            Lookup::NotFound => {}
            Lookup::StoreError(e) => return Err(e.into()),
        }

        let env = vec![
            ("GIT_REPO".to_string(), event.repository.clone_url.clone()),
            ("GITHUB_PR_NUMBER".to_string(), event.number.to_string()),
        ];
        let record = self.lifecycle.launch(key.hostname(), self.port, &env).await?;

        if let Err(e) = self.registry.set(&key, &record).await {
            error!(key = %key, container_id = %record.id, error = %e, "Failed to register preview, removing container");
            if let Err(destroy_err) = self.lifecycle.destroy(&record).await {
                warn!(key = %key, container_id = %record.id, error = %destroy_err, "Unregistered container left behind");
            }
            return Err(e.into());
        }

        info!(
            key = %key,
            number = event.number,
            container_id = %record.id,
            address = %record.address,
            "Preview environment opened"
        );
        Ok(Outcome::Launched { key, record })
    }

    async fn close(&self, event: &PullRequestEvent) -> Result<Outcome, WebhookError> {
        let key = self.routing_key(event.number);
        let _guard = self.locks.lock(&key).await;

        let record = match self.registry.lookup(&key).await {
            Lookup::Found(record) => record,
            Lookup::NotFound => return Err(WebhookError::NotFound(key)),
            Lookup::StoreError(e) => return Err(e.into()),
        };

        match self.lifecycle.destroy(&record).await {
            Ok(()) => {}
            Err(LifecycleError::NotFound(id)) => {
                warn!(key = %key, container_id = %id, "Container already gone, dropping registry entry");
            }
            Err(e) => return Err(e.into()),
        }
        self.registry.delete(&key).await?;

        info!(key = %key, number = event.number, container_id = %record.id, "Preview environment closed");
        Ok(Outcome::Destroyed { key, record })
    }
}

/// Read a delivery body, refusing anything larger than `limit` bytes
pub async fn read_body<B>(body: B, limit: usize) -> Result<Bytes, WebhookError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.is::<LengthLimitError>() => Err(WebhookError::BodyTooLarge(limit)),
        Err(e) => Err(WebhookError::Body(e.to_string())),
    }
}

/// HTTP face of the event processor
pub struct WebhookEndpoint {
    processor: Arc<EventProcessor>,
    secret: Option<String>,
    max_body_bytes: usize,
}

impl WebhookEndpoint {
    pub fn new(processor: Arc<EventProcessor>, config: &WebhookConfig) -> Self {
        Self {
            processor,
            secret: config.secret.clone(),
            max_body_bytes: config.max_body_bytes,
        }
    }

    pub fn processor(&self) -> &Arc<EventProcessor> {
        &self.processor
    }

    /// Handle one delivery; every failure becomes a 400 with the error text
    pub async fn handle<B>(&self, req: Request<B>) -> Response<ResponseBody>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        match self.dispatch(req).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Webhook delivery rejected");
                error_response(e.code(), e.to_string())
            }
        }
    }

    async fn dispatch<B>(&self, req: Request<B>) -> Result<Response<ResponseBody>, WebhookError>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if req.method() != Method::POST {
            return Err(WebhookError::MethodNotAllowed(req.method().to_string()));
        }

        let (parts, body) = req.into_parts();
        let body = read_body(body, self.max_body_bytes).await?;

        if let Some(secret) = &self.secret {
            let signature = parts
                .headers
                .get(SIGNATURE_HEADER)
                .and_then(|v| v.to_str().ok());
            if !verify_signature(secret, &body, signature) {
                return Err(WebhookError::InvalidSignature);
            }
        }

        match DeliveryKind::from_headers(&parts.headers) {
            DeliveryKind::Ping => {
                debug!(bytes = body.len(), "Webhook ping");
                Ok(plain_response(StatusCode::OK, body))
            }
            DeliveryKind::PullRequest => {
                let event = PullRequestEvent::from_slice(&body)?;
                debug!(number = event.number, action = %event.action, "Pull request delivery");
                // Detached so a sender hanging up cannot cut a transition short
                let processor = Arc::clone(&self.processor);
                tokio::spawn(async move { processor.process(&event).await })
                    .await
                    .map_err(|e| WebhookError::Aborted(e.to_string()))??;
                Ok(plain_response(StatusCode::OK, Bytes::new()))
            }
            DeliveryKind::Unsupported(name) if name.is_empty() => Err(
                WebhookError::UnsupportedEvent("missing X-GitHub-Event header".to_string()),
            ),
            DeliveryKind::Unsupported(name) => Err(WebhookError::UnsupportedEvent(name)),
        }
    }
}

fn plain_response(status: StatusCode, body: Bytes) -> Response<ResponseBody> {
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response
}
