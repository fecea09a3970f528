//! Preview container lifecycle
//!
//! [`LifecycleManager`] turns a preview request into a running container
//! and a [`BackendRecord`], and tears it down again. It talks to the
//! container runtime through the [`ContainerRuntime`] trait so the webhook
//! processor can be exercised without a Docker daemon.

use crate::config::PullPolicy;
use crate::registry::BackendRecord;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Label put on every preview container with its virtual hostname
pub const HOSTNAME_LABEL: &str = "previewgate.hostname";

/// What to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub hostname: String,
    /// `KEY=value` entries
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
}

/// Errors reported by a container runtime
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("no such container: {0}")]
    NotFound(String),

    #[error("container has no network address")]
    NoAddress,

    #[error("image '{image}' unavailable: {message}")]
    Image { image: String, message: String },

    #[error("{0}")]
    Api(String),
}

/// The primitive operations a preview needs from a container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Make `image` available locally according to `policy`
    async fn ensure_image(&self, image: &str, policy: &PullPolicy) -> Result<(), RuntimeError>;

    /// Create a container and return its identifier
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    /// IP address the runtime assigned to the container
    async fn inspect_address(&self, id: &str) -> Result<String, RuntimeError>;

    /// Force-remove the container and its volumes
    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("failed to prepare image: {0}")]
    Image(#[source] RuntimeError),

    #[error("failed to create container: {0}")]
    Create(#[source] RuntimeError),

    #[error("failed to start container {id}: {source}")]
    Start {
        id: String,
        #[source]
        source: RuntimeError,
    },

    #[error("failed to inspect container {id}: {source}")]
    Inspect {
        id: String,
        #[source]
        source: RuntimeError,
    },

    #[error("failed to remove container {id}: {source}")]
    Remove {
        id: String,
        #[source]
        source: RuntimeError,
    },

    #[error("container {0} not found")]
    NotFound(String),

    #[error("container runtime {step} call timed out after {after:?}")]
    Timeout { step: &'static str, after: Duration },
}

/// Creates and destroys preview containers from a fixed image
pub struct LifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
    image: String,
    pull_policy: PullPolicy,
    call_timeout: Duration,
}

impl LifecycleManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        image: impl Into<String>,
        pull_policy: PullPolicy,
        call_timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            image: image.into(),
            pull_policy,
            call_timeout,
        }
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    /// Create, start and locate a preview container
    ///
    /// `extra_env` is passed through and `PORT=<port>` is appended. If any
    /// step after creation fails the container is removed before the error
    /// is returned.
    pub async fn launch(
        &self,
        hostname: &str,
        port: u16,
        extra_env: &[(String, String)],
    ) -> Result<BackendRecord, LifecycleError> {
        self.timed("pull", self.runtime.ensure_image(&self.image, &self.pull_policy))
            .await?
            .map_err(LifecycleError::Image)?;

        let mut env: Vec<String> = extra_env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        env.push(format!("PORT={}", port));

        let spec = ContainerSpec {
            image: self.image.clone(),
            hostname: hostname.to_string(),
            env,
            labels: HashMap::from([(HOSTNAME_LABEL.to_string(), hostname.to_string())]),
        };

        let id = self
            .timed("create", self.runtime.create(&spec))
            .await?
            .map_err(LifecycleError::Create)?;
        info!(hostname, container_id = %id, image = %self.image, "Created preview container");

        match self.start_and_locate(&id, port).await {
            Ok(address) => {
                info!(hostname, container_id = %id, address = %address, "Preview container running");
                Ok(BackendRecord { id, address })
            }
            Err(e) => {
                warn!(hostname, container_id = %id, error = %e, "Preview launch failed, removing container");
                self.discard(&id).await;
                Err(e)
            }
        }
    }

    async fn start_and_locate(&self, id: &str, port: u16) -> Result<String, LifecycleError> {
        self.timed("start", self.runtime.start(id))
            .await?
            .map_err(|source| LifecycleError::Start {
                id: id.to_string(),
                source,
            })?;

        let ip = self
            .timed("inspect", self.runtime.inspect_address(id))
            .await?
            .map_err(|source| LifecycleError::Inspect {
                id: id.to_string(),
                source,
            })?;

        Ok(format!("{}:{}", ip, port))
    }

    /// Best-effort removal of a container left behind by a failed launch
    async fn discard(&self, id: &str) {
        match self.timed("remove", self.runtime.remove(id)).await {
            Ok(Ok(())) => debug!(container_id = %id, "Removed partially launched container"),
            Ok(Err(e)) => warn!(container_id = %id, error = %e, "Failed to remove partially launched container"),
            Err(e) => warn!(container_id = %id, error = %e, "Failed to remove partially launched container"),
        }
    }

    /// Force-remove the container behind `record`
    ///
    /// A container the runtime no longer knows is reported as
    /// [`LifecycleError::NotFound`].
    pub async fn destroy(&self, record: &BackendRecord) -> Result<(), LifecycleError> {
        match self.timed("remove", self.runtime.remove(&record.id)).await? {
            Ok(()) => {
                info!(container_id = %record.id, address = %record.address, "Removed preview container");
                Ok(())
            }
            Err(RuntimeError::NotFound(_)) => Err(LifecycleError::NotFound(record.id.clone())),
            Err(source) => Err(LifecycleError::Remove {
                id: record.id.clone(),
                source,
            }),
        }
    }

    async fn timed<T>(
        &self,
        step: &'static str,
        call: impl Future<Output = Result<T, RuntimeError>>,
    ) -> Result<Result<T, RuntimeError>, LifecycleError> {
        tokio::time::timeout(self.call_timeout, call)
            .await
            .map_err(|_| LifecycleError::Timeout {
                step,
                after: self.call_timeout,
            })
    }
}
