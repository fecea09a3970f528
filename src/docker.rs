//! Docker container runtime for preview environments

use crate::config::PullPolicy;
use crate::lifecycle::{ContainerRuntime, ContainerSpec, RuntimeError};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::NetworkSettings;
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, info};

/// Seconds bollard waits on a single Docker API response
const CLIENT_TIMEOUT_SECS: u64 = 120;

/// [`ContainerRuntime`] backed by the Docker Engine API
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to the Docker daemon
    ///
    /// Uses `docker_host` when given, otherwise probes common socket paths.
    pub async fn connect(docker_host: Option<&str>) -> anyhow::Result<Self> {
        let client = match docker_host {
            Some(host) => Self::connect_to_host(host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker at '{}': {}. \
                     Ensure Docker is running and the socket path is correct.",
                    host,
                    e
                )
            })?,
            None => Self::connect_with_defaults().await?,
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. Ensure dockerd is running.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, CLIENT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, CLIENT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker host: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    async fn connect_with_defaults() -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();
        let candidates = [
            "/var/run/docker.sock".to_string(),
            format!("{}/.docker/run/docker.sock", home),
            format!("{}/.colima/default/docker.sock", home),
        ];

        for path in candidates.iter().filter(|p| !p.starts_with("/.")) {
            if !std::path::Path::new(path).exists() {
                continue;
            }
            debug!(path, "Found Docker socket");
            if let Ok(client) =
                Docker::connect_with_socket(path, CLIENT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            {
                if client.ping().await.is_ok() {
                    return Ok(client);
                }
            }
        }

        Docker::connect_with_socket_defaults().map_err(|e| {
            anyhow::anyhow!(
                "Cannot connect to Docker daemon: {}. \
                 Start dockerd or set DOCKER_HOST / docker.host.",
                e
            )
        })
    }
}

fn runtime_error(e: bollard::errors::Error) -> RuntimeError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        other => RuntimeError::Api(other.to_string()),
    }
}

/// First non-empty address Docker reports for the container
///
/// The legacy top-level field covers the default bridge; user-defined
/// networks only appear in the per-network map, searched in name order.
fn container_address(settings: &NetworkSettings) -> Option<String> {
    if let Some(ip) = settings.ip_address.as_deref().filter(|ip| !ip.is_empty()) {
        return Some(ip.to_string());
    }

    let networks = settings.networks.as_ref()?;
    let mut names: Vec<&String> = networks.keys().collect();
    names.sort();
    names.into_iter().find_map(|name| {
        networks[name]
            .ip_address
            .as_deref()
            .filter(|ip| !ip.is_empty())
            .map(str::to_string)
    })
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ensure_image(&self, image: &str, policy: &PullPolicy) -> Result<(), RuntimeError> {
        let present = self.client.inspect_image(image).await.is_ok();
        let should_pull = match policy {
            PullPolicy::Always => true,
            PullPolicy::IfNotPresent => !present,
            PullPolicy::Never if present => false,
            PullPolicy::Never => {
                return Err(RuntimeError::Image {
                    image: image.to_string(),
                    message: "not present locally and pull_policy is 'never'".to_string(),
                })
            }
        };

        if !should_pull {
            debug!(image, "Image exists locally, skipping pull");
            return Ok(());
        }

        info!(image, "Pulling preview image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);

        while let Some(progress) = stream.next().await {
            let progress = progress.map_err(|e| RuntimeError::Image {
                image: image.to_string(),
                message: e.to_string(),
            })?;
            if let Some(error) = progress.error {
                return Err(RuntimeError::Image {
                    image: image.to_string(),
                    message: error,
                });
            }
        }

        info!(image, "Image pulled");
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let config = Config {
            image: Some(spec.image.clone()),
            hostname: Some(spec.hostname.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            ..Default::default()
        };

        let response = self
            .client
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .map_err(runtime_error)?;

        for warning in &response.warnings {
            debug!(container_id = %response.id, warning, "Docker create warning");
        }

        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(runtime_error)
    }

    async fn inspect_address(&self, id: &str) -> Result<String, RuntimeError> {
        let info = self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(runtime_error)?;

        info.network_settings
            .as_ref()
            .and_then(container_address)
            .ok_or(RuntimeError::NoAddress)
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        self.client
            .remove_container(id, Some(options))
            .await
            .map_err(runtime_error)
    }
}
