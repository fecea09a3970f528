use crate::registry::StorePoolConfig;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// How preview containers are named and built
    #[serde(default)]
    pub preview: PreviewConfig,

    /// Container runtime connection
    #[serde(default)]
    pub docker: DockerConfig,

    /// Registry store
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Webhook endpoint
    #[serde(default)]
    pub webhook: WebhookConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Public port for webhooks and proxied traffic (default: 8000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Port for the admin API on 127.0.0.1 (default: 9090, set to 0 to disable)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Authentication token for the admin API
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Maximum idle connections per preview backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle backend connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Max time to wait for a preview to answer a proxied request (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            admin_port: default_admin_port(),
            admin_token: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Image pull policy for preview containers
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum PullPolicy {
    /// Pull if image doesn't exist locally (default)
    #[default]
    IfNotPresent,
    /// Always pull before launching
    Always,
    /// Never pull, fail if image doesn't exist
    Never,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PreviewConfig {
    /// Domain suffix for preview hostnames: pr-<number>.<domain>
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Image every preview container is created from
    #[serde(default = "default_image")]
    pub image: String,

    /// Port previews listen on and the port part of routing keys
    /// (default: same as server.port)
    pub port: Option<u16>,

    #[serde(default)]
    pub pull_policy: PullPolicy,
}

impl PreviewConfig {
    pub fn port(&self, server: &ServerConfig) -> u16 {
        self.port.unwrap_or(server.port)
    }
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            image: default_image(),
            port: None,
            pull_policy: PullPolicy::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DockerConfig {
    /// Docker endpoint: unix:///path/to/socket or tcp://host:port
    /// If not set, DOCKER_HOST and common socket paths are tried
    pub host: Option<String>,

    /// Upper bound on each create/start/inspect/remove call (default: 60)
    #[serde(default = "default_docker_call_timeout")]
    pub call_timeout_secs: u64,
}

impl DockerConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            host: None,
            call_timeout_secs: default_docker_call_timeout(),
        }
    }
}

/// Registry storage backend
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackend {
    /// SQLite database file (default)
    #[default]
    Sqlite,
    /// Process memory, lost on restart
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    #[serde(default)]
    pub backend: RegistryBackend,

    /// Database file for the sqlite backend
    #[serde(default = "default_registry_path")]
    pub path: String,

    /// Maximum store connections in use at once (default: 16)
    #[serde(default = "default_registry_max_open")]
    pub max_open: usize,

    /// Maximum idle store connections kept (default: 3)
    #[serde(default = "default_registry_max_idle")]
    pub max_idle: usize,

    /// Idle store connections older than this are closed (default: 240)
    #[serde(default = "default_registry_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Idle store connections older than this are pinged before reuse (default: 10)
    #[serde(default = "default_registry_test_on_borrow")]
    pub test_on_borrow_after_secs: u64,

    /// Upper bound on each registry operation (default: 5)
    #[serde(default = "default_registry_op_timeout")]
    pub op_timeout_secs: u64,
}

impl RegistryConfig {
    pub fn pool_config(&self) -> StorePoolConfig {
        StorePoolConfig {
            max_open: self.max_open,
            max_idle: self.max_idle,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            test_on_borrow_after: Duration::from_secs(self.test_on_borrow_after_secs),
        }
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: RegistryBackend::default(),
            path: default_registry_path(),
            max_open: default_registry_max_open(),
            max_idle: default_registry_max_idle(),
            idle_timeout_secs: default_registry_idle_timeout(),
            test_on_borrow_after_secs: default_registry_test_on_borrow(),
            op_timeout_secs: default_registry_op_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    /// Shared secret for X-Hub-Signature-256 verification
    /// If not set, deliveries are accepted unsigned
    pub secret: Option<String>,

    /// Largest accepted delivery body in bytes (default: 1 MiB)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: None,
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    8000
}

fn default_admin_port() -> u16 {
    9090
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_request_timeout() -> u64 {
    30
}

fn default_domain() -> String {
    "localdomain".to_string()
}

fn default_image() -> String {
    "nabeken/docker-hugo-server".to_string()
}

fn default_docker_call_timeout() -> u64 {
    60
}

fn default_registry_path() -> String {
    "previewgate.db".to_string()
}

fn default_registry_max_open() -> usize {
    16
}

fn default_registry_max_idle() -> usize {
    3
}

fn default_registry_idle_timeout() -> u64 {
    240
}

fn default_registry_test_on_borrow() -> u64 {
    10
}

fn default_registry_op_timeout() -> u64 {
    5
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load the file if it exists, apply environment overrides, validate
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        Self::load_with_lookup(path, |key| std::env::var(key).ok())
    }

    /// Same as [`Config::load_with_env`] with overrides read through `lookup`
    pub fn load_with_lookup<P, F>(path: P, lookup: F) -> anyhow::Result<Self>
    where
        P: AsRef<Path>,
        F: Fn(&str) -> Option<String>,
    {
        let path = path.as_ref();
        let mut config = if path.exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        config.apply_env(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from environment variables
    ///
    /// Empty values are ignored, matching an unset variable.
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(host) = var("HOST") {
            self.server.bind = host;
        }
        if let Some(port) = var("PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a port number, got '{}'", port))?;
        }
        if let Some(domain) = var("PREVIEW_DOMAIN") {
            self.preview.domain = domain;
        }
        if let Some(image) = var("PREVIEW_IMAGE") {
            self.preview.image = image;
        }
        if let Some(docker_host) = var("DOCKER_HOST") {
            self.docker.host = Some(docker_host);
        }
        if let Some(path) = var("REGISTRY_PATH") {
            self.registry.path = path;
        }
        if let Some(secret) = var("WEBHOOK_SECRET") {
            self.webhook.secret = Some(secret);
        }
        if let Some(token) = var("ADMIN_TOKEN") {
            self.server.admin_token = Some(token);
        }
        Ok(())
    }

    /// Validate the configuration, reporting every problem at once
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.preview.domain.trim().is_empty() {
            errors.push("preview.domain must not be empty".to_string());
        }
        if self.preview.image.trim().is_empty() {
            errors.push("preview.image must not be empty".to_string());
        }
        if self.server.port == 0 {
            errors.push("server.port must be greater than 0".to_string());
        }
        if self.preview.port == Some(0) {
            errors.push("preview.port must be greater than 0".to_string());
        }
        if self.registry.max_open == 0 {
            errors.push("registry.max_open must be greater than 0".to_string());
        }
        if self.registry.max_idle > self.registry.max_open {
            errors.push(format!(
                "registry.max_idle ({}) must not exceed registry.max_open ({})",
                self.registry.max_idle, self.registry.max_open
            ));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.preview.domain, "localdomain");
        assert_eq!(config.preview.image, "nabeken/docker-hugo-server");
        assert_eq!(config.preview.port(&config.server), 8000);
        assert_eq!(config.registry.backend, RegistryBackend::Sqlite);
        assert!(config.webhook.secret.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
bind = "0.0.0.0"
port = 8080
admin_port = 0
request_timeout_secs = 10

[preview]
domain = "preview.example.com"
image = "ghcr.io/acme/site-preview:latest"
port = 1313
pull_policy = "always"

[docker]
host = "unix:///run/docker.sock"
call_timeout_secs = 20

[registry]
backend = "memory"
max_open = 4
max_idle = 2

[webhook]
secret = "s3cret"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.admin_port, 0);
        assert_eq!(config.server.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.preview.port(&config.server), 1313);
        assert_eq!(config.preview.pull_policy, PullPolicy::Always);
        assert_eq!(config.docker.host.as_deref(), Some("unix:///run/docker.sock"));
        assert_eq!(config.docker.call_timeout(), Duration::from_secs(20));
        assert_eq!(config.registry.backend, RegistryBackend::Memory);
        assert_eq!(config.registry.pool_config().max_idle, 2);
        assert_eq!(config.webhook.secret.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                ("HOST", "0.0.0.0"),
                ("PORT", "9000"),
                ("PREVIEW_DOMAIN", "pr.example.org"),
                ("DOCKER_HOST", "tcp://docker:2375"),
                ("WEBHOOK_SECRET", "hush"),
            ]))
            .unwrap();

        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.preview.port(&config.server), 9000);
        assert_eq!(config.preview.domain, "pr.example.org");
        assert_eq!(config.docker.host.as_deref(), Some("tcp://docker:2375"));
        assert_eq!(config.webhook.secret.as_deref(), Some("hush"));
    }

    #[test]
    fn test_empty_env_values_are_ignored() {
        let mut config = Config::default();
        config.apply_env(env(&[("PORT", ""), ("HOST", "")])).unwrap();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.bind, "127.0.0.1");
    }

    #[test]
    fn test_invalid_port_env() {
        let mut config = Config::default();
        let err = config.apply_env(env(&[("PORT", "http")])).unwrap_err();
        assert!(err.to_string().contains("PORT must be a port number"));
    }

    #[test]
    fn test_validate_multiple_errors() {
        let toml = r#"
[preview]
domain = ""
image = " "

[registry]
max_open = 2
max_idle = 5
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("preview.domain must not be empty"));
        assert!(err.contains("preview.image must not be empty"));
        assert!(err.contains("registry.max_idle (5) must not exceed registry.max_open (2)"));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_with_lookup(dir.path().join("absent.toml"), |_| None).unwrap();
        assert_eq!(config.registry.max_open, 16);
        assert_eq!(config.webhook.max_body_bytes, 1024 * 1024);
    }

    #[test]
    fn test_load_applies_overrides_then_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("previewgate.toml");
        std::fs::write(&path, "[server]\nport = 8100\n").unwrap();

        let config = Config::load_with_lookup(&path, env(&[("PREVIEW_DOMAIN", "pr.example.net")])).unwrap();
        assert_eq!(config.server.port, 8100);
        assert_eq!(config.preview.domain, "pr.example.net");

        let err = Config::load_with_lookup(&path, env(&[("PORT", "abc")])).unwrap_err();
        assert!(err.to_string().contains("PORT"));
    }
}
