//! Registry of running preview environments
//!
//! The registry is the only source of truth for which backend serves a
//! given preview hostname. It stores one [`BackendRecord`] per
//! [`RoutingKey`] and is consulted on every routed request; nothing in the
//! proxy caches its answers.
//!
//! Two backends exist:
//! - [`SqliteRegistry`]: durable, pooled SQLite storage (default)
//! - [`MemoryRegistry`]: process-local map, used in tests and for throwaway runs

mod memory;
mod sqlite;
mod store_pool;

pub use memory::MemoryRegistry;
pub use sqlite::SqliteRegistry;
pub use store_pool::{StorePool, StorePoolConfig};

use crate::config::{RegistryBackend, RegistryConfig};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Maximum hostname length allowed by DNS
const MAX_HOSTNAME_LEN: usize = 253;

/// Key under which a preview is registered: `pr-<number>.<domain>:<port>`
///
/// The hostname part doubles as the container's virtual hostname.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoutingKey(String);

impl RoutingKey {
    /// Derive the key for a pull request
    pub fn for_pull_request(number: u64, domain: &str, port: u16) -> Self {
        Self(format!("pr-{}.{}:{}", number, domain.to_lowercase(), port))
    }

    /// Derive the key from a request's Host header value
    ///
    /// Hosts without an explicit port get `default_port` appended so that a
    /// client omitting the port still matches the registered key. Returns
    /// `None` for values that cannot be a hostname.
    pub fn from_host(host: &str, default_port: u16) -> Option<Self> {
        let host = host.trim();
        let (name, port) = match host.rsplit_once(':') {
            Some((name, port)) => (name, port.parse::<u16>().ok()?),
            None => (host, default_port),
        };

        if name.is_empty() || name.len() > MAX_HOSTNAME_LEN {
            return None;
        }

        // Alphanumeric, hyphen and dot only; keeps junk out of logs and keys
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.') {
            return None;
        }

        Some(Self(format!("{}:{}", name.to_lowercase(), port)))
    }

    /// Reconstruct a key read back from storage
    pub fn from_stored(key: String) -> Self {
        Self(key)
    }

    /// The hostname part, without the port
    pub fn hostname(&self) -> &str {
        self.0.rsplit_once(':').map(|(name, _)| name).unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A running preview environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendRecord {
    /// Container runtime identifier
    pub id: String,
    /// Reachable `ip:port` of the container
    #[serde(rename = "host")]
    pub address: String,
}

/// Errors from the backing store
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("store query failed: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store connection unavailable: {0}")]
    Unavailable(String),

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Outcome of a registry read, keeping store failures distinguishable from
/// a missing entry
#[derive(Debug)]
pub enum Lookup {
    Found(BackendRecord),
    NotFound,
    StoreError(RegistryError),
}

impl Lookup {
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }
}

/// Durable mapping from [`RoutingKey`] to [`BackendRecord`]
#[async_trait]
pub trait Registry: Send + Sync {
    /// Read the record for `key`
    async fn lookup(&self, key: &RoutingKey) -> Lookup;

    /// Store `record` under `key`, replacing any previous record
    async fn set(&self, key: &RoutingKey, record: &BackendRecord) -> Result<(), RegistryError>;

    /// Remove the record for `key`. Removing a missing key succeeds.
    async fn delete(&self, key: &RoutingKey) -> Result<(), RegistryError>;

    /// All registered previews, ordered by key
    async fn list(&self) -> Result<Vec<(RoutingKey, BackendRecord)>, RegistryError>;

    /// Fail-open read: a store error is logged and reported as absent
    async fn get(&self, key: &RoutingKey) -> Option<BackendRecord> {
        match self.lookup(key).await {
            Lookup::Found(record) => Some(record),
            Lookup::NotFound => None,
            Lookup::StoreError(e) => {
                warn!(key = %key, error = %e, "Registry read failed, treating as absent");
                None
            }
        }
    }
}

/// Shared handle injected into the webhook processor, router and admin API
pub type SharedRegistry = Arc<dyn Registry>;

/// Open the registry backend selected in configuration
pub async fn connect(config: &RegistryConfig) -> anyhow::Result<SharedRegistry> {
    match config.backend {
        RegistryBackend::Sqlite => {
            let registry = SqliteRegistry::open(
                &config.path,
                config.pool_config(),
                config.op_timeout(),
            )
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open registry at '{}': {}", config.path, e))?;
            info!(path = %config.path, "SQLite registry opened");
            Ok(Arc::new(registry))
        }
        RegistryBackend::Memory => {
            warn!("Using in-memory registry; previews are forgotten on restart");
            Ok(Arc::new(MemoryRegistry::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_key_for_pull_request() {
        let key = RoutingKey::for_pull_request(42, "example.com", 8000);
        assert_eq!(key.as_str(), "pr-42.example.com:8000");
        assert_eq!(key.hostname(), "pr-42.example.com");
    }

    #[test]
    fn test_routing_key_is_deterministic() {
        let a = RoutingKey::for_pull_request(7, "Preview.Local", 8000);
        let b = RoutingKey::for_pull_request(7, "preview.local", 8000);
        assert_eq!(a, b);
    }

    #[test]
    fn test_routing_key_from_host_with_port() {
        let key = RoutingKey::from_host("PR-42.Example.com:8000", 80).unwrap();
        assert_eq!(key, RoutingKey::for_pull_request(42, "example.com", 8000));
    }

    #[test]
    fn test_routing_key_from_host_without_port() {
        let key = RoutingKey::from_host("pr-3.localdomain", 8000).unwrap();
        assert_eq!(key.as_str(), "pr-3.localdomain:8000");
    }

    #[test]
    fn test_routing_key_from_host_rejects_garbage() {
        assert!(RoutingKey::from_host("", 8000).is_none());
        assert!(RoutingKey::from_host(":8000", 8000).is_none());
        assert!(RoutingKey::from_host("pr-1.example.com:notaport", 8000).is_none());
        assert!(RoutingKey::from_host("pr-1.exa mple.com", 8000).is_none());
        assert!(RoutingKey::from_host("evil\nhost", 8000).is_none());
        assert!(RoutingKey::from_host(&"a".repeat(300), 8000).is_none());
    }

    #[test]
    fn test_backend_record_serializes_address_as_host() {
        let record = BackendRecord {
            id: "abc".to_string(),
            address: "10.0.0.5:8000".to_string(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["id"], "abc");
        assert_eq!(json["host"], "10.0.0.5:8000");
    }

    #[tokio::test]
    async fn test_get_collapses_store_error_to_absent() {
        use crate::testing::FlakyRegistry;

        let registry = FlakyRegistry::new();
        let key = RoutingKey::for_pull_request(1, "example.com", 8000);
        registry
            .set(
                &key,
                &BackendRecord {
                    id: "c1".to_string(),
                    address: "10.0.0.1:8000".to_string(),
                },
            )
            .await
            .unwrap();

        registry.fail_reads(true);
        assert!(matches!(registry.lookup(&key).await, Lookup::StoreError(_)));
        assert!(registry.get(&key).await.is_none());

        registry.fail_reads(false);
        assert!(registry.get(&key).await.is_some());
    }
}
