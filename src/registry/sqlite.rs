use super::store_pool::{StorePool, StorePoolConfig};
use super::{BackendRecord, Lookup, Registry, RegistryError, RoutingKey};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Lock wait while a new connection is set up; each operation then uses its own deadline
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Registry stored in a SQLite database file, one row per preview
pub struct SqliteRegistry {
    pool: Arc<StorePool>,
    op_timeout: Duration,
}

impl SqliteRegistry {
    /// Open or create the registry database at `path`
    pub async fn open(
        path: impl AsRef<Path>,
        pool_config: StorePoolConfig,
        op_timeout: Duration,
    ) -> Result<Self, RegistryError> {
        let path: PathBuf = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                RegistryError::Unavailable(format!("cannot create '{}': {}", parent.display(), e))
            })?;
        }

        let pool = StorePool::new(pool_config, move || dial(&path));
        let registry = Self { pool, op_timeout };

        registry
            .pool
            .run(registry.op_timeout, |conn| {
                conn.execute(
                    "CREATE TABLE IF NOT EXISTS previews (
                        key TEXT PRIMARY KEY,
                        id TEXT NOT NULL,
                        host TEXT NOT NULL
                    )",
                    [],
                )
                .map(|_| ())
            })
            .await?;

        Ok(registry)
    }

    /// The underlying connection pool (for statistics)
    pub fn pool(&self) -> &Arc<StorePool> {
        &self.pool
    }
}

fn dial(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    debug!(path = %path.display(), "Opened registry store connection");
    Ok(conn)
}

#[async_trait]
impl Registry for SqliteRegistry {
    async fn lookup(&self, key: &RoutingKey) -> Lookup {
        let k = key.as_str().to_string();
        let result = self
            .pool
            .run(self.op_timeout, move |conn| {
                conn.query_row(
                    "SELECT id, host FROM previews WHERE key = ?1",
                    params![k],
                    |row| {
                        Ok(BackendRecord {
                            id: row.get(0)?,
                            address: row.get(1)?,
                        })
                    },
                )
                .optional()
            })
            .await;

        match result {
            Ok(Some(record)) => Lookup::Found(record),
            Ok(None) => Lookup::NotFound,
            Err(e) => Lookup::StoreError(e),
        }
    }

    async fn set(&self, key: &RoutingKey, record: &BackendRecord) -> Result<(), RegistryError> {
        let k = key.as_str().to_string();
        let record = record.clone();
        self.pool.run(self.op_timeout, move |conn| {
            conn.execute(
                "INSERT INTO previews (key, id, host) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET id = excluded.id, host = excluded.host",
                params![k, record.id, record.address],
            )
            .map(|_| ())
        })
        .await
    }

    async fn delete(&self, key: &RoutingKey) -> Result<(), RegistryError> {
        let k = key.as_str().to_string();
        self.pool.run(self.op_timeout, move |conn| {
            conn.execute("DELETE FROM previews WHERE key = ?1", params![k])
                .map(|_| ())
        })
        .await
    }

    async fn list(&self) -> Result<Vec<(RoutingKey, BackendRecord)>, RegistryError> {
        self.pool.run(self.op_timeout, |conn| {
            let mut stmt = conn.prepare("SELECT key, id, host FROM previews ORDER BY key")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    RoutingKey::from_stored(row.get(0)?),
                    BackendRecord {
                        id: row.get(1)?,
                        address: row.get(2)?,
                    },
                ))
            })?;
            let entries = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
        .await
    }
}
