use super::{BackendRecord, Lookup, Registry, RegistryError, RoutingKey};
use async_trait::async_trait;
use dashmap::DashMap;

/// Process-local registry backed by a concurrent map
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    entries: DashMap<RoutingKey, BackendRecord>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn lookup(&self, key: &RoutingKey) -> Lookup {
        match self.entries.get(key) {
            Some(record) => Lookup::Found(record.clone()),
            None => Lookup::NotFound,
        }
    }

    async fn set(&self, key: &RoutingKey, record: &BackendRecord) -> Result<(), RegistryError> {
        self.entries.insert(key.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, key: &RoutingKey) -> Result<(), RegistryError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<(RoutingKey, BackendRecord)>, RegistryError> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}
