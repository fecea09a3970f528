//! In-process stand-ins for the container runtime and the registry store
//!
//! Used by unit and integration tests to drive the webhook processor and
//! the router without a Docker daemon.

use crate::config::PullPolicy;
use crate::lifecycle::{ContainerRuntime, ContainerSpec, RuntimeError};
use crate::registry::{BackendRecord, Lookup, MemoryRegistry, Registry, RegistryError, RoutingKey};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Runtime call that [`StubRuntime::fail_on`] can make fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeStep {
    Pull,
    Create,
    Start,
    Inspect,
    Remove,
}

#[derive(Debug, Clone)]
pub struct StubContainer {
    pub spec: ContainerSpec,
    pub running: bool,
}

/// Container runtime that keeps containers in a map
///
/// Every started container reports the same configured IP address, so
/// tests can point previews at a local listener.
pub struct StubRuntime {
    containers: DashMap<String, StubContainer>,
    address: String,
    next_id: AtomicU64,
    fail_on: Mutex<Option<RuntimeStep>>,
    create_delay: Mutex<Duration>,
    creates: AtomicUsize,
    removes: AtomicUsize,
}

impl Default for StubRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl StubRuntime {
    pub fn new() -> Self {
        Self::with_address("127.0.0.1")
    }

    pub fn with_address(ip: impl Into<String>) -> Self {
        Self {
            containers: DashMap::new(),
            address: ip.into(),
            next_id: AtomicU64::new(1),
            fail_on: Mutex::new(None),
            create_delay: Mutex::new(Duration::ZERO),
            creates: AtomicUsize::new(0),
            removes: AtomicUsize::new(0),
        }
    }

    /// Make every call of `step` fail until reset with `None`
    pub fn fail_on(&self, step: Option<RuntimeStep>) {
        *self.fail_on.lock() = step;
    }

    /// Delay each create call, widening race windows in concurrency tests
    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock() = delay;
    }

    /// Number of successful create calls
    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Drop a container behind the gateway's back, as `docker rm` would
    pub fn vanish(&self, id: &str) -> bool {
        self.containers.remove(id).is_some()
    }

    /// Number of successful remove calls
    pub fn remove_count(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }

    /// Containers currently known to the runtime
    pub fn container_count(&self) -> usize {
        self.containers.len()
    }

    pub fn exists(&self, id: &str) -> bool {
        self.containers.contains_key(id)
    }

    pub fn container(&self, id: &str) -> Option<StubContainer> {
        self.containers.get(id).map(|c| c.clone())
    }

    fn check(&self, step: RuntimeStep) -> Result<(), RuntimeError> {
        if *self.fail_on.lock() == Some(step) {
            return Err(RuntimeError::Api(format!("injected {:?} failure", step)));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for StubRuntime {
    async fn ensure_image(&self, image: &str, _policy: &PullPolicy) -> Result<(), RuntimeError> {
        self.check(RuntimeStep::Pull).map_err(|e| RuntimeError::Image {
            image: image.to_string(),
            message: e.to_string(),
        })
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let delay = *self.create_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check(RuntimeStep::Create)?;

        let id = format!("stub{:08x}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers.insert(
            id.clone(),
            StubContainer {
                spec: spec.clone(),
                running: false,
            },
        );
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.check(RuntimeStep::Start)?;
        let mut container = self
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        container.running = true;
        Ok(())
    }

    async fn inspect_address(&self, id: &str) -> Result<String, RuntimeError> {
        self.check(RuntimeStep::Inspect)?;
        let container = self
            .containers
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        if !container.running {
            return Err(RuntimeError::NoAddress);
        }
        Ok(self.address.clone())
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.check(RuntimeStep::Remove)?;
        self.containers
            .remove(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        self.removes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory registry whose reads and writes can be made to fail
#[derive(Default)]
pub struct FlakyRegistry {
    inner: MemoryRegistry,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl FlakyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Entries held regardless of injected failures
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn injected() -> RegistryError {
        RegistryError::Unavailable("injected store failure".to_string())
    }
}

#[async_trait]
impl Registry for FlakyRegistry {
    async fn lookup(&self, key: &RoutingKey) -> Lookup {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Lookup::StoreError(Self::injected());
        }
        self.inner.lookup(key).await
    }

    async fn set(&self, key: &RoutingKey, record: &BackendRecord) -> Result<(), RegistryError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        self.inner.set(key, record).await
    }

    async fn delete(&self, key: &RoutingKey) -> Result<(), RegistryError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        self.inner.delete(key).await
    }

    async fn list(&self) -> Result<Vec<(RoutingKey, BackendRecord)>, RegistryError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        self.inner.list().await
    }
}
