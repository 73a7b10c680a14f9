//! Test adapters implementing the collaborator traits.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::collaborators::*;
use crate::error::{CollaboratorError, ProbeError, StoreError};
use crate::events::EventBroadcaster;
use crate::handoff::{HandoffCollaborators, HandoffConfig, HandoffCoordinator};
use crate::infrastructure::{shared, SharedStateStore, StateStore};
use crate::infrastructure_in_memory::InMemoryStateStore;
use crate::registry::{LeaseRegistry, RegistryConfig};
use crate::types::*;

/// Workload whose behaviour is switched per test
#[derive(Default)]
pub struct MockWorkload {
    pub quiesce_calls: AtomicUsize,
    pub resume_calls: AtomicUsize,
    pub fail_quiesce: AtomicBool,
    /// Blocks quiesce for this long
    pub quiesce_delay: Mutex<Option<Duration>>,
    /// `is_ready` answers false until this many polls have happened
    pub ready_after: AtomicUsize,
    pub ready_polls: AtomicUsize,
    pub never_ready: AtomicBool,
}

impl MockWorkload {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Workload for MockWorkload {
    async fn quiesce(&self) -> Result<(), CollaboratorError> {
        self.quiesce_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.quiesce_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_quiesce.load(Ordering::SeqCst) {
            return Err(CollaboratorError::new("workload", "quiesce refused"));
        }
        Ok(())
    }

    async fn resume(&self) -> Result<(), CollaboratorError> {
        self.resume_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_ready(&self) -> Result<bool, CollaboratorError> {
        let polls = self.ready_polls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.never_ready.load(Ordering::SeqCst) {
            return Ok(false);
        }
        Ok(polls > self.ready_after.load(Ordering::SeqCst))
    }
}

/// Replays queued memory readings, then repeats `steady_mb`
pub struct MockAccelerator {
    readings: Mutex<VecDeque<u64>>,
    steady_mb: Mutex<u64>,
    pub polls: AtomicUsize,
}

impl MockAccelerator {
    pub fn idle() -> Arc<Self> {
        Self::with_readings(Vec::new(), 0)
    }

    pub fn with_readings(readings: Vec<u64>, steady_mb: u64) -> Arc<Self> {
        Arc::new(Self {
            readings: Mutex::new(readings.into()),
            steady_mb: Mutex::new(steady_mb),
            polls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl AcceleratorMonitor for MockAccelerator {
    async fn resident_memory_mb(&self) -> Result<u64, CollaboratorError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let next = self.readings.lock().pop_front();
        Ok(next.unwrap_or(*self.steady_mb.lock()))
    }
}

/// Records start/stop calls as "stop:prime", "start:study", ...
#[derive(Default)]
pub struct MockLifecycle {
    pub calls: Mutex<Vec<String>>,
    pub fail_start: Mutex<HashSet<ServiceId>>,
}

impl MockLifecycle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl WorkloadLifecycle for MockLifecycle {
    async fn stop(&self, service: &ServiceId) -> Result<(), CollaboratorError> {
        self.calls.lock().push(format!("stop:{service}"));
        Ok(())
    }

    async fn start(&self, service: &ServiceId) -> Result<(), CollaboratorError> {
        self.calls.lock().push(format!("start:{service}"));
        if self.fail_start.lock().contains(service) {
            return Err(CollaboratorError::new("lifecycle", format!("{service} failed to start")));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MockSync {
    pub requests: Mutex<Vec<String>>,
}

impl MockSync {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl StateSync for MockSync {
    async fn sync_to_standby(&self, group: &str) -> Result<(), CollaboratorError> {
        self.requests.lock().push(group.to_string());
        Ok(())
    }
}

/// Probe answering from a per-service up/down table (unknown services are up)
#[derive(Default)]
pub struct MockProbe {
    up: Mutex<HashMap<ServiceId, bool>>,
    pub delay: Mutex<Option<Duration>>,
    pub calls: AtomicUsize,
}

impl MockProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_up(&self, service: &str, up: bool) {
        self.up.lock().insert(ServiceId::new(service), up);
    }
}

#[async_trait]
impl HealthProbe for MockProbe {
    async fn probe(&self, endpoint: &Endpoint) -> Result<(), ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let up = self
            .up
            .lock()
            .get(&endpoint.service_id)
            .copied()
            .unwrap_or(true);
        if up {
            Ok(())
        } else {
            Err(ProbeError {
                service: endpoint.service_id.clone(),
                message: "connection refused".into(),
            })
        }
    }
}

/// In-memory store that rejects writes of terminal handoff records
#[derive(Default)]
pub struct TerminalWriteFailingStore {
    inner: InMemoryStateStore,
}

impl StateStore for TerminalWriteFailingStore {
    fn load_lease(&self) -> Result<Option<GpuLease>, StoreError> {
        self.inner.load_lease()
    }

    fn save_lease(&mut self, lease: Option<&GpuLease>) -> Result<(), StoreError> {
        self.inner.save_lease(lease)
    }

    fn save_handoff(&mut self, record: &HandoffRecord) -> Result<(), StoreError> {
        if record.is_terminal() {
            return Err(StoreError::Corrupt("write rejected".into()));
        }
        self.inner.save_handoff(record)
    }

    fn commit_transfer(&mut self, lease: &GpuLease, record: &HandoffRecord) -> Result<(), StoreError> {
        self.inner.commit_transfer(lease, record)
    }

    fn load_handoff(&self, handoff_id: Uuid) -> Result<Option<HandoffRecord>, StoreError> {
        self.inner.load_handoff(handoff_id)
    }

    fn load_handoffs(&self) -> Result<Vec<HandoffRecord>, StoreError> {
        self.inner.load_handoffs()
    }

    fn save_health(&mut self, health: &ServiceHealth) -> Result<(), StoreError> {
        self.inner.save_health(health)
    }

    fn load_health(&self) -> Result<Vec<ServiceHealth>, StoreError> {
        self.inner.load_health()
    }
}

/// A coordinator over an in-memory store with mock collaborators
pub struct Harness {
    pub store: SharedStateStore,
    pub events: EventBroadcaster,
    pub registry: Arc<LeaseRegistry>,
    pub coordinator: Arc<HandoffCoordinator>,
    pub prime: Arc<MockWorkload>,
    pub study: Arc<MockWorkload>,
    pub lifecycle: Arc<MockLifecycle>,
    pub accelerator: Arc<MockAccelerator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(InMemoryStateStore::new(), MockAccelerator::idle(), HandoffConfig::default())
    }

    pub fn with(
        store: impl StateStore + Send + 'static,
        accelerator: Arc<MockAccelerator>,
        config: HandoffConfig,
    ) -> Self {
        let store = shared(store);
        let events = EventBroadcaster::default();
        let registry = Arc::new(
            LeaseRegistry::new(store.clone(), events.clone(), RegistryConfig::default())
                .expect("registry"),
        );
        let prime = MockWorkload::new();
        let study = MockWorkload::new();
        let lifecycle = MockLifecycle::new();
        let coordinator = Arc::new(HandoffCoordinator::new(
            registry.clone(),
            store.clone(),
            events.clone(),
            HandoffCollaborators {
                prime: prime.clone(),
                study: study.clone(),
                lifecycle: lifecycle.clone(),
                accelerator: accelerator.clone(),
            },
            config,
        ));

        Self {
            store,
            events,
            registry,
            coordinator,
            prime,
            study,
            lifecycle,
            accelerator,
        }
    }
}
