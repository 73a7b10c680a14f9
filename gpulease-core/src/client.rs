//! High-level entry point that wires the registry, coordinator and watchdog
//! over one pluggable store. The CLI server delegates to this.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::collaborators::{HealthProbe, StateSync};
use crate::error::Result;
use crate::events::{EventBroadcaster, DEFAULT_EVENT_CAPACITY};
use crate::handoff::{HandoffCollaborators, HandoffConfig, HandoffCoordinator};
use crate::infrastructure::{shared, SharedStateStore};
use crate::infrastructure_in_memory::InMemoryStateStore;
use crate::recovery::{recover, RecoveryReport};
use crate::registry::{LeaseRegistry, RegistryConfig};
use crate::types::ServiceGroup;
use crate::watchdog::{HealthWatchdog, WatchdogConfig};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub registry: RegistryConfig,
    pub handoff: HandoffConfig,
    pub watchdog: WatchdogConfig,
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            handoff: HandoffConfig::default(),
            watchdog: WatchdogConfig::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Everything outside the kernel that it talks to
#[derive(Clone)]
pub struct Collaborators {
    pub handoff: HandoffCollaborators,
    pub probe: Arc<dyn HealthProbe>,
    pub sync: Arc<dyn StateSync>,
}

pub struct GpuOrchestrator {
    store: SharedStateStore,
    events: EventBroadcaster,
    registry: Arc<LeaseRegistry>,
    coordinator: Arc<HandoffCoordinator>,
    watchdog: Arc<HealthWatchdog>,
    recovery: RecoveryReport,
}

impl GpuOrchestrator {
    /// Run crash recovery against `store`, then build the components on top
    /// of the recovered state. Nothing accepts requests before this returns.
    pub fn open(
        store: SharedStateStore,
        groups: Vec<ServiceGroup>,
        collaborators: Collaborators,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        let recovery = recover(&mut *store.lock())?;

        let events = EventBroadcaster::new(config.event_capacity);
        let registry = Arc::new(LeaseRegistry::new(
            store.clone(),
            events.clone(),
            config.registry,
        )?);
        let coordinator = Arc::new(HandoffCoordinator::new(
            registry.clone(),
            store.clone(),
            events.clone(),
            collaborators.handoff,
            config.handoff,
        ));
        let watchdog = Arc::new(HealthWatchdog::new(
            groups,
            collaborators.probe,
            collaborators.sync,
            store.clone(),
            events.clone(),
            config.watchdog,
        ));

        Ok(Self {
            store,
            events,
            registry,
            coordinator,
            watchdog,
            recovery,
        })
    }

    /// Orchestrator over a volatile store. State does not survive restarts.
    pub fn in_memory(
        groups: Vec<ServiceGroup>,
        collaborators: Collaborators,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        Self::open(shared(InMemoryStateStore::new()), groups, collaborators, config)
    }

    /// Orchestrator backed by SQLite at the given path.
    #[cfg(feature = "sqlite")]
    pub fn with_sqlite(
        path: &str,
        groups: Vec<ServiceGroup>,
        collaborators: Collaborators,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        let store = crate::infrastructure_sqlite::SqliteStateStore::open(path)?;
        Self::open(shared(store), groups, collaborators, config)
    }

    /// Start the watchdog loop; it stops when `cancel` fires.
    pub fn start_watchdog(&self, cancel: CancellationToken) -> JoinHandle<()> {
        Arc::clone(&self.watchdog).run(cancel)
    }

    pub fn registry(&self) -> &Arc<LeaseRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<HandoffCoordinator> {
        &self.coordinator
    }

    pub fn watchdog(&self) -> &Arc<HealthWatchdog> {
        &self.watchdog
    }

    pub fn events(&self) -> &EventBroadcaster {
        &self.events
    }

    pub fn store(&self) -> &SharedStateStore {
        &self.store
    }

    /// What the startup recovery pass found
    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }
}
