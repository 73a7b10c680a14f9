use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::StoreError;
use crate::types::{GpuLease, HandoffRecord, ServiceHealth, ServiceId};

/// Defines the contract for durable state backends.
///
/// Every mutating call must be flushed before it returns: callers treat a
/// successful return as "this survives a crash".
pub trait StateStore {
    /// Load the persisted lease, `None` if the GPU was free
    fn load_lease(&self) -> Result<Option<GpuLease>, StoreError>;

    /// Replace the persisted lease
    fn save_lease(&mut self, lease: Option<&GpuLease>) -> Result<(), StoreError>;

    /// Insert or update a handoff record
    fn save_handoff(&mut self, record: &HandoffRecord) -> Result<(), StoreError>;

    /// Persist a lease change together with the handoff record that caused it, atomically
    fn commit_transfer(
        &mut self,
        lease: &GpuLease,
        record: &HandoffRecord,
    ) -> Result<(), StoreError>;

    fn load_handoff(&self, handoff_id: Uuid) -> Result<Option<HandoffRecord>, StoreError>;

    /// All handoff records, oldest first
    fn load_handoffs(&self) -> Result<Vec<HandoffRecord>, StoreError>;

    /// Insert or update the last known health of one instance
    fn save_health(&mut self, health: &ServiceHealth) -> Result<(), StoreError>;

    fn load_health(&self) -> Result<Vec<ServiceHealth>, StoreError>;

    fn load_health_for(&self, service_id: &ServiceId) -> Result<Option<ServiceHealth>, StoreError> {
        Ok(self
            .load_health()?
            .into_iter()
            .find(|h| &h.service_id == service_id))
    }
}

/// Store handle shared by the registry, coordinator and watchdog.
pub type SharedStateStore = Arc<Mutex<dyn StateStore + Send>>;

pub fn shared<S: StateStore + Send + 'static>(store: S) -> SharedStateStore {
    Arc::new(Mutex::new(store))
}
