use crate::error::StoreError;
use crate::infrastructure::StateStore;
use crate::types::{GpuLease, HandoffRecord, ServiceHealth, ServiceId};
use std::collections::HashMap;
use uuid::Uuid;

/// Volatile store for tests and `--storage memory`. Nothing survives a restart.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStateStore {
    lease: Option<GpuLease>,
    // Insertion order doubles as history order
    handoffs: Vec<HandoffRecord>,
    health: HashMap<ServiceId, ServiceHealth>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for InMemoryStateStore {
    fn load_lease(&self) -> Result<Option<GpuLease>, StoreError> {
        Ok(self.lease.clone())
    }

    fn save_lease(&mut self, lease: Option<&GpuLease>) -> Result<(), StoreError> {
        self.lease = lease.cloned();
        Ok(())
    }

    fn save_handoff(&mut self, record: &HandoffRecord) -> Result<(), StoreError> {
        match self
            .handoffs
            .iter_mut()
            .find(|r| r.handoff_id == record.handoff_id)
        {
            Some(existing) => *existing = record.clone(),
            None => self.handoffs.push(record.clone()),
        }
        Ok(())
    }

    fn commit_transfer(
        &mut self,
        lease: &GpuLease,
        record: &HandoffRecord,
    ) -> Result<(), StoreError> {
        self.save_handoff(record)?;
        self.lease = Some(lease.clone());
        Ok(())
    }

    fn load_handoff(&self, handoff_id: Uuid) -> Result<Option<HandoffRecord>, StoreError> {
        Ok(self
            .handoffs
            .iter()
            .find(|r| r.handoff_id == handoff_id)
            .cloned())
    }

    fn load_handoffs(&self) -> Result<Vec<HandoffRecord>, StoreError> {
        Ok(self.handoffs.clone())
    }

    fn save_health(&mut self, health: &ServiceHealth) -> Result<(), StoreError> {
        self.health.insert(health.service_id.clone(), health.clone());
        Ok(())
    }

    fn load_health(&self) -> Result<Vec<ServiceHealth>, StoreError> {
        let mut all: Vec<_> = self.health.values().cloned().collect();
        all.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        Ok(all)
    }
}
