//! Boundaries to the systems this kernel drives but does not own.

use async_trait::async_trait;

use crate::error::{CollaboratorError, ProbeError};
use crate::types::{Endpoint, ServiceId};

/// A service that can own the accelerator (source or target of a handoff)
#[async_trait]
pub trait Workload: Send + Sync {
    /// Stop accepting new work and flush in-flight state
    async fn quiesce(&self) -> Result<(), CollaboratorError>;

    /// Start using the accelerator again
    async fn resume(&self) -> Result<(), CollaboratorError>;

    /// Readiness probe; `Ok(false)` means "not yet", not an error
    async fn is_ready(&self) -> Result<bool, CollaboratorError>;
}

/// Signal used to decide the accelerator has been vacated
#[async_trait]
pub trait AcceleratorMonitor: Send + Sync {
    async fn resident_memory_mb(&self) -> Result<u64, CollaboratorError>;
}

/// Starts and stops the processes that hold the lease
#[async_trait]
pub trait WorkloadLifecycle: Send + Sync {
    async fn stop(&self, service: &ServiceId) -> Result<(), CollaboratorError>;

    async fn start(&self, service: &ServiceId) -> Result<(), CollaboratorError>;
}

/// Replicates state from a failed primary's group to its standby
#[async_trait]
pub trait StateSync: Send + Sync {
    async fn sync_to_standby(&self, group: &str) -> Result<(), CollaboratorError>;
}

/// Liveness check of one instance
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, endpoint: &Endpoint) -> Result<(), ProbeError>;
}
