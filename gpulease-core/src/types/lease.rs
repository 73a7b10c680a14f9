use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ServiceId, Timestamp};

/// Exclusive ownership of the accelerator.
///
/// The registry holds an `Option<GpuLease>`; `None` means nobody owns the GPU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuLease {
    /// Service currently holding the accelerator
    pub owner: ServiceId,
    /// Unique lease ID, required to release
    pub lease_id: Uuid,
    /// Why the owner needs the GPU (e.g. "inference", "training")
    pub reason: String,
    /// When the lease was granted
    pub acquired_at: Timestamp,
}

impl GpuLease {
    pub fn new(owner: ServiceId, reason: impl Into<String>, now: Timestamp) -> Self {
        Self {
            owner,
            lease_id: Uuid::new_v4(),
            reason: reason.into(),
            acquired_at: now,
        }
    }
}

/// A caller waiting for the lease
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitQueueEntry {
    pub requester: ServiceId,
    pub requested_at: Timestamp,
    /// Monotonic arrival sequence; the queue is ordered by it
    pub ticket: u64,
}

/// Result of a successful `acquire`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseGrant {
    pub lease: GpuLease,
    /// Time spent in the wait queue, zero for immediate grants
    pub waited_ms: u64,
    /// The caller already held this lease and got it back unchanged
    pub existing: bool,
}

/// Read-only snapshot of the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseStatus {
    pub lease: Option<GpuLease>,
    pub queue_depth: usize,
    pub waiters: Vec<WaitQueueEntry>,
}
