//! Startup pass that puts the store back into a known-safe state.
//!
//! Interrupted handoffs are never resumed or replayed: each non-terminal record
//! is failed with [`Error::InterruptedByRestart`] and the persisted lease is kept as
//! is. A transfer that committed before the crash is already reflected in the
//! lease; one that didn't left it untouched.

use serde::Serialize;

use crate::error::{Error, Result};
use crate::infrastructure::StateStore;
use crate::types::{now_ms, GpuLease, HandoffRecord, Phase};

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    /// Lease as loaded, unchanged by recovery
    pub lease: Option<GpuLease>,
    /// Records that were non-terminal, now FAILED
    pub interrupted: Vec<HandoffRecord>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.interrupted.is_empty()
    }
}

pub fn recover(store: &mut dyn StateStore) -> Result<RecoveryReport> {
    let lease = store.load_lease()?;
    let now = now_ms();

    let mut interrupted = Vec::new();
    for mut record in store.load_handoffs()? {
        if record.is_terminal() {
            continue;
        }

        let last_phase = record.phase;
        record.terminate(Phase::Failed, Error::InterruptedByRestart.to_string(), now);
        store.save_handoff(&record)?;

        tracing::warn!(
            handoff_id = %record.handoff_id,
            kind = %record.kind,
            last_phase = %last_phase,
            lease_committed = record.lease_committed(),
            "handoff interrupted by restart, marked FAILED"
        );
        interrupted.push(record);
    }

    match &lease {
        Some(lease) => tracing::info!(
            owner = %lease.owner,
            lease_id = %lease.lease_id,
            interrupted = interrupted.len(),
            "recovery complete"
        ),
        None => tracing::info!(interrupted = interrupted.len(), "recovery complete, GPU free"),
    }

    Ok(RecoveryReport { lease, interrupted })
}
