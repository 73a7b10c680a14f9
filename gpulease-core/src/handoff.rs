//! Supervised GPU transfer between `prime` and `study`.
//!
//! Phases run strictly in order and each one is persisted before its side
//! effects start, so the store always knows the last confirmed phase. Only
//! `LEASE_TRANSFERRED` touches the lease, through [`LeaseRegistry::transfer`],
//! which commits the owner change and the phase record in one write.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::collaborators::{AcceleratorMonitor, Workload, WorkloadLifecycle};
use crate::error::{Error, Result};
use crate::events::{EventBroadcaster, EventKind};
use crate::infrastructure::SharedStateStore;
use crate::registry::LeaseRegistry;
use crate::types::*;

/// Upper bounds for the waiting phases of one handoff direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseTimeouts {
    pub source_release: Duration,
    pub cleanup: Duration,
    pub target_start: Duration,
}

impl PhaseTimeouts {
    pub fn defaults_for(kind: HandoffKind) -> Self {
        match kind {
            // prime drains in well under a second; study starts from a warm image
            HandoffKind::PrimeToStudy => Self {
                source_release: Duration::from_secs(5),
                cleanup: Duration::from_secs(60),
                target_start: Duration::from_secs(60),
            },
            // study has to checkpoint, prime has to cold-start its model
            HandoffKind::StudyToPrime => Self {
                source_release: Duration::from_secs(30),
                cleanup: Duration::from_secs(60),
                target_start: Duration::from_secs(120),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct HandoffConfig {
    pub prime_to_study: PhaseTimeouts,
    pub study_to_prime: PhaseTimeouts,
    /// Resident memory below which the accelerator counts as vacated
    pub idle_memory_threshold_mb: u64,
    pub cleanup_poll_interval: Duration,
    pub readiness_poll_interval: Duration,
    /// Bound for restarting the source after a failure before the transfer
    pub rollback_timeout: Duration,
}

impl HandoffConfig {
    pub fn timeouts(&self, kind: HandoffKind) -> &PhaseTimeouts {
        match kind {
            HandoffKind::PrimeToStudy => &self.prime_to_study,
            HandoffKind::StudyToPrime => &self.study_to_prime,
        }
    }
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            prime_to_study: PhaseTimeouts::defaults_for(HandoffKind::PrimeToStudy),
            study_to_prime: PhaseTimeouts::defaults_for(HandoffKind::StudyToPrime),
            idle_memory_threshold_mb: 1024,
            cleanup_poll_interval: Duration::from_millis(500),
            readiness_poll_interval: Duration::from_secs(1),
            rollback_timeout: Duration::from_secs(30),
        }
    }
}

/// External systems a handoff drives
#[derive(Clone)]
pub struct HandoffCollaborators {
    pub prime: Arc<dyn Workload>,
    pub study: Arc<dyn Workload>,
    pub lifecycle: Arc<dyn WorkloadLifecycle>,
    pub accelerator: Arc<dyn AcceleratorMonitor>,
}

struct ActiveHandoff {
    record: HandoffRecord,
    cancel: CancellationToken,
}

/// Why `execute` stopped early
enum Interrupt {
    Aborted,
    Failed(Error),
}

impl From<Error> for Interrupt {
    fn from(err: Error) -> Self {
        Interrupt::Failed(err)
    }
}

pub struct HandoffCoordinator {
    registry: Arc<LeaseRegistry>,
    store: SharedStateStore,
    events: EventBroadcaster,
    workloads: HashMap<ServiceId, Arc<dyn Workload>>,
    lifecycle: Arc<dyn WorkloadLifecycle>,
    accelerator: Arc<dyn AcceleratorMonitor>,
    config: HandoffConfig,
    active: Mutex<Option<ActiveHandoff>>,
}

impl HandoffCoordinator {
    pub fn new(
        registry: Arc<LeaseRegistry>,
        store: SharedStateStore,
        events: EventBroadcaster,
        collaborators: HandoffCollaborators,
        config: HandoffConfig,
    ) -> Self {
        let mut workloads = HashMap::new();
        workloads.insert(ServiceId::prime(), collaborators.prime);
        workloads.insert(ServiceId::study(), collaborators.study);

        Self {
            registry,
            store,
            events,
            workloads,
            lifecycle: collaborators.lifecycle,
            accelerator: collaborators.accelerator,
            config,
            active: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &HandoffConfig {
        &self.config
    }

    /// Run a handoff to completion (or failure) on the current task.
    pub async fn run(&self, kind: HandoffKind) -> Result<HandoffRecord> {
        let record = self.begin(kind)?;
        self.drive(record).await
    }

    /// Create the handoff record and execute it on a background task.
    ///
    /// The INITIATED record is returned right away; a concurrent request gets
    /// `HandoffInProgress` synchronously.
    pub fn spawn(
        self: &Arc<Self>,
        kind: HandoffKind,
    ) -> Result<(HandoffRecord, JoinHandle<Result<HandoffRecord>>)> {
        let record = self.begin(kind)?;
        let coordinator = Arc::clone(self);
        let initiated = record.clone();
        let handle = tokio::spawn(async move { coordinator.drive(record).await });
        Ok((initiated, handle))
    }

    /// Reserve the single handoff slot and persist the INITIATED record.
    ///
    /// Refused with `NotOwner` when the GPU is held by someone other than the
    /// direction's source; nothing is recorded in that case.
    pub fn begin(&self, kind: HandoffKind) -> Result<HandoffRecord> {
        let mut active = self.active.lock();
        if let Some(current) = active.as_ref() {
            tracing::warn!(
                active = %current.record.handoff_id,
                requested = %kind,
                "handoff rejected, another one is in progress"
            );
            return Err(Error::HandoffInProgress {
                active: current.record.handoff_id,
            });
        }

        let source = kind.source();
        if let Some(current) = self.registry.current() {
            if current.owner != source {
                tracing::warn!(%kind, owner = %current.owner, "handoff rejected, source does not hold the GPU");
                return Err(Error::NotOwner {
                    caller: source.to_string(),
                    held_by: Some(current.owner),
                });
            }
        }

        let record = HandoffRecord::new(kind, now_ms());
        self.store.lock().save_handoff(&record)?;
        *active = Some(ActiveHandoff {
            record: record.clone(),
            cancel: CancellationToken::new(),
        });
        drop(active);

        tracing::info!(handoff_id = %record.handoff_id, %kind, "handoff initiated");
        self.publish_phase(&record);
        Ok(record)
    }

    /// Execute a record obtained from [`HandoffCoordinator::begin`].
    pub async fn drive(&self, record: HandoffRecord) -> Result<HandoffRecord> {
        let cancel = {
            let active = self.active.lock();
            match active.as_ref() {
                Some(a) if a.record.handoff_id == record.handoff_id => a.cancel.clone(),
                _ => return Err(Error::HandoffNotFound(record.handoff_id)),
            }
        };

        let mut guard = SlotGuard {
            coordinator: self,
            handoff_id: record.handoff_id,
            finished: false,
        };
        let mut record = record;

        let outcome = self.execute(&mut record, &cancel).await;
        let result = self.finish(&mut record, outcome).await;
        guard.finished = true;
        result
    }

    /// Operator abort. Only possible while the lease transfer has not been committed.
    pub fn abort(&self, handoff_id: Uuid) -> Result<()> {
        let active = self.active.lock();
        if let Some(current) = active.as_ref() {
            if current.record.handoff_id == handoff_id {
                if current.record.lease_committed() {
                    return Err(Error::AbortTooLate {
                        handoff_id,
                        phase: current.record.phase,
                    });
                }
                tracing::warn!(%handoff_id, phase = %current.record.phase, "handoff abort requested");
                current.cancel.cancel();
                return Ok(());
            }
        }
        drop(active);

        match self.store.lock().load_handoff(handoff_id)? {
            Some(record) => Err(Error::AbortTooLate {
                handoff_id,
                phase: record.phase,
            }),
            None => Err(Error::HandoffNotFound(handoff_id)),
        }
    }

    /// Id of the non-terminal handoff, if any
    pub fn active(&self) -> Option<Uuid> {
        self.active.lock().as_ref().map(|a| a.record.handoff_id)
    }

    pub fn get(&self, handoff_id: Uuid) -> Result<HandoffRecord> {
        if let Some(a) = self.active.lock().as_ref() {
            if a.record.handoff_id == handoff_id {
                return Ok(a.record.clone());
            }
        }
        self.store
            .lock()
            .load_handoff(handoff_id)?
            .ok_or(Error::HandoffNotFound(handoff_id))
    }

    /// Every handoff ever requested, oldest first
    pub fn history(&self) -> Result<Vec<HandoffRecord>> {
        Ok(self.store.lock().load_handoffs()?)
    }

    async fn execute(
        &self,
        record: &mut HandoffRecord,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), Interrupt> {
        let kind = record.kind;
        let source = kind.source();
        let target = kind.target();
        let timeouts = self.config.timeouts(kind).clone();

        self.enter(record, Phase::SourceReleasing)?;
        let source_workload = self.workload(&source)?;
        self.bounded(Some(cancel), timeouts.source_release, "source release", async {
            source_workload.quiesce().await?;
            self.lifecycle.stop(&source).await?;
            Ok::<(), Error>(())
        })
        .await?;

        self.enter(record, Phase::CleanupWait)?;
        self.bounded(
            Some(cancel),
            timeouts.cleanup,
            "GPU memory cleanup",
            self.wait_for_idle_accelerator(),
        )
        .await?;

        self.commit_transfer(record, cancel, &source, &target)?;

        self.enter(record, Phase::TargetStarting)?;
        let target_workload = self.workload(&target)?;
        self.bounded(None, timeouts.target_start, "target start", async {
            self.lifecycle.start(&target).await?;
            target_workload.resume().await?;
            self.wait_until_ready(target_workload.as_ref()).await
        })
        .await?;

        Ok(())
    }

    /// LEASE_TRANSFERRED. Holds the slot lock so an abort either lands before
    /// the commit or is refused after it.
    fn commit_transfer(
        &self,
        record: &mut HandoffRecord,
        cancel: &CancellationToken,
        source: &ServiceId,
        target: &ServiceId,
    ) -> std::result::Result<(), Interrupt> {
        let mut active = self.active.lock();
        if cancel.is_cancelled() {
            return Err(Interrupt::Aborted);
        }

        let next = advanced(record, Phase::LeaseTransferred);
        self.registry
            .transfer(source, target, record.kind.target_reason(), &next)?;

        *record = next;
        if let Some(a) = active.as_mut() {
            a.record = record.clone();
        }
        drop(active);

        tracing::info!(handoff_id = %record.handoff_id, phase = %record.phase, "handoff phase");
        self.publish_phase(record);
        Ok(())
    }

    /// Persist the next phase before doing any of its work.
    fn enter(&self, record: &mut HandoffRecord, phase: Phase) -> Result<()> {
        let next = advanced(record, phase);
        self.store.lock().save_handoff(&next)?;
        *record = next;
        self.track(record);

        tracing::info!(handoff_id = %record.handoff_id, %phase, "handoff phase");
        self.publish_phase(record);
        Ok(())
    }

    async fn finish(
        &self,
        record: &mut HandoffRecord,
        outcome: std::result::Result<(), Interrupt>,
    ) -> Result<HandoffRecord> {
        let (phase, cause) = match outcome {
            Ok(()) => {
                *record = advanced(record, Phase::Complete);
                let persisted = self.persist_terminal(record);
                tracing::info!(handoff_id = %record.handoff_id, kind = %record.kind, "handoff complete");
                self.publish_phase(record);
                self.release_slot(record.handoff_id);
                persisted?;
                return Ok(record.clone());
            }
            Err(Interrupt::Aborted) => (Phase::Aborted, Error::Aborted),
            Err(Interrupt::Failed(err)) => (Phase::Failed, err),
        };

        let failed_in = record.phase;
        let lease_committed = record.lease_committed();
        let mut message = cause.to_string();

        if !lease_committed && failed_in >= Phase::SourceReleasing {
            if let Err(e) = self.restore_source(record.kind).await {
                tracing::error!(handoff_id = %record.handoff_id, error = %e, "could not restart handoff source");
                message = format!("{message}; source restart failed: {e}");
            }
        }

        record.terminate(phase, message.clone(), now_ms());
        if let Err(e) = self.persist_terminal(record) {
            message = format!("{message}; terminal record not persisted: {e}");
        }
        self.publish_phase(record);

        if lease_committed {
            tracing::error!(
                handoff_id = %record.handoff_id,
                phase = %failed_in,
                owner = %record.kind.target(),
                error = %message,
                "handoff failed after the lease transfer committed; target keeps the GPU"
            );
            self.events.publish(
                EventKind::FallbackNotice,
                json!({
                    "handoff_id": record.handoff_id,
                    "kind": record.kind,
                    "failed_in": failed_in,
                    "owner": record.kind.target(),
                    "message": "handoff failed after lease transfer; operator action required",
                }),
            );
        } else {
            tracing::warn!(
                handoff_id = %record.handoff_id,
                phase = %failed_in,
                outcome = %phase,
                error = %message,
                "handoff stopped before the lease transfer; lease unchanged"
            );
        }

        self.release_slot(record.handoff_id);
        Err(Error::HandoffFailed {
            handoff_id: record.handoff_id,
            phase: failed_in,
            lease_committed,
            reason: message,
            cause: Box::new(cause),
        })
    }

    /// Bring the quiesced source back after a failure before the transfer.
    async fn restore_source(&self, kind: HandoffKind) -> Result<()> {
        let source = kind.source();
        let workload = self.workload(&source)?;
        let limit = self.config.rollback_timeout;
        let restore = async {
            self.lifecycle.start(&source).await?;
            workload.resume().await?;
            Ok::<(), Error>(())
        };
        match tokio::time::timeout(limit, restore).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout("source restart", limit)),
        }
    }

    async fn bounded<F>(
        &self,
        cancel: Option<&CancellationToken>,
        limit: Duration,
        operation: &str,
        work: F,
    ) -> std::result::Result<(), Interrupt>
    where
        F: Future<Output = Result<()>>,
    {
        let timed = tokio::time::timeout(limit, work);
        let outcome = match cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => return Err(Interrupt::Aborted),
                outcome = timed => outcome,
            },
            None => timed.await,
        };
        match outcome {
            Ok(result) => result.map_err(Interrupt::Failed),
            Err(_) => Err(Interrupt::Failed(Error::timeout(operation, limit))),
        }
    }

    async fn wait_for_idle_accelerator(&self) -> Result<()> {
        let threshold = self.config.idle_memory_threshold_mb;
        let mut ticker = interval(poll_period(self.config.cleanup_poll_interval));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match self.accelerator.resident_memory_mb().await {
                Ok(used) if used < threshold => {
                    tracing::debug!(used_mb = used, threshold_mb = threshold, "accelerator idle");
                    return Ok(());
                }
                Ok(used) => {
                    tracing::debug!(used_mb = used, threshold_mb = threshold, "waiting for GPU memory to drain");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "GPU memory probe failed, retrying");
                }
            }
        }
    }

    async fn wait_until_ready(&self, workload: &dyn Workload) -> Result<()> {
        let mut ticker = interval(poll_period(self.config.readiness_poll_interval));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match workload.is_ready().await {
                Ok(true) => return Ok(()),
                Ok(false) => tracing::debug!("target not ready yet"),
                Err(e) => tracing::debug!(error = %e, "readiness probe failed, retrying"),
            }
        }
    }

    fn workload(&self, service: &ServiceId) -> Result<Arc<dyn Workload>> {
        self.workloads.get(service).cloned().ok_or_else(|| {
            Error::Collaborator(crate::error::CollaboratorError::new(
                "workload",
                format!("no workload registered for '{service}'"),
            ))
        })
    }

    fn track(&self, record: &HandoffRecord) {
        if let Some(a) = self.active.lock().as_mut() {
            if a.record.handoff_id == record.handoff_id {
                a.record = record.clone();
            }
        }
    }

    fn persist_terminal(&self, record: &HandoffRecord) -> Result<()> {
        self.store.lock().save_handoff(record).map_err(|e| {
            tracing::error!(
                handoff_id = %record.handoff_id,
                phase = %record.phase,
                error = %e,
                "failed to persist terminal handoff record"
            );
            Error::Store(e)
        })
    }

    fn release_slot(&self, handoff_id: Uuid) {
        let mut active = self.active.lock();
        if active
            .as_ref()
            .is_some_and(|a| a.record.handoff_id == handoff_id)
        {
            *active = None;
        }
    }

    fn publish_phase(&self, record: &HandoffRecord) {
        self.events.publish(
            EventKind::HandoffPhase,
            json!({
                "handoff_id": record.handoff_id,
                "kind": record.kind,
                "phase": record.phase,
                "error": record.error,
                "lease_committed": record.lease_committed(),
            }),
        );
    }
}

/// Copy of `record` moved on to `phase`. Success-path phases must follow
/// [`Phase::next`]; terminal failures go through `HandoffRecord::terminate`.
fn advanced(record: &HandoffRecord, phase: Phase) -> HandoffRecord {
    debug_assert_eq!(
        record.phase.next(),
        Some(phase),
        "handoff phase {} cannot follow {}",
        phase,
        record.phase
    );
    let mut next = record.clone();
    next.advance(phase, now_ms());
    next
}

/// Frees the handoff slot if `drive` is dropped mid-flight, recording the
/// handoff as failed so the store never keeps an orphaned non-terminal record.
struct SlotGuard<'a> {
    coordinator: &'a HandoffCoordinator,
    handoff_id: Uuid,
    finished: bool,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut active = self.coordinator.active.lock();
        let Some(current) = active.take_if(|a| a.record.handoff_id == self.handoff_id) else {
            return;
        };
        drop(active);

        let mut record = current.record;
        record.terminate(Phase::Failed, "handoff execution cancelled", now_ms());
        tracing::error!(
            handoff_id = %record.handoff_id,
            lease_committed = record.lease_committed(),
            "handoff task dropped before reaching a terminal phase"
        );
        let _ = self.coordinator.persist_terminal(&record);
        self.coordinator.publish_phase(&record);
    }
}
