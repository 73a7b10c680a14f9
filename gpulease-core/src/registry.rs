//! Exclusive GPU lease with a FIFO wait queue.
//!
//! Every lease mutation (acquire, release, transfer, force-release) runs inside
//! one `parking_lot::Mutex` critical section and is persisted before the
//! in-memory state changes. The lock is never held across an `.await`.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::events::{EventBroadcaster, EventKind};
use crate::infrastructure::SharedStateStore;
use crate::types::*;

/// Bound applied when callers don't pass their own `max_wait`.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub default_max_wait: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_max_wait: DEFAULT_MAX_WAIT,
        }
    }
}

/// What a queued caller receives when the lease reaches it
#[derive(Debug)]
struct Delivery {
    lease: GpuLease,
    /// The caller's service already owned this lease (duplicate acquire)
    shared: bool,
}

struct Waiter {
    entry: WaitQueueEntry,
    reason: String,
    tx: oneshot::Sender<Delivery>,
}

#[derive(Default)]
struct RegistryState {
    lease: Option<GpuLease>,
    queue: VecDeque<Waiter>,
    next_ticket: u64,
}

pub struct LeaseRegistry {
    state: Mutex<RegistryState>,
    store: SharedStateStore,
    events: EventBroadcaster,
    config: RegistryConfig,
}

impl LeaseRegistry {
    /// Build a registry from whatever lease the store holds. Crash recovery
    /// must already have run against `store`.
    pub fn new(
        store: SharedStateStore,
        events: EventBroadcaster,
        config: RegistryConfig,
    ) -> Result<Self> {
        let lease = store.lock().load_lease()?;
        if let Some(lease) = &lease {
            tracing::info!(owner = %lease.owner, lease_id = %lease.lease_id, "restored GPU lease");
        }
        Ok(Self {
            state: Mutex::new(RegistryState {
                lease,
                ..Default::default()
            }),
            store,
            events,
            config,
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Acquire the GPU for `service`, waiting in FIFO order for at most `max_wait`.
    ///
    /// A service that already holds the lease gets the existing grant back.
    /// Dropping the returned future gives up the queue slot.
    pub async fn acquire(
        &self,
        service: &ServiceId,
        reason: &str,
        max_wait: Duration,
    ) -> Result<LeaseGrant> {
        let started = Instant::now();

        let (ticket, rx) = {
            let mut state = self.state.lock();
            match &state.lease {
                Some(lease) if &lease.owner == service => {
                    tracing::debug!(%service, lease_id = %lease.lease_id, "duplicate acquire, returning existing grant");
                    return Ok(LeaseGrant {
                        lease: lease.clone(),
                        waited_ms: 0,
                        existing: true,
                    });
                }
                None => {
                    let lease = GpuLease::new(service.clone(), reason, now_ms());
                    self.persist(Some(&lease))?;
                    state.lease = Some(lease.clone());
                    drop(state);

                    tracing::info!(%service, lease_id = %lease.lease_id, reason, "GPU lease granted");
                    self.publish("acquired", None, Some(&lease));
                    return Ok(LeaseGrant {
                        lease,
                        waited_ms: 0,
                        existing: false,
                    });
                }
                Some(_) => {}
            }

            let ticket = state.next_ticket;
            state.next_ticket += 1;
            let (tx, rx) = oneshot::channel();
            state.queue.push_back(Waiter {
                entry: WaitQueueEntry {
                    requester: service.clone(),
                    requested_at: now_ms(),
                    ticket,
                },
                reason: reason.to_string(),
                tx,
            });
            tracing::info!(
                %service,
                ticket,
                position = state.queue.len(),
                "GPU busy, queued for lease"
            );
            (ticket, rx)
        };

        let mut slot = QueueSlot {
            registry: self,
            ticket,
            rx,
            settled: false,
        };

        let outcome = tokio::time::timeout(max_wait, &mut slot.rx).await;
        let waited_ms = started.elapsed().as_millis() as u64;
        let delivery = match outcome {
            Ok(Ok(delivery)) => delivery,
            Ok(Err(_)) => {
                slot.settled = true;
                return Err(Error::Cancelled);
            }
            Err(_) => {
                if self.remove_waiter(ticket) {
                    slot.settled = true;
                    tracing::info!(%service, ticket, waited_ms, "lease wait timed out");
                    return Err(Error::timeout("lease acquire", max_wait));
                }
                // Granted between the deadline and taking the lock
                match slot.rx.try_recv() {
                    Ok(delivery) => delivery,
                    Err(_) => {
                        slot.settled = true;
                        return Err(Error::timeout("lease acquire", max_wait));
                    }
                }
            }
        };

        slot.settled = true;
        Ok(LeaseGrant {
            lease: delivery.lease,
            waited_ms,
            existing: delivery.shared,
        })
    }

    /// Release the lease identified by `lease_id` and hand the GPU to the head
    /// of the queue. Returns the lease granted to that waiter, if any.
    pub fn release(&self, lease_id: Uuid) -> Result<Option<GpuLease>> {
        let mut state = self.state.lock();
        let previous = match &state.lease {
            Some(lease) if lease.lease_id == lease_id => lease.clone(),
            other => {
                return Err(Error::NotOwner {
                    caller: lease_id.to_string(),
                    held_by: other.as_ref().map(|l| l.owner.clone()),
                });
            }
        };

        let next = self.hand_over(&mut state)?;
        drop(state);

        tracing::info!(owner = %previous.owner, %lease_id, "GPU lease released");
        self.publish("released", Some(&previous), next.as_ref());
        Ok(next)
    }

    /// Operator override: drop the current lease whoever holds it. The queue
    /// head is granted exactly as on a normal release.
    pub fn force_release(&self) -> Result<Option<GpuLease>> {
        let mut state = self.state.lock();
        let Some(previous) = state.lease.clone() else {
            return Ok(None);
        };

        let next = self.hand_over(&mut state)?;
        drop(state);

        tracing::warn!(owner = %previous.owner, lease_id = %previous.lease_id, "GPU lease force-released");
        self.publish("force_released", Some(&previous), next.as_ref());
        Ok(Some(previous))
    }

    /// Move the lease from `source` to `target` as one guarded step and persist
    /// it together with `record`. A free GPU counts as held by `source`.
    pub(crate) fn transfer(
        &self,
        source: &ServiceId,
        target: &ServiceId,
        reason: &str,
        record: &HandoffRecord,
    ) -> Result<GpuLease> {
        let mut state = self.state.lock();
        if let Some(current) = &state.lease {
            if &current.owner != source {
                return Err(Error::NotOwner {
                    caller: source.to_string(),
                    held_by: Some(current.owner.clone()),
                });
            }
        }

        let previous = state.lease.clone();
        let lease = GpuLease::new(target.clone(), reason, now_ms());
        self.store.lock().commit_transfer(&lease, record)?;
        state.lease = Some(lease.clone());
        Self::satisfy_owner_waiters(&mut state, &lease);
        drop(state);

        tracing::info!(
            from = %source,
            to = %target,
            lease_id = %lease.lease_id,
            handoff_id = %record.handoff_id,
            "GPU lease transferred"
        );
        self.publish("transferred", previous.as_ref(), Some(&lease));
        Ok(lease)
    }

    pub fn status(&self) -> LeaseStatus {
        let state = self.state.lock();
        LeaseStatus {
            lease: state.lease.clone(),
            queue_depth: state.queue.len(),
            waiters: state.queue.iter().map(|w| w.entry.clone()).collect(),
        }
    }

    pub fn current(&self) -> Option<GpuLease> {
        self.state.lock().lease.clone()
    }

    /// Give the lease to the first live waiter, or clear it. Persists before
    /// touching memory.
    fn hand_over(&self, state: &mut RegistryState) -> Result<Option<GpuLease>> {
        loop {
            let Some(head) = state.queue.front() else {
                self.persist(None)?;
                state.lease = None;
                return Ok(None);
            };

            if head.tx.is_closed() {
                state.queue.pop_front();
                continue;
            }

            let lease = GpuLease::new(head.entry.requester.clone(), head.reason.clone(), now_ms());
            self.persist(Some(&lease))?;
            state.lease = Some(lease.clone());

            let Some(waiter) = state.queue.pop_front() else {
                return Ok(Some(lease));
            };
            let delivered = waiter
                .tx
                .send(Delivery {
                    lease: lease.clone(),
                    shared: false,
                })
                .is_ok();
            if !delivered {
                continue;
            }

            tracing::info!(
                service = %lease.owner,
                ticket = waiter.entry.ticket,
                lease_id = %lease.lease_id,
                "GPU lease granted to queued caller"
            );
            Self::satisfy_owner_waiters(state, &lease);
            return Ok(Some(lease));
        }
    }

    /// Queued duplicates from the new owner get the same lease back.
    fn satisfy_owner_waiters(state: &mut RegistryState, lease: &GpuLease) {
        let (owners, others): (VecDeque<Waiter>, VecDeque<Waiter>) = state
            .queue
            .drain(..)
            .partition(|w| w.entry.requester == lease.owner);
        state.queue = others;
        for waiter in owners {
            let _ = waiter.tx.send(Delivery {
                lease: lease.clone(),
                shared: true,
            });
        }
    }

    fn remove_waiter(&self, ticket: u64) -> bool {
        let mut state = self.state.lock();
        match state.queue.iter().position(|w| w.entry.ticket == ticket) {
            Some(pos) => {
                state.queue.remove(pos);
                true
            }
            None => false,
        }
    }

    fn persist(&self, lease: Option<&GpuLease>) -> Result<()> {
        self.store.lock().save_lease(lease).map_err(|e| {
            tracing::error!(error = %e, "failed to persist GPU lease");
            Error::from(e)
        })
    }

    fn publish(&self, action: &str, previous: Option<&GpuLease>, lease: Option<&GpuLease>) {
        self.events.publish(
            EventKind::LeaseChanged,
            json!({
                "action": action,
                "previous": previous,
                "lease": lease,
            }),
        );
    }
}

/// Owns a queued caller's receiver. If the acquire future is dropped before it
/// settles, the slot is removed from the queue, or, if the lease already
/// reached it, released again so the next waiter gets it.
struct QueueSlot<'a> {
    registry: &'a LeaseRegistry,
    ticket: u64,
    rx: oneshot::Receiver<Delivery>,
    settled: bool,
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if self.registry.remove_waiter(self.ticket) {
            tracing::debug!(ticket = self.ticket, "lease wait cancelled");
            return;
        }
        if let Ok(delivery) = self.rx.try_recv() {
            if delivery.shared {
                return;
            }
            tracing::info!(
                ticket = self.ticket,
                lease_id = %delivery.lease.lease_id,
                "lease granted to a departed caller, passing it on"
            );
            if let Err(e) = self.registry.release(delivery.lease.lease_id) {
                tracing::warn!(error = %e, "could not release lease of departed caller");
            }
        }
    }
}
