#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::error::Error;
    use crate::events::{EventBroadcaster, EventKind};
    use crate::infrastructure::{shared, SharedStateStore, StateStore};
    use crate::infrastructure_in_memory::InMemoryStateStore;
    use crate::registry::{LeaseRegistry, RegistryConfig};
    use crate::types::ServiceId;

    const WAIT: Duration = Duration::from_secs(5);

    fn registry() -> (Arc<LeaseRegistry>, SharedStateStore, EventBroadcaster) {
        let store = shared(InMemoryStateStore::new());
        let events = EventBroadcaster::default();
        let registry =
            LeaseRegistry::new(store.clone(), events.clone(), RegistryConfig::default()).unwrap();
        (Arc::new(registry), store, events)
    }

    fn spawn_acquire(
        registry: &Arc<LeaseRegistry>,
        service: &str,
        max_wait: Duration,
    ) -> tokio::task::JoinHandle<crate::Result<crate::types::LeaseGrant>> {
        let registry = Arc::clone(registry);
        let service = ServiceId::new(service);
        tokio::spawn(async move { registry.acquire(&service, "queued", max_wait).await })
    }

    /// Let spawned tasks run up to their next suspension point.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_free_gpu_grants_and_persists() {
        let (registry, store, _) = registry();

        let grant = registry
            .acquire(&ServiceId::prime(), "inference", WAIT)
            .await
            .unwrap();

        assert!(!grant.existing);
        assert_eq!(grant.waited_ms, 0);
        assert_eq!(grant.lease.owner, ServiceId::prime());
        assert_eq!(grant.lease.reason, "inference");
        assert_eq!(store.lock().load_lease().unwrap(), Some(grant.lease.clone()));
        assert_eq!(registry.current(), Some(grant.lease));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_acquire_returns_existing_grant() {
        let (registry, _, _) = registry();
        let first = registry
            .acquire(&ServiceId::prime(), "inference", WAIT)
            .await
            .unwrap();
        let again = registry
            .acquire(&ServiceId::prime(), "something else", WAIT)
            .await
            .unwrap();

        assert!(again.existing);
        assert_eq!(again.lease.lease_id, first.lease.lease_id);
        assert_eq!(again.lease.reason, "inference");
        assert_eq!(registry.status().queue_depth, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_are_served_in_fifo_order() {
        let (registry, _, _) = registry();
        let held = registry
            .acquire(&ServiceId::prime(), "inference", WAIT)
            .await
            .unwrap();

        let first = spawn_acquire(&registry, "tenant-a", WAIT);
        settle().await;
        let second = spawn_acquire(&registry, "tenant-b", WAIT);
        settle().await;

        let status = registry.status();
        assert_eq!(status.queue_depth, 2);
        assert_eq!(status.waiters[0].requester, ServiceId::new("tenant-a"));
        assert_eq!(status.waiters[1].requester, ServiceId::new("tenant-b"));
        assert!(status.waiters[0].ticket < status.waiters[1].ticket);

        let next = registry.release(held.lease.lease_id).unwrap().unwrap();
        assert_eq!(next.owner, ServiceId::new("tenant-a"));

        let grant_a = first.await.unwrap().unwrap();
        assert_eq!(grant_a.lease.lease_id, next.lease_id);
        assert!(!grant_a.existing);
        assert!(!second.is_finished());

        registry.release(grant_a.lease.lease_id).unwrap();
        let grant_b = second.await.unwrap().unwrap();
        assert_eq!(grant_b.lease.owner, ServiceId::new("tenant-b"));
        assert_eq!(grant_b.lease.reason, "queued");
        assert_eq!(registry.status().queue_depth, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_is_bounded_and_leaves_no_queue_entry() {
        let (registry, _, _) = registry();
        registry
            .acquire(&ServiceId::prime(), "inference", WAIT)
            .await
            .unwrap();

        let err = registry
            .acquire(&ServiceId::study(), "training", Duration::from_millis(250))
            .await
            .unwrap_err();

        match err {
            Error::Timeout { after_ms, .. } => assert_eq!(after_ms, 250),
            other => panic!("expected Timeout, got {other:?}"),
        }
        assert_eq!(registry.status().queue_depth, 0);
        assert_eq!(registry.current().unwrap().owner, ServiceId::prime());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_acquire_gives_up_its_slot() {
        let (registry, _, _) = registry();
        let held = registry
            .acquire(&ServiceId::prime(), "inference", WAIT)
            .await
            .unwrap();

        let waiter = spawn_acquire(&registry, "tenant-a", WAIT);
        settle().await;
        assert_eq!(registry.status().queue_depth, 1);

        waiter.abort();
        settle().await;
        assert_eq!(registry.status().queue_depth, 0);

        // Nobody left to hand over to
        assert_eq!(registry.release(held.lease.lease_id).unwrap(), None);
        assert_eq!(registry.current(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_with_foreign_lease_id_is_rejected() {
        let (registry, _, _) = registry();
        let held = registry
            .acquire(&ServiceId::prime(), "inference", WAIT)
            .await
            .unwrap();

        let err = registry.release(uuid::Uuid::new_v4()).unwrap_err();
        match err {
            Error::NotOwner { held_by, .. } => assert_eq!(held_by, Some(ServiceId::prime())),
            other => panic!("expected NotOwner, got {other:?}"),
        }
        assert_eq!(registry.current(), Some(held.lease));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_on_free_gpu_is_rejected() {
        let (registry, _, _) = registry();
        let err = registry.release(uuid::Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, Error::NotOwner { held_by: None, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_release_hands_gpu_to_queue_head() {
        let (registry, store, _) = registry();
        let held = registry
            .acquire(&ServiceId::prime(), "inference", WAIT)
            .await
            .unwrap();
        let waiter = spawn_acquire(&registry, "study", WAIT);
        settle().await;

        let previous = registry.force_release().unwrap();
        assert_eq!(previous, Some(held.lease));

        let grant = waiter.await.unwrap().unwrap();
        assert_eq!(grant.lease.owner, ServiceId::study());
        assert_eq!(store.lock().load_lease().unwrap(), Some(grant.lease));
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_release_on_free_gpu_is_a_noop() {
        let (registry, _, _) = registry();
        assert_eq!(registry.force_release().unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_waiters_from_new_owner_share_the_grant() {
        let (registry, _, _) = registry();
        let held = registry
            .acquire(&ServiceId::prime(), "inference", WAIT)
            .await
            .unwrap();

        let first = spawn_acquire(&registry, "study", WAIT);
        settle().await;
        let duplicate = spawn_acquire(&registry, "study", WAIT);
        settle().await;
        assert_eq!(registry.status().queue_depth, 2);

        registry.release(held.lease.lease_id).unwrap();
        let grant = first.await.unwrap().unwrap();
        let shared = duplicate.await.unwrap().unwrap();

        assert!(!grant.existing);
        assert!(shared.existing);
        assert_eq!(shared.lease.lease_id, grant.lease.lease_id);
        assert_eq!(registry.status().queue_depth, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_changes_are_published() {
        let (registry, _, events) = registry();
        let mut sub = events.subscribe();

        let grant = registry
            .acquire(&ServiceId::prime(), "inference", WAIT)
            .await
            .unwrap();
        registry.release(grant.lease.lease_id).unwrap();

        let acquired = sub.try_recv().unwrap();
        assert_eq!(acquired.kind, EventKind::LeaseChanged);
        assert_eq!(acquired.payload["action"], "acquired");
        assert_eq!(acquired.payload["lease"]["owner"], "prime");

        let released = sub.try_recv().unwrap();
        assert_eq!(released.payload["action"], "released");
        assert!(released.payload["lease"].is_null());
        assert_eq!(released.payload["previous"]["owner"], "prime");
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_restores_persisted_lease() {
        let (registry, store, events) = registry();
        let grant = registry
            .acquire(&ServiceId::study(), "training", WAIT)
            .await
            .unwrap();
        drop(registry);

        let restored = LeaseRegistry::new(store, events, RegistryConfig::default()).unwrap();
        assert_eq!(restored.current(), Some(grant.lease));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_release_never_overlaps() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        const TASKS: usize = 16;
        const ROUNDS: usize = 25;

        let (registry, store, _) = registry();
        let holders = Arc::new(AtomicUsize::new(0));
        let max_holders = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..TASKS {
            let registry = Arc::clone(&registry);
            let holders = Arc::clone(&holders);
            let max_holders = Arc::clone(&max_holders);
            handles.push(tokio::spawn(async move {
                let service = ServiceId::new(format!("svc-{i}"));
                for _ in 0..ROUNDS {
                    let grant = registry
                        .acquire(&service, "stress", Duration::from_secs(30))
                        .await
                        .unwrap();
                    assert!(!grant.existing);

                    let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                    max_holders.fetch_max(now, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    holders.fetch_sub(1, Ordering::SeqCst);

                    registry.release(grant.lease.lease_id).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_holders.load(Ordering::SeqCst), 1);
        let status = registry.status();
        assert_eq!(status.lease, None);
        assert_eq!(status.queue_depth, 0);
        assert_eq!(store.lock().load_lease().unwrap(), None);
    }
}
