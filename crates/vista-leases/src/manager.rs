//! Server-side reference-counted resource checkout

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vista_values::UniqueId;

use crate::error::LeaseError;

/// A resource the manager can lease out
pub trait EngineResource: Send + Sync + 'static {
    /// The resource's identity
    fn unique_id(&self) -> &UniqueId;

    /// Called exactly once, when the last count on the resource is dropped
    fn release(&self);
}

/// Manager-local identifier of one issued reference
///
/// Monotonically assigned, never reused, and meaningless outside the issuing
/// manager's lifetime. A reference id is not a resource identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReferenceId(pub u64);

impl fmt::Display for ReferenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref-{}", self.0)
    }
}

struct ResourceEntry<R> {
    resource: Arc<R>,
    count: u64,
}

struct TrackedReference {
    resource_id: UniqueId,
    last_heartbeat: Instant,
}

/// Reference-counted checkout of ephemeral resources with heartbeat expiry
///
/// The manager is the sole mutator of lease state. Holders interact only
/// through `create_reference` / `heartbeat` / `release_reference`; releases
/// are linearized per reference id, so an explicit release racing an expiry
/// sweep resolves to whichever arrives first, the other a no-op.
pub struct EngineResourceManager<R: EngineResource> {
    resources: DashMap<UniqueId, ResourceEntry<R>>,
    references: DashMap<ReferenceId, TrackedReference>,
    next_reference_id: AtomicU64,
}

impl<R: EngineResource> Default for EngineResourceManager<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: EngineResource> EngineResourceManager<R> {
    /// An empty manager
    pub fn new() -> Self {
        Self {
            resources: DashMap::new(),
            references: DashMap::new(),
            next_reference_id: AtomicU64::new(1),
        }
    }

    /// Take a resource under management with an owner count of 1
    ///
    /// The owner count belongs to whoever created the resource (typically a
    /// view process retaining its recent cycles) and is dropped through
    /// [`EngineResourceManager::release_ownership`].
    pub fn manage(&self, resource: Arc<R>) {
        let id = resource.unique_id().clone();
        let previous = self
            .resources
            .insert(id.clone(), ResourceEntry { resource, count: 1 });
        if previous.is_some() {
            warn!(resource = %id, "replaced an already-managed resource");
        }
    }

    /// Drop the owner count taken by [`EngineResourceManager::manage`]
    pub fn release_ownership(&self, resource_id: &UniqueId) {
        self.decrement(resource_id);
    }

    /// Check out a counted reference to a managed resource
    pub fn create_reference(&self, resource_id: &UniqueId) -> Result<ReferenceId, LeaseError> {
        let mut entry = self
            .resources
            .get_mut(resource_id)
            .ok_or_else(|| LeaseError::UnknownResource(resource_id.clone()))?;
        entry.count += 1;
        drop(entry);

        let id = ReferenceId(self.next_reference_id.fetch_add(1, Ordering::Relaxed));
        self.references.insert(
            id,
            TrackedReference {
                resource_id: resource_id.clone(),
                last_heartbeat: Instant::now(),
            },
        );
        debug!(reference = %id, resource = %resource_id, "created resource reference");
        Ok(id)
    }

    /// The resource behind a live reference
    pub fn get(&self, reference_id: ReferenceId) -> Result<Arc<R>, LeaseError> {
        let tracked = self
            .references
            .get(&reference_id)
            .ok_or(LeaseError::NotFound(reference_id))?;
        let entry = self
            .resources
            .get(&tracked.resource_id)
            .ok_or(LeaseError::NotFound(reference_id))?;
        Ok(entry.resource.clone())
    }

    /// Refresh a reference's last-heartbeat timestamp
    pub fn heartbeat(&self, reference_id: ReferenceId) -> Result<(), LeaseError> {
        let mut tracked = self
            .references
            .get_mut(&reference_id)
            .ok_or(LeaseError::NotFound(reference_id))?;
        tracked.last_heartbeat = Instant::now();
        Ok(())
    }

    /// Release a reference
    ///
    /// The first call removes the reference and drops its count; any later
    /// call fails `NotFound`, which callers log as a warning rather than
    /// treating as fatal.
    pub fn release_reference(&self, reference_id: ReferenceId) -> Result<(), LeaseError> {
        let (_, tracked) = self
            .references
            .remove(&reference_id)
            .ok_or(LeaseError::NotFound(reference_id))?;
        debug!(reference = %reference_id, resource = %tracked.resource_id, "released resource reference");
        self.decrement(&tracked.resource_id);
        Ok(())
    }

    /// Release every reference whose last heartbeat predates the cutoff
    ///
    /// Runs the normal release path, so downstream observers cannot tell an
    /// expiry from an explicit release. Returns the number released.
    pub fn release_expired(&self, cutoff: Instant) -> usize {
        let expired: Vec<ReferenceId> = self
            .references
            .iter()
            .filter(|r| r.last_heartbeat < cutoff)
            .map(|r| *r.key())
            .collect();
        let mut released = 0;
        for id in expired {
            // A concurrent explicit release wins the race; NotFound here is
            // the no-op side of that race.
            if self.release_reference(id).is_ok() {
                warn!(reference = %id, "released expired resource reference; holder stopped heartbeating");
                released += 1;
            }
        }
        released
    }

    /// Number of live references
    pub fn active_references(&self) -> usize {
        self.references.len()
    }

    /// Whether a resource is still managed (its count has not hit zero)
    pub fn is_managed(&self, resource_id: &UniqueId) -> bool {
        self.resources.contains_key(resource_id)
    }

    fn decrement(&self, resource_id: &UniqueId) {
        let mut reached_zero = false;
        if let Some(mut entry) = self.resources.get_mut(resource_id) {
            entry.count -= 1;
            reached_zero = entry.count == 0;
        }
        if !reached_zero {
            return;
        }
        // A create_reference may have re-incremented since the guard
        // dropped; only a removal observed at zero releases the resource.
        if let Some((_, entry)) = self.resources.remove_if(resource_id, |_, e| e.count == 0) {
            debug!(resource = %resource_id, "last reference dropped; releasing resource");
            entry.resource.release();
        }
    }
}

/// Run the periodic expiry sweep until cancelled
///
/// Schedule equals the lease timeout; each tick releases references whose
/// last heartbeat is older than `now - lease_timeout`. A holder heartbeating
/// at `lease_timeout / 2` is therefore never swept.
pub fn spawn_expiry_sweep<R: EngineResource>(
    manager: Arc<EngineResourceManager<R>>,
    lease_timeout: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut sweep = interval(lease_timeout);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; skip it so the first real
        // sweep happens one full timeout after startup.
        sweep.tick().await;
        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    if let Some(cutoff) = Instant::now().checked_sub(lease_timeout) {
                        manager.release_expired(cutoff);
                    }
                }
                _ = cancel.cancelled() => {
                    info!("resource lease expiry sweep stopped");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::AtomicBool;

    #[derive(Debug)]
    struct TestResource {
        id: UniqueId,
        released: AtomicBool,
    }

    impl TestResource {
        fn new(value: &str) -> Arc<Self> {
            Arc::new(Self {
                id: UniqueId::new("Res", value),
                released: AtomicBool::new(false),
            })
        }
    }

    impl EngineResource for TestResource {
        fn unique_id(&self) -> &UniqueId {
            &self.id
        }

        fn release(&self) {
            let again = self.released.swap(true, Ordering::SeqCst);
            assert!(!again, "resource released twice");
        }
    }

    #[tokio::test]
    async fn get_succeeds_until_release() {
        let manager = EngineResourceManager::new();
        let resource = TestResource::new("a");
        manager.manage(resource.clone());

        let reference = manager.create_reference(resource.unique_id()).unwrap();
        assert!(manager.get(reference).is_ok());

        manager.release_reference(reference).unwrap();
        assert_matches!(manager.get(reference), Err(LeaseError::NotFound(_)));
    }

    #[tokio::test]
    async fn second_release_fails_not_found() {
        let manager = EngineResourceManager::new();
        let resource = TestResource::new("a");
        manager.manage(resource.clone());

        let reference = manager.create_reference(resource.unique_id()).unwrap();
        manager.release_reference(reference).unwrap();
        assert_matches!(
            manager.release_reference(reference),
            Err(LeaseError::NotFound(_))
        );
        // Externally observable state matches a single release.
        assert_matches!(manager.get(reference), Err(LeaseError::NotFound(_)));
    }

    #[tokio::test]
    async fn unknown_resource_is_rejected() {
        let manager: EngineResourceManager<TestResource> = EngineResourceManager::new();
        assert_matches!(
            manager.create_reference(&UniqueId::new("Res", "missing")),
            Err(LeaseError::UnknownResource(_))
        );
    }

    #[tokio::test]
    async fn reference_ids_are_never_reused() {
        let manager = EngineResourceManager::new();
        let resource = TestResource::new("a");
        manager.manage(resource.clone());

        let first = manager.create_reference(resource.unique_id()).unwrap();
        manager.release_reference(first).unwrap();
        let second = manager.create_reference(resource.unique_id()).unwrap();
        assert_ne!(first, second);
        assert!(second > first);
    }

    #[tokio::test]
    async fn resource_released_when_owner_and_references_gone() {
        let manager = EngineResourceManager::new();
        let resource = TestResource::new("a");
        manager.manage(resource.clone());

        let reference = manager.create_reference(resource.unique_id()).unwrap();
        manager.release_ownership(resource.unique_id());
        assert!(!resource.released.load(Ordering::SeqCst));

        manager.release_reference(reference).unwrap();
        assert!(resource.released.load(Ordering::SeqCst));
        assert!(!manager.is_managed(resource.unique_id()));
    }

    #[tokio::test]
    async fn released_resource_is_no_longer_leasable() {
        let manager = EngineResourceManager::new();
        let resource = TestResource::new("a");
        manager.manage(resource.clone());
        manager.release_ownership(resource.unique_id());

        assert_matches!(
            manager.create_reference(resource.unique_id()),
            Err(LeaseError::UnknownResource(_))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn references_issued_during_release_stay_live() {
        let manager = Arc::new(EngineResourceManager::new());
        let resource = TestResource::new("a");
        manager.manage(resource.clone());

        // Checkout loops racing the owner release: a reference that was
        // successfully issued must resolve until it is released, and the
        // resource must be released exactly once when the last count drops.
        let mut holders = Vec::new();
        for _ in 0..4 {
            let manager = manager.clone();
            let id = resource.unique_id().clone();
            holders.push(tokio::spawn(async move {
                for _ in 0..250 {
                    let Ok(reference) = manager.create_reference(&id) else {
                        return;
                    };
                    manager.get(reference).expect("issued reference must resolve");
                    manager.release_reference(reference).unwrap();
                }
            }));
        }
        manager.release_ownership(resource.unique_id());
        for holder in holders {
            holder.await.unwrap();
        }

        assert!(!manager.is_managed(resource.unique_id()));
        assert!(resource.released.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_releases_only_stale_references() {
        let manager = EngineResourceManager::new();
        let resource = TestResource::new("a");
        manager.manage(resource.clone());

        let stale = manager.create_reference(resource.unique_id()).unwrap();
        let fresh = manager.create_reference(resource.unique_id()).unwrap();

        tokio::time::advance(Duration::from_millis(3000)).await;
        manager.heartbeat(fresh).unwrap();
        tokio::time::advance(Duration::from_millis(2500)).await;

        // Cutoff 5000ms ago: `stale` (5500ms old) expires, `fresh` (2500ms
        // since heartbeat) survives.
        let released = manager.release_expired(Instant::now() - Duration::from_millis(5000));
        assert_eq!(released, 1);
        assert_matches!(manager.get(stale), Err(LeaseError::NotFound(_)));
        assert!(manager.get(fresh).is_ok());
    }
}
