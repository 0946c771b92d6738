//! End-to-end lease lifetime scenarios under virtual time

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use vista_leases::{
    EngineResource, EngineResourceManager, LeaseEndpoint, LeaseError, ReferenceId, RemoteLease,
    spawn_expiry_sweep,
};
use vista_values::UniqueId;

struct Snapshot {
    id: UniqueId,
    released: AtomicBool,
}

impl EngineResource for Snapshot {
    fn unique_id(&self) -> &UniqueId {
        &self.id
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

/// Endpoint calling the manager directly, with a switch to cut heartbeats.
struct DirectEndpoint {
    manager: Arc<EngineResourceManager<Snapshot>>,
    reference_id: ReferenceId,
    heartbeats_enabled: AtomicBool,
}

#[async_trait]
impl LeaseEndpoint for DirectEndpoint {
    fn reference_id(&self) -> ReferenceId {
        self.reference_id
    }

    async fn heartbeat(&self) -> Result<(), LeaseError> {
        if !self.heartbeats_enabled.load(Ordering::SeqCst) {
            return Err(LeaseError::Transport("heartbeat channel down".into()));
        }
        self.manager.heartbeat(self.reference_id)
    }

    async fn release(&self) -> Result<(), LeaseError> {
        self.manager.release_reference(self.reference_id)
    }
}

fn leased_snapshot() -> (Arc<EngineResourceManager<Snapshot>>, Arc<DirectEndpoint>) {
    let manager = Arc::new(EngineResourceManager::new());
    let snapshot = Arc::new(Snapshot {
        id: UniqueId::new("ViewCycle", "1"),
        released: AtomicBool::new(false),
    });
    manager.manage(snapshot.clone());
    let reference_id = manager.create_reference(&snapshot.id).unwrap();
    let endpoint = Arc::new(DirectEndpoint {
        manager: manager.clone(),
        reference_id,
        heartbeats_enabled: AtomicBool::new(true),
    });
    (manager, endpoint)
}

async fn step(ms: u64) {
    tokio::time::advance(Duration::from_millis(ms)).await;
    tokio::task::yield_now().await;
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Lease timeout 5000 ms, heartbeat interval 2500 ms: a proxy heartbeating
/// on schedule is never released by the sweep running every 5000 ms.
#[tokio::test(start_paused = true)]
async fn on_schedule_heartbeats_survive_every_sweep() {
    init_tracing();
    let (manager, endpoint) = leased_snapshot();
    let cancel = CancellationToken::new();
    let sweep = spawn_expiry_sweep(
        manager.clone(),
        Duration::from_millis(5000),
        cancel.clone(),
    );

    let lease = RemoteLease::new(endpoint.clone(), Duration::from_millis(5000));

    // 20 seconds of on-schedule operation, four sweep windows.
    for _ in 0..8 {
        step(2500).await;
    }
    assert_eq!(manager.active_references(), 1);
    assert!(manager.get(lease.reference_id()).is_ok());

    lease.release().await;
    cancel.cancel();
    sweep.await.unwrap();
}

/// If heartbeating stops after t=2500, the sweep whose cutoff passes the
/// last heartbeat releases the reference.
#[tokio::test(start_paused = true)]
async fn stopped_heartbeats_expire_after_one_timeout() {
    init_tracing();
    let (manager, endpoint) = leased_snapshot();
    let cancel = CancellationToken::new();
    let sweep = spawn_expiry_sweep(
        manager.clone(),
        Duration::from_millis(5000),
        cancel.clone(),
    );

    let lease = RemoteLease::new(endpoint.clone(), Duration::from_millis(5000));

    // Heartbeat lands at t=2500, then the channel goes down.
    step(2500).await;
    endpoint.heartbeats_enabled.store(false, Ordering::SeqCst);

    // Sweep at t=5000: cutoff 0 < 2500, survives.
    step(2500).await;
    assert_eq!(manager.active_references(), 1);

    // Sweep at t=10000: cutoff 5000 > 2500, released.
    step(5000).await;
    assert_eq!(manager.active_references(), 0);

    // Downstream this is indistinguishable from an explicit release: the
    // proxy's own release becomes the no-op side of the race.
    lease.release().await;
    assert!(manager.get(lease.reference_id()).is_err());

    cancel.cancel();
    sweep.await.unwrap();
}

/// Explicit release racing the sweep: whichever arrives first wins, the
/// other is a no-op.
#[tokio::test(start_paused = true)]
async fn explicit_release_then_sweep_is_a_no_op() {
    init_tracing();
    let (manager, endpoint) = leased_snapshot();

    let lease = RemoteLease::new(endpoint, Duration::from_millis(5000));
    lease.release().await;
    assert_eq!(manager.active_references(), 0);

    step(10000).await;
    let released = manager.release_expired(tokio::time::Instant::now() - Duration::from_millis(5000));
    assert_eq!(released, 0);
}
