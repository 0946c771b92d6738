//! In-process lease handle

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use vista_values::UniqueId;

use crate::error::LeaseError;
use crate::manager::{EngineResource, EngineResourceManager, ReferenceId};

/// A scoped, in-process checkout of a managed resource
///
/// Heartbeats on the holder's behalf at half the lease timeout. Release is
/// explicit and idempotent; dropping an unreleased lease performs a
/// best-effort release and logs a warning, as a safety net only.
pub struct LocalResourceLease<R: EngineResource> {
    manager: Arc<EngineResourceManager<R>>,
    reference_id: ReferenceId,
    released: Arc<AtomicBool>,
    heartbeat_cancel: CancellationToken,
}

impl<R: EngineResource> LocalResourceLease<R> {
    /// Check out a reference and start heartbeating it
    pub fn acquire(
        manager: Arc<EngineResourceManager<R>>,
        resource_id: &UniqueId,
        lease_timeout: Duration,
    ) -> Result<Self, LeaseError> {
        let reference_id = manager.create_reference(resource_id)?;
        let heartbeat_cancel = CancellationToken::new();

        let beat_manager = manager.clone();
        let beat_cancel = heartbeat_cancel.clone();
        tokio::spawn(async move {
            let mut beat = interval(lease_timeout / 2);
            beat.set_missed_tick_behavior(MissedTickBehavior::Skip);
            beat.tick().await;
            loop {
                tokio::select! {
                    _ = beat.tick() => {
                        if beat_manager.heartbeat(reference_id).is_err() {
                            // Reference gone (released or swept); nothing
                            // left to keep alive.
                            break;
                        }
                    }
                    _ = beat_cancel.cancelled() => break,
                }
            }
        });

        Ok(Self {
            manager,
            reference_id,
            released: Arc::new(AtomicBool::new(false)),
            heartbeat_cancel,
        })
    }

    /// The manager-local reference id
    pub fn reference_id(&self) -> ReferenceId {
        self.reference_id
    }

    /// The resource; fails once this lease has been released
    pub fn get(&self) -> Result<Arc<R>, LeaseError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(LeaseError::AlreadyReleased(self.reference_id));
        }
        self.manager.get(self.reference_id)
    }

    /// Release the lease
    ///
    /// Idempotent: the second call logs and returns. The heartbeat stops
    /// before the manager is told, so no renewal races the release.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            warn!(reference = %self.reference_id, "lease already released");
            return;
        }
        self.heartbeat_cancel.cancel();
        if let Err(err) = self.manager.release_reference(self.reference_id) {
            // Lost the race against an expiry sweep; already released.
            warn!(reference = %self.reference_id, %err, "release found reference already gone");
        }
    }

    /// Whether this lease has been released
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl<R: EngineResource> Drop for LocalResourceLease<R> {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            warn!(
                reference = %self.reference_id,
                "resource lease dropped without explicit release"
            );
            self.heartbeat_cancel.cancel();
            let _ = self.manager.release_reference(self.reference_id);
        }
    }
}
