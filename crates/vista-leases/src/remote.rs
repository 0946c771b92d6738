//! Holder-side mirror of a server-issued lease

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::LeaseError;
use crate::manager::ReferenceId;

/// The call boundary one remote lease drives
///
/// An endpoint is bound to a single manager-issued reference id on the far
/// side; the proxy never sees the resource itself, only this handle.
#[async_trait]
pub trait LeaseEndpoint: Send + Sync + 'static {
    /// The reference id this endpoint is bound to
    fn reference_id(&self) -> ReferenceId;

    /// Renew the server-side lease
    async fn heartbeat(&self) -> Result<(), LeaseError>;

    /// Release the server-side lease
    async fn release(&self) -> Result<(), LeaseError>;
}

/// Client-side mirror of a lease: schedules its own heartbeats
///
/// Constructed around a [`LeaseEndpoint`]; immediately starts a recurring
/// heartbeat at `lease_timeout / 2`, guaranteeing at least one renewal per
/// timeout window under normal conditions. `release` always cancels the
/// heartbeat first so no renewal races a release.
pub struct RemoteLease {
    endpoint: Arc<dyn LeaseEndpoint>,
    released: Arc<AtomicBool>,
    heartbeat_cancel: CancellationToken,
}

impl RemoteLease {
    /// Mirror a lease and start heartbeating it
    pub fn new(endpoint: Arc<dyn LeaseEndpoint>, lease_timeout: Duration) -> Self {
        let heartbeat_cancel = CancellationToken::new();

        let beat_endpoint = endpoint.clone();
        let beat_cancel = heartbeat_cancel.clone();
        tokio::spawn(async move {
            let mut beat = interval(lease_timeout / 2);
            beat.set_missed_tick_behavior(MissedTickBehavior::Skip);
            beat.tick().await;
            loop {
                tokio::select! {
                    _ = beat.tick() => {
                        if let Err(err) = beat_endpoint.heartbeat().await {
                            // Heartbeat failure is not retried; the server's
                            // expiry sweep takes over from here.
                            warn!(
                                reference = %beat_endpoint.reference_id(),
                                %err,
                                "lease heartbeat failed; stopping renewals"
                            );
                            break;
                        }
                    }
                    _ = beat_cancel.cancelled() => break,
                }
            }
        });

        Self {
            endpoint,
            released: Arc::new(AtomicBool::new(false)),
            heartbeat_cancel,
        }
    }

    /// The reference id this lease mirrors
    pub fn reference_id(&self) -> ReferenceId {
        self.endpoint.reference_id()
    }

    /// Whether this proxy has been locally released
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Fail if the proxy has been locally released
    pub fn ensure_live(&self) -> Result<(), LeaseError> {
        if self.is_released() {
            Err(LeaseError::AlreadyReleased(self.reference_id()))
        } else {
            Ok(())
        }
    }

    /// Release the lease on the server
    ///
    /// Idempotent: a second call logs and returns without touching the
    /// server. The heartbeat schedule is cancelled before the release call.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            warn!(reference = %self.reference_id(), "remote lease already released");
            return;
        }
        self.heartbeat_cancel.cancel();
        if let Err(err) = self.endpoint.release().await {
            // Expiry beat us to it, or the transport is gone; either way the
            // server no longer tracks the reference.
            warn!(reference = %self.reference_id(), %err, "remote release did not complete cleanly");
        }
    }
}

impl Drop for RemoteLease {
    fn drop(&mut self) {
        self.heartbeat_cancel.cancel();
        if !self.released.swap(true, Ordering::SeqCst) {
            warn!(
                reference = %self.reference_id(),
                "remote lease dropped without explicit release"
            );
            let endpoint = self.endpoint.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = endpoint.release().await;
                });
            }
        }
    }
}
