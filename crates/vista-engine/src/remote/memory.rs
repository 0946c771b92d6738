//! In-process transport wiring proxies straight to a server

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use vista_values::UniqueId;

use crate::error::{EngineResult, Error};
use crate::remote::server::EngineServer;
use crate::remote::transport::EngineTransport;

/// Couples the remote proxies to an [`EngineServer`] without a network
///
/// `set_failed` makes every subsequent call fail and ends open notification
/// streams, standing in for a broken connection.
pub struct MemoryTransport {
    server: Arc<EngineServer>,
    failed: Arc<AtomicBool>,
}

impl MemoryTransport {
    /// Wire a transport to a server
    pub fn new(server: Arc<EngineServer>) -> Arc<Self> {
        Arc::new(Self {
            server,
            failed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Simulate a broken (or repaired) connection
    pub fn set_failed(&self, failed: bool) {
        self.failed.store(failed, Ordering::SeqCst);
    }

    fn ensure_connected(&self) -> EngineResult<()> {
        if self.failed.load(Ordering::SeqCst) {
            return Err(Error::transport("connection lost"));
        }
        Ok(())
    }
}

#[async_trait]
impl EngineTransport for MemoryTransport {
    async fn call(&self, request: Bytes) -> EngineResult<Bytes> {
        self.ensure_connected()?;
        Ok(self.server.handle(request).await)
    }

    async fn notifications(
        &self,
        client_id: &UniqueId,
    ) -> EngineResult<BoxStream<'static, Bytes>> {
        self.ensure_connected()?;
        let receiver = self.server.subscribe(client_id);
        let failed = self.failed.clone();
        let stream = BroadcastStream::new(receiver)
            // Lagged receivers drop the missed notifications; the poll
            // surface still has the full state.
            .filter_map(|item| async move { item.ok() })
            .take_while(move |_| {
                let failed = failed.clone();
                async move { !failed.load(Ordering::SeqCst) }
            });
        Ok(stream.boxed())
    }
}
