//! The call boundary the remote proxies speak over

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use vista_values::UniqueId;

use crate::error::EngineResult;
use crate::remote::messages::{decode, encode, EngineRequest, EngineResponse};

/// Carries CBOR-framed requests and push notifications
///
/// Failures are fatal to whatever session made the call; proxies never
/// retry a failed transport.
#[async_trait]
pub trait EngineTransport: Send + Sync + 'static {
    /// One request/response exchange
    async fn call(&self, request: Bytes) -> EngineResult<Bytes>;

    /// The push notification stream for one client session
    ///
    /// The stream ends when the session ends or the transport fails.
    async fn notifications(&self, client_id: &UniqueId)
        -> EngineResult<BoxStream<'static, Bytes>>;
}

/// One encoded exchange: request out, decoded response back, server errors
/// rehydrated
pub(super) async fn roundtrip(
    transport: &Arc<dyn EngineTransport>,
    request: &EngineRequest,
) -> EngineResult<EngineResponse> {
    let bytes = encode(request)?;
    let response = transport.call(bytes).await?;
    decode::<EngineResponse>(&response)?.into_result()
}
