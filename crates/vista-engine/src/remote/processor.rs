//! Client-side proxy of the view processor

use std::sync::Arc;

use dashmap::DashMap;
use vista_leases::ReferenceId;
use vista_values::UniqueId;

use crate::client::UserPrincipal;
use crate::config::EngineConfig;
use crate::error::{EngineResult, Error};
use crate::market_data::MarketDataSnapshot;
use crate::remote::client::RemoteViewClient;
use crate::remote::messages::{EngineRequest, EngineResponse, ProcessInfo};
use crate::remote::transport::{roundtrip, EngineTransport};

/// Proxy of the engine's front door
///
/// Client proxies are cached per session id: a second lookup of the same
/// session returns the same proxy, so one registration heartbeat runs per
/// session no matter how many times it is resolved.
pub struct RemoteViewProcessor {
    transport: Arc<dyn EngineTransport>,
    config: EngineConfig,
    clients: DashMap<UniqueId, Arc<RemoteViewClient>>,
}

impl RemoteViewProcessor {
    /// Connect to an engine over a transport
    ///
    /// `config` mirrors the server's timeouts so proxies heartbeat at the
    /// right rate.
    pub fn new(transport: Arc<dyn EngineTransport>, config: EngineConfig) -> Self {
        Self {
            transport,
            config,
            clients: DashMap::new(),
        }
    }

    /// Create a new client session on the server
    pub async fn create_view_client(
        &self,
        user: UserPrincipal,
    ) -> EngineResult<Arc<RemoteViewClient>> {
        let response = roundtrip(&self.transport, &EngineRequest::CreateClient { user: user.clone() })
            .await?;
        let EngineResponse::ClientCreated { client_id } = response else {
            return Err(unexpected(&response));
        };
        let client = RemoteViewClient::new(client_id.clone(), user, self.transport.clone(), &self.config);
        self.clients.insert(client_id, client.clone());
        Ok(client)
    }

    /// Resolve an existing session, reusing a cached proxy when one exists
    ///
    /// Fails `NotFound` once the server has expired the registration.
    pub async fn view_client(&self, client_id: &UniqueId) -> EngineResult<Arc<RemoteViewClient>> {
        if let Some(client) = self.clients.get(client_id) {
            return Ok(client.clone());
        }
        let response = roundtrip(
            &self.transport,
            &EngineRequest::LookupClient {
                client_id: client_id.clone(),
            },
        )
        .await?;
        let EngineResponse::ClientFound { user } = response else {
            return Err(unexpected(&response));
        };
        let client = RemoteViewClient::new(client_id.clone(), user, self.transport.clone(), &self.config);
        self.clients.insert(client_id.clone(), client.clone());
        Ok(client)
    }

    /// Locate a view process by id
    pub async fn view_process(&self, process_id: &UniqueId) -> EngineResult<ProcessInfo> {
        match roundtrip(
            &self.transport,
            &EngineRequest::LookupProcess {
                process_id: process_id.clone(),
            },
        )
        .await?
        {
            EngineResponse::ProcessFound(info) => Ok(info),
            other => Err(unexpected(&other)),
        }
    }

    /// Names of the market data specifications the engine knows about
    pub async fn market_data_spec_names(&self) -> EngineResult<Vec<String>> {
        match roundtrip(&self.transport, &EngineRequest::MarketDataSpecNames).await? {
            EngineResponse::SpecNames(names) => Ok(names),
            other => Err(unexpected(&other)),
        }
    }

    /// Capture the market data of a leased cycle, overrides applied
    pub async fn create_market_data_snapshot(
        &self,
        reference_id: ReferenceId,
    ) -> EngineResult<MarketDataSnapshot> {
        match roundtrip(
            &self.transport,
            &EngineRequest::CreateMarketDataSnapshot { reference_id },
        )
        .await?
        {
            EngineResponse::Snapshot(snapshot) => Ok(snapshot),
            other => Err(unexpected(&other)),
        }
    }

    /// Drop a cached client proxy without touching the server
    pub fn forget_client(&self, client_id: &UniqueId) {
        self.clients.remove(client_id);
    }
}

fn unexpected(response: &EngineResponse) -> Error {
    Error::internal(format!("unexpected engine response: {response:?}"))
}
