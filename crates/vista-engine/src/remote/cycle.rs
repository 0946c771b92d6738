//! Remote proxies over a leased cycle

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::OnceCell;
use vista_depgraph::{
    CompiledViewDefinition, DependencyGraph, DependencyNode, GraphError, GraphExplorer,
};
use vista_leases::{LeaseEndpoint, LeaseError, ReferenceId, RemoteLease};
use vista_values::{ResultDescriptor, ResultRequest, UniqueId};

use crate::cycle::{ViewCycleAccess, ViewCycleReference, ViewCycleState};
use crate::error::{EngineResult, Error};
use crate::execution::CycleExecutionOptions;
use crate::remote::messages::{CycleDescription, CycleOp, EngineRequest, EngineResponse};
use crate::remote::transport::{roundtrip, EngineTransport};

/// Drives one server-issued cycle lease over the transport
struct TransportLeaseEndpoint {
    transport: Arc<dyn EngineTransport>,
    reference_id: ReferenceId,
}

impl TransportLeaseEndpoint {
    fn map_error(&self, err: Error) -> LeaseError {
        if err.is_not_found() {
            LeaseError::NotFound(self.reference_id)
        } else {
            LeaseError::Transport(err.to_string())
        }
    }
}

#[async_trait]
impl LeaseEndpoint for TransportLeaseEndpoint {
    fn reference_id(&self) -> ReferenceId {
        self.reference_id
    }

    async fn heartbeat(&self) -> Result<(), LeaseError> {
        roundtrip(
            &self.transport,
            &EngineRequest::CycleHeartbeat {
                reference_id: self.reference_id,
            },
        )
        .await
        .map(|_| ())
        .map_err(|err| self.map_error(err))
    }

    async fn release(&self) -> Result<(), LeaseError> {
        roundtrip(
            &self.transport,
            &EngineRequest::CycleRelease {
                reference_id: self.reference_id,
            },
        )
        .await
        .map(|_| ())
        .map_err(|err| self.map_error(err))
    }
}

/// Holder-side cycle lease: heartbeats itself, gates access
pub struct RemoteCycleReference {
    lease: RemoteLease,
    cycle: Arc<RemoteViewCycle>,
}

impl RemoteCycleReference {
    /// Mirror a server-issued lease
    pub fn new(
        transport: Arc<dyn EngineTransport>,
        reference_id: ReferenceId,
        lease_timeout: Duration,
    ) -> Self {
        let endpoint = Arc::new(TransportLeaseEndpoint {
            transport: transport.clone(),
            reference_id,
        });
        Self {
            lease: RemoteLease::new(endpoint, lease_timeout),
            cycle: Arc::new(RemoteViewCycle::new(transport, reference_id)),
        }
    }

    /// The manager-issued reference this proxy mirrors
    pub fn reference_id(&self) -> ReferenceId {
        self.lease.reference_id()
    }
}

#[async_trait]
impl ViewCycleReference for RemoteCycleReference {
    async fn get(&self) -> EngineResult<Arc<dyn ViewCycleAccess>> {
        self.lease.ensure_live()?;
        Ok(self.cycle.clone())
    }

    async fn release(&self) {
        self.lease.release().await;
    }
}

/// Remote [`ViewCycleAccess`]: every query is one call, immutable answers
/// are cached
pub struct RemoteViewCycle {
    transport: Arc<dyn EngineTransport>,
    reference_id: ReferenceId,
    compiled: OnceCell<Arc<CompiledViewDefinition>>,
    explorers: DashMap<String, Arc<RemoteGraphExplorer>>,
}

impl RemoteViewCycle {
    fn new(transport: Arc<dyn EngineTransport>, reference_id: ReferenceId) -> Self {
        Self {
            transport,
            reference_id,
            compiled: OnceCell::new(),
            explorers: DashMap::new(),
        }
    }

    async fn call(&self, op: CycleOp) -> EngineResult<EngineResponse> {
        roundtrip(
            &self.transport,
            &EngineRequest::Cycle {
                reference_id: self.reference_id,
                op,
            },
        )
        .await
    }

    async fn describe(&self) -> EngineResult<CycleDescription> {
        match self.call(CycleOp::Describe).await? {
            EngineResponse::CycleDescription(description) => Ok(description),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(response: &EngineResponse) -> Error {
    Error::internal(format!("unexpected engine response: {response:?}"))
}

impl fmt::Debug for RemoteViewCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteViewCycle")
            .field("reference_id", &self.reference_id)
            .finish()
    }
}

#[async_trait]
impl ViewCycleAccess for RemoteViewCycle {
    async fn cycle_id(&self) -> EngineResult<UniqueId> {
        Ok(self.describe().await?.cycle_id)
    }

    async fn name(&self) -> EngineResult<String> {
        Ok(self.describe().await?.name)
    }

    async fn state(&self) -> EngineResult<ViewCycleState> {
        Ok(self.describe().await?.state)
    }

    async fn duration(&self) -> EngineResult<Duration> {
        Ok(self.describe().await?.duration)
    }

    async fn execution_options(&self) -> EngineResult<CycleExecutionOptions> {
        Ok(self.describe().await?.execution_options)
    }

    async fn compiled_view_definition(&self) -> EngineResult<Arc<CompiledViewDefinition>> {
        self.compiled
            .get_or_try_init(|| async {
                match self.call(CycleOp::CompiledViewDefinition).await? {
                    EngineResponse::CompiledViewDefinition(compiled) => Ok(compiled),
                    other => Err(unexpected(&other)),
                }
            })
            .await
            .cloned()
    }

    async fn graph_explorer(&self, config: &str) -> EngineResult<Arc<dyn GraphExplorer>> {
        // No validating call here; an unknown configuration surfaces on the
        // explorer's first query.
        let explorer = self
            .explorers
            .entry(config.to_string())
            .or_insert_with(|| {
                Arc::new(RemoteGraphExplorer::new(
                    self.transport.clone(),
                    self.reference_id,
                    config.to_string(),
                ))
            })
            .clone();
        Ok(explorer)
    }

    async fn full_result(&self) -> EngineResult<crate::result_model::ViewResultSnapshot> {
        match self.call(CycleOp::FullResult).await? {
            EngineResponse::FullResult(result) => Ok(result),
            other => Err(unexpected(&other)),
        }
    }

    async fn query_computation_caches(
        &self,
        query: &crate::result_model::CycleQuery,
    ) -> EngineResult<crate::result_model::CycleQueryResponse> {
        match self
            .call(CycleOp::QueryComputationCaches(query.clone()))
            .await?
        {
            EngineResponse::Query(response) => Ok(response),
            other => Err(unexpected(&other)),
        }
    }

    async fn query_results(
        &self,
        query: &crate::result_model::CycleQuery,
    ) -> EngineResult<crate::result_model::CycleQueryResponse> {
        match self.call(CycleOp::QueryResults(query.clone())).await? {
            EngineResponse::Query(response) => Ok(response),
            other => Err(unexpected(&other)),
        }
    }
}

/// Remote graph explorer: fetches the whole graph once, answers locally
///
/// Safe because compiled graphs are immutable; one fetch amortizes any
/// number of drill-down queries.
pub struct RemoteGraphExplorer {
    transport: Arc<dyn EngineTransport>,
    reference_id: ReferenceId,
    config: String,
    cache: OnceCell<Arc<DependencyGraph>>,
}

impl RemoteGraphExplorer {
    fn new(transport: Arc<dyn EngineTransport>, reference_id: ReferenceId, config: String) -> Self {
        Self {
            transport,
            reference_id,
            config,
            cache: OnceCell::new(),
        }
    }
}

#[async_trait]
impl GraphExplorer for RemoteGraphExplorer {
    async fn whole_graph(&self) -> Result<Arc<DependencyGraph>, GraphError> {
        self.cache
            .get_or_try_init(|| async {
                let response = roundtrip(
                    &self.transport,
                    &EngineRequest::Cycle {
                        reference_id: self.reference_id,
                        op: CycleOp::WholeGraph {
                            config: self.config.clone(),
                        },
                    },
                )
                .await
                .map_err(|err| {
                    if err.is_not_found() {
                        GraphError::UnknownConfig(self.config.clone())
                    } else {
                        GraphError::Transport(err.to_string())
                    }
                })?;
                match response {
                    EngineResponse::Graph(graph) => Ok(graph),
                    other => Err(GraphError::Transport(format!(
                        "unexpected engine response: {other:?}"
                    ))),
                }
            })
            .await
            .cloned()
    }

    async fn producer_of(
        &self,
        output: &ResultDescriptor,
    ) -> Result<Option<DependencyNode>, GraphError> {
        let graph = self.whole_graph().await?;
        Ok(graph.producer_of(output).cloned())
    }

    async fn subgraph_producing(
        &self,
        output: &ResultDescriptor,
    ) -> Result<Option<DependencyGraph>, GraphError> {
        let graph = self.whole_graph().await?;
        Ok(graph.subgraph_producing(output))
    }

    async fn terminal_outputs(
        &self,
    ) -> Result<BTreeMap<ResultDescriptor, BTreeSet<ResultRequest>>, GraphError> {
        let graph = self.whole_graph().await?;
        Ok(graph.terminal_outputs().clone())
    }
}
