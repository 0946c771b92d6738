//! Server-side dispatcher for the call boundary

use std::sync::{Arc, Weak};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use vista_depgraph::CompiledViewDefinition;
use vista_values::UniqueId;

use crate::client::{CycleTarget, ViewClient};
use crate::error::{EngineResult, Error};
use crate::listener::ViewResultListener;
use crate::processor::ViewProcessor;
use crate::remote::messages::{
    decode, encode, ClientOp, CycleDescription, CycleOp, EngineNotification, EngineRequest,
    EngineResponse, ProcessInfo,
};
use crate::result_model::ViewResultSnapshot;

const PUSH_CHANNEL_CAPACITY: usize = 64;

/// Serves the engine over a transport
///
/// Owns one push channel per client session; a channel only carries
/// notifications while the client has declared listener demand.
pub struct EngineServer {
    processor: Arc<ViewProcessor>,
    push: DashMap<UniqueId, broadcast::Sender<Bytes>>,
    weak_self: Weak<EngineServer>,
}

impl EngineServer {
    /// Serve a processor
    pub fn new(processor: Arc<ViewProcessor>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            processor,
            push: DashMap::new(),
            weak_self: weak_self.clone(),
        })
    }

    /// The served processor
    pub fn processor(&self) -> &Arc<ViewProcessor> {
        &self.processor
    }

    /// Number of open push channels
    pub fn push_channel_count(&self) -> usize {
        self.push.len()
    }

    /// Subscribe to a client session's push channel
    pub fn subscribe(&self, client_id: &UniqueId) -> broadcast::Receiver<Bytes> {
        self.push_sender(client_id).subscribe()
    }

    fn push_sender(&self, client_id: &UniqueId) -> broadcast::Sender<Bytes> {
        self.push
            .entry(client_id.clone())
            .or_insert_with(|| broadcast::channel(PUSH_CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Handle one encoded request, always producing an encoded response
    pub async fn handle(&self, request: Bytes) -> Bytes {
        let response = match decode::<EngineRequest>(&request) {
            Ok(request) => match self.dispatch(request).await {
                Ok(response) => response,
                Err(err) => EngineResponse::from(&err),
            },
            Err(err) => EngineResponse::from(&err),
        };
        encode(&response).unwrap_or_default()
    }

    async fn dispatch(&self, request: EngineRequest) -> EngineResult<EngineResponse> {
        match request {
            EngineRequest::CreateClient { user } => {
                let client = self.processor.create_view_client(user);
                Ok(EngineResponse::ClientCreated {
                    client_id: client.client_id().clone(),
                })
            }
            EngineRequest::ClientHeartbeat { client_id } => {
                self.processor.client_heartbeat(&client_id)?;
                Ok(EngineResponse::Ok)
            }
            EngineRequest::LookupClient { client_id } => {
                let client = self.processor.view_client(&client_id)?;
                Ok(EngineResponse::ClientFound {
                    user: client.user().clone(),
                })
            }
            EngineRequest::LookupProcess { process_id } => {
                let process = self.processor.view_process(&process_id)?;
                Ok(EngineResponse::ProcessFound(ProcessInfo {
                    process_id: process.process_id().clone(),
                    definition_id: process.definition_id().clone(),
                    state: process.state(),
                }))
            }
            EngineRequest::Client { client_id, op } => self.dispatch_client(&client_id, op).await,
            EngineRequest::CycleHeartbeat { reference_id } => {
                self.processor.cycle_manager().await.heartbeat(reference_id)?;
                Ok(EngineResponse::Ok)
            }
            EngineRequest::CycleRelease { reference_id } => {
                self.processor
                    .cycle_manager()
                    .await
                    .release_reference(reference_id)?;
                Ok(EngineResponse::Ok)
            }
            EngineRequest::Cycle { reference_id, op } => {
                let cycle = self.processor.cycle_manager().await.get(reference_id)?;
                self.dispatch_cycle(&cycle, op)
            }
            EngineRequest::MarketDataSpecNames => Ok(EngineResponse::SpecNames(
                self.processor
                    .market_data_specs()
                    .names()
                    .map(str::to_string)
                    .collect(),
            )),
            EngineRequest::CreateMarketDataSnapshot { reference_id } => {
                let cycle = self.processor.cycle_manager().await.get(reference_id)?;
                let snapshot = self.processor.create_market_data_snapshot(&cycle)?;
                Ok(EngineResponse::Snapshot(snapshot))
            }
        }
    }

    async fn dispatch_client(
        &self,
        client_id: &UniqueId,
        op: ClientOp,
    ) -> EngineResult<EngineResponse> {
        let client = self.processor.view_client(client_id)?;
        match op {
            ClientOp::State => Ok(EngineResponse::ClientState(client.state().await?)),
            ClientOp::AttachToDefinition {
                definition_id,
                execution_options,
                private,
            } => {
                client
                    .attach_to_view_definition(definition_id, execution_options, private)
                    .await?;
                Ok(EngineResponse::Ok)
            }
            ClientOp::AttachToProcess { process_id } => {
                client.attach_to_process(process_id).await?;
                Ok(EngineResponse::Ok)
            }
            ClientOp::Detach => {
                client.detach().await?;
                Ok(EngineResponse::Ok)
            }
            ClientOp::Pause => {
                client.pause().await?;
                Ok(EngineResponse::Ok)
            }
            ClientOp::Resume => {
                client.resume().await?;
                Ok(EngineResponse::Ok)
            }
            ClientOp::TriggerCycle => {
                client.trigger_cycle().await?;
                Ok(EngineResponse::Ok)
            }
            ClientOp::ResultMode => Ok(EngineResponse::ResultMode(client.result_mode().await?)),
            ClientOp::SetResultMode(mode) => {
                client.set_result_mode(mode).await?;
                Ok(EngineResponse::Ok)
            }
            ClientOp::FragmentResultMode => Ok(EngineResponse::ResultMode(
                client.fragment_result_mode().await?,
            )),
            ClientOp::SetFragmentResultMode(mode) => {
                client.set_fragment_result_mode(mode).await?;
                Ok(EngineResponse::Ok)
            }
            ClientOp::UpdatePeriod => Ok(EngineResponse::UpdatePeriod(
                client.update_period().await?,
            )),
            ClientOp::SetUpdatePeriod(period) => {
                client.set_update_period(period).await?;
                Ok(EngineResponse::Ok)
            }
            ClientOp::SetMinimumLogMode { mode, outputs } => {
                client.set_minimum_log_mode(mode, outputs).await?;
                Ok(EngineResponse::Ok)
            }
            ClientOp::SetListenerDemand(demand) => {
                if demand {
                    let listener = Arc::new(PushListener {
                        server: self.weak_self.clone(),
                        client_id: client_id.clone(),
                        sender: self.push_sender(client_id),
                    });
                    client.set_result_listener(Some(listener)).await?;
                    debug!(client = %client_id, "push channel opened");
                } else {
                    client.set_result_listener(None).await?;
                    debug!(client = %client_id, "push channel closed");
                }
                Ok(EngineResponse::Ok)
            }
            ClientOp::IsCompleted => Ok(EngineResponse::Completed(client.is_completed().await?)),
            ClientOp::LatestResult => Ok(EngineResponse::LatestResult(
                client.latest_result().await?.map(|r| (*r).clone()),
            )),
            ClientOp::LatestCompiledDefinition => Ok(EngineResponse::LatestCompiledDefinition(
                client.latest_compiled_definition().await?,
            )),
            ClientOp::CreateCycleReference(target) => {
                let cycle_id = match target {
                    CycleTarget::Latest => {
                        let process = client.attached_process()?;
                        process.latest_cycle_id().ok_or_else(|| {
                            Error::not_found(format!(
                                "process {} has no completed cycle",
                                process.process_id()
                            ))
                        })?
                    }
                    CycleTarget::ById(id) => id,
                };
                let reference_id = self
                    .processor
                    .cycle_manager()
                    .await
                    .create_reference(&cycle_id)?;
                Ok(EngineResponse::CycleReference { reference_id })
            }
            ClientOp::Shutdown => {
                client.shutdown().await?;
                self.push.remove(client_id);
                Ok(EngineResponse::Ok)
            }
        }
    }

    fn dispatch_cycle(
        &self,
        cycle: &crate::cycle::ViewCycle,
        op: CycleOp,
    ) -> EngineResult<EngineResponse> {
        match op {
            CycleOp::Describe => Ok(EngineResponse::CycleDescription(CycleDescription {
                cycle_id: cycle.cycle_id().clone(),
                process_id: cycle.process_id().clone(),
                name: cycle.name().to_string(),
                state: cycle.state(),
                duration: cycle.duration(),
                execution_options: cycle.execution_options().clone(),
            })),
            CycleOp::CompiledViewDefinition => Ok(EngineResponse::CompiledViewDefinition(
                cycle.compiled_view_definition().clone(),
            )),
            CycleOp::FullResult => Ok(EngineResponse::FullResult(cycle.result_snapshot())),
            CycleOp::QueryComputationCaches(query) => Ok(EngineResponse::Query(
                cycle.query_computation_caches(&query),
            )),
            CycleOp::QueryResults(query) => {
                Ok(EngineResponse::Query(cycle.query_results(&query)))
            }
            CycleOp::WholeGraph { config } => {
                let compiled = cycle.compiled_view_definition();
                let config = compiled
                    .config(&config)
                    .ok_or_else(|| Error::not_found(format!("calculation configuration '{config}'")))?;
                Ok(EngineResponse::Graph(config.graph.clone()))
            }
        }
    }
}

/// Forwards process events into a client's push channel
struct PushListener {
    server: Weak<EngineServer>,
    client_id: UniqueId,
    sender: broadcast::Sender<Bytes>,
}

impl PushListener {
    fn send(&self, notification: &EngineNotification) {
        match encode(notification) {
            // No subscribers is fine; demand can precede the stream.
            Ok(bytes) => {
                let _ = self.sender.send(bytes);
            }
            Err(err) => warn!(%err, "dropping unencodable push notification"),
        }
    }
}

impl ViewResultListener for PushListener {
    fn view_definition_compiled(&self, compiled: &Arc<CompiledViewDefinition>) {
        self.send(&EngineNotification::ViewDefinitionCompiled {
            compiled: compiled.clone(),
        });
    }

    fn cycle_started(&self, cycle_id: &UniqueId, valuation_time: DateTime<Utc>) {
        self.send(&EngineNotification::CycleStarted {
            cycle_id: cycle_id.clone(),
            valuation_time,
        });
    }

    fn cycle_fragment_completed(&self, fragment: &ViewResultSnapshot) {
        self.send(&EngineNotification::CycleFragmentCompleted {
            fragment: fragment.clone(),
        });
    }

    fn cycle_completed(
        &self,
        full: &Arc<ViewResultSnapshot>,
        delta: Option<&Arc<ViewResultSnapshot>>,
    ) {
        self.send(&EngineNotification::CycleCompleted {
            full: (**full).clone(),
            delta: delta.map(|d| (**d).clone()),
        });
    }

    fn process_completed(&self) {
        self.send(&EngineNotification::ProcessCompleted);
    }

    fn process_terminated(&self) {
        self.send(&EngineNotification::ProcessTerminated);
    }

    fn client_shutdown(&self, reason: &str) {
        self.send(&EngineNotification::ClientShutdown {
            reason: reason.to_string(),
        });
        // The session is over however it ended, including a registration
        // sweep; drop its channel so reaped clients do not accumulate.
        if let Some(server) = self.server.upgrade() {
            server.push.remove(&self.client_id);
        }
    }
}
