//! Wire shapes for the engine call boundary

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use vista_depgraph::{CompiledViewDefinition, DependencyGraph};
use vista_leases::ReferenceId;
use vista_values::{ResultDescriptor, UniqueId};

use crate::client::{CycleTarget, UserPrincipal, ViewClientState};
use crate::cycle::ViewCycleState;
use crate::error::{EngineResult, Error, ErrorKind};
use crate::execution::{
    CycleExecutionOptions, ExecutionLogMode, ViewExecutionOptions, ViewResultMode,
};
use crate::market_data::MarketDataSnapshot;
use crate::process::ViewProcessState;
use crate::result_model::{CycleQuery, CycleQueryResponse, ViewResultSnapshot};

/// CBOR-encode a message
pub fn encode<T: Serialize>(value: &T) -> EngineResult<Bytes> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|err| Error::internal(format!("encoding failed: {err}")))?;
    Ok(Bytes::from(buf))
}

/// CBOR-decode a message
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> EngineResult<T> {
    ciborium::from_reader(bytes).map_err(|err| Error::transport(format!("decoding failed: {err}")))
}

/// A request to the engine server
#[derive(Debug, Serialize, Deserialize)]
pub enum EngineRequest {
    /// Create a new client session
    CreateClient { user: UserPrincipal },
    /// Keep a client registration alive
    ClientHeartbeat { client_id: UniqueId },
    /// Resolve an existing client session
    LookupClient { client_id: UniqueId },
    /// Locate a view process by id
    LookupProcess { process_id: UniqueId },
    /// An operation on one client session
    Client { client_id: UniqueId, op: ClientOp },
    /// Renew a cycle lease
    CycleHeartbeat { reference_id: ReferenceId },
    /// Release a cycle lease
    CycleRelease { reference_id: ReferenceId },
    /// An operation on one leased cycle
    Cycle { reference_id: ReferenceId, op: CycleOp },
    /// Names of the market data specifications the engine knows about
    MarketDataSpecNames,
    /// Capture the market data of a leased cycle, overrides applied
    CreateMarketDataSnapshot { reference_id: ReferenceId },
}

/// Operations on a client session
#[derive(Debug, Serialize, Deserialize)]
pub enum ClientOp {
    State,
    AttachToDefinition {
        definition_id: UniqueId,
        execution_options: ViewExecutionOptions,
        private: bool,
    },
    AttachToProcess {
        process_id: UniqueId,
    },
    Detach,
    Pause,
    Resume,
    TriggerCycle,
    ResultMode,
    SetResultMode(ViewResultMode),
    FragmentResultMode,
    SetFragmentResultMode(ViewResultMode),
    UpdatePeriod,
    SetUpdatePeriod(Duration),
    SetMinimumLogMode {
        mode: ExecutionLogMode,
        outputs: BTreeSet<ResultDescriptor>,
    },
    /// Open (`true`) or close (`false`) the server-side push channel
    SetListenerDemand(bool),
    IsCompleted,
    LatestResult,
    LatestCompiledDefinition,
    CreateCycleReference(CycleTarget),
    Shutdown,
}

/// Operations on a leased cycle
#[derive(Debug, Serialize, Deserialize)]
pub enum CycleOp {
    Describe,
    CompiledViewDefinition,
    FullResult,
    QueryComputationCaches(CycleQuery),
    QueryResults(CycleQuery),
    /// The whole dependency graph of one configuration; fetched once and
    /// cached by the remote explorer
    WholeGraph { config: String },
}

/// Point-in-time description of one view process
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub process_id: UniqueId,
    pub definition_id: UniqueId,
    pub state: ViewProcessState,
}

/// Immutable description of a leased cycle
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CycleDescription {
    pub cycle_id: UniqueId,
    pub process_id: UniqueId,
    pub name: String,
    pub state: ViewCycleState,
    pub duration: Duration,
    pub execution_options: CycleExecutionOptions,
}

/// A response from the engine server
#[derive(Debug, Serialize, Deserialize)]
pub enum EngineResponse {
    Ok,
    ClientCreated { client_id: UniqueId },
    ClientFound { user: UserPrincipal },
    ClientState(ViewClientState),
    ProcessFound(ProcessInfo),
    ResultMode(ViewResultMode),
    UpdatePeriod(Duration),
    Completed(bool),
    LatestResult(Option<ViewResultSnapshot>),
    LatestCompiledDefinition(Option<Arc<CompiledViewDefinition>>),
    CycleReference { reference_id: ReferenceId },
    CycleDescription(CycleDescription),
    CompiledViewDefinition(Arc<CompiledViewDefinition>),
    FullResult(ViewResultSnapshot),
    Query(CycleQueryResponse),
    Graph(Arc<DependencyGraph>),
    SpecNames(Vec<String>),
    Snapshot(MarketDataSnapshot),
    Error { kind: ErrorKind, context: String },
}

impl EngineResponse {
    /// Turn a server-reported error back into an [`Error`]
    pub fn into_result(self) -> EngineResult<EngineResponse> {
        match self {
            EngineResponse::Error { kind, context } => Err(Error::new(kind, context)),
            other => Ok(other),
        }
    }
}

impl From<&Error> for EngineResponse {
    fn from(err: &Error) -> Self {
        EngineResponse::Error {
            kind: err.kind(),
            context: err.context().to_string(),
        }
    }
}

/// A push notification from the server to one client session
#[derive(Debug, Serialize, Deserialize)]
pub enum EngineNotification {
    ViewDefinitionCompiled {
        compiled: Arc<CompiledViewDefinition>,
    },
    CycleStarted {
        cycle_id: UniqueId,
        valuation_time: DateTime<Utc>,
    },
    CycleFragmentCompleted {
        fragment: ViewResultSnapshot,
    },
    CycleCompleted {
        full: ViewResultSnapshot,
        delta: Option<ViewResultSnapshot>,
    },
    ProcessCompleted,
    ProcessTerminated,
    ClientShutdown {
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_cross_the_boundary_with_their_kind() {
        let original = Error::not_found("view process ViewProcess~9");
        let bytes = encode(&EngineResponse::from(&original)).unwrap();
        let response: EngineResponse = decode(&bytes).unwrap();

        let err = response.into_result().unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.context(), "view process ViewProcess~9");
    }

    #[test]
    fn requests_round_trip() {
        let request = EngineRequest::Client {
            client_id: UniqueId::new("ViewClient", "3"),
            op: ClientOp::SetResultMode(ViewResultMode::FullThenDelta),
        };
        let bytes = encode(&request).unwrap();
        let decoded: EngineRequest = decode(&bytes).unwrap();
        match decoded {
            EngineRequest::Client { client_id, op } => {
                assert_eq!(client_id.value, "3");
                assert!(matches!(
                    op,
                    ClientOp::SetResultMode(ViewResultMode::FullThenDelta)
                ));
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }
}
