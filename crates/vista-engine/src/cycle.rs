//! One computation pass of a view process

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;
use vista_depgraph::{CompiledViewDefinition, GraphExplorer, LocalGraphExplorer};
use vista_leases::EngineResource;
use vista_values::UniqueId;

use crate::error::{EngineResult, Error};
use crate::execution::CycleExecutionOptions;
use crate::result_model::{
    ComputedValue, CycleQuery, CycleQueryResponse, ResultModel, ViewResultSnapshot,
};

/// Lifecycle state of a view cycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViewCycleState {
    /// Created but not yet executing
    AwaitingExecution,
    /// Executing now
    Executing,
    /// Executed to completion; results available
    Executed,
    /// Execution failed
    Failed,
    /// Evicted from the retained window or shut down; unleasable
    Destroyed,
}

/// One completed (or in-progress) computation pass
///
/// Leased to clients through the cycle resource manager; once the last
/// reference drops, the cycle is destroyed and can never be leased again.
pub struct ViewCycle {
    id: UniqueId,
    process_id: UniqueId,
    name: String,
    state: RwLock<ViewCycleState>,
    duration: Duration,
    execution_options: CycleExecutionOptions,
    compiled: Arc<CompiledViewDefinition>,
    result_model: ResultModel,
}

impl ViewCycle {
    /// Assemble an executed cycle from a finished computation pass
    pub fn executed(
        process_id: UniqueId,
        name: impl Into<String>,
        execution_options: CycleExecutionOptions,
        compiled: Arc<CompiledViewDefinition>,
        result_model: ResultModel,
        duration: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: UniqueId::new("ViewCycle", Uuid::new_v4().to_string()),
            process_id,
            name: name.into(),
            state: RwLock::new(ViewCycleState::Executed),
            duration,
            execution_options,
            compiled,
            result_model,
        })
    }

    /// The cycle's identity
    pub fn cycle_id(&self) -> &UniqueId {
        &self.id
    }

    /// The owning process
    pub fn process_id(&self) -> &UniqueId {
        &self.process_id
    }

    /// Display name, typically the view name plus valuation time
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state
    pub fn state(&self) -> ViewCycleState {
        *self.state.read()
    }

    /// How long execution took
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// The options the cycle executed under
    pub fn execution_options(&self) -> &CycleExecutionOptions {
        &self.execution_options
    }

    /// The compiled definition the cycle executed against
    pub fn compiled_view_definition(&self) -> &Arc<CompiledViewDefinition> {
        &self.compiled
    }

    /// The full result model
    pub fn result_model(&self) -> &ResultModel {
        &self.result_model
    }

    /// Client-facing summary of this cycle: terminal values only
    pub fn result_snapshot(&self) -> ViewResultSnapshot {
        ViewResultSnapshot {
            cycle_id: self.id.clone(),
            process_id: self.process_id.clone(),
            valuation_time: self.execution_options.valuation_time,
            duration: self.duration,
            values: self.result_model.terminal_values(),
        }
    }

    /// Raw intermediate (and terminal) values for exactly the named outputs
    pub fn query_computation_caches(&self, query: &CycleQuery) -> CycleQueryResponse {
        self.query(query, false)
    }

    /// Final, terminal values for exactly the named outputs
    pub fn query_results(&self, query: &CycleQuery) -> CycleQueryResponse {
        self.query(query, true)
    }

    fn query(&self, query: &CycleQuery, terminal_only: bool) -> CycleQueryResponse {
        let Some(config) = self.result_model.config(&query.calculation_config) else {
            return CycleQueryResponse::default();
        };
        let values = query
            .descriptors
            .iter()
            .filter(|d| !terminal_only || config.is_terminal(d))
            .filter_map(|d| {
                config.get(d).map(|v| ComputedValue {
                    descriptor: d.clone(),
                    value: v.clone(),
                })
            })
            .collect();
        CycleQueryResponse { values }
    }
}

impl EngineResource for ViewCycle {
    fn unique_id(&self) -> &UniqueId {
        &self.id
    }

    fn release(&self) {
        *self.state.write() = ViewCycleState::Destroyed;
        debug!(cycle = %self.id, "view cycle destroyed");
    }
}

/// Read access to one leased cycle, local or remote
#[async_trait]
pub trait ViewCycleAccess: Send + Sync + fmt::Debug {
    /// The cycle's identity
    async fn cycle_id(&self) -> EngineResult<UniqueId>;

    /// Display name
    async fn name(&self) -> EngineResult<String>;

    /// Lifecycle state
    async fn state(&self) -> EngineResult<ViewCycleState>;

    /// Execution duration
    async fn duration(&self) -> EngineResult<Duration>;

    /// The options the cycle executed under
    async fn execution_options(&self) -> EngineResult<CycleExecutionOptions>;

    /// The compiled definition the cycle executed against
    async fn compiled_view_definition(&self) -> EngineResult<Arc<CompiledViewDefinition>>;

    /// Explorer over one configuration's dependency graph
    async fn graph_explorer(&self, config: &str) -> EngineResult<Arc<dyn GraphExplorer>>;

    /// The full client-facing result
    async fn full_result(&self) -> EngineResult<ViewResultSnapshot>;

    /// Raw intermediate values for exactly the named outputs
    async fn query_computation_caches(&self, query: &CycleQuery) -> EngineResult<CycleQueryResponse>;

    /// Terminal values for exactly the named outputs
    async fn query_results(&self, query: &CycleQuery) -> EngineResult<CycleQueryResponse>;
}

/// In-process cycle access over a shared [`ViewCycle`]
pub struct LocalViewCycleAccess {
    cycle: Arc<ViewCycle>,
}

impl LocalViewCycleAccess {
    /// Wrap a shared cycle
    pub fn new(cycle: Arc<ViewCycle>) -> Self {
        Self { cycle }
    }
}

impl fmt::Debug for LocalViewCycleAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalViewCycleAccess")
            .field("cycle", self.cycle.cycle_id())
            .finish()
    }
}

#[async_trait]
impl ViewCycleAccess for LocalViewCycleAccess {
    async fn cycle_id(&self) -> EngineResult<UniqueId> {
        Ok(self.cycle.cycle_id().clone())
    }

    async fn name(&self) -> EngineResult<String> {
        Ok(self.cycle.name().to_string())
    }

    async fn state(&self) -> EngineResult<ViewCycleState> {
        Ok(self.cycle.state())
    }

    async fn duration(&self) -> EngineResult<Duration> {
        Ok(self.cycle.duration())
    }

    async fn execution_options(&self) -> EngineResult<CycleExecutionOptions> {
        Ok(self.cycle.execution_options().clone())
    }

    async fn compiled_view_definition(&self) -> EngineResult<Arc<CompiledViewDefinition>> {
        Ok(self.cycle.compiled_view_definition().clone())
    }

    async fn graph_explorer(&self, config: &str) -> EngineResult<Arc<dyn GraphExplorer>> {
        let compiled = self.cycle.compiled_view_definition();
        let config = compiled
            .config(config)
            .ok_or_else(|| Error::not_found(format!("calculation configuration '{config}'")))?;
        Ok(Arc::new(LocalGraphExplorer::new(config.graph.clone())))
    }

    async fn full_result(&self) -> EngineResult<ViewResultSnapshot> {
        Ok(self.cycle.result_snapshot())
    }

    async fn query_computation_caches(
        &self,
        query: &CycleQuery,
    ) -> EngineResult<CycleQueryResponse> {
        Ok(self.cycle.query_computation_caches(query))
    }

    async fn query_results(&self, query: &CycleQuery) -> EngineResult<CycleQueryResponse> {
        Ok(self.cycle.query_results(query))
    }
}

/// A leased checkout of one cycle
///
/// Both the latest-cycle and by-id paths go through the resource lease
/// manager; the holder must release (or let the lease expire).
#[async_trait]
pub trait ViewCycleReference: Send + Sync {
    /// Access the cycle; fails `InvalidState` once released
    async fn get(&self) -> EngineResult<Arc<dyn ViewCycleAccess>>;

    /// Release the lease; idempotent
    async fn release(&self);
}
