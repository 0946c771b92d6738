//! A running view computation

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info};
use vista_depgraph::CompiledViewDefinition;
use vista_leases::EngineResourceManager;
use vista_values::{ResultDescriptor, UniqueId};

use crate::cycle::ViewCycle;
use crate::execution::{ExecutionLogMode, ViewExecutionOptions};
use crate::listener::ViewResultListener;
use crate::market_data::MarketDataInjector;
use crate::result_model::ViewResultSnapshot;

/// Lifecycle state of a view process
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViewProcessState {
    /// Created, worker not yet running
    Stopped,
    /// Computing cycles
    Running,
    /// Suspended; no new cycles until resumed
    Paused,
    /// Ran to its natural end
    Finished,
    /// Shut down
    Terminated,
}

/// Identifies one attached listener
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A running instance of a view definition's continuous recomputation
///
/// The valuation side is an external collaborator: a worker drives
/// [`ViewProcess::cycle_completed`] and friends, while clients observe
/// through attached listeners and lease completed cycles. The process
/// retains a bounded window of recent cycles; eviction releases the
/// process's own count on the cycle, leaving client leases intact.
pub struct ViewProcess {
    id: UniqueId,
    definition_id: UniqueId,
    execution_options: ViewExecutionOptions,
    state: RwLock<ViewProcessState>,
    latest_compiled: RwLock<Option<Arc<CompiledViewDefinition>>>,
    latest_result: RwLock<Option<Arc<ViewResultSnapshot>>>,
    latest_cycle_id: RwLock<Option<UniqueId>>,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn ViewResultListener>)>>,
    next_listener_id: AtomicU64,
    injector: Arc<MarketDataInjector>,
    cycle_manager: Arc<EngineResourceManager<ViewCycle>>,
    retained: Mutex<VecDeque<UniqueId>>,
    retained_limit: usize,
    log_floors: Mutex<BTreeMap<ResultDescriptor, ExecutionLogMode>>,
    trigger: Notify,
}

impl ViewProcess {
    /// Create a running process
    pub fn new(
        id: UniqueId,
        definition_id: UniqueId,
        execution_options: ViewExecutionOptions,
        cycle_manager: Arc<EngineResourceManager<ViewCycle>>,
        retained_limit: usize,
    ) -> Arc<Self> {
        info!(process = %id, definition = %definition_id, "view process created");
        Arc::new(Self {
            id,
            definition_id,
            execution_options,
            state: RwLock::new(ViewProcessState::Running),
            latest_compiled: RwLock::new(None),
            latest_result: RwLock::new(None),
            latest_cycle_id: RwLock::new(None),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            injector: Arc::new(MarketDataInjector::new()),
            cycle_manager,
            retained: Mutex::new(VecDeque::new()),
            retained_limit,
            log_floors: Mutex::new(BTreeMap::new()),
            trigger: Notify::new(),
        })
    }

    /// Process identity
    pub fn process_id(&self) -> &UniqueId {
        &self.id
    }

    /// The view definition being computed
    pub fn definition_id(&self) -> &UniqueId {
        &self.definition_id
    }

    /// The options the process executes under
    pub fn execution_options(&self) -> &ViewExecutionOptions {
        &self.execution_options
    }

    /// Current lifecycle state
    pub fn state(&self) -> ViewProcessState {
        *self.state.read()
    }

    /// The most recent compiled definition, once one exists
    pub fn latest_compiled_definition(&self) -> Option<Arc<CompiledViewDefinition>> {
        self.latest_compiled.read().clone()
    }

    /// The most recent completed result, once one exists
    pub fn latest_result(&self) -> Option<Arc<ViewResultSnapshot>> {
        self.latest_result.read().clone()
    }

    /// Id of the most recent completed cycle, once one exists
    pub fn latest_cycle_id(&self) -> Option<UniqueId> {
        self.latest_cycle_id.read().clone()
    }

    /// The ad hoc market data override write path
    pub fn live_data_override_injector(&self) -> &Arc<MarketDataInjector> {
        &self.injector
    }

    /// Whether the process ran to its natural end or was shut down
    pub fn is_completed(&self) -> bool {
        matches!(
            self.state(),
            ViewProcessState::Finished | ViewProcessState::Terminated
        )
    }

    // Listener registry

    /// Attach a listener
    ///
    /// The listener immediately observes the latest compiled definition and
    /// latest result, so a late joiner does not wait a full cycle for state.
    pub fn attach_listener(&self, listener: Arc<dyn ViewResultListener>) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        if let Some(compiled) = self.latest_compiled_definition() {
            listener.view_definition_compiled(&compiled);
        }
        if let Some(result) = self.latest_result() {
            listener.cycle_completed(&result, None);
        }
        self.listeners.lock().push((id, listener));
        id
    }

    /// Detach a listener; returns whether it was attached
    pub fn detach_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(l, _)| *l != id);
        listeners.len() != before
    }

    /// Number of attached listeners; the process has execution demand iff
    /// this is non-zero
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    fn each_listener(&self, f: impl Fn(&dyn ViewResultListener)) {
        let listeners: Vec<_> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            f(listener.as_ref());
        }
    }

    // Worker entry points

    /// A compilation pass produced a new definition
    pub fn definition_compiled(&self, compiled: Arc<CompiledViewDefinition>) {
        *self.latest_compiled.write() = Some(compiled.clone());
        self.each_listener(|l| l.view_definition_compiled(&compiled));
    }

    /// A cycle started executing
    pub fn cycle_started(&self, cycle_id: &UniqueId, valuation_time: DateTime<Utc>) {
        self.each_listener(|l| l.cycle_started(cycle_id, valuation_time));
    }

    /// A partial result became available mid-cycle
    pub fn cycle_fragment_completed(&self, fragment: ViewResultSnapshot) {
        self.each_listener(|l| l.cycle_fragment_completed(&fragment));
    }

    /// A cycle finished
    ///
    /// Takes the cycle under lease management, retains it in the window
    /// (evicting the oldest beyond the limit), and notifies listeners with
    /// the full result plus the delta against the previous cycle.
    pub fn cycle_completed(&self, cycle: Arc<ViewCycle>) {
        let cycle_id = cycle.cycle_id().clone();
        self.cycle_manager.manage(cycle.clone());

        let evicted = {
            let mut retained = self.retained.lock();
            retained.push_back(cycle_id.clone());
            if retained.len() > self.retained_limit {
                retained.pop_front()
            } else {
                None
            }
        };
        if let Some(old) = evicted {
            debug!(process = %self.id, cycle = %old, "evicting cycle from retained window");
            self.cycle_manager.release_ownership(&old);
        }

        let full = Arc::new(cycle.result_snapshot());
        let delta = self
            .latest_result
            .read()
            .as_ref()
            .map(|previous| Arc::new(full.delta_since(previous)));

        *self.latest_result.write() = Some(full.clone());
        *self.latest_cycle_id.write() = Some(cycle_id);

        self.each_listener(|l| l.cycle_completed(&full, delta.as_ref()));
    }

    /// The process ran to its natural end
    pub fn process_completed(&self) {
        *self.state.write() = ViewProcessState::Finished;
        info!(process = %self.id, "view process completed");
        self.each_listener(|l| l.process_completed());
    }

    /// Shut the process down
    ///
    /// Idempotent. Releases the retained-cycle window; cycles stay alive
    /// for any client still holding a lease on them.
    pub fn shutdown(&self) {
        {
            let mut state = self.state.write();
            if *state == ViewProcessState::Terminated {
                return;
            }
            *state = ViewProcessState::Terminated;
        }
        info!(process = %self.id, "view process shut down");
        let retained: Vec<UniqueId> = self.retained.lock().drain(..).collect();
        for cycle_id in retained {
            self.cycle_manager.release_ownership(&cycle_id);
        }
        self.each_listener(|l| l.process_terminated());
    }

    // Scheduling

    /// Suspend cycle execution
    pub fn pause(&self) {
        let mut state = self.state.write();
        if *state == ViewProcessState::Running {
            *state = ViewProcessState::Paused;
        }
    }

    /// Resume cycle execution
    pub fn resume(&self) {
        let mut state = self.state.write();
        if *state == ViewProcessState::Paused {
            *state = ViewProcessState::Running;
        }
    }

    /// Force an out-of-schedule recompute
    pub fn trigger_cycle(&self) {
        self.trigger.notify_one();
    }

    /// Worker side of [`ViewProcess::trigger_cycle`]
    pub async fn await_trigger(&self) {
        self.trigger.notified().await;
    }

    // Execution log modes

    /// Raise (or clear) the log verbosity floor for a set of outputs
    ///
    /// `FullLogs` sets the floor, `Indicators` clears it. Floors last for
    /// the remainder of the process's life.
    pub fn set_minimum_log_mode(&self, mode: ExecutionLogMode, outputs: BTreeSet<ResultDescriptor>) {
        let mut floors = self.log_floors.lock();
        match mode {
            ExecutionLogMode::FullLogs => {
                for output in outputs {
                    floors.insert(output, ExecutionLogMode::FullLogs);
                }
            }
            ExecutionLogMode::Indicators => {
                for output in &outputs {
                    floors.remove(output);
                }
            }
        }
    }

    /// The effective log mode for one output
    pub fn log_mode(&self, output: &ResultDescriptor) -> ExecutionLogMode {
        self.log_floors
            .lock()
            .get(output)
            .copied()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::CycleExecutionOptions;
    use crate::market_data::MarketDataSpecification;
    use crate::result_model::ResultModel;
    use std::time::Duration;
    use vista_depgraph::{CompiledCalculationConfig, DependencyGraphBuilder};
    use vista_values::{ComputationTargetRef, TargetKind, ValueProperties, VersionCorrection};

    fn desc(name: &str) -> ResultDescriptor {
        ResultDescriptor::new(
            name,
            ComputationTargetRef::new(TargetKind::Position, UniqueId::new("Pos", "1")),
            ValueProperties::none(),
        )
    }

    fn compiled() -> Arc<CompiledViewDefinition> {
        let mut builder = DependencyGraphBuilder::new("Default");
        builder.add_node("F", vec![], vec![desc("Pv")]).unwrap();
        Arc::new(CompiledViewDefinition::new(
            UniqueId::new("ViewDef", "d"),
            None,
            [CompiledCalculationConfig::new(builder.build())],
            VersionCorrection::LATEST,
        ))
    }

    fn process() -> (Arc<ViewProcess>, Arc<EngineResourceManager<ViewCycle>>) {
        let manager = Arc::new(EngineResourceManager::new());
        let process = ViewProcess::new(
            UniqueId::new("ViewProcess", "1"),
            UniqueId::new("ViewDef", "d"),
            ViewExecutionOptions::live(MarketDataSpecification::Live {
                provider: "test".to_string(),
            }),
            manager.clone(),
            2,
        );
        (process, manager)
    }

    fn executed_cycle(process: &ViewProcess, pv: f64) -> Arc<ViewCycle> {
        let mut model = ResultModel::new();
        model.insert("Default", desc("Pv"), serde_json::json!(pv), true);
        ViewCycle::executed(
            process.process_id().clone(),
            "test",
            CycleExecutionOptions {
                valuation_time: Utc::now(),
                market_data: MarketDataSpecification::Live {
                    provider: "test".to_string(),
                },
                version_correction: VersionCorrection::LATEST,
            },
            compiled(),
            model,
            Duration::from_millis(5),
        )
    }

    #[tokio::test]
    async fn retained_window_evicts_oldest() {
        let (process, manager) = process();
        let first = executed_cycle(&process, 1.0);
        let first_id = first.cycle_id().clone();
        process.cycle_completed(first);
        process.cycle_completed(executed_cycle(&process, 2.0));
        assert!(manager.is_managed(&first_id));

        process.cycle_completed(executed_cycle(&process, 3.0));
        // Window of 2: the first cycle lost its owner count and, with no
        // client leases, was destroyed.
        assert!(!manager.is_managed(&first_id));
    }

    #[tokio::test]
    async fn shutdown_releases_retained_cycles_and_is_idempotent() {
        let (process, manager) = process();
        let cycle = executed_cycle(&process, 1.0);
        let cycle_id = cycle.cycle_id().clone();
        process.cycle_completed(cycle);

        process.shutdown();
        assert_eq!(process.state(), ViewProcessState::Terminated);
        assert!(!manager.is_managed(&cycle_id));
        process.shutdown();
    }

    #[tokio::test]
    async fn listeners_see_latest_state_on_attach() {
        let (process, _manager) = process();
        process.definition_compiled(compiled());
        process.cycle_completed(executed_cycle(&process, 1.0));

        struct Recorder(std::sync::atomic::AtomicU64);
        impl ViewResultListener for Recorder {
            fn cycle_completed(
                &self,
                _full: &Arc<ViewResultSnapshot>,
                _delta: Option<&Arc<ViewResultSnapshot>>,
            ) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let recorder = Arc::new(Recorder(AtomicU64::new(0)));
        let id = process.attach_listener(recorder.clone());
        // Latest result replayed on attach.
        assert_eq!(recorder.0.load(Ordering::SeqCst), 1);
        assert_eq!(process.listener_count(), 1);

        assert!(process.detach_listener(id));
        assert!(!process.detach_listener(id));
        assert_eq!(process.listener_count(), 0);
    }

    #[tokio::test]
    async fn log_floor_is_sticky_until_cleared() {
        let (process, _manager) = process();
        assert_eq!(process.log_mode(&desc("Pv")), ExecutionLogMode::Indicators);

        process.set_minimum_log_mode(ExecutionLogMode::FullLogs, BTreeSet::from([desc("Pv")]));
        assert_eq!(process.log_mode(&desc("Pv")), ExecutionLogMode::FullLogs);

        process.set_minimum_log_mode(ExecutionLogMode::Indicators, BTreeSet::from([desc("Pv")]));
        assert_eq!(process.log_mode(&desc("Pv")), ExecutionLogMode::Indicators);
    }
}
