//! Client sessions onto view processes

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;
use vista_depgraph::CompiledViewDefinition;
use vista_leases::LocalResourceLease;
use vista_values::{ResultDescriptor, UniqueId};

use crate::cycle::{
    LocalViewCycleAccess, ViewCycle, ViewCycleAccess, ViewCycleReference,
};
use crate::error::{EngineResult, Error};
use crate::execution::{ExecutionLogMode, ViewExecutionOptions, ViewResultMode};
use crate::listener::ViewResultListener;
use crate::process::{ListenerId, ViewProcess};
use crate::processor::ViewProcessor;
use crate::result_model::ViewResultSnapshot;

/// The user a client session belongs to
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserPrincipal {
    /// User name
    pub user_name: String,
    /// Where the session originates
    pub ip_address: String,
}

impl UserPrincipal {
    /// A local, in-process user
    pub fn local(user_name: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            ip_address: "127.0.0.1".to_string(),
        }
    }
}

/// Lifecycle state of a view client
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViewClientState {
    /// Not bound to any process
    Detached,
    /// Bound to a process and receiving results
    Attached,
    /// Bound to a process with delivery suspended
    Paused,
    /// Shut down; unusable
    Terminated,
}

/// Which cycle a leased reference should target
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CycleTarget {
    /// The most recently completed cycle
    Latest,
    /// A specific cycle by id
    ById(UniqueId),
}

/// A client session: attach to a process, observe it, lease its cycles
///
/// Two implementations exist, selected by composition: [`LocalViewClient`]
/// for in-process callers and the remote proxy in [`crate::remote`] for
/// callers on the far side of the call boundary.
#[async_trait]
pub trait ViewClient: Send + Sync {
    /// Client identity
    fn client_id(&self) -> &UniqueId;

    /// The owning user
    fn user(&self) -> &UserPrincipal;

    /// Current lifecycle state
    async fn state(&self) -> EngineResult<ViewClientState>;

    /// Attach to a process computing the given definition
    ///
    /// Joins the shared process for (definition, options) unless
    /// `new_process` forces a private one. Attaching while already attached
    /// performs an implicit detach-then-attach.
    async fn attach_to_view_definition(
        &self,
        definition_id: UniqueId,
        execution_options: ViewExecutionOptions,
        new_process: bool,
    ) -> EngineResult<()>;

    /// Attach directly to an existing process by id
    async fn attach_to_process(&self, process_id: UniqueId) -> EngineResult<()>;

    /// Detach from the current process; no-op when detached
    async fn detach(&self) -> EngineResult<()>;

    /// Suspend result delivery to this client
    async fn pause(&self) -> EngineResult<()>;

    /// Resume result delivery
    async fn resume(&self) -> EngineResult<()>;

    /// Force an out-of-schedule recompute on the attached process
    async fn trigger_cycle(&self) -> EngineResult<()>;

    /// The current result delivery mode
    async fn result_mode(&self) -> EngineResult<ViewResultMode>;

    /// How completed cycles are delivered
    async fn set_result_mode(&self, mode: ViewResultMode) -> EngineResult<()>;

    /// The current fragment delivery mode
    async fn fragment_result_mode(&self) -> EngineResult<ViewResultMode>;

    /// How mid-cycle fragments are delivered
    async fn set_fragment_result_mode(&self, mode: ViewResultMode) -> EngineResult<()>;

    /// The current minimum interval between delivered results
    async fn update_period(&self) -> EngineResult<Duration>;

    /// Minimum interval between delivered results; zero delivers every cycle
    async fn set_update_period(&self, period: Duration) -> EngineResult<()>;

    /// Raise or clear the log verbosity floor for a set of outputs
    async fn set_minimum_log_mode(
        &self,
        mode: ExecutionLogMode,
        outputs: BTreeSet<ResultDescriptor>,
    ) -> EngineResult<()>;

    /// Register (or clear) the push-result listener
    ///
    /// Registering the first listener opens the push channel; clearing the
    /// last closes it. Delivery modes shape what flows, not whether the
    /// channel is open.
    async fn set_result_listener(
        &self,
        listener: Option<Arc<dyn ViewResultListener>>,
    ) -> EngineResult<()>;

    /// Whether the attached process has completed; `false` when detached
    async fn is_completed(&self) -> EngineResult<bool>;

    /// The latest completed result, when attached and one exists
    async fn latest_result(&self) -> EngineResult<Option<Arc<ViewResultSnapshot>>>;

    /// The latest compiled definition, when attached and one exists
    async fn latest_compiled_definition(
        &self,
    ) -> EngineResult<Option<Arc<CompiledViewDefinition>>>;

    /// Block until the attached process signals completion
    ///
    /// Returns immediately when completion already happened; the gate is
    /// reset on each attach.
    async fn wait_for_completion(&self) -> EngineResult<()>;

    /// Lease a reference to the latest or a specific cycle
    ///
    /// The caller must release the reference (or let it expire).
    async fn create_cycle_reference(
        &self,
        target: CycleTarget,
    ) -> EngineResult<Box<dyn ViewCycleReference>>;

    /// Terminate this client, detaching first if attached
    async fn shutdown(&self) -> EngineResult<()>;
}

struct Attachment {
    process: Arc<ViewProcess>,
    // Set right after registration; replayed events can arrive before it.
    listener_id: OnceLock<ListenerId>,
    cycle_index: AtomicU64,
}

/// In-process implementation of [`ViewClient`]
pub struct LocalViewClient {
    id: UniqueId,
    user: UserPrincipal,
    processor: Weak<ViewProcessor>,
    weak_self: Weak<LocalViewClient>,
    state: RwLock<ViewClientState>,
    attachment: Mutex<Option<Arc<Attachment>>>,
    listener: Mutex<Option<Arc<dyn ViewResultListener>>>,
    result_mode: RwLock<ViewResultMode>,
    fragment_mode: RwLock<ViewResultMode>,
    update_period: RwLock<Duration>,
    last_delivery: Mutex<Option<Instant>>,
    completed_tx: watch::Sender<bool>,
}

impl fmt::Debug for LocalViewClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalViewClient")
            .field("id", &self.id)
            .field("user", &self.user)
            .finish()
    }
}

impl LocalViewClient {
    pub(crate) fn new(
        id: UniqueId,
        user: UserPrincipal,
        processor: Weak<ViewProcessor>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            id,
            user,
            processor,
            weak_self: weak_self.clone(),
            state: RwLock::new(ViewClientState::Detached),
            attachment: Mutex::new(None),
            listener: Mutex::new(None),
            result_mode: RwLock::new(ViewResultMode::default()),
            fragment_mode: RwLock::new(ViewResultMode::default()),
            // Zero means every completed cycle is delivered.
            update_period: RwLock::new(Duration::ZERO),
            last_delivery: Mutex::new(None),
            completed_tx: watch::Sender::new(true),
        })
    }

    fn processor(&self) -> EngineResult<Arc<ViewProcessor>> {
        self.processor
            .upgrade()
            .ok_or_else(|| Error::invalid_state("view processor has shut down"))
    }

    fn ensure_not_terminated(&self) -> EngineResult<()> {
        if *self.state.read() == ViewClientState::Terminated {
            return Err(Error::invalid_state(format!(
                "view client {} is terminated",
                self.id
            )));
        }
        Ok(())
    }

    fn current_attachment(&self) -> Option<Arc<Attachment>> {
        self.attachment.lock().clone()
    }

    fn attached(&self) -> EngineResult<Arc<Attachment>> {
        self.current_attachment().ok_or_else(|| {
            Error::invalid_state(format!("view client {} is not attached", self.id))
        })
    }

    /// The process this client is attached to
    pub fn attached_process(&self) -> EngineResult<Arc<ViewProcess>> {
        Ok(self.attached()?.process.clone())
    }

    fn bind(&self, process: Arc<ViewProcess>) {
        // Reset the completion gate before listening so a completion racing
        // the attach is never lost.
        self.completed_tx.send_replace(process.is_completed());
        let attachment = Arc::new(Attachment {
            process: process.clone(),
            listener_id: OnceLock::new(),
            cycle_index: AtomicU64::new(0),
        });
        *self.attachment.lock() = Some(attachment.clone());
        *self.state.write() = ViewClientState::Attached;
        // Registration replays the latest compiled definition and result, so
        // the client must already look attached.
        let forwarder = Arc::new(ProcessEventForwarder {
            client: self.weak_self.clone(),
        });
        let _ = attachment.listener_id.set(process.attach_listener(forwarder));
        // A completion landing between the gate reset above and listener
        // registration has no replay; re-check so waiters cannot hang on a
        // process that already finished.
        if process.is_completed() {
            self.completed_tx.send_replace(true);
        }
    }

    async fn unbind(&self) -> EngineResult<()> {
        let attachment = self.attachment.lock().take();
        if let Some(attachment) = attachment {
            if let Some(listener_id) = attachment.listener_id.get() {
                attachment.process.detach_listener(*listener_id);
            }
            if let Ok(processor) = self.processor() {
                processor.release_process_if_idle(&attachment.process);
            }
        }
        *self.state.write() = ViewClientState::Detached;
        self.completed_tx.send_replace(true);
        Ok(())
    }

    // Push-side entry points, called by the forwarder

    fn deliverable(&self) -> bool {
        *self.state.read() == ViewClientState::Attached
    }

    fn on_definition_compiled(&self, compiled: &Arc<CompiledViewDefinition>) {
        if !self.deliverable() {
            return;
        }
        if let Some(listener) = self.listener.lock().clone() {
            listener.view_definition_compiled(compiled);
        }
    }

    fn on_cycle_started(&self, cycle_id: &UniqueId, valuation_time: DateTime<Utc>) {
        if !self.deliverable() {
            return;
        }
        if let Some(listener) = self.listener.lock().clone() {
            listener.cycle_started(cycle_id, valuation_time);
        }
    }

    fn on_cycle_fragment_completed(&self, fragment: &ViewResultSnapshot) {
        if !self.deliverable() {
            return;
        }
        let index = self
            .current_attachment()
            .map(|a| a.cycle_index.load(Ordering::SeqCst))
            .unwrap_or(0);
        if !self.fragment_mode.read().wants_full(index) {
            return;
        }
        if let Some(listener) = self.listener.lock().clone() {
            listener.cycle_fragment_completed(fragment);
        }
    }

    fn on_cycle_completed(
        &self,
        full: &Arc<ViewResultSnapshot>,
        delta: Option<&Arc<ViewResultSnapshot>>,
    ) {
        let Some(attachment) = self.current_attachment() else {
            return;
        };
        let index = attachment.cycle_index.fetch_add(1, Ordering::SeqCst);
        if !self.deliverable() {
            return;
        }
        let mode = *self.result_mode.read();
        let Some(listener) = self.listener.lock().clone() else {
            return;
        };
        let period = *self.update_period.read();
        if !period.is_zero() {
            let mut last = self.last_delivery.lock();
            if let Some(previous) = *last {
                if previous.elapsed() < period {
                    return;
                }
            }
            *last = Some(Instant::now());
        }
        let full_out = mode.wants_full(index).then_some(full);
        let delta_out = if mode.wants_delta(index) { delta } else { None };
        if let Some(full) = full_out {
            listener.cycle_completed(full, delta_out);
        } else if let Some(delta) = delta_out {
            // Delta-only delivery reuses the completed callback with the
            // delta in the full slot absent.
            listener.cycle_completed(delta, None);
        }
    }

    fn on_process_completed(&self) {
        self.completed_tx.send_replace(true);
        if let Some(listener) = self.listener.lock().clone() {
            listener.process_completed();
        }
    }

    fn on_process_terminated(&self) {
        self.completed_tx.send_replace(true);
        if let Some(listener) = self.listener.lock().clone() {
            listener.process_terminated();
        }
    }
}

#[async_trait]
impl ViewClient for LocalViewClient {
    fn client_id(&self) -> &UniqueId {
        &self.id
    }

    fn user(&self) -> &UserPrincipal {
        &self.user
    }

    async fn state(&self) -> EngineResult<ViewClientState> {
        Ok(*self.state.read())
    }

    async fn attach_to_view_definition(
        &self,
        definition_id: UniqueId,
        execution_options: ViewExecutionOptions,
        new_process: bool,
    ) -> EngineResult<()> {
        self.ensure_not_terminated()?;
        if definition_id.value.is_empty() {
            return Err(Error::invalid_state("a view definition id is required"));
        }
        // Implicit detach-then-attach when already attached.
        self.unbind().await?;
        let process = self
            .processor()?
            .attach_process(&definition_id, execution_options, new_process)
            .await?;
        debug!(client = %self.id, process = %process.process_id(), "client attached");
        self.bind(process);
        Ok(())
    }

    async fn attach_to_process(&self, process_id: UniqueId) -> EngineResult<()> {
        self.ensure_not_terminated()?;
        let process = self.processor()?.view_process(&process_id)?;
        self.unbind().await?;
        debug!(client = %self.id, process = %process_id, "client attached to existing process");
        self.bind(process);
        Ok(())
    }

    async fn detach(&self) -> EngineResult<()> {
        self.ensure_not_terminated()?;
        self.unbind().await
    }

    async fn pause(&self) -> EngineResult<()> {
        self.attached()?;
        *self.state.write() = ViewClientState::Paused;
        Ok(())
    }

    async fn resume(&self) -> EngineResult<()> {
        self.attached()?;
        *self.state.write() = ViewClientState::Attached;
        Ok(())
    }

    async fn trigger_cycle(&self) -> EngineResult<()> {
        self.attached()?.process.trigger_cycle();
        Ok(())
    }

    async fn result_mode(&self) -> EngineResult<ViewResultMode> {
        Ok(*self.result_mode.read())
    }

    async fn set_result_mode(&self, mode: ViewResultMode) -> EngineResult<()> {
        *self.result_mode.write() = mode;
        Ok(())
    }

    async fn fragment_result_mode(&self) -> EngineResult<ViewResultMode> {
        Ok(*self.fragment_mode.read())
    }

    async fn set_fragment_result_mode(&self, mode: ViewResultMode) -> EngineResult<()> {
        *self.fragment_mode.write() = mode;
        Ok(())
    }

    async fn update_period(&self) -> EngineResult<Duration> {
        Ok(*self.update_period.read())
    }

    async fn set_update_period(&self, period: Duration) -> EngineResult<()> {
        *self.update_period.write() = period;
        Ok(())
    }

    async fn set_minimum_log_mode(
        &self,
        mode: ExecutionLogMode,
        outputs: BTreeSet<ResultDescriptor>,
    ) -> EngineResult<()> {
        self.attached()?.process.set_minimum_log_mode(mode, outputs);
        Ok(())
    }

    async fn set_result_listener(
        &self,
        listener: Option<Arc<dyn ViewResultListener>>,
    ) -> EngineResult<()> {
        self.ensure_not_terminated()?;
        *self.listener.lock() = listener;
        Ok(())
    }

    async fn is_completed(&self) -> EngineResult<bool> {
        Ok(self
            .current_attachment()
            .map(|a| a.process.is_completed())
            .unwrap_or(false))
    }

    async fn latest_result(&self) -> EngineResult<Option<Arc<ViewResultSnapshot>>> {
        Ok(self
            .current_attachment()
            .and_then(|a| a.process.latest_result()))
    }

    async fn latest_compiled_definition(
        &self,
    ) -> EngineResult<Option<Arc<CompiledViewDefinition>>> {
        Ok(self
            .current_attachment()
            .and_then(|a| a.process.latest_compiled_definition()))
    }

    async fn wait_for_completion(&self) -> EngineResult<()> {
        let mut completed = self.completed_tx.subscribe();
        // Completion state is checked before blocking, so a process that
        // already finished returns immediately.
        while !*completed.borrow_and_update() {
            completed
                .changed()
                .await
                .map_err(|_| Error::invalid_state("view client gone while waiting"))?;
        }
        Ok(())
    }

    async fn create_cycle_reference(
        &self,
        target: CycleTarget,
    ) -> EngineResult<Box<dyn ViewCycleReference>> {
        let attachment = self.attached()?;
        let processor = self.processor()?;
        let cycle_id = match target {
            CycleTarget::Latest => attachment.process.latest_cycle_id().ok_or_else(|| {
                Error::not_found(format!(
                    "process {} has no completed cycle",
                    attachment.process.process_id()
                ))
            })?,
            CycleTarget::ById(id) => id,
        };
        let manager = processor.cycle_manager().await;
        let lease = LocalResourceLease::acquire(
            manager,
            &cycle_id,
            processor.config().cycle_reference_timeout,
        )?;
        Ok(Box::new(LocalCycleReference { lease }))
    }

    async fn shutdown(&self) -> EngineResult<()> {
        if *self.state.read() == ViewClientState::Terminated {
            return Ok(());
        }
        self.unbind().await?;
        *self.state.write() = ViewClientState::Terminated;
        if let Ok(processor) = self.processor() {
            processor.forget_client(&self.id);
        }
        if let Some(listener) = self.listener.lock().take() {
            listener.client_shutdown("client shut down");
        }
        Ok(())
    }
}

/// Forwards process events into the owning client
struct ProcessEventForwarder {
    client: Weak<LocalViewClient>,
}

impl ViewResultListener for ProcessEventForwarder {
    fn view_definition_compiled(&self, compiled: &Arc<CompiledViewDefinition>) {
        if let Some(client) = self.client.upgrade() {
            client.on_definition_compiled(compiled);
        }
    }

    fn cycle_started(&self, cycle_id: &UniqueId, valuation_time: DateTime<Utc>) {
        if let Some(client) = self.client.upgrade() {
            client.on_cycle_started(cycle_id, valuation_time);
        }
    }

    fn cycle_fragment_completed(&self, fragment: &ViewResultSnapshot) {
        if let Some(client) = self.client.upgrade() {
            client.on_cycle_fragment_completed(fragment);
        }
    }

    fn cycle_completed(
        &self,
        full: &Arc<ViewResultSnapshot>,
        delta: Option<&Arc<ViewResultSnapshot>>,
    ) {
        if let Some(client) = self.client.upgrade() {
            client.on_cycle_completed(full, delta);
        }
    }

    fn process_completed(&self) {
        if let Some(client) = self.client.upgrade() {
            client.on_process_completed();
        }
    }

    fn process_terminated(&self) {
        if let Some(client) = self.client.upgrade() {
            client.on_process_terminated();
        }
    }
}

/// In-process leased cycle reference
struct LocalCycleReference {
    lease: LocalResourceLease<ViewCycle>,
}

#[async_trait]
impl ViewCycleReference for LocalCycleReference {
    async fn get(&self) -> EngineResult<Arc<dyn ViewCycleAccess>> {
        let cycle = self.lease.get()?;
        Ok(Arc::new(LocalViewCycleAccess::new(cycle)))
    }

    async fn release(&self) {
        self.lease.release();
    }
}
