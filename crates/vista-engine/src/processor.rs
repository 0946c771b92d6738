//! Top-level entry point: processes, clients, shared managers

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vista_leases::{spawn_expiry_sweep, EngineResourceManager};
use vista_values::UniqueId;

use crate::client::{LocalViewClient, UserPrincipal, ViewClient};
use crate::config::EngineConfig;
use crate::cycle::ViewCycle;
use crate::error::{EngineResult, Error};
use crate::execution::ViewExecutionOptions;
use crate::market_data::{MarketDataSnapshot, NamedMarketDataSpecs};
use crate::process::{ViewProcess, ViewProcessState};

/// Key identifying a shareable process: same definition, same options
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ProcessDescription {
    definition_id: UniqueId,
    execution_options: ViewExecutionOptions,
}

struct ClientRegistration {
    client: Arc<LocalViewClient>,
    last_access: Mutex<Instant>,
}

/// The access layer's front door
///
/// Owns every view process and client session, the shared cycle resource
/// manager, and the catalogue of named market data specifications. Clients
/// attaching with identical (definition, options) pairs share one process
/// unless they demand a private one.
pub struct ViewProcessor {
    config: EngineConfig,
    processes: DashMap<UniqueId, Arc<ViewProcess>>,
    shared: DashMap<ProcessDescription, UniqueId>,
    clients: DashMap<UniqueId, ClientRegistration>,
    next_process_id: AtomicU64,
    next_client_id: AtomicU64,
    cycle_manager: OnceCell<Arc<EngineResourceManager<ViewCycle>>>,
    market_data_specs: NamedMarketDataSpecs,
    cancel: CancellationToken,
    weak_self: Weak<ViewProcessor>,
}

impl ViewProcessor {
    /// Create a processor and start its client registration sweep
    pub fn new(config: EngineConfig, market_data_specs: NamedMarketDataSpecs) -> Arc<Self> {
        let processor = Arc::new_cyclic(|weak_self| Self {
            config,
            processes: DashMap::new(),
            shared: DashMap::new(),
            clients: DashMap::new(),
            next_process_id: AtomicU64::new(1),
            next_client_id: AtomicU64::new(1),
            cycle_manager: OnceCell::new(),
            market_data_specs,
            cancel: CancellationToken::new(),
            weak_self: weak_self.clone(),
        });
        info!(name = %processor.config.name, "view processor started");
        processor.spawn_client_sweep();
        processor
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The named market data specifications this engine knows about
    pub fn market_data_specs(&self) -> &NamedMarketDataSpecs {
        &self.market_data_specs
    }

    /// The shared cycle resource manager, created on first use
    ///
    /// Lazy so an engine that never leases a cycle never runs a sweep task.
    pub async fn cycle_manager(&self) -> Arc<EngineResourceManager<ViewCycle>> {
        self.cycle_manager
            .get_or_init(|| async {
                let manager = Arc::new(EngineResourceManager::new());
                spawn_expiry_sweep(
                    manager.clone(),
                    self.config.cycle_reference_timeout,
                    self.cancel.child_token(),
                );
                manager
            })
            .await
            .clone()
    }

    // Client sessions

    /// Create a new client session for a user
    pub fn create_view_client(&self, user: UserPrincipal) -> Arc<LocalViewClient> {
        let id = UniqueId::new(
            "ViewClient",
            self.next_client_id.fetch_add(1, Ordering::Relaxed).to_string(),
        );
        let client = LocalViewClient::new(id.clone(), user, self.weak_self.clone());
        self.clients.insert(
            id.clone(),
            ClientRegistration {
                client: client.clone(),
                last_access: Mutex::new(Instant::now()),
            },
        );
        debug!(client = %id, "view client created");
        client
    }

    /// Look up a client by id, refreshing its registration
    ///
    /// A client whose registration expired is gone; callers must create a
    /// new session.
    pub fn view_client(&self, client_id: &UniqueId) -> EngineResult<Arc<LocalViewClient>> {
        let registration = self
            .clients
            .get(client_id)
            .ok_or_else(|| Error::not_found(format!("view client {client_id}")))?;
        *registration.last_access.lock() = Instant::now();
        Ok(registration.client.clone())
    }

    /// Keep a client registration alive without using it
    pub fn client_heartbeat(&self, client_id: &UniqueId) -> EngineResult<()> {
        self.view_client(client_id).map(|_| ())
    }

    /// Number of live client registrations
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub(crate) fn forget_client(&self, client_id: &UniqueId) {
        self.clients.remove(client_id);
    }

    // Processes

    /// Look up a process by id
    pub fn view_process(&self, process_id: &UniqueId) -> EngineResult<Arc<ViewProcess>> {
        self.processes
            .get(process_id)
            .map(|p| p.clone())
            .ok_or_else(|| Error::not_found(format!("view process {process_id}")))
    }

    /// All live processes
    pub fn view_processes(&self) -> Vec<Arc<ViewProcess>> {
        self.processes.iter().map(|p| p.clone()).collect()
    }

    /// Find or create the process a client should attach to
    ///
    /// Identical (definition, options) pairs share one process unless
    /// `private` is set, which always creates a fresh one outside the
    /// shared map.
    pub async fn attach_process(
        &self,
        definition_id: &UniqueId,
        execution_options: ViewExecutionOptions,
        private: bool,
    ) -> EngineResult<Arc<ViewProcess>> {
        if !private {
            let description = ProcessDescription {
                definition_id: definition_id.clone(),
                execution_options: execution_options.clone(),
            };
            if let Some(existing) = self.shared.get(&description) {
                if let Ok(process) = self.view_process(&existing) {
                    if process.state() != ViewProcessState::Terminated {
                        debug!(process = %process.process_id(), "joining shared view process");
                        return Ok(process);
                    }
                }
            }
            let process = self
                .spawn_process(definition_id.clone(), execution_options)
                .await;
            self.shared.insert(description, process.process_id().clone());
            return Ok(process);
        }
        Ok(self
            .spawn_process(definition_id.clone(), execution_options)
            .await)
    }

    async fn spawn_process(
        &self,
        definition_id: UniqueId,
        execution_options: ViewExecutionOptions,
    ) -> Arc<ViewProcess> {
        let id = UniqueId::new(
            "ViewProcess",
            self.next_process_id.fetch_add(1, Ordering::Relaxed).to_string(),
        );
        let process = ViewProcess::new(
            id.clone(),
            definition_id,
            execution_options,
            self.cycle_manager().await,
            self.config.retained_cycles,
        );
        self.processes.insert(id, process.clone());
        process
    }

    /// Shut a process down when its last listener detached
    pub(crate) fn release_process_if_idle(&self, process: &Arc<ViewProcess>) {
        if process.listener_count() > 0 {
            return;
        }
        debug!(process = %process.process_id(), "last listener detached, releasing process");
        self.remove_process(process);
    }

    /// Terminate a process regardless of remaining listeners
    pub fn shutdown_view_process(&self, process_id: &UniqueId) -> EngineResult<()> {
        let process = self.view_process(process_id)?;
        self.remove_process(&process);
        Ok(())
    }

    fn remove_process(&self, process: &Arc<ViewProcess>) {
        process.shutdown();
        self.processes.remove(process.process_id());
        self.shared.retain(|_, id| id != process.process_id());
    }

    // Snapshots

    /// Capture the market data a cycle executed against, overrides applied
    pub fn create_market_data_snapshot(
        &self,
        cycle: &ViewCycle,
    ) -> EngineResult<MarketDataSnapshot> {
        let compiled = cycle.compiled_view_definition();
        let mut values = std::collections::BTreeMap::new();
        for name in compiled.config_names() {
            let Some(config) = compiled.config(name) else {
                continue;
            };
            let Some(results) = cycle.result_model().config(name) else {
                continue;
            };
            for requirement in config.graph.market_data_requirements() {
                if let Some(value) = results.get(&requirement) {
                    values.insert(requirement, value.clone());
                }
            }
        }
        // Overrides in force now shadow what the cycle actually consumed.
        if let Ok(process) = self.view_process(cycle.process_id()) {
            for (descriptor, value) in process.live_data_override_injector().snapshot() {
                values.insert(descriptor, value);
            }
        }
        Ok(MarketDataSnapshot {
            id: UniqueId::new("MarketDataSnapshot", Uuid::new_v4().to_string()),
            valuation_time: cycle.execution_options().valuation_time,
            values,
        })
    }

    // Lifecycle

    /// Shut everything down: processes, clients, background sweeps
    pub async fn shutdown(&self) {
        info!(name = %self.config.name, "view processor shutting down");
        self.cancel.cancel();
        let clients: Vec<_> = self.clients.iter().map(|c| c.client.clone()).collect();
        for client in clients {
            if let Err(error) = client.shutdown().await {
                warn!(client = %client.client_id(), %error, "client shutdown failed");
            }
        }
        self.clients.clear();
        let processes = self.view_processes();
        for process in processes {
            self.remove_process(&process);
        }
    }

    fn spawn_client_sweep(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let timeout = self.config.client_registration_timeout;
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            let mut sweep = interval(timeout);
            sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
            sweep.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sweep.tick() => {}
                }
                let Some(processor) = weak.upgrade() else {
                    break;
                };
                let Some(cutoff) = Instant::now().checked_sub(timeout) else {
                    continue;
                };
                let expired: Vec<_> = processor
                    .clients
                    .iter()
                    .filter(|c| *c.last_access.lock() < cutoff)
                    .map(|c| c.client.clone())
                    .collect();
                for client in expired {
                    warn!(client = %client.client_id(), "client registration expired");
                    processor.clients.remove(client.client_id());
                    if let Err(error) = client.shutdown().await {
                        warn!(client = %client.client_id(), %error, "expired client shutdown failed");
                    }
                }
            }
        });
    }
}

impl Drop for ViewProcessor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
