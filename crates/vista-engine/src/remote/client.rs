//! Client-side proxy of a view client session

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use vista_depgraph::CompiledViewDefinition;
use vista_values::{ResultDescriptor, UniqueId};

use crate::client::{CycleTarget, UserPrincipal, ViewClient, ViewClientState};
use crate::config::EngineConfig;
use crate::cycle::ViewCycleReference;
use crate::error::{EngineResult, Error};
use crate::execution::{ExecutionLogMode, ViewExecutionOptions, ViewResultMode};
use crate::listener::ViewResultListener;
use crate::remote::cycle::RemoteCycleReference;
use crate::remote::messages::{decode, ClientOp, EngineNotification, EngineRequest, EngineResponse};
use crate::remote::transport::{roundtrip, EngineTransport};
use crate::result_model::ViewResultSnapshot;

const COMPLETION_POLL: Duration = Duration::from_millis(100);

/// Proxy of one server-side client session
///
/// Keeps the server-side registration alive with its own heartbeat task.
/// The push pump only runs while a listener is registered; pump startup
/// declares listener demand on the server, which opens the push channel.
pub struct RemoteViewClient {
    id: UniqueId,
    user: UserPrincipal,
    transport: Arc<dyn EngineTransport>,
    cycle_reference_timeout: Duration,
    listener: Arc<Mutex<Option<Arc<dyn ViewResultListener>>>>,
    pump_cancel: Mutex<Option<CancellationToken>>,
    heartbeat_cancel: CancellationToken,
    terminated: AtomicBool,
}

impl fmt::Debug for RemoteViewClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteViewClient")
            .field("id", &self.id)
            .field("user", &self.user)
            .field("terminated", &self.terminated)
            .finish()
    }
}

impl RemoteViewClient {
    pub(super) fn new(
        id: UniqueId,
        user: UserPrincipal,
        transport: Arc<dyn EngineTransport>,
        config: &EngineConfig,
    ) -> Arc<Self> {
        let heartbeat_cancel = CancellationToken::new();
        let client = Arc::new(Self {
            id: id.clone(),
            user,
            transport: transport.clone(),
            cycle_reference_timeout: config.cycle_reference_timeout,
            listener: Arc::new(Mutex::new(None)),
            pump_cancel: Mutex::new(None),
            heartbeat_cancel: heartbeat_cancel.clone(),
            terminated: AtomicBool::new(false),
        });

        // Half the registration timeout guarantees a renewal per window.
        let period = config.client_registration_timeout / 2;
        tokio::spawn(async move {
            let mut beat = interval(period);
            beat.set_missed_tick_behavior(MissedTickBehavior::Skip);
            beat.tick().await;
            loop {
                tokio::select! {
                    _ = heartbeat_cancel.cancelled() => break,
                    _ = beat.tick() => {}
                }
                let request = EngineRequest::ClientHeartbeat {
                    client_id: id.clone(),
                };
                if let Err(err) = roundtrip(&transport, &request).await {
                    warn!(client = %id, %err, "registration heartbeat failed; stopping renewals");
                    break;
                }
            }
        });

        client
    }

    async fn call(&self, op: ClientOp) -> EngineResult<EngineResponse> {
        roundtrip(
            &self.transport,
            &EngineRequest::Client {
                client_id: self.id.clone(),
                op,
            },
        )
        .await
    }

    async fn call_ok(&self, op: ClientOp) -> EngineResult<()> {
        match self.call(op).await? {
            EngineResponse::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn start_pump(&self) -> EngineResult<()> {
        if self.pump_cancel.lock().is_some() {
            return Ok(());
        }
        self.call_ok(ClientOp::SetListenerDemand(true)).await?;
        let mut stream = self.transport.notifications(&self.id).await?;
        let cancel = CancellationToken::new();
        *self.pump_cancel.lock() = Some(cancel.clone());

        let listener = self.listener.clone();
        let client_id = self.id.clone();
        let heartbeat_cancel = self.heartbeat_cancel.clone();
        tokio::spawn(async move {
            loop {
                let bytes = tokio::select! {
                    _ = cancel.cancelled() => return,
                    next = stream.next() => match next {
                        Some(bytes) => bytes,
                        // Stream end without a local cancel is a dead
                        // transport; the session cannot recover, so stop
                        // renewing its registration too.
                        None => {
                            warn!(client = %client_id, "push stream ended; synthesizing shutdown");
                            heartbeat_cancel.cancel();
                            if let Some(listener) = listener.lock().take() {
                                listener.client_shutdown("push transport failed");
                            }
                            return;
                        }
                    },
                };
                let notification = match decode::<EngineNotification>(&bytes) {
                    Ok(notification) => notification,
                    Err(err) => {
                        warn!(client = %client_id, %err, "dropping undecodable notification");
                        continue;
                    }
                };
                let Some(current) = listener.lock().clone() else {
                    continue;
                };
                match notification {
                    EngineNotification::ViewDefinitionCompiled { compiled } => {
                        current.view_definition_compiled(&compiled);
                    }
                    EngineNotification::CycleStarted {
                        cycle_id,
                        valuation_time,
                    } => current.cycle_started(&cycle_id, valuation_time),
                    EngineNotification::CycleFragmentCompleted { fragment } => {
                        current.cycle_fragment_completed(&fragment);
                    }
                    EngineNotification::CycleCompleted { full, delta } => {
                        let delta = delta.map(Arc::new);
                        current.cycle_completed(&Arc::new(full), delta.as_ref());
                    }
                    EngineNotification::ProcessCompleted => current.process_completed(),
                    EngineNotification::ProcessTerminated => current.process_terminated(),
                    EngineNotification::ClientShutdown { reason } => {
                        heartbeat_cancel.cancel();
                        listener.lock().take();
                        current.client_shutdown(&reason);
                        return;
                    }
                }
            }
        });
        Ok(())
    }

    fn stop_pump(&self) {
        if let Some(cancel) = self.pump_cancel.lock().take() {
            cancel.cancel();
        }
    }
}

fn unexpected(response: &EngineResponse) -> Error {
    Error::internal(format!("unexpected engine response: {response:?}"))
}

#[async_trait]
impl ViewClient for RemoteViewClient {
    fn client_id(&self) -> &UniqueId {
        &self.id
    }

    fn user(&self) -> &UserPrincipal {
        &self.user
    }

    async fn state(&self) -> EngineResult<ViewClientState> {
        match self.call(ClientOp::State).await? {
            EngineResponse::ClientState(state) => Ok(state),
            other => Err(unexpected(&other)),
        }
    }

    async fn attach_to_view_definition(
        &self,
        definition_id: UniqueId,
        execution_options: ViewExecutionOptions,
        new_process: bool,
    ) -> EngineResult<()> {
        self.call_ok(ClientOp::AttachToDefinition {
            definition_id,
            execution_options,
            private: new_process,
        })
        .await
    }

    async fn attach_to_process(&self, process_id: UniqueId) -> EngineResult<()> {
        self.call_ok(ClientOp::AttachToProcess { process_id }).await
    }

    async fn detach(&self) -> EngineResult<()> {
        self.call_ok(ClientOp::Detach).await
    }

    async fn pause(&self) -> EngineResult<()> {
        self.call_ok(ClientOp::Pause).await
    }

    async fn resume(&self) -> EngineResult<()> {
        self.call_ok(ClientOp::Resume).await
    }

    async fn trigger_cycle(&self) -> EngineResult<()> {
        self.call_ok(ClientOp::TriggerCycle).await
    }

    async fn result_mode(&self) -> EngineResult<ViewResultMode> {
        match self.call(ClientOp::ResultMode).await? {
            EngineResponse::ResultMode(mode) => Ok(mode),
            other => Err(unexpected(&other)),
        }
    }

    async fn set_result_mode(&self, mode: ViewResultMode) -> EngineResult<()> {
        self.call_ok(ClientOp::SetResultMode(mode)).await
    }

    async fn fragment_result_mode(&self) -> EngineResult<ViewResultMode> {
        match self.call(ClientOp::FragmentResultMode).await? {
            EngineResponse::ResultMode(mode) => Ok(mode),
            other => Err(unexpected(&other)),
        }
    }

    async fn set_fragment_result_mode(&self, mode: ViewResultMode) -> EngineResult<()> {
        self.call_ok(ClientOp::SetFragmentResultMode(mode)).await
    }

    async fn update_period(&self) -> EngineResult<Duration> {
        match self.call(ClientOp::UpdatePeriod).await? {
            EngineResponse::UpdatePeriod(period) => Ok(period),
            other => Err(unexpected(&other)),
        }
    }

    async fn set_update_period(&self, period: Duration) -> EngineResult<()> {
        self.call_ok(ClientOp::SetUpdatePeriod(period)).await
    }

    async fn set_minimum_log_mode(
        &self,
        mode: ExecutionLogMode,
        outputs: BTreeSet<ResultDescriptor>,
    ) -> EngineResult<()> {
        self.call_ok(ClientOp::SetMinimumLogMode { mode, outputs })
            .await
    }

    async fn set_result_listener(
        &self,
        listener: Option<Arc<dyn ViewResultListener>>,
    ) -> EngineResult<()> {
        match listener {
            Some(listener) => {
                *self.listener.lock() = Some(listener);
                self.start_pump().await
            }
            None => {
                self.stop_pump();
                *self.listener.lock() = None;
                self.call_ok(ClientOp::SetListenerDemand(false)).await
            }
        }
    }

    async fn is_completed(&self) -> EngineResult<bool> {
        match self.call(ClientOp::IsCompleted).await? {
            EngineResponse::Completed(completed) => Ok(completed),
            other => Err(unexpected(&other)),
        }
    }

    async fn latest_result(&self) -> EngineResult<Option<Arc<ViewResultSnapshot>>> {
        match self.call(ClientOp::LatestResult).await? {
            EngineResponse::LatestResult(result) => Ok(result.map(Arc::new)),
            other => Err(unexpected(&other)),
        }
    }

    async fn latest_compiled_definition(
        &self,
    ) -> EngineResult<Option<Arc<CompiledViewDefinition>>> {
        match self.call(ClientOp::LatestCompiledDefinition).await? {
            EngineResponse::LatestCompiledDefinition(compiled) => Ok(compiled),
            other => Err(unexpected(&other)),
        }
    }

    async fn wait_for_completion(&self) -> EngineResult<()> {
        // Polling keeps completion independent of the push channel, which
        // may not be open.
        loop {
            match self.state().await? {
                ViewClientState::Detached | ViewClientState::Terminated => return Ok(()),
                _ => {}
            }
            if self.is_completed().await? {
                return Ok(());
            }
            tokio::time::sleep(COMPLETION_POLL).await;
        }
    }

    async fn create_cycle_reference(
        &self,
        target: CycleTarget,
    ) -> EngineResult<Box<dyn ViewCycleReference>> {
        match self.call(ClientOp::CreateCycleReference(target)).await? {
            EngineResponse::CycleReference { reference_id } => {
                debug!(client = %self.id, reference = %reference_id, "cycle reference leased");
                Ok(Box::new(RemoteCycleReference::new(
                    self.transport.clone(),
                    reference_id,
                    self.cycle_reference_timeout,
                )))
            }
            other => Err(unexpected(&other)),
        }
    }

    async fn shutdown(&self) -> EngineResult<()> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.heartbeat_cancel.cancel();
        self.stop_pump();
        if let Err(err) = self.call_ok(ClientOp::Shutdown).await {
            warn!(client = %self.id, %err, "remote shutdown did not complete cleanly");
        }
        if let Some(listener) = self.listener.lock().take() {
            listener.client_shutdown("client shut down");
        }
        Ok(())
    }
}

impl Drop for RemoteViewClient {
    fn drop(&mut self) {
        self.heartbeat_cancel.cancel();
        self.stop_pump();
    }
}
