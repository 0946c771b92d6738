//! Client-facing behavior of the local engine

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::Utc;
use tokio::sync::mpsc;
use vista_depgraph::{CompiledCalculationConfig, CompiledViewDefinition, DependencyGraphBuilder};
use vista_engine::{
    CycleExecutionOptions, EngineConfig, MarketDataSpecification, NamedMarketDataSpecs,
    ResultModel, UserPrincipal, ViewClient, ViewCycle, ViewExecutionOptions, ViewProcess,
    ViewProcessor, ViewResultListener, ViewResultMode, ViewResultSnapshot,
};
use vista_values::{
    ComputationTargetRef, ResultDescriptor, TargetKind, UniqueId, ValueProperties,
    VersionCorrection,
};

#[derive(Debug)]
enum Event {
    Compiled,
    CycleCompleted { pv: serde_json::Value, has_delta: bool },
    ProcessCompleted,
    Shutdown(String),
}

struct ChannelListener {
    tx: mpsc::UnboundedSender<Event>,
}

impl ViewResultListener for ChannelListener {
    fn view_definition_compiled(&self, _compiled: &Arc<CompiledViewDefinition>) {
        let _ = self.tx.send(Event::Compiled);
    }

    fn cycle_completed(
        &self,
        full: &Arc<ViewResultSnapshot>,
        delta: Option<&Arc<ViewResultSnapshot>>,
    ) {
        let pv = full.values["Default"]
            .get(&desc("Pv"))
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let _ = self.tx.send(Event::CycleCompleted {
            pv,
            has_delta: delta.is_some(),
        });
    }

    fn process_completed(&self) {
        let _ = self.tx.send(Event::ProcessCompleted);
    }

    fn client_shutdown(&self, reason: &str) {
        let _ = self.tx.send(Event::Shutdown(reason.to_string()));
    }
}

fn desc(name: &str) -> ResultDescriptor {
    ResultDescriptor::new(
        name,
        ComputationTargetRef::new(TargetKind::Position, UniqueId::new("Pos", "1")),
        ValueProperties::none(),
    )
}

fn compiled() -> Arc<CompiledViewDefinition> {
    let mut builder = DependencyGraphBuilder::new("Default");
    builder
        .add_node("Discounting", vec![desc("Quote")], vec![desc("Pv")])
        .unwrap();
    Arc::new(CompiledViewDefinition::new(
        UniqueId::new("ViewDef", "equities"),
        None,
        [CompiledCalculationConfig::new(builder.build())],
        VersionCorrection::LATEST,
    ))
}

fn live() -> ViewExecutionOptions {
    ViewExecutionOptions::live(MarketDataSpecification::Live {
        provider: "sim".to_string(),
    })
}

fn run_cycle(process: &Arc<ViewProcess>, pv: f64) -> Arc<ViewCycle> {
    let mut model = ResultModel::new();
    model.insert("Default", desc("Pv"), serde_json::json!(pv), true);
    let cycle = ViewCycle::executed(
        process.process_id().clone(),
        "equities",
        CycleExecutionOptions {
            valuation_time: Utc::now(),
            market_data: MarketDataSpecification::Live {
                provider: "sim".to_string(),
            },
            version_correction: VersionCorrection::LATEST,
        },
        compiled(),
        model,
        Duration::from_millis(5),
    );
    process.cycle_completed(cycle.clone());
    cycle
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("no event within a second")
        .expect("event channel closed")
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[tokio::test]
async fn wait_for_completion_returns_immediately_when_already_complete() {
    init_tracing();
    let processor = ViewProcessor::new(EngineConfig::default(), NamedMarketDataSpecs::default());
    let client = processor.create_view_client(UserPrincipal::local("alice"));
    client
        .attach_to_view_definition(UniqueId::new("ViewDef", "v"), live(), false)
        .await
        .unwrap();

    let process = processor.view_processes().pop().unwrap();
    process.process_completed();

    // Already complete: the wait must not block.
    tokio::time::timeout(Duration::from_millis(50), client.wait_for_completion())
        .await
        .expect("wait_for_completion blocked on a completed process")
        .unwrap();
    assert!(client.is_completed().await.unwrap());
}

#[tokio::test]
async fn wait_for_completion_wakes_when_the_process_finishes() {
    init_tracing();
    let processor = ViewProcessor::new(EngineConfig::default(), NamedMarketDataSpecs::default());
    let client = processor.create_view_client(UserPrincipal::local("alice"));
    client
        .attach_to_view_definition(UniqueId::new("ViewDef", "v"), live(), false)
        .await
        .unwrap();

    let waiter = {
        let client = client.clone();
        tokio::spawn(async move { client.wait_for_completion().await })
    };
    tokio::task::yield_now().await;

    let process = processor.view_processes().pop().unwrap();
    process.process_completed();

    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter never woke")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn joining_a_finished_process_does_not_block_waiters() {
    init_tracing();
    let processor = ViewProcessor::new(EngineConfig::default(), NamedMarketDataSpecs::default());
    let a = processor.create_view_client(UserPrincipal::local("alice"));
    a.attach_to_view_definition(UniqueId::new("ViewDef", "v"), live(), false)
        .await
        .unwrap();
    let process = processor.view_processes().pop().unwrap();
    process.process_completed();

    // Listener registration replays compiled state and results but never a
    // completion, so the attach path itself must close the gate.
    let b = processor.create_view_client(UserPrincipal::local("bob"));
    b.attach_to_process(process.process_id().clone())
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_millis(50), b.wait_for_completion())
        .await
        .expect("wait_for_completion blocked after joining a finished process")
        .unwrap();
    assert!(b.is_completed().await.unwrap());
}

#[tokio::test]
async fn attaching_while_attached_swaps_processes() {
    init_tracing();
    let processor = ViewProcessor::new(EngineConfig::default(), NamedMarketDataSpecs::default());
    let client = processor.create_view_client(UserPrincipal::local("alice"));

    client
        .attach_to_view_definition(UniqueId::new("ViewDef", "first"), live(), false)
        .await
        .unwrap();
    client
        .attach_to_view_definition(UniqueId::new("ViewDef", "second"), live(), false)
        .await
        .unwrap();

    // The first process lost its only listener and was released.
    let processes = processor.view_processes();
    assert_eq!(processes.len(), 1);
    assert_eq!(processes[0].definition_id().value, "second");
}

#[tokio::test]
async fn late_listener_sees_current_state_immediately() {
    init_tracing();
    let processor = ViewProcessor::new(EngineConfig::default(), NamedMarketDataSpecs::default());
    let client = processor.create_view_client(UserPrincipal::local("alice"));
    client
        .attach_to_view_definition(UniqueId::new("ViewDef", "v"), live(), false)
        .await
        .unwrap();

    let process = processor.view_processes().pop().unwrap();
    process.definition_compiled(compiled());
    run_cycle(&process, 100.0);

    // Another client joining the shared process replays compiled + latest
    // result through its fresh listener.
    let joiner = processor.create_view_client(UserPrincipal::local("bob"));
    let (tx, mut rx) = mpsc::unbounded_channel();
    joiner
        .set_result_listener(Some(Arc::new(ChannelListener { tx })))
        .await
        .unwrap();
    joiner
        .attach_to_view_definition(UniqueId::new("ViewDef", "v"), live(), false)
        .await
        .unwrap();

    assert_matches!(recv(&mut rx).await, Event::Compiled);
    match recv(&mut rx).await {
        Event::CycleCompleted { pv, .. } => assert_eq!(pv, serde_json::json!(100.0)),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn full_then_delta_mode_delivers_deltas_after_the_first_cycle() {
    init_tracing();
    let processor = ViewProcessor::new(EngineConfig::default(), NamedMarketDataSpecs::default());
    let client = processor.create_view_client(UserPrincipal::local("alice"));
    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .set_result_listener(Some(Arc::new(ChannelListener { tx })))
        .await
        .unwrap();
    client.set_result_mode(ViewResultMode::Both).await.unwrap();
    client
        .attach_to_view_definition(UniqueId::new("ViewDef", "v"), live(), false)
        .await
        .unwrap();

    let process = processor.view_processes().pop().unwrap();
    run_cycle(&process, 100.0);
    run_cycle(&process, 101.0);

    match recv(&mut rx).await {
        Event::CycleCompleted { has_delta, .. } => assert!(!has_delta),
        other => panic!("unexpected event: {other:?}"),
    }
    match recv(&mut rx).await {
        Event::CycleCompleted { pv, has_delta } => {
            assert_eq!(pv, serde_json::json!(101.0));
            assert!(has_delta);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn paused_client_misses_deliveries_until_resumed() {
    init_tracing();
    let processor = ViewProcessor::new(EngineConfig::default(), NamedMarketDataSpecs::default());
    let client = processor.create_view_client(UserPrincipal::local("alice"));
    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .set_result_listener(Some(Arc::new(ChannelListener { tx })))
        .await
        .unwrap();
    client
        .attach_to_view_definition(UniqueId::new("ViewDef", "v"), live(), false)
        .await
        .unwrap();
    let process = processor.view_processes().pop().unwrap();

    client.pause().await.unwrap();
    run_cycle(&process, 100.0);
    client.resume().await.unwrap();
    run_cycle(&process, 200.0);

    // Only the post-resume cycle arrives.
    match recv(&mut rx).await {
        Event::CycleCompleted { pv, .. } => assert_eq!(pv, serde_json::json!(200.0)),
        other => panic!("unexpected event: {other:?}"),
    }
    // The latest result is still observable by polling while paused.
    assert!(client.latest_result().await.unwrap().is_some());
}

#[tokio::test]
async fn shutdown_tells_the_listener_and_is_idempotent() {
    init_tracing();
    let processor = ViewProcessor::new(EngineConfig::default(), NamedMarketDataSpecs::default());
    let client = processor.create_view_client(UserPrincipal::local("alice"));
    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .set_result_listener(Some(Arc::new(ChannelListener { tx })))
        .await
        .unwrap();
    client
        .attach_to_view_definition(UniqueId::new("ViewDef", "v"), live(), false)
        .await
        .unwrap();

    client.shutdown().await.unwrap();
    client.shutdown().await.unwrap();

    assert_matches!(recv(&mut rx).await, Event::Shutdown(_));
    assert!(processor.view_processes().is_empty());
    let err = client
        .attach_to_view_definition(UniqueId::new("ViewDef", "v"), live(), false)
        .await
        .unwrap_err();
    assert!(err.is_invalid_state());
}

#[tokio::test]
async fn process_completion_reaches_every_attached_client() {
    init_tracing();
    let processor = ViewProcessor::new(EngineConfig::default(), NamedMarketDataSpecs::default());
    let a = processor.create_view_client(UserPrincipal::local("alice"));
    let b = processor.create_view_client(UserPrincipal::local("bob"));
    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    a.set_result_listener(Some(Arc::new(ChannelListener { tx: tx_a })))
        .await
        .unwrap();
    b.set_result_listener(Some(Arc::new(ChannelListener { tx: tx_b })))
        .await
        .unwrap();
    a.attach_to_view_definition(UniqueId::new("ViewDef", "v"), live(), false)
        .await
        .unwrap();
    b.attach_to_view_definition(UniqueId::new("ViewDef", "v"), live(), false)
        .await
        .unwrap();

    processor.view_processes().pop().unwrap().process_completed();

    assert_matches!(recv(&mut rx_a).await, Event::ProcessCompleted);
    assert_matches!(recv(&mut rx_b).await, Event::ProcessCompleted);
}
