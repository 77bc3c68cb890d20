//! End-to-end task lifecycle scenarios over a fake runner bridge.
//!
//! These drive the full wiring the way the application does: a
//! [`TaskServices`] instance built over one bridge, domain contexts
//! created from it, events arriving on the bridge's multiplexed stream.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use shared_types::{ChatRole, EntityId, TaskId};
use studio::domains::{BlockEnhanceDomain, SavedDraft, WriterAgentDomain};
use studio::services::TaskServices;
use studio::tasks::{
    DraftSaver, RunnerError, RunnerEvent, SaveError, SaveRequest, SubmitOptions, SubmitRequest,
    TaskControllerConfig, TaskEventBus, TaskRunner,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Fake bridge
// ============================================================================

struct FakeBridge {
    tx: broadcast::Sender<RunnerEvent>,
    next_id: AtomicUsize,
    submits: Mutex<Vec<SubmitRequest>>,
    cancelled: Mutex<Vec<TaskId>>,
    /// Events ingested into the bus before `submit` returns, simulating
    /// a runner that resolves before the routing registration observes
    /// the submission.
    pre_resolved: Mutex<Vec<RunnerEvent>>,
    bus: Mutex<Option<TaskEventBus>>,
}

impl FakeBridge {
    fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(64);
        Arc::new(Self {
            tx,
            next_id: AtomicUsize::new(1),
            submits: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            pre_resolved: Mutex::new(Vec::new()),
            bus: Mutex::new(None),
        })
    }

    fn attach_bus(&self, bus: TaskEventBus) {
        *self.bus.lock().unwrap() = Some(bus);
    }

    fn emit(&self, event: RunnerEvent) {
        self.tx.send(event).expect("pump must be listening");
    }
}

#[async_trait]
impl TaskRunner for FakeBridge {
    async fn submit(&self, request: SubmitRequest) -> Result<TaskId, RunnerError> {
        self.submits.lock().unwrap().push(request);
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let task_id = TaskId(format!("t{n}"));

        let pre: Vec<RunnerEvent> = self.pre_resolved.lock().unwrap().drain(..).collect();
        if !pre.is_empty() {
            let bus = self.bus.lock().unwrap().clone().expect("bus attached");
            for event in pre {
                bus.ingest(event);
            }
        }
        Ok(task_id)
    }

    fn cancel(&self, task_id: &TaskId) {
        self.cancelled.lock().unwrap().push(task_id.clone());
    }

    fn events(&self) -> Option<broadcast::Receiver<RunnerEvent>> {
        Some(self.tx.subscribe())
    }
}

// ============================================================================
// Recording saver
// ============================================================================

struct RecordingSaver {
    saved: Mutex<Vec<SaveRequest>>,
    fail: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl RecordingSaver {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            saved: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            delay: Mutex::new(None),
        })
    }
}

#[async_trait]
impl DraftSaver<SavedDraft> for RecordingSaver {
    async fn save(&self, request: SaveRequest) -> Result<SavedDraft, SaveError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(SaveError::Storage("disk full".to_string()));
        }
        let mut saved = self.saved.lock().unwrap();
        saved.push(request);
        Ok(SavedDraft {
            id: format!("draft-{}", saved.len()),
            revision: saved.len() as u64,
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn stream(task: &str, delta: &str) -> RunnerEvent {
    RunnerEvent::Stream {
        task_id: TaskId::from(task),
        delta: delta.to_string(),
    }
}

fn completed(task: &str, content: &str) -> RunnerEvent {
    RunnerEvent::Completed {
        task_id: TaskId::from(task),
        result: serde_json::json!({ "content": content }),
    }
}

async fn wait_until(what: &str, pred: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !pred() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_round_trip_chat_scenario() {
    init_tracing();
    let bridge = FakeBridge::new();
    let services = TaskServices::new(bridge.clone());
    bridge.attach_bus(services.bus());
    let saver = RecordingSaver::new();
    let ctx = services.context(
        WriterAgentDomain::new(),
        Some(saver.clone()),
        TaskControllerConfig::default(),
    );

    let doc = ctx.entity(EntityId::from("doc-1"));
    doc.submit("hello", None, SubmitOptions::default()).await;
    assert_eq!(doc.state().task_id, Some(TaskId::from("t1")));

    bridge.emit(stream("t1", "He"));
    bridge.emit(stream("t1", "llo"));
    bridge.emit(completed("t1", "Hello"));

    wait_until("completion routed", || !doc.state().is_loading).await;

    let state = doc.state();
    assert_eq!(state.messages.len(), 2);
    assert_eq!(state.messages[0].role, ChatRole::User);
    assert_eq!(state.messages[0].content, "hello");
    assert_eq!(state.messages[1].role, ChatRole::Assistant);
    assert_eq!(state.messages[1].content, "Hello");
    assert!(!state.is_streaming);
    assert!(state.task_id.is_none());
    assert!(state.error.is_none());

    // The completed draft is persisted automatically.
    wait_until("auto-save finished", || doc.state().last_saved.is_some()).await;
    let state = doc.state();
    assert!(!state.is_saving);
    assert_eq!(saver.saved.lock().unwrap()[0].target, "drafts/doc-1");
}

#[tokio::test]
async fn test_terminal_before_routing_is_processed_exactly_once() {
    init_tracing();
    let bridge = FakeBridge::new();
    let services = TaskServices::new(bridge.clone());
    bridge.attach_bus(services.bus());
    let ctx = services.context(WriterAgentDomain::new(), None, TaskControllerConfig::default());

    // The runner resolves the whole operation before `submit` returns,
    // so the terminal event is consumed while no route exists yet.
    *bridge.pre_resolved.lock().unwrap() = vec![
        stream("t1", "Hel"),
        stream("t1", "lo"),
        completed("t1", "Hello"),
    ];

    let doc = ctx.entity(EntityId::from("doc-1"));
    doc.submit("hello", None, SubmitOptions::default()).await;

    // No waiting: the post-submit snapshot check must have handled it.
    let state = doc.state();
    assert!(!state.is_loading);
    assert!(state.task_id.is_none());
    assert_eq!(state.messages.len(), 2, "terminal processed exactly once");
    assert_eq!(state.messages[1].content, "Hello");
}

#[tokio::test]
async fn test_block_enhancement_streams_onto_seed_and_reverts_on_error() {
    init_tracing();
    let bridge = FakeBridge::new();
    let services = TaskServices::new(bridge.clone());
    bridge.attach_bus(services.bus());
    let ctx = services.context(BlockEnhanceDomain::new(), None, TaskControllerConfig::default());

    let block = ctx.entity(EntityId::from("block-7"));
    block
        .submit(
            "fix the typos",
            None,
            BlockEnhanceDomain::options_for("Teh quick fox"),
        )
        .await;

    bridge.emit(stream("t1", " jumps"));
    wait_until("delta routed", || block.state().is_streaming).await;
    assert_eq!(block.state().latest_response, "Teh quick fox jumps");

    bridge.emit(RunnerEvent::Error {
        task_id: TaskId::from("t1"),
        message: "provider overloaded".to_string(),
    });
    wait_until("error routed", || block.state().error.is_some()).await;

    let state = block.state();
    // In-place domains discard partial content back to the original.
    assert_eq!(state.latest_response, "Teh quick fox");
    assert!(!state.is_loading);
    assert!(state.task_id.is_none());
}

#[tokio::test]
async fn test_save_failure_is_isolated_from_the_completed_operation() {
    init_tracing();
    let bridge = FakeBridge::new();
    let services = TaskServices::new(bridge.clone());
    bridge.attach_bus(services.bus());
    let saver = RecordingSaver::new();
    saver.fail.store(true, Ordering::SeqCst);
    let ctx = services.context(
        WriterAgentDomain::new(),
        Some(saver.clone()),
        TaskControllerConfig::default(),
    );

    let doc = ctx.entity(EntityId::from("doc-1"));
    doc.submit("hello", None, SubmitOptions::default()).await;
    bridge.emit(completed("t1", "Hello"));

    wait_until("save failure recorded", || {
        doc.state().last_save_error.is_some()
    })
    .await;

    let state = doc.state();
    // The operation stays completed; only the persistence sub-state fails.
    assert!(state.error.is_none());
    assert_eq!(state.messages[1].content, "Hello");
    assert!(!state.is_saving);
    assert!(state.last_saved.is_none());
    assert!(state.last_save_error.as_deref().unwrap().contains("disk full"));
}

#[tokio::test]
async fn test_stale_save_result_is_dropped_after_resubmit() {
    init_tracing();
    let bridge = FakeBridge::new();
    let services = TaskServices::new(bridge.clone());
    bridge.attach_bus(services.bus());
    let saver = RecordingSaver::new();
    *saver.delay.lock().unwrap() = Some(Duration::from_millis(50));
    let ctx = services.context(
        WriterAgentDomain::new(),
        Some(saver.clone()),
        TaskControllerConfig::default(),
    );

    let doc = ctx.entity(EntityId::from("doc-1"));
    doc.submit("hello", None, SubmitOptions::default()).await;
    bridge.emit(completed("t1", "Hello"));
    wait_until("first completion routed", || !doc.state().is_loading).await;

    // Resubmit while the first auto-save is still sleeping.
    doc.submit("more", None, SubmitOptions::default()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let state = doc.state();
    // The superseded save resolved but must not have landed.
    assert!(state.last_saved.is_none());
    assert!(state.is_loading, "second operation still in flight");
}

#[tokio::test]
async fn test_contexts_are_independent_domains() {
    init_tracing();
    let bridge = FakeBridge::new();
    let services = TaskServices::new(bridge.clone());
    bridge.attach_bus(services.bus());
    let writer = services.context(WriterAgentDomain::new(), None, TaskControllerConfig::default());
    let blocks = services.context(BlockEnhanceDomain::new(), None, TaskControllerConfig::default());

    let shared_id = EntityId::from("doc-1");
    let doc = writer.entity(shared_id.clone());
    doc.submit("hello", None, SubmitOptions::default()).await;

    bridge.emit(completed("t1", "Hello"));
    wait_until("writer completion routed", || !doc.state().is_loading).await;

    // The other domain never interprets the writer's task id, even for
    // an identical entity id.
    assert!(blocks.store().get(&shared_id).is_none());
    assert_eq!(doc.state().messages.len(), 2);
}

#[tokio::test]
async fn test_watch_delivers_updates_until_unsubscribed() {
    init_tracing();
    let bridge = FakeBridge::new();
    let services = TaskServices::new(bridge.clone());
    bridge.attach_bus(services.bus());
    let ctx = services.context(WriterAgentDomain::new(), None, TaskControllerConfig::default());

    let doc = ctx.entity(EntityId::from("doc-1"));
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_clone = hits.clone();
    let sub = doc.watch(move || {
        hits_clone.fetch_add(1, Ordering::SeqCst);
    });

    doc.submit("hello", None, SubmitOptions::default()).await;
    bridge.emit(completed("t1", "Hello"));
    wait_until("completion routed", || !doc.state().is_loading).await;

    let seen = hits.load(Ordering::SeqCst);
    assert!(seen >= 2, "submit and completion both notify, saw {seen}");

    sub.unsubscribe();
    doc.clear();
    assert_eq!(hits.load(Ordering::SeqCst), seen);
}

#[tokio::test]
async fn test_cancel_then_retry_uses_a_fresh_task() {
    init_tracing();
    let bridge = FakeBridge::new();
    let services = TaskServices::new(bridge.clone());
    bridge.attach_bus(services.bus());
    let ctx = services.context(WriterAgentDomain::new(), None, TaskControllerConfig::default());

    let doc = ctx.entity(EntityId::from("doc-1"));
    doc.submit("hello", None, SubmitOptions::default()).await;
    doc.cancel();
    assert_eq!(
        bridge.cancelled.lock().unwrap().as_slice(),
        &[TaskId::from("t1")]
    );

    doc.submit("hello again", None, SubmitOptions::default()).await;
    assert_eq!(doc.state().task_id, Some(TaskId::from("t2")));

    // A straggler event from the cancelled task is inert.
    bridge.emit(completed("t1", "stale"));
    bridge.emit(completed("t2", "fresh"));
    wait_until("retry completion routed", || !doc.state().is_loading).await;

    let state = doc.state();
    let assistant_turns: Vec<_> = state
        .messages
        .iter()
        .filter(|turn| turn.role == ChatRole::Assistant)
        .collect();
    assert_eq!(assistant_turns.len(), 1);
    assert_eq!(assistant_turns[0].content, "fresh");
}
