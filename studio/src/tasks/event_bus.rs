//! Task event bus - demultiplexes the runner's event stream into
//! per-task snapshots.
//!
//! The bus is the single point of contact with the external runner's
//! multiplexed stream. It keeps a rolling [`TaskSnapshot`] per task id,
//! notifies listeners synchronously as events arrive, and evicts
//! terminal snapshots on a deferred tick so that a listener handling a
//! terminal event can still read the snapshot in the same tick.
//!
//! One underlying stream subscription exists per process regardless of
//! how many listeners register; it is established lazily on the first
//! `subscribe`/`subscribe_all` call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use shared_types::{TaskId, TaskStatus};
use tokio::task::AbortHandle;

use crate::tasks::runner::{RunnerEvent, TaskRunner};

// ============================================================================
// Snapshots
// ============================================================================

/// The bus's current-best-knowledge record of one task.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub status: TaskStatus,

    /// The most recent delta exactly as delivered, not cumulative.
    pub streamed_content: Option<String>,

    /// Seed plus every delta received so far.
    pub content: String,

    /// Optional prefix established before streaming starts, so the
    /// first delta composes without special-casing "no seed".
    pub seed_content: Option<String>,

    /// Present only when `status == Error`.
    pub error: Option<String>,

    /// Present only when `status == Completed`. Opaque domain payload.
    pub result: Option<serde_json::Value>,

    pub updated_at: DateTime<Utc>,
}

impl TaskSnapshot {
    fn new() -> Self {
        Self {
            status: TaskStatus::Queued,
            streamed_content: None,
            content: String::new(),
            seed_content: None,
            error: None,
            result: None,
            updated_at: Utc::now(),
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct TaskEventBusConfig {
    /// How long a terminal snapshot stays readable after its listeners
    /// have been notified. Reads within the same tick always succeed;
    /// reads after the grace period see the snapshot gone.
    pub eviction_grace: Duration,
}

impl Default for TaskEventBusConfig {
    fn default() -> Self {
        Self {
            eviction_grace: Duration::from_millis(25),
        }
    }
}

// ============================================================================
// TaskEventBus
// ============================================================================

type TaskListener = dyn Fn(&TaskSnapshot) + Send + Sync;
type StreamListener = dyn Fn(&TaskId, &TaskSnapshot) + Send + Sync;

struct BusState {
    snapshots: HashMap<TaskId, TaskSnapshot>,
    task_listeners: HashMap<TaskId, Vec<(u64, Arc<TaskListener>)>>,
    all_listeners: Vec<(u64, Arc<StreamListener>)>,
    pending_evictions: HashMap<TaskId, AbortHandle>,
    next_listener_id: u64,
    pump_started: bool,
}

struct BusShared {
    state: Mutex<BusState>,
    config: TaskEventBusConfig,
    runner: Arc<dyn TaskRunner>,
}

impl BusShared {
    fn lock_state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cheaply clonable handle; all clones share one snapshot table and one
/// underlying stream subscription.
#[derive(Clone)]
pub struct TaskEventBus {
    inner: Arc<BusShared>,
}

impl TaskEventBus {
    pub fn new(runner: Arc<dyn TaskRunner>, config: TaskEventBusConfig) -> Self {
        Self {
            inner: Arc::new(BusShared {
                state: Mutex::new(BusState {
                    snapshots: HashMap::new(),
                    task_listeners: HashMap::new(),
                    all_listeners: Vec::new(),
                    pending_evictions: HashMap::new(),
                    next_listener_id: 0,
                    pump_started: false,
                }),
                config,
                runner,
            }),
        }
    }

    /// Register a listener for one task id. The listener runs
    /// synchronously for every event of that task, in arrival order.
    ///
    /// Dropping the returned subscription (or calling `unsubscribe`)
    /// removes exactly this listener.
    pub fn subscribe(
        &self,
        task_id: &TaskId,
        listener: impl Fn(&TaskSnapshot) + Send + Sync + 'static,
    ) -> SnapshotSubscription {
        self.ensure_pump();
        let mut state = self.inner.lock_state();
        let id = state.next_listener_id;
        state.next_listener_id += 1;
        state
            .task_listeners
            .entry(task_id.clone())
            .or_default()
            .push((id, Arc::new(listener)));
        SnapshotSubscription {
            shared: Arc::downgrade(&self.inner),
            task_id: Some(task_id.clone()),
            id,
        }
    }

    /// Register a listener for every demultiplexed event, regardless of
    /// task id. Controllers use this as their routing feed.
    pub fn subscribe_all(
        &self,
        listener: impl Fn(&TaskId, &TaskSnapshot) + Send + Sync + 'static,
    ) -> SnapshotSubscription {
        self.ensure_pump();
        let mut state = self.inner.lock_state();
        let id = state.next_listener_id;
        state.next_listener_id += 1;
        state.all_listeners.push((id, Arc::new(listener)));
        SnapshotSubscription {
            shared: Arc::downgrade(&self.inner),
            task_id: None,
            id,
        }
    }

    /// Synchronous read of the latest known snapshot. Late joiners use
    /// this instead of waiting for the next event.
    pub fn snapshot(&self, task_id: &TaskId) -> Option<TaskSnapshot> {
        self.inner.lock_state().snapshots.get(task_id).cloned()
    }

    /// Initialize `seed_content`/`content` for a task before any stream
    /// event arrives. Call before streaming starts.
    pub fn seed_content(&self, task_id: &TaskId, text: &str) {
        let mut state = self.inner.lock_state();
        let snapshot = state
            .snapshots
            .entry(task_id.clone())
            .or_insert_with(TaskSnapshot::new);
        snapshot.seed_content = Some(text.to_string());
        snapshot.content = text.to_string();
        snapshot.updated_at = Utc::now();
    }

    /// Demultiplex one raw runner event. This is the single entry point
    /// for the pump task; tests drive it directly.
    pub fn ingest(&self, event: RunnerEvent) {
        Self::apply(&self.inner, event);
    }

    fn ensure_pump(&self) {
        {
            let mut state = self.inner.lock_state();
            if state.pump_started {
                return;
            }
            state.pump_started = true;
        }

        match self.inner.runner.events() {
            Some(mut rx) => {
                let weak = Arc::downgrade(&self.inner);
                tokio::spawn(async move {
                    loop {
                        match rx.recv().await {
                            Ok(event) => {
                                let Some(shared) = weak.upgrade() else {
                                    break;
                                };
                                Self::apply(&shared, event);
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                                tracing::warn!(skipped, "task event stream lagged; events dropped");
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    tracing::debug!("task event pump stopped");
                });
            }
            None => {
                // Degraded, not fatal: listeners stay registered and
                // manually seeded snapshots remain readable.
                tracing::warn!("task runner bridge unavailable; no task events will be delivered");
            }
        }
    }

    fn apply(shared: &Arc<BusShared>, event: RunnerEvent) {
        let Some(task_id) = event.task_id().cloned() else {
            tracing::debug!("dropping task event without a resolvable task id");
            return;
        };

        let (snapshot, task_listeners, all_listeners) = {
            let mut state = shared.lock_state();

            // A newer event makes any scheduled eviction for this task stale.
            if let Some(pending) = state.pending_evictions.remove(&task_id) {
                pending.abort();
            }

            let snapshot = state
                .snapshots
                .entry(task_id.clone())
                .or_insert_with(TaskSnapshot::new);

            match event {
                RunnerEvent::Queued { .. } | RunnerEvent::Resumed { .. } => {
                    snapshot.status = TaskStatus::Queued;
                }
                RunnerEvent::Started { .. } | RunnerEvent::Progress { .. } => {
                    snapshot.status = TaskStatus::Running;
                }
                RunnerEvent::Stream { delta, .. } => {
                    snapshot.status = TaskStatus::Running;
                    snapshot.content.push_str(&delta);
                    snapshot.streamed_content = Some(delta);
                }
                RunnerEvent::Completed { result, .. } => {
                    snapshot.status = TaskStatus::Completed;
                    snapshot.result = Some(result);
                }
                RunnerEvent::Error { message, .. } => {
                    snapshot.status = TaskStatus::Error;
                    snapshot.error = Some(message);
                }
                RunnerEvent::Cancelled { .. } => {
                    snapshot.status = TaskStatus::Cancelled;
                }
                RunnerEvent::Paused { .. } => {
                    snapshot.status = TaskStatus::Paused;
                }
                RunnerEvent::Unknown => unreachable!("unknown events carry no task id"),
            }
            snapshot.updated_at = Utc::now();
            let snapshot = snapshot.clone();

            let task_listeners: Vec<Arc<TaskListener>> = state
                .task_listeners
                .get(&task_id)
                .map(|listeners| listeners.iter().map(|(_, l)| l.clone()).collect())
                .unwrap_or_default();
            let all_listeners: Vec<Arc<StreamListener>> =
                state.all_listeners.iter().map(|(_, l)| l.clone()).collect();

            (snapshot, task_listeners, all_listeners)
        };

        tracing::debug!(task_id = %task_id, status = %snapshot.status, "task event applied");

        // Listeners run outside the lock so they may re-enter the bus
        // (snapshot reads in particular) without deadlocking.
        for listener in &task_listeners {
            listener(&snapshot);
        }
        for listener in &all_listeners {
            listener(&task_id, &snapshot);
        }

        // Terminal snapshots are evicted only after every current
        // listener has observed them.
        if snapshot.status.is_terminal() {
            Self::schedule_eviction(shared, task_id);
        }
    }

    fn schedule_eviction(shared: &Arc<BusShared>, task_id: TaskId) {
        let weak = Arc::downgrade(shared);
        let grace = shared.config.eviction_grace;
        let evict_id = task_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let mut state = shared.lock_state();
            state.pending_evictions.remove(&evict_id);
            state.snapshots.remove(&evict_id);
            tracing::debug!(task_id = %evict_id, "evicted terminal task snapshot");
        });
        shared
            .lock_state()
            .pending_evictions
            .insert(task_id, handle.abort_handle());
    }
}

// ============================================================================
// Subscriptions
// ============================================================================

/// Removes its listener when dropped. When the last listener for a task
/// id goes away, the id's listener bookkeeping is removed as well.
pub struct SnapshotSubscription {
    shared: Weak<BusShared>,
    /// `None` for all-events listeners.
    task_id: Option<TaskId>,
    id: u64,
}

impl SnapshotSubscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for SnapshotSubscription {
    fn drop(&mut self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut state = shared.lock_state();
        match &self.task_id {
            Some(task_id) => {
                if let Some(listeners) = state.task_listeners.get_mut(task_id) {
                    listeners.retain(|(id, _)| *id != self.id);
                    if listeners.is_empty() {
                        state.task_listeners.remove(task_id);
                    }
                }
            }
            None => {
                state.all_listeners.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
