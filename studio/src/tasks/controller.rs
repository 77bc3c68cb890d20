//! Entity task controller.
//!
//! The stateful glue between one domain's callbacks and the two
//! primitives underneath: it submits work to the external runner, maps
//! the runner's task ids back onto entity ids, folds bus events into
//! the per-entity store, and runs the post-completion save step.
//!
//! One controller exists per domain. Its routing table is the only
//! place task ids and entity ids meet; dropping a route is how
//! cancellation and terminal handling make later events for a task
//! harmless.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use shared_types::{ChatRole, ChatTurn, EntityId, InferenceSettings, TaskId};
use tokio::task::AbortHandle;

use crate::tasks::context::{ErrorRecovery, TaskDomain};
use crate::tasks::entity_store::EntityTaskStore;
use crate::tasks::event_bus::{SnapshotSubscription, TaskEventBus, TaskSnapshot};
use crate::tasks::runner::TaskRunner;
use crate::tasks::save::DraftSaver;

// ============================================================================
// Options & configuration
// ============================================================================

/// Per-submit options. Settings left `None` fall back to whatever the
/// entity last used.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub provider_id: Option<String>,
    pub model_id: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub reasoning: Option<bool>,

    /// Domain-specific extras, forwarded untouched to the payload
    /// builder (e.g. the original text of a block being enhanced).
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct TaskControllerConfig {
    /// When set, an operation that produces no terminal event within
    /// the deadline is abandoned: the external task is cancelled
    /// best-effort and the entity transitions to an error state. With
    /// `None` a stuck runner leaves the entity loading until the user
    /// cancels.
    pub operation_deadline: Option<Duration>,
}

// ============================================================================
// Controller
// ============================================================================

#[derive(Default)]
struct RouteTable {
    /// Task ids this controller owns, mapped to their entities.
    by_task: HashMap<TaskId, EntityId>,

    /// Per-entity submit generation. An auto-save result is applied
    /// only if the entity has not started a newer operation since the
    /// save was launched.
    save_epochs: HashMap<EntityId, u64>,

    watchdogs: HashMap<TaskId, AbortHandle>,
}

struct ControllerShared<D: TaskDomain> {
    domain: D,
    runner: Arc<dyn TaskRunner>,
    bus: TaskEventBus,
    store: EntityTaskStore<D::SaveResult>,
    saver: Option<Arc<dyn DraftSaver<D::SaveResult>>>,
    config: TaskControllerConfig,
    routes: Mutex<RouteTable>,
    /// Keeps the bus routing registration alive for the controller's
    /// lifetime.
    route_sub: Mutex<Option<SnapshotSubscription>>,
}

pub struct EntityTaskController<D: TaskDomain> {
    shared: Arc<ControllerShared<D>>,
}

impl<D: TaskDomain> Clone for EntityTaskController<D> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<D: TaskDomain> EntityTaskController<D> {
    pub fn new(
        domain: D,
        runner: Arc<dyn TaskRunner>,
        bus: TaskEventBus,
        saver: Option<Arc<dyn DraftSaver<D::SaveResult>>>,
        config: TaskControllerConfig,
    ) -> Self {
        let shared = Arc::new(ControllerShared {
            domain,
            runner,
            bus: bus.clone(),
            store: EntityTaskStore::new(),
            saver,
            config,
            routes: Mutex::new(RouteTable::default()),
            route_sub: Mutex::new(None),
        });

        // The routing loop: one all-events registration per controller.
        // The subscription holds only a weak reference, so dropping the
        // last controller handle tears the routing down instead of
        // leaking it.
        let weak = Arc::downgrade(&shared);
        let subscription = bus.subscribe_all(move |task_id, snapshot| {
            if let Some(shared) = weak.upgrade() {
                ControllerShared::route_event(&shared, task_id, snapshot);
            }
        });
        *shared
            .route_sub
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(subscription);

        Self { shared }
    }

    pub fn store(&self) -> &EntityTaskStore<D::SaveResult> {
        &self.shared.store
    }

    /// Start an operation for `entity_id`.
    ///
    /// Never returns an error: outcomes are observed through the store.
    /// A blank prompt or an entity that is already loading makes this a
    /// silent no-op (the single-flight guard).
    pub async fn submit(
        &self,
        entity_id: &EntityId,
        prompt: &str,
        system_prompt: Option<&str>,
        options: SubmitOptions,
    ) {
        let shared = &self.shared;

        if !shared.runner.available() {
            tracing::warn!(
                domain = shared.domain.name(),
                "task runner bridge missing; submit ignored"
            );
            return;
        }

        let prompt = prompt.trim();
        if prompt.is_empty() {
            tracing::debug!(
                domain = shared.domain.name(),
                entity = %entity_id,
                "submit ignored; empty prompt"
            );
            return;
        }

        let current = shared.store.get_or_create(entity_id);
        if current.is_loading {
            tracing::debug!(
                domain = shared.domain.name(),
                entity = %entity_id,
                "submit ignored; an operation is already in flight"
            );
            return;
        }

        shared.store.update(entity_id, |state| {
            state.messages.push(ChatTurn::user(prompt));
            state.is_loading = true;
            state.is_streaming = false;
            state.error = None;
            state.latest_response.clear();
            // Any save still in flight belongs to a superseded
            // operation; its result is dropped by the epoch guard.
            state.is_saving = false;
            apply_settings(&mut state.settings, &options);
        });

        // A new operation supersedes any auto-save still in flight for
        // this entity; its late result must not land here.
        {
            let mut routes = shared.lock_routes();
            *routes.save_epochs.entry(entity_id.clone()).or_insert(0) += 1;
        }

        let state_now = shared.store.get_or_create(entity_id);
        let request =
            shared
                .domain
                .build_submit_request(entity_id, prompt, system_prompt, &state_now, &options);
        tracing::debug!(
            domain = shared.domain.name(),
            entity = %entity_id,
            operation = %request.operation,
            "submitting task"
        );

        let task_id = match shared.runner.submit(request).await {
            Ok(task_id) => task_id,
            Err(err) => {
                tracing::warn!(
                    domain = shared.domain.name(),
                    entity = %entity_id,
                    error = %err,
                    "task submission failed"
                );
                shared.store.update(entity_id, |state| {
                    state.error = Some(err.to_string());
                    state.is_loading = false;
                });
                return;
            }
        };

        shared.store.update(entity_id, |state| {
            state.task_id = Some(task_id.clone());
        });
        shared
            .lock_routes()
            .by_task
            .insert(task_id.clone(), entity_id.clone());

        // The runner may have resolved before our routing registration
        // observed the submission. The bus will not re-fire an already
        // consumed terminal event, so process the snapshot here.
        match shared.bus.snapshot(&task_id) {
            Some(snapshot) if snapshot.status.is_terminal() => {
                ControllerShared::route_event(shared, &task_id, &snapshot);
            }
            Some(_) => {
                // Already streaming; too late to seed.
                ControllerShared::arm_watchdog(shared, &task_id, entity_id);
            }
            None => {
                if let Some(seed) = shared.domain.seed_content(entity_id, &options) {
                    shared.bus.seed_content(&task_id, &seed);
                }
                ControllerShared::arm_watchdog(shared, &task_id, entity_id);
            }
        }
    }

    /// Best-effort cancellation. No-op when the entity has no active
    /// task. The route is dropped before the runner is told, so a late
    /// event for the old task id is already unroutable.
    pub fn cancel(&self, entity_id: &EntityId) {
        let shared = &self.shared;
        let Some(task_id) = shared.store.get(entity_id).and_then(|s| s.task_id.clone()) else {
            return;
        };

        shared.finish_route(&task_id);
        shared.runner.cancel(&task_id);
        shared.store.update(entity_id, |state| {
            state.is_loading = false;
            state.is_streaming = false;
            state.task_id = None;
        });
        tracing::info!(
            domain = shared.domain.name(),
            entity = %entity_id,
            task_id = %task_id,
            "task cancelled"
        );
    }

    /// Reset the entity to defaults. Does not cancel a running task.
    pub fn clear(&self, entity_id: &EntityId) {
        self.shared.store.reset(entity_id, |_| {});
    }
}

// ============================================================================
// Event routing
// ============================================================================

impl<D: TaskDomain> ControllerShared<D> {
    fn lock_routes(&self) -> MutexGuard<'_, RouteTable> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish_route(&self, task_id: &TaskId) {
        let mut routes = self.lock_routes();
        routes.by_task.remove(task_id);
        if let Some(watchdog) = routes.watchdogs.remove(task_id) {
            watchdog.abort();
        }
    }

    fn route_event(shared: &Arc<Self>, task_id: &TaskId, snapshot: &TaskSnapshot) {
        let terminal = snapshot.status.is_terminal();

        // For terminal events the route is taken, not read: whichever
        // caller gets here first (bus notification or the post-submit
        // snapshot check) processes the transition exactly once.
        let entity = {
            let mut routes = shared.lock_routes();
            if terminal {
                let entity = routes.by_task.remove(task_id);
                if entity.is_some() {
                    if let Some(watchdog) = routes.watchdogs.remove(task_id) {
                        watchdog.abort();
                    }
                }
                entity
            } else {
                routes.by_task.get(task_id).cloned()
            }
        };
        let Some(entity) = entity else {
            return;
        };

        use shared_types::TaskStatus;
        match snapshot.status {
            TaskStatus::Running => Self::handle_stream(shared, &entity, snapshot),
            TaskStatus::Completed => Self::handle_completed(shared, &entity, task_id, snapshot),
            TaskStatus::Error => Self::handle_error(shared, &entity, task_id, snapshot),
            TaskStatus::Cancelled => {
                shared.store.update(&entity, |state| {
                    state.is_loading = false;
                    state.is_streaming = false;
                    state.task_id = None;
                });
                tracing::debug!(
                    domain = shared.domain.name(),
                    entity = %entity,
                    task_id = %task_id,
                    "task reported cancelled"
                );
            }
            TaskStatus::Queued | TaskStatus::Paused => {}
        }
    }

    fn handle_stream(shared: &Arc<Self>, entity: &EntityId, snapshot: &TaskSnapshot) {
        // Only actual deltas count; `started`/`progress` leave the
        // cumulative text untouched.
        if snapshot.streamed_content.is_none() {
            return;
        }
        let current = shared.store.get_or_create(entity);
        // Replayed or stale cumulative content is ignored.
        if snapshot.content.len() <= current.latest_response.len() {
            return;
        }

        let content = snapshot.content.clone();
        shared.store.update(entity, |state| {
            if !state.is_streaming && state.latest_response.is_empty() {
                // First delta of this operation: the assistant turn the
                // final content will land in is created now, empty.
                state.messages.push(ChatTurn::assistant(""));
                state.is_streaming = true;
            }
            state.latest_response = content;
        });
    }

    fn handle_completed(
        shared: &Arc<Self>,
        entity: &EntityId,
        task_id: &TaskId,
        snapshot: &TaskSnapshot,
    ) {
        let current = shared.store.get_or_create(entity);
        let final_content = snapshot
            .result
            .as_ref()
            .and_then(|result| shared.domain.extract_result_content(result))
            .filter(|content| !content.is_empty())
            .or_else(|| {
                (!current.latest_response.is_empty()).then(|| current.latest_response.clone())
            })
            .unwrap_or_else(|| snapshot.content.clone());

        let backfill = final_content.clone();
        shared.store.update(entity, |state| {
            match state.messages.last_mut() {
                Some(turn) if turn.role == ChatRole::Assistant => turn.content = backfill.clone(),
                _ => state.messages.push(ChatTurn::assistant(backfill.clone())),
            }
            state.latest_response = backfill.clone();
            state.is_loading = false;
            state.is_streaming = false;
            state.task_id = None;
        });

        tracing::info!(
            domain = shared.domain.name(),
            entity = %entity,
            task_id = %task_id,
            "task completed"
        );
        shared.domain.on_completed(entity, &final_content);
        Self::spawn_auto_save(shared, entity.clone(), final_content);
    }

    fn handle_error(
        shared: &Arc<Self>,
        entity: &EntityId,
        task_id: &TaskId,
        snapshot: &TaskSnapshot,
    ) {
        let message = snapshot
            .error
            .clone()
            .unwrap_or_else(|| "task failed".to_string());
        let revert = shared.domain.error_recovery() == ErrorRecovery::RevertToSeed;
        let seed = snapshot.seed_content.clone().unwrap_or_default();

        shared.store.update(entity, |state| {
            state.error = Some(message.clone());
            state.is_loading = false;
            state.is_streaming = false;
            state.task_id = None;
            if revert {
                state.latest_response = seed.clone();
                // The placeholder assistant turn never got content.
                if state
                    .messages
                    .last()
                    .is_some_and(|turn| turn.role == ChatRole::Assistant && turn.content.is_empty())
                {
                    state.messages.pop();
                }
            }
        });
        tracing::warn!(
            domain = shared.domain.name(),
            entity = %entity,
            task_id = %task_id,
            error = %message,
            "task failed"
        );
    }

    // ------------------------------------------------------------------
    // Auto-save
    // ------------------------------------------------------------------

    fn spawn_auto_save(shared: &Arc<Self>, entity: EntityId, content: String) {
        let Some(saver) = shared.saver.clone() else {
            return;
        };
        let state = shared.store.get_or_create(&entity);
        let Some(request) = shared.domain.build_save_request(&entity, &state, &content) else {
            return;
        };
        let epoch = shared
            .lock_routes()
            .save_epochs
            .get(&entity)
            .copied()
            .unwrap_or(0);

        shared.store.update(&entity, |state| {
            state.is_saving = true;
            state.last_save_error = None;
        });

        let domain_name = shared.domain.name();
        let weak = Arc::downgrade(shared);
        tokio::spawn(async move {
            let outcome = saver.save(request).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let current_epoch = shared
                .lock_routes()
                .save_epochs
                .get(&entity)
                .copied()
                .unwrap_or(0);
            if current_epoch != epoch {
                tracing::debug!(
                    domain = domain_name,
                    entity = %entity,
                    "discarding auto-save result from a superseded operation"
                );
                return;
            }
            match outcome {
                Ok(saved) => {
                    shared.store.update(&entity, |state| {
                        state.is_saving = false;
                        state.last_save_error = None;
                        state.last_saved = Some(saved);
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        domain = domain_name,
                        entity = %entity,
                        error = %err,
                        "auto-save failed"
                    );
                    shared.store.update(&entity, |state| {
                        state.is_saving = false;
                        state.last_save_error = Some(err.to_string());
                    });
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Deadline watchdog
    // ------------------------------------------------------------------

    fn arm_watchdog(shared: &Arc<Self>, task_id: &TaskId, entity_id: &EntityId) {
        let Some(deadline) = shared.config.operation_deadline else {
            return;
        };
        let weak = Arc::downgrade(shared);
        let watched_task = task_id.clone();
        let watched_entity = entity_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let still_routed = {
                let mut routes = shared.lock_routes();
                routes.watchdogs.remove(&watched_task);
                routes.by_task.remove(&watched_task).is_some()
            };
            if !still_routed {
                return;
            }
            tracing::warn!(
                domain = shared.domain.name(),
                entity = %watched_entity,
                task_id = %watched_task,
                "no terminal event within the operation deadline; abandoning task"
            );
            shared.runner.cancel(&watched_task);
            shared.store.update(&watched_entity, |state| {
                state.error = Some(format!(
                    "operation produced no result within {}s",
                    deadline.as_secs()
                ));
                state.is_loading = false;
                state.is_streaming = false;
                state.task_id = None;
            });
        });
        shared
            .lock_routes()
            .watchdogs
            .insert(task_id.clone(), handle.abort_handle());
    }
}

fn apply_settings(settings: &mut InferenceSettings, options: &SubmitOptions) {
    if options.provider_id.is_some() {
        settings.provider_id = options.provider_id.clone();
    }
    if options.model_id.is_some() {
        settings.model_id = options.model_id.clone();
    }
    if options.temperature.is_some() {
        settings.temperature = options.temperature;
    }
    if options.max_tokens.is_some() {
        settings.max_tokens = options.max_tokens;
    }
    if options.reasoning.is_some() {
        settings.reasoning = options.reasoning;
    }
}

// ============================================================================
// Tests
// ============================================================================
