//! Per-entity task store.
//!
//! A keyed, independently-subscribable state container: each entity
//! (document, block, chat session) owns one [`EntityTaskState`] slice,
//! and mutating entity A never notifies listeners registered only for
//! entity B. Every update replaces the stored `Arc`, so consumers can
//! detect change with pointer equality.
//!
//! A store is owned exclusively by one controller per domain; it is
//! never shared across domains.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use shared_types::{ChatTurn, EntityId, InferenceSettings, TaskId};

// ============================================================================
// Entity State
// ============================================================================

/// One entity's task slice. `S` is the domain's persistence result type.
#[derive(Debug, Clone)]
pub struct EntityTaskState<S> {
    /// Ordered chat turns. Append-only, except that the trailing empty
    /// assistant turn is amended in place once streaming completes.
    pub messages: Vec<ChatTurn>,

    /// True from submit until the terminal event.
    pub is_loading: bool,

    /// True only once the first content delta of the current operation
    /// has arrived.
    pub is_streaming: bool,

    /// Cumulative text visible for the in-flight or just-completed
    /// operation.
    pub latest_response: String,

    /// The in-flight external task, if any. This field is the
    /// single-flight guard: while it is set, submits are ignored.
    pub task_id: Option<TaskId>,

    /// Last failure message, if any.
    pub error: Option<String>,

    pub is_saving: bool,
    pub last_save_error: Option<String>,
    pub last_saved: Option<S>,

    /// Inference configuration captured at submit time.
    pub settings: InferenceSettings,
}

impl<S> Default for EntityTaskState<S> {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            is_loading: false,
            is_streaming: false,
            latest_response: String::new(),
            task_id: None,
            error: None,
            is_saving: false,
            last_save_error: None,
            last_saved: None,
            settings: InferenceSettings::default(),
        }
    }
}

// ============================================================================
// EntityTaskStore
// ============================================================================

type EntityListener = dyn Fn() + Send + Sync;

struct StoreState<S> {
    entities: HashMap<EntityId, Arc<EntityTaskState<S>>>,
    listeners: HashMap<EntityId, Vec<(u64, Arc<EntityListener>)>>,
    next_listener_id: u64,
}

struct StoreShared<S> {
    state: Mutex<StoreState<S>>,
}

impl<S> StoreShared<S> {
    fn lock_state(&self) -> MutexGuard<'_, StoreState<S>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct EntityTaskStore<S> {
    inner: Arc<StoreShared<S>>,
}

impl<S> Clone for EntityTaskStore<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S> Default for EntityTaskStore<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> EntityTaskStore<S> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StoreShared {
                state: Mutex::new(StoreState {
                    entities: HashMap::new(),
                    listeners: HashMap::new(),
                    next_listener_id: 0,
                }),
            }),
        }
    }

    /// Returns the entity's current state, creating defaults on first
    /// access. The same `Arc` is returned until the next `update`/`reset`.
    pub fn get_or_create(&self, entity_id: &EntityId) -> Arc<EntityTaskState<S>> {
        let mut state = self.inner.lock_state();
        state
            .entities
            .entry(entity_id.clone())
            .or_insert_with(|| Arc::new(EntityTaskState::default()))
            .clone()
    }

    pub fn get(&self, entity_id: &EntityId) -> Option<Arc<EntityTaskState<S>>> {
        self.inner.lock_state().entities.get(entity_id).cloned()
    }

    /// Register a listener invoked after any `update`/`reset` for this
    /// entity. Removing the last listener does not delete the entity's
    /// state; a re-mounted consumer sees prior progress.
    pub fn subscribe(
        &self,
        entity_id: &EntityId,
        listener: impl Fn() + Send + Sync + 'static,
    ) -> StoreSubscription<S> {
        let mut state = self.inner.lock_state();
        let id = state.next_listener_id;
        state.next_listener_id += 1;
        state
            .listeners
            .entry(entity_id.clone())
            .or_default()
            .push((id, Arc::new(listener)));
        StoreSubscription {
            shared: Arc::downgrade(&self.inner),
            entity_id: entity_id.clone(),
            id,
        }
    }

    /// Remove the entity's state entirely. Teardown hook for "document
    /// closed"; without it entries would accumulate for the lifetime of
    /// the process. Does not touch any in-flight external task.
    pub fn remove(&self, entity_id: &EntityId) {
        let listeners = {
            let mut state = self.inner.lock_state();
            if state.entities.remove(entity_id).is_none() {
                return;
            }
            tracing::debug!(entity = %entity_id, "entity task state removed");
            self.collect_listeners(&state, entity_id)
        };
        for listener in &listeners {
            listener();
        }
    }

    fn collect_listeners(
        &self,
        state: &StoreState<S>,
        entity_id: &EntityId,
    ) -> Vec<Arc<EntityListener>> {
        state
            .listeners
            .get(entity_id)
            .map(|listeners| listeners.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default()
    }
}

impl<S: Clone> EntityTaskStore<S> {
    /// Apply a mutation to the entity's state and synchronously notify
    /// that entity's listeners only. The stored `Arc` is replaced, never
    /// mutated in place.
    pub fn update(&self, entity_id: &EntityId, mutate: impl FnOnce(&mut EntityTaskState<S>)) {
        let listeners = {
            let mut state = self.inner.lock_state();
            let current = state
                .entities
                .entry(entity_id.clone())
                .or_insert_with(|| Arc::new(EntityTaskState::default()));
            let mut next = (**current).clone();
            mutate(&mut next);
            *current = Arc::new(next);
            self.collect_listeners(&state, entity_id)
        };
        for listener in &listeners {
            listener();
        }
    }

    /// Replace the entity's state with defaults plus `overrides`. Does
    /// not cancel a running task; callers cancel first if they want the
    /// task to actually stop.
    pub fn reset(&self, entity_id: &EntityId, overrides: impl FnOnce(&mut EntityTaskState<S>)) {
        let listeners = {
            let mut state = self.inner.lock_state();
            let mut next = EntityTaskState::default();
            overrides(&mut next);
            state.entities.insert(entity_id.clone(), Arc::new(next));
            self.collect_listeners(&state, entity_id)
        };
        for listener in &listeners {
            listener();
        }
    }
}

// ============================================================================
// Subscriptions
// ============================================================================

/// Removes its listener when dropped.
pub struct StoreSubscription<S> {
    shared: Weak<StoreShared<S>>,
    entity_id: EntityId,
    id: u64,
}

impl<S> StoreSubscription<S> {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl<S> Drop for StoreSubscription<S> {
    fn drop(&mut self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut state = shared.lock_state();
        if let Some(listeners) = state.listeners.get_mut(&self.entity_id) {
            listeners.retain(|(id, _)| *id != self.id);
            if listeners.is_empty() {
                state.listeners.remove(&self.entity_id);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
