//! Entity task context factory.
//!
//! A [`TaskDomain`] supplies the handful of callbacks that differ
//! between kinds of AI-assisted operations (how to build the submit
//! payload, how to read the final content, what to persist). The
//! factory turns one domain into an independent controller/store pair;
//! nothing but the process-wide event bus is shared between contexts,
//! so a task id owned by one domain can never be routed by another.

use std::sync::Arc;

use shared_types::EntityId;

use crate::tasks::controller::{EntityTaskController, SubmitOptions, TaskControllerConfig};
use crate::tasks::entity_store::{EntityTaskState, EntityTaskStore, StoreSubscription};
use crate::tasks::event_bus::TaskEventBus;
use crate::tasks::runner::{SubmitRequest, TaskRunner};
use crate::tasks::save::{DraftSaver, SaveRequest, SavedRecord};

/// What to do with partially streamed content when an operation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorRecovery {
    /// Keep the partial attempt visible alongside the error marker
    /// (chat-style domains).
    KeepPartial,

    /// Discard the partial content back to the pre-operation seed text
    /// (in-place domains such as block enhancement).
    RevertToSeed,
}

/// The domain-specific callbacks of one kind of AI-assisted operation.
pub trait TaskDomain: Send + Sync + 'static {
    /// Result type of this domain's persistence step.
    type SaveResult: SavedRecord + Clone + Send + Sync + 'static;

    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Build the payload handed to the external runner.
    fn build_submit_request(
        &self,
        entity_id: &EntityId,
        prompt: &str,
        system_prompt: Option<&str>,
        state: &EntityTaskState<Self::SaveResult>,
        options: &SubmitOptions,
    ) -> SubmitRequest;

    /// Read the final content out of a completed result payload.
    /// Returning `None` falls back to the accumulated streamed text.
    fn extract_result_content(&self, result: &serde_json::Value) -> Option<String> {
        result
            .get("content")
            .and_then(|value| value.as_str())
            .map(str::to_string)
    }

    /// Build the persistence request for a completed operation.
    /// Domains that do not persist return `None` (the default) and the
    /// save step is skipped entirely.
    fn build_save_request(
        &self,
        _entity_id: &EntityId,
        _state: &EntityTaskState<Self::SaveResult>,
        _content: &str,
    ) -> Option<SaveRequest> {
        None
    }

    /// Text to seed the task's stream with before the first delta
    /// (e.g. the original pre-enhancement text).
    fn seed_content(&self, _entity_id: &EntityId, _options: &SubmitOptions) -> Option<String> {
        None
    }

    fn error_recovery(&self) -> ErrorRecovery {
        ErrorRecovery::KeepPartial
    }

    /// Side effect invoked after a completed operation, before the save
    /// step.
    fn on_completed(&self, _entity_id: &EntityId, _content: &str) {}
}

// ============================================================================
// Context
// ============================================================================

/// One domain's ready-to-use controller/store pair.
pub struct EntityTaskContext<D: TaskDomain> {
    controller: EntityTaskController<D>,
}

impl<D: TaskDomain> EntityTaskContext<D> {
    /// Build a fresh, independent context for `domain`. Calling this
    /// twice produces two fully separate domains: separate stores,
    /// separate task routing, shared bus underneath.
    pub fn new(
        domain: D,
        runner: Arc<dyn TaskRunner>,
        bus: TaskEventBus,
        saver: Option<Arc<dyn DraftSaver<D::SaveResult>>>,
        config: TaskControllerConfig,
    ) -> Self {
        Self {
            controller: EntityTaskController::new(domain, runner, bus, saver, config),
        }
    }

    pub fn controller(&self) -> &EntityTaskController<D> {
        &self.controller
    }

    /// Read/subscribe access to the domain's entity states.
    pub fn store(&self) -> &EntityTaskStore<D::SaveResult> {
        self.controller.store()
    }

    /// A handle bound to one entity id, as handed to a view.
    pub fn entity(&self, entity_id: EntityId) -> EntityTaskHandle<D> {
        EntityTaskHandle {
            controller: self.controller.clone(),
            entity_id,
        }
    }
}

// ============================================================================
// Per-entity handle
// ============================================================================

/// `submit`/`cancel`/`clear` plus state access, bound to one entity.
pub struct EntityTaskHandle<D: TaskDomain> {
    controller: EntityTaskController<D>,
    entity_id: EntityId,
}

impl<D: TaskDomain> EntityTaskHandle<D> {
    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    pub async fn submit(&self, prompt: &str, system_prompt: Option<&str>, options: SubmitOptions) {
        self.controller
            .submit(&self.entity_id, prompt, system_prompt, options)
            .await;
    }

    pub fn cancel(&self) {
        self.controller.cancel(&self.entity_id);
    }

    pub fn clear(&self) {
        self.controller.clear(&self.entity_id);
    }

    /// Drop the entity's state entirely ("document closed").
    pub fn remove(&self) {
        self.controller.store().remove(&self.entity_id);
    }

    pub fn state(&self) -> Arc<EntityTaskState<D::SaveResult>> {
        self.controller.store().get_or_create(&self.entity_id)
    }

    pub fn watch(
        &self,
        listener: impl Fn() + Send + Sync + 'static,
    ) -> StoreSubscription<D::SaveResult> {
        self.controller.store().subscribe(&self.entity_id, listener)
    }
}
