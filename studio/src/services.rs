//! Service wiring.
//!
//! The engine avoids module-level singletons: the runner bridge and the
//! event bus are constructed once at application startup and injected
//! into every domain context from here. Tests build their own instances
//! the same way.

use std::sync::Arc;

use crate::tasks::{
    DraftSaver, EntityTaskContext, TaskControllerConfig, TaskDomain, TaskEventBus,
    TaskEventBusConfig, TaskRunner,
};

/// Cheaply clonable handle over the process-wide task services.
#[derive(Clone)]
pub struct TaskServices {
    inner: Arc<TaskServicesInner>,
}

struct TaskServicesInner {
    runner: Arc<dyn TaskRunner>,
    bus: TaskEventBus,
}

impl TaskServices {
    pub fn new(runner: Arc<dyn TaskRunner>) -> Self {
        Self::with_bus_config(runner, TaskEventBusConfig::default())
    }

    pub fn with_bus_config(runner: Arc<dyn TaskRunner>, config: TaskEventBusConfig) -> Self {
        let bus = TaskEventBus::new(runner.clone(), config);
        Self {
            inner: Arc::new(TaskServicesInner { runner, bus }),
        }
    }

    pub fn runner(&self) -> Arc<dyn TaskRunner> {
        self.inner.runner.clone()
    }

    /// The process-wide event bus; all domains share it.
    pub fn bus(&self) -> TaskEventBus {
        self.inner.bus.clone()
    }

    /// Build an independent context for `domain`. Each call produces a
    /// separate store and routing table over the shared bus.
    pub fn context<D: TaskDomain>(
        &self,
        domain: D,
        saver: Option<Arc<dyn DraftSaver<D::SaveResult>>>,
        config: TaskControllerConfig,
    ) -> EntityTaskContext<D> {
        tracing::info!(domain = domain.name(), "creating entity task context");
        EntityTaskContext::new(domain, self.runner(), self.bus(), saver, config)
    }
}
