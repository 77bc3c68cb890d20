//! Task tracking engine.
//!
//! Submitting a long-running AI operation, following its token stream,
//! and reconciling its final result happens out-of-band from any
//! particular view: the consumer may navigate away, several operations
//! may be in flight for different entities, and events may race against
//! subscription setup. This module owns that lifecycle:
//!
//! - [`event_bus`] demultiplexes the runner's event stream into
//!   per-task snapshots,
//! - [`entity_store`] holds each entity's independently-subscribable
//!   task state,
//! - [`controller`] glues the two together for one domain,
//! - [`context`] packages a domain's callbacks into a ready-to-use
//!   controller/store pair,
//! - [`runner`] and [`save`] are the boundary contracts to the external
//!   runner and the persistence layer.

pub mod context;
pub mod controller;
pub mod entity_store;
pub mod event_bus;
pub mod runner;
pub mod save;

pub use context::{EntityTaskContext, EntityTaskHandle, ErrorRecovery, TaskDomain};
pub use controller::{EntityTaskController, SubmitOptions, TaskControllerConfig};
pub use entity_store::{EntityTaskState, EntityTaskStore, StoreSubscription};
pub use event_bus::{SnapshotSubscription, TaskEventBus, TaskEventBusConfig, TaskSnapshot};
pub use runner::{RunnerError, RunnerEvent, SubmitRequest, TaskRunner};
pub use save::{DraftSaver, SaveError, SaveRequest, SavedRecord};
