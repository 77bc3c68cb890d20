//! Authoring domains built on the task engine.
//!
//! Each domain is a [`crate::tasks::TaskDomain`] implementation; the
//! engine does the lifecycle work, the domain supplies payload shapes
//! and persistence choices.

pub mod block_enhance;
pub mod writer_agent;

pub use block_enhance::{BlockEnhanceDomain, SavedBlock};
pub use writer_agent::{SavedDraft, WriterAgentDomain};
