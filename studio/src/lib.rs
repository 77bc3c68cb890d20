//! Quill Studio backend core.
//!
//! This crate provides the task tracking engine for Quill Studio: the
//! event bus over the external task runner, the per-entity task store,
//! and the controller/context machinery that the authoring domains
//! (writer agent, block enhancement) are built on.

pub mod domains;
pub mod services;
pub mod tasks;
