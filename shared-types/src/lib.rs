//! Shared types between the Quill Studio backend and the desktop shell.
//!
//! These types are used by both:
//! - the backend task engine (native Rust)
//! - the desktop shell (TypeScript, via generated bindings)
//!
//! Serializable with serde for JSON over the shell bridge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

// ============================================================================
// Identifiers
// ============================================================================

/// Identifies a unit of content that owns its own task lifecycle:
/// a document, a block, a chat session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, TS)]
#[ts(export, export_to = "../bindings/generated.ts")]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Opaque identifier assigned by the external task runner at submission time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, TS)]
#[ts(export, export_to = "../bindings/generated.ts")]
pub struct TaskId(pub String);

impl TaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ============================================================================
// Task Lifecycle
// ============================================================================

/// Lifecycle status of one external task.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    TS,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[ts(export, export_to = "../bindings/generated.ts")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Error,
    Cancelled,
    Paused,
}

impl TaskStatus {
    /// Terminal statuses emit no further events from a well-behaved runner.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Error | TaskStatus::Cancelled
        )
    }
}

// ============================================================================
// Chat Turns
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "../bindings/generated.ts")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One turn of an entity's conversation, as rendered by the shell.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export, export_to = "../bindings/generated.ts")]
pub struct ChatTurn {
    /// Unique turn identifier (ULID, sortable by creation time)
    pub id: String,
    pub role: ChatRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content)
    }

    fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

// ============================================================================
// Inference Settings
// ============================================================================

/// Inference configuration captured per entity at submit time.
///
/// Each entity remembers its own last-used settings; a later submit without
/// overrides reuses them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default, TS)]
#[ts(export, export_to = "../bindings/generated.ts")]
pub struct InferenceSettings {
    pub provider_id: Option<String>,
    pub model_id: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub reasoning: Option<bool>,
}

// ============================================================================
// Tests
// ============================================================================
