//! External task runner bridge.
//!
//! The runner performs the actual long-running AI operations out of
//! process. This module owns only the boundary contract: how work is
//! submitted, how it is cancelled, and the shape of the multiplexed
//! event stream every in-flight task reports on.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared_types::TaskId;
use tokio::sync::broadcast;

/// Payload handed to the runner at submission time.
///
/// `operation` selects the runner-side handler; `payload` is the
/// domain-built request body and is opaque to this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub operation: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RunnerError {
    #[error("task runner rejected the request: {0}")]
    Rejected(String),

    #[error("task runner transport failure: {0}")]
    Transport(String),

    #[error("task runner bridge is not available")]
    Unavailable,
}

/// One event on the runner's multiplexed stream.
///
/// The wire shape is `{ "type": ..., "data": { "task_id": ..., ... } }`.
/// Types this build does not know about deserialize to [`RunnerEvent::Unknown`]
/// and are dropped by the bus, so a newer runner can ship event types ahead
/// of us without breaking anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RunnerEvent {
    Queued {
        task_id: TaskId,
    },
    Started {
        task_id: TaskId,
    },
    Progress {
        task_id: TaskId,
        #[serde(default)]
        message: Option<String>,
    },
    Stream {
        task_id: TaskId,
        delta: String,
    },
    Completed {
        task_id: TaskId,
        #[serde(default)]
        result: serde_json::Value,
    },
    Error {
        task_id: TaskId,
        message: String,
    },
    Cancelled {
        task_id: TaskId,
    },
    Paused {
        task_id: TaskId,
    },
    Resumed {
        task_id: TaskId,
    },
    #[serde(other)]
    Unknown,
}

impl RunnerEvent {
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            RunnerEvent::Queued { task_id }
            | RunnerEvent::Started { task_id }
            | RunnerEvent::Progress { task_id, .. }
            | RunnerEvent::Stream { task_id, .. }
            | RunnerEvent::Completed { task_id, .. }
            | RunnerEvent::Error { task_id, .. }
            | RunnerEvent::Cancelled { task_id }
            | RunnerEvent::Paused { task_id }
            | RunnerEvent::Resumed { task_id } => Some(task_id),
            RunnerEvent::Unknown => None,
        }
    }
}

/// The bridge to the external task runner.
///
/// Implementations wrap whatever transport the desktop shell provides.
/// The engine holds exactly one instance and shares it across domains.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Whether the bridge is wired up at all. A missing bridge is a
    /// packaging problem the UI cannot recover from; callers guard on
    /// this and no-op instead of surfacing an error state.
    fn available(&self) -> bool {
        true
    }

    /// Start an operation. Resolves to the runner-assigned task id.
    async fn submit(&self, request: SubmitRequest) -> Result<TaskId, RunnerError>;

    /// Best-effort cancellation; the runner is not guaranteed to emit a
    /// `cancelled` event promptly, or at all.
    fn cancel(&self, task_id: &TaskId);

    /// The single multiplexed event stream. `None` means the bridge
    /// cannot deliver events (degraded, not fatal).
    fn events(&self) -> Option<broadcast::Receiver<RunnerEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let event: RunnerEvent = serde_json::from_value(serde_json::json!({
            "type": "stream",
            "data": { "task_id": "t1", "delta": "He" }
        }))
        .unwrap();
        assert_eq!(
            event,
            RunnerEvent::Stream {
                task_id: TaskId::from("t1"),
                delta: "He".to_string(),
            }
        );
    }

    #[test]
    fn test_unknown_event_type_deserializes() {
        let event: RunnerEvent = serde_json::from_value(serde_json::json!({
            "type": "some-future-type",
            "data": { "task_id": "t1", "whatever": 42 }
        }))
        .unwrap();
        assert_eq!(event, RunnerEvent::Unknown);
        assert!(event.task_id().is_none());
    }

    #[test]
    fn test_completed_result_defaults_to_null() {
        let event: RunnerEvent = serde_json::from_value(serde_json::json!({
            "type": "completed",
            "data": { "task_id": "t9" }
        }))
        .unwrap();
        match event {
            RunnerEvent::Completed { task_id, result } => {
                assert_eq!(task_id.as_str(), "t9");
                assert!(result.is_null());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
