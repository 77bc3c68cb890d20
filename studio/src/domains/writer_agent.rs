//! Writer agent domain - chat-style long-form writing continuation.
//!
//! The writer agent converses with the user about one document. Prior
//! turns ride along in every request so the runner can continue the
//! piece coherently, and completed drafts are persisted through the
//! document library.

use serde::{Deserialize, Serialize};
use shared_types::EntityId;

use crate::tasks::{
    EntityTaskState, SaveRequest, SavedRecord, SubmitOptions, SubmitRequest, TaskDomain,
};

/// How many prior turns ride along in a continuation request. Older
/// turns are summarized into the draft itself, not resent.
const HISTORY_WINDOW: usize = 24;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a writing partner. Continue the user's piece in \
their voice; prefer concrete detail over filler. Return the continuation only.";

/// Draft record returned by the document library after a save.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedDraft {
    pub id: String,
    pub revision: u64,
}

impl SavedRecord for SavedDraft {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Default)]
pub struct WriterAgentDomain;

impl WriterAgentDomain {
    pub fn new() -> Self {
        Self
    }
}

impl TaskDomain for WriterAgentDomain {
    type SaveResult = SavedDraft;

    fn name(&self) -> &'static str {
        "writer_agent"
    }

    fn build_submit_request(
        &self,
        entity_id: &EntityId,
        prompt: &str,
        system_prompt: Option<&str>,
        state: &EntityTaskState<SavedDraft>,
        _options: &SubmitOptions,
    ) -> SubmitRequest {
        // The user turn for this prompt is already appended; the
        // history window therefore includes it.
        let history: Vec<serde_json::Value> = state
            .messages
            .iter()
            .rev()
            .take(HISTORY_WINDOW)
            .rev()
            .map(|turn| {
                serde_json::json!({
                    "role": turn.role,
                    "content": turn.content,
                })
            })
            .collect();

        SubmitRequest {
            operation: "writer.continue".to_string(),
            payload: serde_json::json!({
                "document_id": entity_id.as_str(),
                "prompt": prompt,
                "system_prompt": system_prompt.unwrap_or(DEFAULT_SYSTEM_PROMPT),
                "history": history,
                "settings": state.settings,
            }),
        }
    }

    fn build_save_request(
        &self,
        entity_id: &EntityId,
        _state: &EntityTaskState<SavedDraft>,
        content: &str,
    ) -> Option<SaveRequest> {
        Some(SaveRequest {
            target: format!("drafts/{entity_id}"),
            payload: serde_json::json!({
                "document_id": entity_id.as_str(),
                "content": content,
                "word_count": content.split_whitespace().count(),
            }),
        })
    }
}
