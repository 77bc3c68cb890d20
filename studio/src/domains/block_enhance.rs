//! Block enhancement domain - in-place "enhance this text".
//!
//! The entity is a single content block. Its original text seeds the
//! stream so deltas compose onto it, a failure reverts the visible text
//! to the original, and a completed enhancement replaces the block in
//! storage.

use serde::{Deserialize, Serialize};
use shared_types::EntityId;

use crate::tasks::{
    EntityTaskState, ErrorRecovery, SaveRequest, SavedRecord, SubmitOptions, SubmitRequest,
    TaskDomain,
};

/// Block record returned by block storage after a save.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedBlock {
    pub id: String,
}

impl SavedRecord for SavedBlock {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Default)]
pub struct BlockEnhanceDomain;

impl BlockEnhanceDomain {
    pub fn new() -> Self {
        Self
    }

    /// Submit options carrying the block's current text, which the
    /// runner needs and the stream is seeded from.
    pub fn options_for(original_text: &str) -> SubmitOptions {
        SubmitOptions {
            params: serde_json::json!({ "original_text": original_text }),
            ..Default::default()
        }
    }

    fn original_text(options: &SubmitOptions) -> Option<&str> {
        options.params.get("original_text").and_then(|v| v.as_str())
    }
}

impl TaskDomain for BlockEnhanceDomain {
    type SaveResult = SavedBlock;

    fn name(&self) -> &'static str {
        "block_enhance"
    }

    fn build_submit_request(
        &self,
        entity_id: &EntityId,
        prompt: &str,
        system_prompt: Option<&str>,
        state: &EntityTaskState<SavedBlock>,
        options: &SubmitOptions,
    ) -> SubmitRequest {
        SubmitRequest {
            operation: "block.enhance".to_string(),
            payload: serde_json::json!({
                "block_id": entity_id.as_str(),
                "instruction": prompt,
                "original_text": Self::original_text(options).unwrap_or_default(),
                "system_prompt": system_prompt,
                "settings": state.settings,
            }),
        }
    }

    fn build_save_request(
        &self,
        entity_id: &EntityId,
        _state: &EntityTaskState<SavedBlock>,
        content: &str,
    ) -> Option<SaveRequest> {
        Some(SaveRequest {
            target: format!("blocks/{entity_id}"),
            payload: serde_json::json!({
                "block_id": entity_id.as_str(),
                "content": content,
            }),
        })
    }

    fn seed_content(&self, _entity_id: &EntityId, options: &SubmitOptions) -> Option<String> {
        Self::original_text(options)
            .filter(|text| !text.is_empty())
            .map(str::to_string)
    }

    fn error_recovery(&self) -> ErrorRecovery {
        ErrorRecovery::RevertToSeed
    }
}
