//! Persistence collaborator contract.
//!
//! Persisting completed content is owned by the surrounding application
//! (document library, block storage). The engine only needs a way to
//! hand over a save request after a completed operation and to record
//! the outcome on the entity's state.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Anything a saver returns must at least be addressable afterwards.
pub trait SavedRecord {
    fn id(&self) -> &str;
}

/// Domain-built request handed to the saver after a completed
/// operation. `target` addresses the destination (a draft, a block);
/// `payload` is the domain's body and is opaque to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveRequest {
    pub target: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SaveError {
    #[error("save rejected: {0}")]
    Rejected(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

/// The application-side persistence service for one domain.
#[async_trait]
pub trait DraftSaver<S>: Send + Sync {
    async fn save(&self, request: SaveRequest) -> Result<S, SaveError>;
}
