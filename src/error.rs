//! Engine Error Taxonomy
//!
//! Every error carries a stable machine-readable kind for collaborators
//! (REST layer, MCP adapter, bots) plus a human-readable message.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The persisted record is structurally malformed. Not retried.
    #[error("player record is structurally invalid: {0}")]
    InvalidState(String),

    /// Unrecognized or malformed action input. State is left unchanged.
    #[error("unknown or invalid action: {0}")]
    UnknownAction(String),

    #[error("quest not found: {0}")]
    QuestNotFound(String),

    #[error("step not found: {0}")]
    StepNotFound(String),

    /// Another quest is already active for this player.
    #[error("quest {active} is already active")]
    QuestConflict { active: String },

    #[error("inventory is full (capacity {capacity})")]
    InventoryFull { capacity: usize },

    #[error("item not found in inventory: {0}")]
    ItemNotFound(String),

    /// Another live replica holds the write token for this player.
    #[error("player {player_id} is owned by replica {holder}")]
    OwnershipConflict { player_id: String, holder: String },

    /// A store call exceeded its bounded timeout. The caller may resubmit
    /// the whole action; the engine never retries automatically.
    #[error("store operation timed out after {0:?}")]
    StoreTimeout(Duration),

    #[error("store error: {0}")]
    Store(String),

    #[error("quest catalog error: {0}")]
    Catalog(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Stable machine-readable kind, independent of the display message.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidState(_) => "invalid_state",
            EngineError::UnknownAction(_) => "unknown_action",
            EngineError::QuestNotFound(_) => "quest_not_found",
            EngineError::StepNotFound(_) => "step_not_found",
            EngineError::QuestConflict { .. } => "quest_conflict",
            EngineError::InventoryFull { .. } => "inventory_full",
            EngineError::ItemNotFound(_) => "item_not_found",
            EngineError::OwnershipConflict { .. } => "ownership_conflict",
            EngineError::StoreTimeout(_) => "store_timeout",
            EngineError::Store(_) => "store",
            EngineError::Catalog(_) => "catalog",
            EngineError::Config(_) => "config",
        }
    }

    /// Whether resubmitting the same action could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::StoreTimeout(_) | EngineError::OwnershipConflict { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_stable() {
        assert_eq!(EngineError::InvalidState("x".into()).kind(), "invalid_state");
        assert_eq!(EngineError::UnknownAction("x".into()).kind(), "unknown_action");
        assert_eq!(
            EngineError::QuestConflict { active: "q1".into() }.kind(),
            "quest_conflict"
        );
        assert_eq!(
            EngineError::StoreTimeout(Duration::from_secs(5)).kind(),
            "store_timeout"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(EngineError::StoreTimeout(Duration::from_secs(1)).is_retryable());
        assert!(!EngineError::QuestNotFound("q".into()).is_retryable());
    }
}
