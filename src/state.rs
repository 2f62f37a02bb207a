//! Player Game State
//!
//! The per-player record: profile, quest log, inventory, session, and
//! metadata. One record per player in the durable store; the replica that
//! owns the player holds the mutable in-memory copy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::quest::definition::Quest;

/// Current persisted schema version (the "enhanced step" schema).
pub const SCHEMA_VERSION: u32 = 2;

/// Schema version before quest steps carried metadata/resources/progress.
pub const LEGACY_SCHEMA_VERSION: u32 = 1;

// ============================================================================
// Level
// ============================================================================

/// Player level, a pure function of score. Never stored in a way that
/// contradicts the score; recomputed after every score change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Novice,
    Apprentice,
    Expert,
    Master,
}

impl Level {
    /// Threshold function: 0 -> novice, 100 -> apprentice, 500 -> expert,
    /// 1000 -> master.
    pub fn for_score(score: i64) -> Self {
        if score >= 1000 {
            Level::Master
        } else if score >= 500 {
            Level::Expert
        } else if score >= 100 {
            Level::Apprentice
        } else {
            Level::Novice
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Novice => "novice",
            Level::Apprentice => "apprentice",
            Level::Expert => "expert",
            Level::Master => "master",
        }
    }
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerProfile {
    pub id: String,
    pub name: String,
    pub score: i64,
    pub level: Level,
    pub status: String,
    pub location: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub text: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Session {
    pub conversation_history: Vec<ChatMessage>,
    pub turn_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub schema_version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemStack {
    pub item: String,
    pub quantity: u32,
}

/// Quest buckets. Invariant: a quest id appears in exactly one bucket, and
/// at most one quest is active (enforced by the `Option`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuestLog {
    pub available: Vec<Quest>,
    pub active: Option<Quest>,
    pub completed: Vec<Quest>,
}

impl QuestLog {
    /// True if the quest id is tracked in any bucket.
    pub fn contains(&self, quest_id: &str) -> bool {
        self.available.iter().any(|q| q.id == quest_id)
            || self.active.as_ref().is_some_and(|q| q.id == quest_id)
            || self.completed.iter().any(|q| q.id == quest_id)
    }

    /// All quest ids across every bucket.
    pub fn quest_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.available.iter().map(|q| q.id.as_str()).collect();
        if let Some(q) = &self.active {
            ids.push(q.id.as_str());
        }
        ids.extend(self.completed.iter().map(|q| q.id.as_str()));
        ids
    }
}

// ============================================================================
// GameState
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameState {
    pub player: PlayerProfile,
    pub quests: QuestLog,
    pub inventory: Vec<ItemStack>,
    pub session: Session,
    pub metadata: Metadata,
}

impl GameState {
    /// Default state created on first player reference: score 0, novice,
    /// idle in town, nothing started.
    pub fn new_default(player_id: &str) -> Self {
        let now = Utc::now();
        Self {
            player: PlayerProfile {
                id: player_id.to_string(),
                name: player_id.to_string(),
                score: 0,
                level: Level::Novice,
                status: "idle".to_string(),
                location: "town".to_string(),
            },
            quests: QuestLog::default(),
            inventory: Vec::new(),
            session: Session::default(),
            metadata: Metadata {
                schema_version: SCHEMA_VERSION,
                created_at: now,
                updated_at: now,
            },
        }
    }

    /// Parse a persisted record. Checks the five required sections are
    /// present before the typed parse so corruption surfaces as
    /// `invalid_state` with a useful message.
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| EngineError::InvalidState(format!("record is not valid JSON: {}", e)))?;
        for section in ["player", "quests", "inventory", "session", "metadata"] {
            if value.get(section).is_none() {
                return Err(EngineError::InvalidState(format!(
                    "record is missing the '{}' section",
                    section
                )));
            }
        }
        serde_json::from_value(value)
            .map_err(|e| EngineError::InvalidState(format!("record does not match schema: {}", e)))
    }

    pub fn to_json(&self) -> Result<String, EngineError> {
        serde_json::to_string(self)
            .map_err(|e| EngineError::Store(format!("failed to serialize state: {}", e)))
    }

    /// Invariant check run before any mutation.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.player.score < 0 {
            return Err(EngineError::InvalidState(format!(
                "negative score {} for player {}",
                self.player.score, self.player.id
            )));
        }
        if self.player.level != Level::for_score(self.player.score) {
            return Err(EngineError::InvalidState(format!(
                "level {:?} contradicts score {}",
                self.player.level, self.player.score
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for id in self.quests.quest_ids() {
            if !seen.insert(id) {
                return Err(EngineError::InvalidState(format!(
                    "quest {} appears in more than one bucket",
                    id
                )));
            }
        }
        Ok(())
    }

    /// Recompute every derived field. Called once after each successful
    /// action application.
    pub fn recompute_derived(&mut self) {
        self.player.level = Level::for_score(self.player.score);
        self.metadata.updated_at = Utc::now();
    }

    /// Add items to the inventory, stacking onto an existing entry where
    /// possible. A new stack beyond the cap fails rather than dropping.
    pub fn add_item(&mut self, item: &str, quantity: u32, cap: usize) -> Result<(), EngineError> {
        if quantity == 0 {
            return Ok(());
        }
        if let Some(stack) = self.inventory.iter_mut().find(|s| s.item == item) {
            stack.quantity += quantity;
            return Ok(());
        }
        if self.inventory.len() >= cap {
            return Err(EngineError::InventoryFull { capacity: cap });
        }
        self.inventory.push(ItemStack {
            item: item.to_string(),
            quantity,
        });
        Ok(())
    }

    /// Remove items, dropping the stack when it reaches zero.
    pub fn remove_item(&mut self, item: &str, quantity: u32) -> Result<(), EngineError> {
        let Some(idx) = self.inventory.iter().position(|s| s.item == item) else {
            return Err(EngineError::ItemNotFound(item.to_string()));
        };
        let stack = &mut self.inventory[idx];
        if stack.quantity < quantity {
            return Err(EngineError::ItemNotFound(format!(
                "{} (have {}, tried to remove {})",
                item, stack.quantity, quantity
            )));
        }
        stack.quantity -= quantity;
        if stack.quantity == 0 {
            self.inventory.remove(idx);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_thresholds() {
        assert_eq!(Level::for_score(0), Level::Novice);
        assert_eq!(Level::for_score(99), Level::Novice);
        assert_eq!(Level::for_score(100), Level::Apprentice);
        assert_eq!(Level::for_score(499), Level::Apprentice);
        assert_eq!(Level::for_score(500), Level::Expert);
        assert_eq!(Level::for_score(999), Level::Expert);
        assert_eq!(Level::for_score(1000), Level::Master);
        assert_eq!(Level::for_score(5000), Level::Master);
    }

    #[test]
    fn test_default_state() {
        let state = GameState::new_default("p1");
        assert_eq!(state.player.score, 0);
        assert_eq!(state.player.level, Level::Novice);
        assert_eq!(state.player.status, "idle");
        assert_eq!(state.player.location, "town");
        assert!(state.quests.available.is_empty());
        assert!(state.quests.active.is_none());
        assert!(state.inventory.is_empty());
        assert_eq!(state.metadata.schema_version, SCHEMA_VERSION);
        state.validate().unwrap();
    }

    #[test]
    fn test_from_json_missing_section() {
        let err = GameState::from_json(r#"{"player": {}, "quests": {}}"#).unwrap_err();
        assert_eq!(err.kind(), "invalid_state");
        assert!(err.to_string().contains("inventory"));
    }

    #[test]
    fn test_json_round_trip() {
        let state = GameState::new_default("p1");
        let json = state.to_json().unwrap();
        let back = GameState::from_json(&json).unwrap();
        assert_eq!(back.player.id, "p1");
        assert_eq!(back.player.level, Level::Novice);
    }

    #[test]
    fn test_validate_rejects_contradicting_level() {
        let mut state = GameState::new_default("p1");
        state.player.score = 600;
        // level left at Novice
        let err = state.validate().unwrap_err();
        assert_eq!(err.kind(), "invalid_state");

        state.recompute_derived();
        assert_eq!(state.player.level, Level::Expert);
        state.validate().unwrap();
    }

    #[test]
    fn test_inventory_cap() {
        let mut state = GameState::new_default("p1");
        for i in 0..3 {
            state.add_item(&format!("item{}", i), 1, 3).unwrap();
        }
        let err = state.add_item("overflow", 1, 3).unwrap_err();
        assert_eq!(err.kind(), "inventory_full");
        assert_eq!(state.inventory.len(), 3);

        // Stacking onto an existing entry is not a new slot
        state.add_item("item0", 5, 3).unwrap();
        assert_eq!(state.inventory[0].quantity, 6);
    }

    #[test]
    fn test_remove_item() {
        let mut state = GameState::new_default("p1");
        state.add_item("torch", 2, 10).unwrap();
        state.remove_item("torch", 1).unwrap();
        assert_eq!(state.inventory[0].quantity, 1);
        state.remove_item("torch", 1).unwrap();
        assert!(state.inventory.is_empty());
        let err = state.remove_item("torch", 1).unwrap_err();
        assert_eq!(err.kind(), "item_not_found");
    }
}
