//! Quest System Module
//!
//! Quest definitions live in TOML catalog files; per-player quest instances
//! live inside the GameState record and move through the lifecycle state
//! machine in `engine`.

pub mod catalog;
pub mod definition;
pub mod engine;

pub use catalog::QuestCatalog;
pub use definition::{Quest, QuestDefinition, QuestLifecycle, Reward, Step};
pub use engine::CompletionOutcome;
