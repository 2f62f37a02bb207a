//! Quest Definition Structures
//!
//! The static quest catalog is deserialized from TOML files; per-player
//! quest instances (with lifecycle and step completion) are stamped out
//! from the definitions and persisted inside the GameState record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

// ============================================================================
// Raw TOML structures
// ============================================================================

/// A quest definition file as it appears on disk.
#[derive(Debug, Clone, Deserialize)]
pub struct RawQuestFile {
    pub quest: RawQuest,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawQuest {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub steps: Vec<RawStep>,
    #[serde(default)]
    pub reward: RawReward,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawStep {
    pub id: String,
    pub description: String,
    #[serde(default = "default_difficulty")]
    pub difficulty: String,
    #[serde(default)]
    pub estimated_duration: String,
    #[serde(default)]
    pub points: i64,
    #[serde(default)]
    pub resources: Vec<RawResource>,
    pub launcher: Option<String>,
    pub validation: Option<String>,
}

fn default_difficulty() -> String {
    "normal".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawResource {
    #[serde(rename = "type")]
    pub kind: String,
    pub uri: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawReward {
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub items: Vec<String>,
}

// ============================================================================
// Enhanced step schema (schema version 2)
// ============================================================================

/// Authoring metadata for a step. Legacy records lack this block; serde
/// defaults keep them loadable before migration runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StepMetadata {
    pub difficulty: String,
    pub estimated_duration: String,
    pub points: i64,
}

impl Default for StepMetadata {
    fn default() -> Self {
        Self {
            difficulty: default_difficulty(),
            estimated_duration: String::new(),
            points: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    #[serde(rename = "type")]
    pub kind: String,
    pub uri: String,
}

/// How a step is launched and validated by external tooling, when known.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Execution {
    pub launcher: Option<String>,
    pub validation: Option<String>,
}

/// Per-player progress tracking on one step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StepProgress {
    pub notes: Vec<String>,
    pub artifacts: Vec<String>,
    pub attempt_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub description: String,
    pub completed: bool,
    #[serde(default)]
    pub metadata: StepMetadata,
    #[serde(default)]
    pub resources: Vec<Resource>,
    #[serde(default)]
    pub execution: Execution,
    #[serde(default)]
    pub progress: StepProgress,
}

// ============================================================================
// Quest lifecycle
// ============================================================================

/// Tagged quest lifecycle. Reward application lives inside the Completed
/// variant so it is structurally impossible to apply twice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QuestLifecycle {
    Available,
    Active {
        started_at: DateTime<Utc>,
    },
    Completed {
        completed_at: DateTime<Utc>,
        reward_applied: bool,
    },
    Failed {
        failed_at: DateTime<Utc>,
    },
}

impl QuestLifecycle {
    pub fn status_str(&self) -> &'static str {
        match self {
            QuestLifecycle::Available => "available",
            QuestLifecycle::Active { .. } => "active",
            QuestLifecycle::Completed { .. } => "completed",
            QuestLifecycle::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Reward {
    pub score: i64,
    pub items: Vec<String>,
}

/// A per-player quest instance, persisted inside the GameState record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quest {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(flatten)]
    pub lifecycle: QuestLifecycle,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub reward: Reward,
}

impl Quest {
    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == step_id)
    }

    pub fn all_steps_completed(&self) -> bool {
        !self.steps.is_empty() && self.steps.iter().all(|s| s.completed)
    }
}

// ============================================================================
// Resolved definition
// ============================================================================

/// A validated catalog entry, from which player instances are stamped.
#[derive(Debug, Clone)]
pub struct QuestDefinition {
    pub id: String,
    pub title: String,
    pub description: String,
    pub steps: Vec<Step>,
    pub reward: Reward,
}

impl QuestDefinition {
    pub fn from_raw(raw: &RawQuest) -> Result<Self, EngineError> {
        if raw.id.trim().is_empty() {
            return Err(EngineError::Catalog("quest id must not be empty".to_string()));
        }
        if raw.steps.is_empty() {
            return Err(EngineError::Catalog(format!(
                "quest '{}' has no steps",
                raw.id
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for step in &raw.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(EngineError::Catalog(format!(
                    "quest '{}' has duplicate step id '{}'",
                    raw.id, step.id
                )));
            }
        }

        let steps = raw
            .steps
            .iter()
            .map(|s| Step {
                id: s.id.clone(),
                description: s.description.clone(),
                completed: false,
                metadata: StepMetadata {
                    difficulty: s.difficulty.clone(),
                    estimated_duration: s.estimated_duration.clone(),
                    points: s.points,
                },
                resources: s
                    .resources
                    .iter()
                    .map(|r| Resource {
                        kind: r.kind.clone(),
                        uri: r.uri.clone(),
                    })
                    .collect(),
                execution: Execution {
                    launcher: s.launcher.clone(),
                    validation: s.validation.clone(),
                },
                progress: StepProgress::default(),
            })
            .collect();

        Ok(Self {
            id: raw.id.clone(),
            title: raw.title.clone(),
            description: raw.description.clone(),
            steps,
            reward: Reward {
                score: raw.reward.score,
                items: raw.reward.items.clone(),
            },
        })
    }

    /// Stamp out a fresh player instance in the available state.
    pub fn instantiate(&self) -> Quest {
        Quest {
            id: self.id.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            lifecycle: QuestLifecycle::Available,
            steps: self.steps.clone(),
            reward: self.reward.clone(),
        }
    }
}
