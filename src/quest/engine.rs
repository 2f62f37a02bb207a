//! Quest Lifecycle State Machine
//!
//! available -> active -> {completed, failed}. One active quest per player.
//! Completion is evaluated after every step mutation; the reward is applied
//! exactly once, guarded by the `reward_applied` flag carried inside the
//! Completed variant.

use chrono::Utc;
use tracing::warn;

use crate::config::AbandonPolicy;
use crate::error::EngineError;
use crate::quest::catalog::QuestCatalog;
use crate::quest::definition::{Quest, QuestLifecycle};
use crate::state::{GameState, Level};

/// What happened when the active quest finished.
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub quest_id: String,
    pub reward_score: i64,
    pub items_granted: Vec<String>,
    /// Reward items that did not fit in the inventory.
    pub items_dropped: Vec<String>,
}

/// Top up the available bucket with catalog quests the player is not yet
/// tracking in any bucket. Keeps the one-bucket-per-quest invariant.
pub fn sync_available(state: &mut GameState, catalog: &QuestCatalog) {
    for def in catalog.definitions() {
        if !state.quests.contains(&def.id) {
            state.quests.available.push(def.instantiate());
        }
    }
}

/// Move a quest from available to active. Fails if another quest is active
/// or the quest is not in the available bucket.
pub fn start_quest(state: &mut GameState, quest_id: &str) -> Result<(), EngineError> {
    if let Some(active) = &state.quests.active {
        return Err(EngineError::QuestConflict {
            active: active.id.clone(),
        });
    }

    let Some(idx) = state.quests.available.iter().position(|q| q.id == quest_id) else {
        return Err(EngineError::QuestNotFound(quest_id.to_string()));
    };

    let mut quest = state.quests.available.remove(idx);
    reset_progress(&mut quest);
    quest.lifecycle = QuestLifecycle::Active {
        started_at: Utc::now(),
    };
    state.quests.active = Some(quest);
    Ok(())
}

/// Abandon the active quest. Depending on policy the quest returns to the
/// available bucket (restartable) or is marked failed.
pub fn abandon_quest(state: &mut GameState, policy: AbandonPolicy) -> Result<String, EngineError> {
    let Some(mut quest) = state.quests.active.take() else {
        return Err(EngineError::QuestNotFound("no active quest".to_string()));
    };
    let quest_id = quest.id.clone();

    match policy {
        AbandonPolicy::ReturnToAvailable => {
            reset_progress(&mut quest);
            quest.lifecycle = QuestLifecycle::Available;
            state.quests.available.push(quest);
        }
        AbandonPolicy::Fail => {
            quest.lifecycle = QuestLifecycle::Failed {
                failed_at: Utc::now(),
            };
            state.quests.completed.push(quest);
        }
    }
    Ok(quest_id)
}

/// Mark a step of the active quest completed. Re-invoking on an
/// already-completed step is not an error: it bumps the attempt counter and
/// changes nothing else. Returns true when the step was newly completed.
pub fn complete_step(state: &mut GameState, step_id: &str) -> Result<bool, EngineError> {
    let Some(active) = state.quests.active.as_mut() else {
        return Err(EngineError::StepNotFound(step_id.to_string()));
    };
    let Some(step) = active.step_mut(step_id) else {
        return Err(EngineError::StepNotFound(step_id.to_string()));
    };

    if step.completed {
        step.progress.attempt_count += 1;
        Ok(false)
    } else {
        step.completed = true;
        Ok(true)
    }
}

/// When every step of the active quest is complete, move it to the
/// completed bucket and apply the reward exactly once. Safe to call any
/// number of times; a second invocation finds no finished active quest.
pub fn evaluate_completion(state: &mut GameState, inventory_cap: usize) -> Option<CompletionOutcome> {
    let finished = state
        .quests
        .active
        .as_ref()
        .is_some_and(Quest::all_steps_completed);
    if !finished {
        return None;
    }

    let mut quest = state.quests.active.take()?;
    quest.lifecycle = QuestLifecycle::Completed {
        completed_at: Utc::now(),
        reward_applied: false,
    };
    let outcome = apply_reward(state, &mut quest, inventory_cap);
    state.quests.completed.push(quest);
    outcome
}

fn apply_reward(
    state: &mut GameState,
    quest: &mut Quest,
    inventory_cap: usize,
) -> Option<CompletionOutcome> {
    let QuestLifecycle::Completed { reward_applied, .. } = &mut quest.lifecycle else {
        return None;
    };
    if *reward_applied {
        return None;
    }
    *reward_applied = true;

    state.player.score += quest.reward.score;
    // Level re-derived after the reward lands, not before
    state.player.level = Level::for_score(state.player.score);

    let mut granted = Vec::new();
    let mut dropped = Vec::new();
    for item in &quest.reward.items {
        match state.add_item(item, 1, inventory_cap) {
            Ok(()) => granted.push(item.clone()),
            Err(_) => {
                warn!(
                    "Reward item '{}' dropped for player {}: inventory full",
                    item, state.player.id
                );
                dropped.push(item.clone());
            }
        }
    }

    Some(CompletionOutcome {
        quest_id: quest.id.clone(),
        reward_score: quest.reward.score,
        items_granted: granted,
        items_dropped: dropped,
    })
}

fn reset_progress(quest: &mut Quest) {
    for step in &mut quest.steps {
        step.completed = false;
        step.progress.attempt_count = 0;
        step.progress.notes.clear();
        step.progress.artifacts.clear();
    }
}
