//! Game State Manager
//!
//! Owns the authoritative in-memory copy of each player this replica has
//! claimed. Actions for one player are serialized through a per-player
//! mutex slot; different players proceed fully concurrently. Every
//! successful action is persisted, then announced on the change bus with
//! the player's next revision.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::{ChangeBus, ChangeEvent};
use crate::config::{AbandonPolicy, EngineConfig};
use crate::error::EngineError;
use crate::quest::catalog::QuestCatalog;
use crate::quest::definition::{Quest, QuestDefinition};
use crate::quest::engine;
use crate::state::{ChatMessage, GameState, Session};
use crate::store::{OwnerClaim, StateStore, with_timeout};

// ============================================================================
// Actions
// ============================================================================

/// The action vocabulary exposed to collaborators as `{type, payload}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    SetScore { score: i64 },
    AdjustScore { delta: i64 },
    StartQuest { quest_id: String },
    AbandonQuest,
    CompleteStep { step_id: String },
    AddItem { item: String, quantity: u32 },
    RemoveItem { item: String, quantity: u32 },
    UpdatePlayer {
        name: Option<String>,
        status: Option<String>,
        location: Option<String>,
    },
    /// Chat content generation is external; the core only records the
    /// exchange into the session transcript.
    Chat { role: String, text: String },
    ResetSession,
}

impl Action {
    /// Parse a raw `{type, payload}` value. Unrecognized or malformed
    /// input surfaces as `unknown_action` and never touches state.
    pub fn from_value(value: serde_json::Value) -> Result<Self, EngineError> {
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("<missing type>")
            .to_string();
        serde_json::from_value(value)
            .map_err(|e| EngineError::UnknownAction(format!("{}: {}", kind, e)))
    }
}

// ============================================================================
// Manager
// ============================================================================

struct CacheEntry {
    state: GameState,
    revision: u64,
    /// Whether this replica holds the write token for the player.
    owned: bool,
}

type Slot = Arc<Mutex<Option<CacheEntry>>>;

pub struct GameStateManager {
    replica_id: String,
    store: Arc<dyn StateStore>,
    bus: Arc<ChangeBus>,
    catalog: Arc<QuestCatalog>,
    inventory_cap: usize,
    abandon_policy: AbandonPolicy,
    store_timeout: Duration,
    owner_ttl: Duration,
    slots: DashMap<String, Slot>,
}

impl GameStateManager {
    pub fn new(
        replica_id: &str,
        store: Arc<dyn StateStore>,
        bus: Arc<ChangeBus>,
        catalog: Arc<QuestCatalog>,
        cfg: &EngineConfig,
    ) -> Self {
        Self {
            replica_id: replica_id.to_string(),
            store,
            bus,
            catalog,
            inventory_cap: cfg.inventory_cap,
            abandon_policy: cfg.abandon_policy,
            store_timeout: cfg.store_timeout(),
            owner_ttl: cfg.owner_ttl(),
            slots: DashMap::new(),
        }
    }

    fn slot(&self, player_id: &str) -> Slot {
        self.slots
            .entry(player_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    async fn load_from_store(&self, player_id: &str) -> Result<CacheEntry, EngineError> {
        let record = with_timeout(self.store_timeout, self.store.load(player_id)).await?;
        let (mut state, revision) = match record {
            Some(record) => (GameState::from_json(&record.state_json)?, record.revision),
            // Lazy default-state creation on first player reference
            None => (GameState::new_default(player_id), 0),
        };
        engine::sync_available(&mut state, &self.catalog);
        Ok(CacheEntry {
            state,
            revision,
            owned: false,
        })
    }

    /// Apply one action atomically for this player. Mutation happens on a
    /// working copy; the cache commits only after the store accepted the
    /// write, so a persistence failure leaves cache and store agreeing on
    /// the pre-action state.
    pub async fn apply_action(
        &self,
        player_id: &str,
        action: Action,
    ) -> Result<GameState, EngineError> {
        let slot = self.slot(player_id);
        let mut guard = slot.lock().await;

        // Single writer across replicas: hold the player's ownership token
        match with_timeout(
            self.store_timeout,
            self.store.claim_owner(player_id, &self.replica_id, self.owner_ttl),
        )
        .await?
        {
            OwnerClaim::Granted => {}
            OwnerClaim::Held { holder } => {
                return Err(EngineError::OwnershipConflict {
                    player_id: player_id.to_string(),
                    holder,
                });
            }
        }

        // A granted claim may be a handover from a peer that wrote and
        // released. Anything cached while not owning the player is a reader
        // snapshot and can be stale, so reload from the store on the
        // not-owned -> owned transition.
        if guard.as_ref().is_none_or(|e| !e.owned) {
            *guard = Some(self.load_from_store(player_id).await?);
        }
        let Some(entry) = guard.as_mut() else {
            return Err(EngineError::Store("cache slot empty after load".to_string()));
        };
        // The token is live from the claim onward; shutdown must release it
        // even when the action below fails.
        entry.owned = true;

        entry.state.validate()?;

        let mut next = entry.state.clone();
        let summary = self.apply_to_state(&mut next, &action)?;
        next.recompute_derived();

        let new_revision = entry.revision + 1;
        let json = next.to_json()?;
        with_timeout(
            self.store_timeout,
            self.store.save(player_id, &json, new_revision),
        )
        .await?;

        entry.state = next;
        entry.revision = new_revision;
        let result = entry.state.clone();

        debug!("Applied {} for {} at revision {}", summary, player_id, new_revision);
        // Publish before the slot unlocks so events leave in commit order;
        // a later action serialized behind this mutex must not announce its
        // revision first.
        self.bus.publish(ChangeEvent {
            player_id: player_id.to_string(),
            revision: new_revision,
            summary,
            origin: self.replica_id.clone(),
        });
        Ok(result)
    }

    fn apply_to_state(&self, state: &mut GameState, action: &Action) -> Result<String, EngineError> {
        match action {
            Action::SetScore { score } => {
                if *score < 0 {
                    return Err(EngineError::UnknownAction(
                        "SET_SCORE: score must be non-negative".to_string(),
                    ));
                }
                state.player.score = *score;
                Ok(format!("score set to {}", score))
            }
            Action::AdjustScore { delta } => {
                state.player.score = (state.player.score + delta).max(0);
                Ok(format!("score adjusted by {}", delta))
            }
            Action::StartQuest { quest_id } => {
                engine::start_quest(state, quest_id)?;
                Ok(format!("quest {} started", quest_id))
            }
            Action::AbandonQuest => {
                let quest_id = engine::abandon_quest(state, self.abandon_policy)?;
                Ok(format!("quest {} abandoned", quest_id))
            }
            Action::CompleteStep { step_id } => {
                let newly = engine::complete_step(state, step_id)?;
                if let Some(outcome) = engine::evaluate_completion(state, self.inventory_cap) {
                    Ok(format!(
                        "step {} completed; quest {} completed (+{} score)",
                        step_id, outcome.quest_id, outcome.reward_score
                    ))
                } else if newly {
                    Ok(format!("step {} completed", step_id))
                } else {
                    Ok(format!("step {} re-confirmed", step_id))
                }
            }
            Action::AddItem { item, quantity } => {
                state.add_item(item, *quantity, self.inventory_cap)?;
                Ok(format!("{} x{} added to inventory", item, quantity))
            }
            Action::RemoveItem { item, quantity } => {
                state.remove_item(item, *quantity)?;
                Ok(format!("{} x{} removed from inventory", item, quantity))
            }
            Action::UpdatePlayer {
                name,
                status,
                location,
            } => {
                if let Some(name) = name {
                    state.player.name = name.clone();
                }
                if let Some(status) = status {
                    state.player.status = status.clone();
                }
                if let Some(location) = location {
                    state.player.location = location.clone();
                }
                Ok("player fields updated".to_string())
            }
            Action::Chat { role, text } => {
                state.session.conversation_history.push(ChatMessage {
                    role: role.clone(),
                    text: text.clone(),
                    at: Utc::now(),
                });
                state.session.turn_count += 1;
                Ok(format!("chat turn {}", state.session.turn_count))
            }
            Action::ResetSession => {
                state.session = Session::default();
                Ok("session reset".to_string())
            }
        }
    }

    /// Read path. The cached copy is authoritative while this replica owns
    /// the player; otherwise the cache is a lazily refreshed snapshot that
    /// the invalidation task drops when a foreign write lands.
    pub async fn get_state(&self, player_id: &str) -> Result<GameState, EngineError> {
        let slot = self.slot(player_id);
        let mut guard = slot.lock().await;
        if guard.is_none() {
            *guard = Some(self.load_from_store(player_id).await?);
        }
        match guard.as_ref() {
            Some(entry) => Ok(entry.state.clone()),
            None => Err(EngineError::Store("cache slot empty after load".to_string())),
        }
    }

    pub async fn list_available_quests(&self, player_id: &str) -> Result<Vec<Quest>, EngineError> {
        Ok(self.get_state(player_id).await?.quests.available)
    }

    /// The full static catalog quests are drawn from.
    pub fn quest_catalog(&self) -> Vec<Arc<QuestDefinition>> {
        self.catalog.definitions()
    }

    /// Drop cached copies when another replica announces a newer revision.
    pub fn spawn_invalidation(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        let mut rx = manager.bus.subscribe_all();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ev) => {
                        if ev.origin == manager.replica_id {
                            continue;
                        }
                        manager.invalidate_if_stale(&ev).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            "Invalidation feed lagged ({} events), dropping all foreign caches",
                            skipped
                        );
                        manager.drop_unowned_caches().await;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    async fn invalidate_if_stale(&self, ev: &ChangeEvent) {
        let slot = match self.slots.get(&ev.player_id) {
            Some(slot) => slot.clone(),
            None => return,
        };
        let mut guard = slot.lock().await;
        if let Some(entry) = guard.as_ref() {
            if !entry.owned && entry.revision < ev.revision {
                debug!(
                    "Invalidating cached {} (revision {} < {})",
                    ev.player_id, entry.revision, ev.revision
                );
                *guard = None;
            }
        }
    }

    async fn drop_unowned_caches(&self) {
        let slots: Vec<Slot> = self.slots.iter().map(|e| e.value().clone()).collect();
        for slot in slots {
            let mut guard = slot.lock().await;
            if guard.as_ref().is_some_and(|e| !e.owned) {
                *guard = None;
            }
        }
    }

    /// Hand back every ownership token this replica holds (shutdown path).
    pub async fn release_owned(&self) {
        let slots: Vec<(String, Slot)> = self
            .slots
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (player_id, slot) in slots {
            let mut guard = slot.lock().await;
            if let Some(entry) = guard.as_mut() {
                if entry.owned {
                    // Demote the cache to a reader snapshot so a later
                    // re-claim reloads instead of trusting it.
                    entry.owned = false;
                    if let Err(e) = self.store.release_owner(&player_id, &self.replica_id).await {
                        warn!("Failed to release ownership of {}: {}", player_id, e);
                    }
                }
            }
        }
    }
}
