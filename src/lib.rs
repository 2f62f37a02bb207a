//! questline-engine
//!
//! A replicated game-state engine: each replica caches player state backed
//! by a shared durable store, applies actions through a per-player
//! serialized pipeline, and fans out change events to peers and live
//! subscribers. Collaborators (REST layer, MCP adapter, bots, dashboards)
//! consume the [`EngineReplica`] surface; transports and content
//! generation live outside this crate.

pub mod bus;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod manager;
pub mod migration;
pub mod notify;
pub mod quest;
pub mod state;
pub mod store;

use std::sync::Arc;

use tokio::task::JoinHandle;
use uuid::Uuid;

pub use bus::{ChangeBus, ChangeEvent};
pub use config::{AbandonPolicy, EngineConfig};
pub use coordinator::ReplicaCoordinator;
pub use error::EngineError;
pub use manager::{Action, GameStateManager};
pub use migration::{MigrationReport, MigrationRunner};
pub use notify::{LiveNotifier, Subscription};
pub use quest::{Quest, QuestCatalog, QuestDefinition, QuestLifecycle};
pub use state::{GameState, Level};
pub use store::{MemoryStore, SqliteStore, StateStore};

/// One running engine replica. Multiple replicas share a store and a
/// change bus; leadership and per-player write ownership are negotiated
/// through the store.
pub struct EngineReplica {
    replica_id: String,
    store: Arc<dyn StateStore>,
    manager: Arc<GameStateManager>,
    coordinator: Arc<ReplicaCoordinator>,
    notifier: LiveNotifier,
    cfg: EngineConfig,
}

impl EngineReplica {
    pub fn new(
        cfg: EngineConfig,
        store: Arc<dyn StateStore>,
        bus: Arc<ChangeBus>,
        catalog: Arc<QuestCatalog>,
    ) -> Self {
        let replica_id = format!("replica-{}", Uuid::new_v4());
        Self::with_id(&replica_id, cfg, store, bus, catalog)
    }

    /// Fixed replica id, for tests and deployments with stable naming.
    pub fn with_id(
        replica_id: &str,
        cfg: EngineConfig,
        store: Arc<dyn StateStore>,
        bus: Arc<ChangeBus>,
        catalog: Arc<QuestCatalog>,
    ) -> Self {
        let manager = Arc::new(GameStateManager::new(
            replica_id,
            store.clone(),
            bus.clone(),
            catalog,
            &cfg,
        ));
        let coordinator = Arc::new(ReplicaCoordinator::new(
            replica_id,
            store.clone(),
            cfg.lease_ttl(),
        ));
        Self {
            replica_id: replica_id.to_string(),
            store,
            manager,
            coordinator,
            notifier: LiveNotifier::new(bus),
            cfg,
        }
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    pub fn is_primary(&self) -> bool {
        self.coordinator.is_primary()
    }

    pub async fn get_state(&self, player_id: &str) -> Result<GameState, EngineError> {
        self.manager.get_state(player_id).await
    }

    pub async fn apply_action(
        &self,
        player_id: &str,
        action: Action,
    ) -> Result<GameState, EngineError> {
        self.manager.apply_action(player_id, action).await
    }

    /// Apply a raw `{type, payload}` action value from a collaborator.
    pub async fn apply_json(
        &self,
        player_id: &str,
        value: serde_json::Value,
    ) -> Result<GameState, EngineError> {
        let action = Action::from_value(value)?;
        self.manager.apply_action(player_id, action).await
    }

    pub async fn list_available_quests(
        &self,
        player_id: &str,
    ) -> Result<Vec<Quest>, EngineError> {
        self.manager.list_available_quests(player_id).await
    }

    pub fn quest_catalog(&self) -> Vec<Arc<QuestDefinition>> {
        self.manager.quest_catalog()
    }

    /// Open an ordered change-event subscription for one player.
    pub fn subscribe(&self, player_id: &str, last_seen: u64) -> Subscription {
        self.notifier.subscribe(player_id, last_seen)
    }

    /// Out-of-band schema migration. Must not run while this replica is
    /// serving traffic against the records it touches.
    pub async fn run_migration(&self) -> Result<MigrationReport, EngineError> {
        MigrationRunner::new(self.store.clone()).run().await
    }

    /// Spawn the replica's background tasks: lease heartbeat, cache
    /// invalidation, and the primary-gated backup loop.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        vec![
            self.coordinator.spawn_heartbeat(),
            self.manager.spawn_invalidation(),
            self.coordinator.spawn_backup(self.cfg.backup_interval()),
        ]
    }

    /// Release the lease and every ownership token so peers can take over
    /// without waiting out TTLs.
    pub async fn shutdown(&self) {
        self.manager.release_owned().await;
        self.coordinator.release().await;
    }
}
