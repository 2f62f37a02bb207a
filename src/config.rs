//! Engine Configuration
//!
//! Loaded from an optional TOML file, then overridden by environment
//! variables (`QUESTLINE_*`). Every field has a working default so a bare
//! `questline-engine` starts against a local sqlite file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::EngineError;

/// What happens to the active quest when the player abandons it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbandonPolicy {
    /// Quest returns to the available list and can be started again.
    ReturnToAvailable,
    /// Quest is marked failed and cannot be restarted.
    Fail,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Connection string for the shared durable store.
    pub database_url: String,
    /// Directory holding quest catalog TOML files.
    pub quest_data_dir: PathBuf,
    /// Maximum number of inventory stacks per player.
    pub inventory_cap: usize,
    pub abandon_policy: AbandonPolicy,
    /// Bound on any single store call from the action path (ms).
    pub store_timeout_ms: u64,
    /// Leadership lease TTL (ms). Heartbeat renews at a third of this.
    pub lease_ttl_ms: u64,
    /// Per-player ownership token TTL (ms).
    pub owner_ttl_ms: u64,
    pub backup_interval_secs: u64,
    /// Broadcast channel capacity per player on the change bus.
    pub bus_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:questline.db?mode=rwc".to_string(),
            quest_data_dir: PathBuf::from("data/quests"),
            inventory_cap: 10,
            abandon_policy: AbandonPolicy::ReturnToAvailable,
            store_timeout_ms: 5_000,
            lease_ttl_ms: 15_000,
            owner_ttl_ms: 30_000,
            backup_interval_secs: 3_600,
            bus_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file if it exists, then apply env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, EngineError> {
        let mut cfg = match path {
            Some(p) if p.exists() => {
                let content = std::fs::read_to_string(p)
                    .map_err(|e| EngineError::Config(format!("failed to read {:?}: {}", p, e)))?;
                toml::from_str(&content)
                    .map_err(|e| EngineError::Config(format!("failed to parse {:?}: {}", p, e)))?
            }
            Some(p) => {
                return Err(EngineError::Config(format!("config file not found: {:?}", p)));
            }
            None => Self::default(),
        };
        cfg.apply_env();
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("QUESTLINE_DATABASE_URL") {
            self.database_url = url;
        }
        if let Ok(dir) = std::env::var("QUESTLINE_QUEST_DATA_DIR") {
            self.quest_data_dir = PathBuf::from(dir);
        }
        if let Ok(cap) = std::env::var("QUESTLINE_INVENTORY_CAP") {
            if let Ok(cap) = cap.parse() {
                self.inventory_cap = cap;
            }
        }
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn owner_ttl(&self) -> Duration {
        Duration::from_millis(self.owner_ttl_ms)
    }

    pub fn backup_interval(&self) -> Duration {
        Duration::from_secs(self.backup_interval_secs)
    }
}
