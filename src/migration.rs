//! Schema Migration Runner
//!
//! One-shot batch upgrade of persisted records to the enhanced step
//! schema. Operates on raw JSON so legacy shapes the typed model no longer
//! expresses are still upgradeable. Additive only: every legacy field is
//! preserved, new fields get defaults. A full backup is taken before any
//! record is touched, and per-record failures are collected rather than
//! aborting the batch.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::error::EngineError;
use crate::state::{GameState, LEGACY_SCHEMA_VERSION, SCHEMA_VERSION};
use crate::store::StateStore;

#[derive(Debug, Clone)]
pub struct RecordFailure {
    pub player_id: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct MigrationReport {
    pub backup_id: String,
    pub migrated: usize,
    pub skipped: usize,
    pub failed: Vec<RecordFailure>,
}

pub struct MigrationRunner {
    store: Arc<dyn StateStore>,
}

impl MigrationRunner {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Safe to re-run: records already at the target version are skipped.
    pub async fn run(&self) -> Result<MigrationReport, EngineError> {
        let player_ids = self.store.player_ids().await?;

        let backup_id = format!("pre-migration-{}", Utc::now().format("%Y%m%dT%H%M%SZ"));
        let backed_up = self.store.snapshot_backup(&backup_id).await?;
        info!(
            "Migration backup {} captured {} records",
            backup_id, backed_up
        );

        let mut report = MigrationReport {
            backup_id,
            migrated: 0,
            skipped: 0,
            failed: Vec::new(),
        };

        for player_id in player_ids {
            match self.migrate_record(&player_id).await {
                Ok(true) => report.migrated += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    warn!("Migration failed for {}: {}", player_id, e);
                    report.failed.push(RecordFailure {
                        player_id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Migration complete: {} migrated, {} skipped, {} failed",
            report.migrated,
            report.skipped,
            report.failed.len()
        );
        Ok(report)
    }

    async fn migrate_record(&self, player_id: &str) -> Result<bool, EngineError> {
        let Some(record) = self.store.load(player_id).await? else {
            return Err(EngineError::Store(format!(
                "record for {} vanished during migration",
                player_id
            )));
        };

        let mut value: Value = serde_json::from_str(&record.state_json)
            .map_err(|e| EngineError::InvalidState(format!("record is not valid JSON: {}", e)))?;

        let version = value
            .get("metadata")
            .and_then(|m| m.get("schema_version"))
            .and_then(Value::as_u64)
            .unwrap_or(LEGACY_SCHEMA_VERSION as u64);
        if version >= SCHEMA_VERSION as u64 {
            return Ok(false);
        }

        upgrade_record(&mut value)?;

        let json = serde_json::to_string(&value)
            .map_err(|e| EngineError::Store(format!("failed to serialize record: {}", e)))?;
        // The upgraded record must parse under the current typed schema
        GameState::from_json(&json)?;

        self.store.save(player_id, &json, record.revision).await?;
        Ok(true)
    }
}

fn upgrade_record(value: &mut Value) -> Result<(), EngineError> {
    let Some(obj) = value.as_object_mut() else {
        return Err(EngineError::InvalidState(
            "record is not a JSON object".to_string(),
        ));
    };

    if let Some(quests) = obj.get_mut("quests").and_then(Value::as_object_mut) {
        for bucket in ["available", "completed"] {
            if let Some(arr) = quests.get_mut(bucket).and_then(Value::as_array_mut) {
                for quest in arr {
                    upgrade_quest(quest)?;
                }
            }
        }
        if let Some(active) = quests.get_mut("active") {
            if !active.is_null() {
                upgrade_quest(active)?;
            }
        }
    }

    let now = json!(Utc::now());
    let metadata = obj
        .entry("metadata")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(|| EngineError::InvalidState("metadata is not an object".to_string()))?;
    metadata.entry("created_at").or_insert_with(|| now.clone());
    metadata.entry("updated_at").or_insert_with(|| now.clone());
    metadata.insert("schema_version".to_string(), json!(SCHEMA_VERSION));

    Ok(())
}

fn upgrade_quest(quest: &mut Value) -> Result<(), EngineError> {
    let Some(obj) = quest.as_object_mut() else {
        return Err(EngineError::InvalidState(
            "quest is not a JSON object".to_string(),
        ));
    };

    // Legacy lifecycle fields: fill in what the tagged representation needs
    let status = obj
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("available")
        .to_string();
    let now = json!(Utc::now());
    match status.as_str() {
        "active" => {
            obj.entry("started_at").or_insert_with(|| now.clone());
        }
        "completed" => {
            obj.entry("completed_at").or_insert_with(|| now.clone());
            // Legacy completed quests already paid out their reward
            obj.entry("reward_applied").or_insert(json!(true));
        }
        "failed" => {
            obj.entry("failed_at").or_insert_with(|| now.clone());
        }
        _ => {
            obj.entry("status").or_insert(json!("available"));
        }
    }

    obj.entry("reward")
        .or_insert_with(|| json!({ "score": 0, "items": [] }));

    if let Some(steps) = obj.get_mut("steps").and_then(Value::as_array_mut) {
        for step in steps {
            upgrade_step(step)?;
        }
    }
    Ok(())
}

fn upgrade_step(step: &mut Value) -> Result<(), EngineError> {
    let Some(obj) = step.as_object_mut() else {
        return Err(EngineError::InvalidState(
            "step is not a JSON object".to_string(),
        ));
    };

    obj.entry("completed").or_insert(json!(false));
    obj.entry("metadata").or_insert_with(|| {
        json!({ "difficulty": "normal", "estimated_duration": "", "points": 0 })
    });
    obj.entry("resources").or_insert_with(|| json!([]));
    obj.entry("execution").or_insert_with(|| json!({}));
    obj.entry("progress")
        .or_insert_with(|| json!({ "notes": [], "artifacts": [], "attempt_count": 0 }));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn legacy_record() -> String {
        serde_json::to_string(&json!({
            "player": {
                "id": "p1", "name": "Pia", "score": 120,
                "level": "apprentice", "status": "idle", "location": "town"
            },
            "quests": {
                "available": [{
                    "id": "q2", "title": "Later", "description": "later quest",
                    "status": "available",
                    "steps": [
                        { "id": "s1", "description": "legacy step", "completed": false }
                    ]
                }],
                "active": {
                    "id": "q1", "title": "Now", "description": "current quest",
                    "status": "active",
                    "steps": [
                        { "id": "s1", "description": "first", "completed": true },
                        { "id": "s2", "description": "second", "completed": false }
                    ]
                },
                "completed": [{
                    "id": "q0", "title": "Done", "description": "old quest",
                    "status": "completed",
                    "steps": [
                        { "id": "s1", "description": "only", "completed": true }
                    ]
                }]
            },
            "inventory": [],
            "session": { "conversation_history": [], "turn_count": 0 },
            "metadata": {
                "schema_version": 1,
                "created_at": "2024-01-01T00:00:00Z",
                "updated_at": "2024-06-01T00:00:00Z"
            }
        }))
        .unwrap()
    }

    async fn store_with_legacy() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.save("p1", &legacy_record(), 7).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_migration_upgrades_legacy_record() {
        let store = store_with_legacy().await;
        let runner = MigrationRunner::new(store.clone());

        let report = runner.run().await.unwrap();
        assert_eq!(report.migrated, 1);
        assert_eq!(report.skipped, 0);
        assert!(report.failed.is_empty());

        let record = store.load("p1").await.unwrap().unwrap();
        let state = GameState::from_json(&record.state_json).unwrap();
        assert_eq!(state.metadata.schema_version, SCHEMA_VERSION);
        // Revision is untouched; migration runs out-of-band
        assert_eq!(record.revision, 7);

        // Legacy fields preserved verbatim
        assert_eq!(state.player.score, 120);
        let active = state.quests.active.as_ref().unwrap();
        assert_eq!(active.id, "q1");
        assert_eq!(active.steps[0].description, "first");
        assert!(active.steps[0].completed);
        assert!(!active.steps[1].completed);

        // Enhanced defaults filled in
        assert_eq!(active.steps[0].metadata.points, 0);
        assert_eq!(active.steps[0].metadata.difficulty, "normal");
        assert!(active.steps[0].resources.is_empty());
        assert_eq!(active.steps[0].progress.attempt_count, 0);

        // Legacy completed quests count as paid out
        let value: Value = serde_json::from_str(&record.state_json).unwrap();
        assert_eq!(value["quests"]["completed"][0]["reward_applied"], true);
        assert!(value["quests"]["active"]["started_at"].is_string());
    }

    #[tokio::test]
    async fn test_backup_taken_before_mutation() {
        let store = store_with_legacy().await;
        let runner = MigrationRunner::new(store.clone());
        let report = runner.run().await.unwrap();

        let backed_up = store.backup_records(&report.backup_id).await;
        assert_eq!(backed_up.len(), 1);
        // The backup holds the pre-migration shape
        let value: Value = serde_json::from_str(&backed_up[0].state_json).unwrap();
        assert_eq!(value["metadata"]["schema_version"], 1);
        assert!(value["quests"]["active"]["steps"][0].get("metadata").is_none());
    }

    #[tokio::test]
    async fn test_migration_is_idempotent() {
        let store = store_with_legacy().await;
        let runner = MigrationRunner::new(store.clone());

        runner.run().await.unwrap();
        let after_first = store.load("p1").await.unwrap().unwrap().state_json;

        let report = runner.run().await.unwrap();
        assert_eq!(report.migrated, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(store.load("p1").await.unwrap().unwrap().state_json, after_first);
    }

    #[tokio::test]
    async fn test_current_records_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        let current = GameState::new_default("p9").to_json().unwrap();
        store.save("p9", &current, 1).await.unwrap();

        let runner = MigrationRunner::new(store.clone());
        let report = runner.run().await.unwrap();
        assert_eq!(report.migrated, 0);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_one_bad_record_does_not_abort_the_batch() {
        let store = store_with_legacy().await;
        store.save("broken", "this is not json", 1).await.unwrap();

        let runner = MigrationRunner::new(store.clone());
        let report = runner.run().await.unwrap();
        assert_eq!(report.migrated, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].player_id, "broken");

        // The good record still got upgraded
        let record = store.load("p1").await.unwrap().unwrap();
        assert!(GameState::from_json(&record.state_json).is_ok());
    }
}
