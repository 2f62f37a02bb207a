//! Durable State Store
//!
//! One record per player, plus the coordination tables (leadership lease,
//! per-player ownership tokens) and backup snapshots. `SqliteStore` is the
//! production implementation; `MemoryStore` backs tests.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::EngineError;

/// A persisted player record: state JSON plus its revision counter.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub player_id: String,
    pub state_json: String,
    pub revision: u64,
}

/// Outcome of a per-player ownership claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerClaim {
    Granted,
    /// Another replica holds a live token.
    Held { holder: String },
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, player_id: &str) -> Result<Option<StoredRecord>, EngineError>;

    async fn save(
        &self,
        player_id: &str,
        state_json: &str,
        revision: u64,
    ) -> Result<(), EngineError>;

    /// The durable set of all known player ids.
    async fn player_ids(&self) -> Result<Vec<String>, EngineError>;

    /// Copy every live record into a backup location keyed by `backup_id`.
    /// Returns the number of records copied.
    async fn snapshot_backup(&self, backup_id: &str) -> Result<usize, EngineError>;

    /// Acquire or renew a named lease. Granted when the lease is absent,
    /// expired, or already held by `holder`.
    async fn acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, EngineError>;

    async fn release_lease(&self, name: &str, holder: &str) -> Result<(), EngineError>;

    /// Claim or renew the write token for a player. Same semantics as the
    /// lease: absent/expired/own tokens are granted, live foreign ones are
    /// reported back.
    async fn claim_owner(
        &self,
        player_id: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<OwnerClaim, EngineError>;

    async fn release_owner(&self, player_id: &str, holder: &str) -> Result<(), EngineError>;
}

/// Bound a store call. Elapsing surfaces as `store_timeout`; the caller
/// resubmits the whole action, the engine never retries on its own.
pub async fn with_timeout<T, F>(bound: Duration, fut: F) -> Result<T, EngineError>
where
    F: Future<Output = Result<T, EngineError>>,
{
    match tokio::time::timeout(bound, fut).await {
        Ok(res) => res,
        Err(_) => Err(EngineError::StoreTimeout(bound)),
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry_millis(ttl: Duration) -> i64 {
    now_millis() + ttl.as_millis() as i64
}

// ============================================================================
// Sqlite implementation
// ============================================================================

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn new(database_url: &str) -> Result<Self, EngineError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| EngineError::Store(format!("failed to connect: {}", e)))?;

        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS player_states (
                player_id TEXT PRIMARY KEY,
                state_json TEXT NOT NULL,
                revision INTEGER NOT NULL DEFAULT 0,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(store_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS state_backups (
                backup_id TEXT NOT NULL,
                player_id TEXT NOT NULL,
                state_json TEXT NOT NULL,
                revision INTEGER NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (backup_id, player_id)
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(store_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS leases (
                name TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(store_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS player_owners (
                player_id TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(store_err)?;

        info!("Store migrations complete");
        Ok(())
    }
}

fn store_err(e: sqlx::Error) -> EngineError {
    EngineError::Store(e.to_string())
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn load(&self, player_id: &str) -> Result<Option<StoredRecord>, EngineError> {
        let row = sqlx::query(
            "SELECT player_id, state_json, revision FROM player_states WHERE player_id = ?",
        )
        .bind(player_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(row.map(|r| StoredRecord {
            player_id: r.get("player_id"),
            state_json: r.get("state_json"),
            revision: r.get::<i64, _>("revision") as u64,
        }))
    }

    async fn save(
        &self,
        player_id: &str,
        state_json: &str,
        revision: u64,
    ) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO player_states (player_id, state_json, revision, updated_at)
            VALUES (?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(player_id) DO UPDATE SET
                state_json = excluded.state_json,
                revision = excluded.revision,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(player_id)
        .bind(state_json)
        .bind(revision as i64)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn player_ids(&self) -> Result<Vec<String>, EngineError> {
        let rows = sqlx::query("SELECT player_id FROM player_states ORDER BY player_id")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(rows.iter().map(|r| r.get("player_id")).collect())
    }

    async fn snapshot_backup(&self, backup_id: &str) -> Result<usize, EngineError> {
        let result = sqlx::query(
            r#"
            INSERT INTO state_backups (backup_id, player_id, state_json, revision)
            SELECT ?, player_id, state_json, revision FROM player_states
            "#,
        )
        .bind(backup_id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() as usize)
    }

    async fn acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, EngineError> {
        let result = sqlx::query(
            r#"
            INSERT INTO leases (name, holder, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                holder = excluded.holder,
                expires_at = excluded.expires_at
            WHERE leases.holder = excluded.holder OR leases.expires_at <= ?
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(expiry_millis(ttl))
        .bind(now_millis())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<(), EngineError> {
        sqlx::query("DELETE FROM leases WHERE name = ? AND holder = ?")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn claim_owner(
        &self,
        player_id: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<OwnerClaim, EngineError> {
        // Two attempts: a peer can delete the token between the upsert and
        // the holder lookup, and claiming again resolves that race.
        for _ in 0..2 {
            let result = sqlx::query(
                r#"
                INSERT INTO player_owners (player_id, holder, expires_at) VALUES (?, ?, ?)
                ON CONFLICT(player_id) DO UPDATE SET
                    holder = excluded.holder,
                    expires_at = excluded.expires_at
                WHERE player_owners.holder = excluded.holder
                   OR player_owners.expires_at <= ?
                "#,
            )
            .bind(player_id)
            .bind(holder)
            .bind(expiry_millis(ttl))
            .bind(now_millis())
            .execute(&self.pool)
            .await
            .map_err(store_err)?;

            if result.rows_affected() > 0 {
                return Ok(OwnerClaim::Granted);
            }

            let row = sqlx::query("SELECT holder FROM player_owners WHERE player_id = ?")
                .bind(player_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(store_err)?;
            if let Some(r) = row {
                return Ok(OwnerClaim::Held {
                    holder: r.get("holder"),
                });
            }
        }
        Err(EngineError::Store(format!(
            "ownership claim for {} kept racing a concurrent release",
            player_id
        )))
    }

    async fn release_owner(&self, player_id: &str, holder: &str) -> Result<(), EngineError> {
        sqlx::query("DELETE FROM player_owners WHERE player_id = ? AND holder = ?")
            .bind(player_id)
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}

// ============================================================================
// In-memory implementation (tests, ephemeral deployments)
// ============================================================================

#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, StoredRecord>>,
    backups: RwLock<HashMap<String, Vec<StoredRecord>>>,
    leases: RwLock<HashMap<String, (String, i64)>>,
    owners: RwLock<HashMap<String, (String, i64)>>,
    fail_saves: AtomicBool,
    save_delay: RwLock<Option<Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent save fail (rollback tests).
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Inject latency into saves (timeout tests).
    pub async fn set_save_delay(&self, delay: Option<Duration>) {
        *self.save_delay.write().await = delay;
    }

    /// Records captured under a backup id.
    pub async fn backup_records(&self, backup_id: &str) -> Vec<StoredRecord> {
        self.backups
            .read()
            .await
            .get(backup_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn backup_ids(&self) -> Vec<String> {
        self.backups.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self, player_id: &str) -> Result<Option<StoredRecord>, EngineError> {
        Ok(self.records.read().await.get(player_id).cloned())
    }

    async fn save(
        &self,
        player_id: &str,
        state_json: &str,
        revision: u64,
    ) -> Result<(), EngineError> {
        let delay = *self.save_delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(EngineError::Store("injected save failure".to_string()));
        }
        self.records.write().await.insert(
            player_id.to_string(),
            StoredRecord {
                player_id: player_id.to_string(),
                state_json: state_json.to_string(),
                revision,
            },
        );
        Ok(())
    }

    async fn player_ids(&self) -> Result<Vec<String>, EngineError> {
        let mut ids: Vec<String> = self.records.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn snapshot_backup(&self, backup_id: &str) -> Result<usize, EngineError> {
        let records: Vec<StoredRecord> = self.records.read().await.values().cloned().collect();
        let count = records.len();
        self.backups
            .write()
            .await
            .insert(backup_id.to_string(), records);
        Ok(count)
    }

    async fn acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, EngineError> {
        let mut leases = self.leases.write().await;
        let now = now_millis();
        match leases.get(name) {
            Some((current, expires)) if current != holder && *expires > now => Ok(false),
            _ => {
                leases.insert(name.to_string(), (holder.to_string(), expiry_millis(ttl)));
                Ok(true)
            }
        }
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<(), EngineError> {
        let mut leases = self.leases.write().await;
        if leases.get(name).is_some_and(|(h, _)| h == holder) {
            leases.remove(name);
        }
        Ok(())
    }

    async fn claim_owner(
        &self,
        player_id: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<OwnerClaim, EngineError> {
        let mut owners = self.owners.write().await;
        let now = now_millis();
        match owners.get(player_id) {
            Some((current, expires)) if current != holder && *expires > now => {
                Ok(OwnerClaim::Held {
                    holder: current.clone(),
                })
            }
            _ => {
                owners.insert(
                    player_id.to_string(),
                    (holder.to_string(), expiry_millis(ttl)),
                );
                Ok(OwnerClaim::Granted)
            }
        }
    }

    async fn release_owner(&self, player_id: &str, holder: &str) -> Result<(), EngineError> {
        let mut owners = self.owners.write().await;
        if owners.get(player_id).is_some_and(|(h, _)| h == holder) {
            owners.remove(player_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        assert!(store.load("p1").await.unwrap().is_none());

        store.save("p1", "{}", 1).await.unwrap();
        let rec = store.load("p1").await.unwrap().unwrap();
        assert_eq!(rec.revision, 1);
        assert_eq!(store.player_ids().await.unwrap(), vec!["p1"]);
    }

    #[tokio::test]
    async fn test_memory_store_lease_semantics() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);

        assert!(store.acquire_lease("primary", "a", ttl).await.unwrap());
        // Renewal by the holder succeeds, a contender is refused
        assert!(store.acquire_lease("primary", "a", ttl).await.unwrap());
        assert!(!store.acquire_lease("primary", "b", ttl).await.unwrap());

        // Expired lease is up for grabs
        assert!(store.acquire_lease("primary", "a", Duration::ZERO).await.unwrap());
        assert!(store.acquire_lease("primary", "b", ttl).await.unwrap());

        store.release_lease("primary", "b").await.unwrap();
        assert!(store.acquire_lease("primary", "c", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_store_owner_claims() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);

        assert_eq!(
            store.claim_owner("p1", "a", ttl).await.unwrap(),
            OwnerClaim::Granted
        );
        assert_eq!(
            store.claim_owner("p1", "b", ttl).await.unwrap(),
            OwnerClaim::Held { holder: "a".into() }
        );
        // Different player is independent
        assert_eq!(
            store.claim_owner("p2", "b", ttl).await.unwrap(),
            OwnerClaim::Granted
        );

        store.release_owner("p1", "a").await.unwrap();
        assert_eq!(
            store.claim_owner("p1", "b", ttl).await.unwrap(),
            OwnerClaim::Granted
        );
    }

    #[tokio::test]
    async fn test_with_timeout_maps_elapsed() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, EngineError>(())
        };
        let err = with_timeout(Duration::from_millis(10), slow).await.unwrap_err();
        assert_eq!(err.kind(), "store_timeout");
    }

    #[tokio::test]
    async fn test_sqlite_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("test.db").display());
        let store = SqliteStore::new(&url).await.unwrap();

        store.save("p1", r#"{"v":1}"#, 1).await.unwrap();
        store.save("p1", r#"{"v":2}"#, 2).await.unwrap();
        store.save("p2", r#"{"v":1}"#, 1).await.unwrap();

        let rec = store.load("p1").await.unwrap().unwrap();
        assert_eq!(rec.revision, 2);
        assert_eq!(rec.state_json, r#"{"v":2}"#);
        assert_eq!(store.player_ids().await.unwrap(), vec!["p1", "p2"]);

        let copied = store.snapshot_backup("b1").await.unwrap();
        assert_eq!(copied, 2);
    }

    #[tokio::test]
    async fn test_sqlite_store_lease_and_owner() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("test.db").display());
        let store = SqliteStore::new(&url).await.unwrap();
        let ttl = Duration::from_secs(60);

        assert!(store.acquire_lease("primary", "a", ttl).await.unwrap());
        assert!(!store.acquire_lease("primary", "b", ttl).await.unwrap());
        assert!(store.acquire_lease("primary", "a", ttl).await.unwrap());

        assert_eq!(
            store.claim_owner("p1", "a", ttl).await.unwrap(),
            OwnerClaim::Granted
        );
        let held = store.claim_owner("p1", "b", ttl).await.unwrap();
        assert_eq!(held, OwnerClaim::Held { holder: "a".into() });

        store.release_owner("p1", "a").await.unwrap();
        assert_eq!(
            store.claim_owner("p1", "b", ttl).await.unwrap(),
            OwnerClaim::Granted
        );
    }
}
