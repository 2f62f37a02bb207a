//! Replica Coordinator
//!
//! Leadership is a renewable lease in the shared store, not a static
//! primary flag: any replica may acquire the lease when it is absent or
//! expired, and the holder renews at a third of the TTL. Losing the lease
//! flips the primary watch to false, which stops the scheduled backup
//! before another replica can acquire.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::EngineError;
use crate::store::StateStore;

/// Name of the leadership lease in the store.
pub const PRIMARY_LEASE: &str = "primary";

pub struct ReplicaCoordinator {
    replica_id: String,
    store: Arc<dyn StateStore>,
    lease_ttl: Duration,
    primary_tx: watch::Sender<bool>,
}

impl ReplicaCoordinator {
    pub fn new(replica_id: &str, store: Arc<dyn StateStore>, lease_ttl: Duration) -> Self {
        let (primary_tx, _) = watch::channel(false);
        Self {
            replica_id: replica_id.to_string(),
            store,
            lease_ttl,
            primary_tx,
        }
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    pub fn is_primary(&self) -> bool {
        *self.primary_tx.borrow()
    }

    /// Observable leadership state; maintenance loops gate on this.
    pub fn watch_primary(&self) -> watch::Receiver<bool> {
        self.primary_tx.subscribe()
    }

    /// One lease acquisition/renewal attempt. Returns the new leadership
    /// state. A store failure is treated as lost leadership: exclusive
    /// duties must stop when the lease cannot be confirmed.
    pub async fn heartbeat_once(&self) -> bool {
        let granted = match self
            .store
            .acquire_lease(PRIMARY_LEASE, &self.replica_id, self.lease_ttl)
            .await
        {
            Ok(granted) => granted,
            Err(e) => {
                warn!("Lease heartbeat failed for {}: {}", self.replica_id, e);
                false
            }
        };

        let was_primary = self.is_primary();
        if granted && !was_primary {
            info!("Replica {} acquired the primary lease", self.replica_id);
        } else if !granted && was_primary {
            warn!("Replica {} lost the primary lease", self.replica_id);
        }
        let _ = self.primary_tx.send(granted);
        granted
    }

    /// Renew (or contend for) the lease forever. Non-holders add a little
    /// jitter so contenders do not stampede an expiring lease.
    pub fn spawn_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let period = coordinator.lease_ttl / 3;
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let primary = coordinator.heartbeat_once().await;
                if !primary {
                    let jitter_ms =
                        rand::thread_rng().gen_range(0..coordinator.lease_ttl.as_millis().max(10) / 10);
                    tokio::time::sleep(Duration::from_millis(jitter_ms as u64)).await;
                }
            }
        })
    }

    /// Periodic full-store backup, primary only. Every action is persisted
    /// synchronously on its own path, so backup is the primary's only
    /// scheduled store duty.
    pub fn spawn_backup(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                if !coordinator.is_primary() {
                    continue;
                }
                match coordinator.run_backup_once().await {
                    Ok((id, count)) => info!("Backup {} captured {} records", id, count),
                    Err(e) => error!("Backup failed: {}", e),
                }
            }
        })
    }

    pub async fn run_backup_once(&self) -> Result<(String, usize), EngineError> {
        let backup_id = format!("scheduled-{}", Utc::now().format("%Y%m%dT%H%M%SZ"));
        let count = self.store.snapshot_backup(&backup_id).await?;
        Ok((backup_id, count))
    }

    /// Hand the lease back on shutdown so a peer can take over without
    /// waiting out the TTL.
    pub async fn release(&self) {
        let _ = self.primary_tx.send(false);
        if let Err(e) = self
            .store
            .release_lease(PRIMARY_LEASE, &self.replica_id)
            .await
        {
            warn!("Failed to release primary lease: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn coordinator(id: &str, store: &Arc<MemoryStore>, ttl: Duration) -> ReplicaCoordinator {
        let shared: Arc<dyn StateStore> = store.clone();
        ReplicaCoordinator::new(id, shared, ttl)
    }

    #[tokio::test]
    async fn test_single_holder_at_a_time() {
        let store = Arc::new(MemoryStore::new());
        let a = coordinator("replica-a", &store, Duration::from_secs(60));
        let b = coordinator("replica-b", &store, Duration::from_secs(60));

        assert!(a.heartbeat_once().await);
        assert!(a.is_primary());
        assert!(!b.heartbeat_once().await);
        assert!(!b.is_primary());

        // Renewal keeps leadership
        assert!(a.heartbeat_once().await);
    }

    #[tokio::test]
    async fn test_release_hands_over_leadership() {
        let store = Arc::new(MemoryStore::new());
        let a = coordinator("replica-a", &store, Duration::from_secs(60));
        let b = coordinator("replica-b", &store, Duration::from_secs(60));

        assert!(a.heartbeat_once().await);
        a.release().await;
        assert!(!a.is_primary());
        assert!(b.heartbeat_once().await);
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let store = Arc::new(MemoryStore::new());
        let a = coordinator("replica-a", &store, Duration::from_millis(20));
        let b = coordinator("replica-b", &store, Duration::from_secs(60));

        assert!(a.heartbeat_once().await);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(b.heartbeat_once().await);

        // The stale holder observes the loss on its next heartbeat
        assert!(!a.heartbeat_once().await);
        assert!(!a.is_primary());
    }

    #[tokio::test]
    async fn test_watch_flips_on_transitions() {
        let store = Arc::new(MemoryStore::new());
        let a = coordinator("replica-a", &store, Duration::from_secs(60));
        let mut rx = a.watch_primary();
        assert!(!*rx.borrow());

        a.heartbeat_once().await;
        rx.changed().await.unwrap();
        assert!(*rx.borrow());

        a.release().await;
        rx.changed().await.unwrap();
        assert!(!*rx.borrow());
    }

    #[tokio::test]
    async fn test_backup_once_snapshots_records() {
        let store = Arc::new(MemoryStore::new());
        store.save("p1", "{}", 1).await.unwrap();
        store.save("p2", "{}", 3).await.unwrap();

        let a = coordinator("replica-a", &store, Duration::from_secs(60));
        let (backup_id, count) = a.run_backup_once().await.unwrap();
        assert_eq!(count, 2);
        assert!(backup_id.starts_with("scheduled-"));
        assert_eq!(store.backup_records(&backup_id).await.len(), 2);
    }
}
