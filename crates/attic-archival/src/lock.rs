// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Mutual exclusion for the run and for each table. Two layers: a
//! process-wide single-instance lock at startup, and a per-table lock
//! around each table's batches. Every backend heartbeats; a lock whose
//! holder stops heartbeating for two TTLs is stale and may be taken
//! over.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use attic_config::{LockBackend, LockConfig};
use attic_db::SourcePool;
use attic_storage::client::CreateOutcome;
use attic_storage::ArchiveStore;

use crate::error::ArchiveError;
use crate::layout;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockLease {
    owner: String,
    lock_name: String,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl LockLease {
    fn new(owner: &str, name: &str, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            owner: owner.to_string(),
            lock_name: name.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or_default(),
        }
    }

    /// Stale means no heartbeat for two TTLs: the expiry tracks the last
    /// heartbeat plus one TTL, so staleness is one further TTL past it.
    fn is_stale(&self, ttl: Duration) -> bool {
        Utc::now() > self.expires_at + chrono::Duration::from_std(ttl).unwrap_or_default()
    }
}

/// A held lock. The heartbeat runs on its own timer; `lost()` flips if
/// the backend stops confirming ownership, at which point the holder
/// must abort its current batch and roll back.
pub struct LockGuard {
    name: String,
    lost_rx: watch::Receiver<bool>,
    release_tx: Option<oneshot::Sender<()>>,
    heartbeat: JoinHandle<()>,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_lost(&self) -> bool {
        *self.lost_rx.borrow()
    }

    pub fn lost_signal(&self) -> watch::Receiver<bool> {
        self.lost_rx.clone()
    }

    /// Graceful release: stops the heartbeat and removes the backing
    /// lease. Dropping without calling this leaves the lease to expire
    /// by TTL.
    pub async fn release(mut self) {
        if let Some(tx) = self.release_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.heartbeat).await;
        info!(lock = %self.name, "lock released");
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.release_tx.is_some() {
            // Crash path: the heartbeat dies with us and the lease goes
            // stale after its TTL.
            self.heartbeat.abort();
        }
    }
}

/// Acquires run- and table-level locks with the configured backend.
pub struct LockManager {
    config: LockConfig,
    store: Arc<ArchiveStore>,
    prefix: Option<String>,
    owner: String,
}

impl LockManager {
    pub fn new(config: LockConfig, store: Arc<ArchiveStore>, prefix: Option<String>) -> Self {
        Self {
            config,
            store,
            prefix,
            owner: format!("attic-{}", uuid::Uuid::new_v4()),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.config.ttl_secs)
    }

    fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.config.heartbeat_secs)
    }

    /// Acquires the named lock. `pool` is required for the advisory
    /// backend and ignored otherwise.
    pub async fn acquire(
        &self,
        name: &str,
        pool: Option<&SourcePool>,
    ) -> Result<LockGuard, ArchiveError> {
        match self.config.backend {
            LockBackend::File => self.acquire_file(name).await,
            LockBackend::Lease => self.acquire_lease(name).await,
            LockBackend::Advisory => {
                let pool = pool.ok_or_else(|| {
                    ArchiveError::fatal("advisory locking requires a database pool")
                })?;
                self.acquire_advisory(name, pool).await
            }
        }
    }

    async fn acquire_file(&self, name: &str) -> Result<LockGuard, ArchiveError> {
        let dir = self.config.file_path.clone().ok_or_else(|| {
            ArchiveError::fatal("file locking requires locking.file-path")
        })?;
        std::fs::create_dir_all(&dir)
            .map_err(|e| ArchiveError::fatal(format!("cannot create lock dir: {e}")))?;
        let path = dir.join(format!("{}.lock", name.replace('/', "__")));

        let lease = LockLease::new(&self.owner, name, self.ttl());
        if !try_create_lock_file(&path, &lease)? {
            let existing = read_lock_file(&path)?;
            match existing {
                Some(existing) if existing.is_stale(self.ttl()) => {
                    warn!(lock = name, stale_owner = %existing.owner,
                        "taking over stale file lock");
                    let _ = std::fs::remove_file(&path);
                    if !try_create_lock_file(&path, &lease)? {
                        return Err(ArchiveError::LockUnavailable {
                            message: format!("lost race for stale lock {name}"),
                        });
                    }
                }
                Some(existing) => {
                    return Err(ArchiveError::LockUnavailable {
                        message: format!("{name} held by {}", existing.owner),
                    });
                }
                None => {
                    return Err(ArchiveError::LockUnavailable {
                        message: format!("{name} lock file unreadable"),
                    });
                }
            }
        }
        info!(lock = name, owner = %self.owner, "file lock acquired");

        let (lost_tx, lost_rx) = watch::channel(false);
        let (release_tx, mut release_rx) = oneshot::channel();
        let owner = self.owner.clone();
        let lock_name = name.to_string();
        let ttl = self.ttl();
        let interval = self.heartbeat_interval();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut release_rx => {
                        let _ = std::fs::remove_file(&path);
                        return;
                    }
                    _ = ticker.tick() => {
                        let lease = LockLease::new(&owner, &lock_name, ttl);
                        match serde_json::to_vec_pretty(&lease) {
                            Ok(body) => {
                                if std::fs::write(&path, body).is_err() {
                                    let _ = lost_tx.send(true);
                                    return;
                                }
                            }
                            Err(_) => {
                                let _ = lost_tx.send(true);
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(LockGuard {
            name: name.to_string(),
            lost_rx,
            release_tx: Some(release_tx),
            heartbeat,
        })
    }

    async fn acquire_lease(&self, name: &str) -> Result<LockGuard, ArchiveError> {
        let key = layout::lock_key(self.prefix.as_deref(), name);
        let lease = LockLease::new(&self.owner, name, self.ttl());
        let body = Bytes::from(serde_json::to_vec_pretty(&lease).expect("lease serializes"));

        let outcome = self
            .store
            .put_if_absent(&key, body.clone())
            .await
            .map_err(|e| ArchiveError::fatal(format!("lease write failed: {e}")))?;
        if outcome == CreateOutcome::AlreadyExists {
            let (bytes, version) = self
                .store
                .get_with_version(&key)
                .await
                .map_err(|e| ArchiveError::fatal(format!("lease read failed: {e}")))?;
            let existing: LockLease = serde_json::from_slice(&bytes).map_err(|e| {
                ArchiveError::fatal(format!("lease for {name} is corrupt: {e}"))
            })?;
            if !existing.is_stale(self.ttl()) {
                return Err(ArchiveError::LockUnavailable {
                    message: format!("{name} held by {}", existing.owner),
                });
            }
            warn!(lock = name, stale_owner = %existing.owner, "taking over stale lease");
            self.store
                .put_if_matches(&key, body, version)
                .await
                .map_err(|_| ArchiveError::LockUnavailable {
                    message: format!("lost race for stale lease {name}"),
                })?;
        }
        info!(lock = name, owner = %self.owner, "lease lock acquired");

        let (lost_tx, lost_rx) = watch::channel(false);
        let (release_tx, mut release_rx) = oneshot::channel();
        let store = self.store.clone();
        let owner = self.owner.clone();
        let lock_name = name.to_string();
        let ttl = self.ttl();
        let interval = self.heartbeat_interval();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            let mut failures = 0u32;
            loop {
                tokio::select! {
                    _ = &mut release_rx => {
                        let _ = store.delete(&key).await;
                        return;
                    }
                    _ = ticker.tick() => {
                        let renewed = LockLease::new(&owner, &lock_name, ttl);
                        let refreshed = async {
                            let (bytes, version) = store.get_with_version(&key).await?;
                            let current: LockLease = serde_json::from_slice(&bytes)
                                .map_err(|e| attic_storage::StorageError::Fallback(
                                    std::io::Error::other(e)))?;
                            if current.owner != owner {
                                return Ok(false);
                            }
                            let body = Bytes::from(
                                serde_json::to_vec_pretty(&renewed).expect("lease serializes"));
                            store.put_if_matches(&key, body, version).await?;
                            Ok::<bool, attic_storage::StorageError>(true)
                        }
                        .await;
                        match refreshed {
                            Ok(true) => failures = 0,
                            Ok(false) => {
                                warn!(lock = %lock_name, "lease stolen, marking lock lost");
                                let _ = lost_tx.send(true);
                                return;
                            }
                            Err(e) => {
                                failures += 1;
                                warn!(lock = %lock_name, error = %e, failures,
                                    "lease heartbeat failed");
                                if failures >= 2 {
                                    let _ = lost_tx.send(true);
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        });

        Ok(LockGuard {
            name: name.to_string(),
            lost_rx,
            release_tx: Some(release_tx),
            heartbeat,
        })
    }

    async fn acquire_advisory(
        &self,
        name: &str,
        pool: &SourcePool,
    ) -> Result<LockGuard, ArchiveError> {
        let client = pool.advisory_lock_connection().await.map_err(|e| {
            ArchiveError::fatal(format!("cannot open advisory lock connection: {e}"))
        })?;
        let lock_id = attic_db::advisory_key(name);
        let row = client
            .query_one("SELECT pg_try_advisory_lock($1)", &[&lock_id])
            .await
            .map_err(|e| ArchiveError::fatal(format!("advisory lock query failed: {e}")))?;
        if !row.get::<_, bool>(0) {
            return Err(ArchiveError::LockUnavailable {
                message: format!("{name} advisory lock held elsewhere"),
            });
        }
        info!(lock = name, lock_id, "advisory lock acquired");

        let (lost_tx, lost_rx) = watch::channel(false);
        let (release_tx, mut release_rx) = oneshot::channel();
        let lock_name = name.to_string();
        let interval = self.heartbeat_interval();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut release_rx => {
                        let _ = client
                            .execute("SELECT pg_advisory_unlock($1)", &[&lock_id])
                            .await;
                        return;
                    }
                    _ = ticker.tick() => {
                        // The advisory lock is session-scoped; the probe
                        // both keeps the session alive and detects loss.
                        if client.query_one("SELECT 1", &[]).await.is_err() {
                            warn!(lock = %lock_name, "advisory lock session died");
                            let _ = lost_tx.send(true);
                            return;
                        }
                    }
                }
            }
        });

        Ok(LockGuard {
            name: name.to_string(),
            lost_rx,
            release_tx: Some(release_tx),
            heartbeat,
        })
    }
}

/// Lock name for the process-wide single-instance lock.
pub fn run_lock_name() -> String {
    "run".to_string()
}

/// Lock name for one table.
pub fn table_lock_name(table: &crate::types::TableId) -> String {
    format!("table/{}/{}/{}", table.database, table.schema, table.table)
}

fn try_create_lock_file(path: &PathBuf, lease: &LockLease) -> Result<bool, ArchiveError> {
    use std::io::Write;
    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(mut file) => {
            let body = serde_json::to_vec_pretty(lease)
                .map_err(|e| ArchiveError::fatal(format!("lease encode failed: {e}")))?;
            file.write_all(&body)
                .map_err(|e| ArchiveError::fatal(format!("lock file write failed: {e}")))?;
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(ArchiveError::fatal(format!("lock file create failed: {e}"))),
    }
}

fn read_lock_file(path: &PathBuf) -> Result<Option<LockLease>, ArchiveError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ArchiveError::fatal(format!("lock file read failed: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TableId;
    use object_store::memory::InMemory;

    fn manager(backend: LockBackend, dir: Option<PathBuf>) -> LockManager {
        LockManager::new(
            LockConfig {
                backend,
                ttl_secs: 120,
                heartbeat_secs: 1,
                file_path: dir,
            },
            Arc::new(ArchiveStore::for_tests(Arc::new(InMemory::new()))),
            Some("archive".to_string()),
        )
    }

    #[tokio::test]
    async fn file_lock_excludes_second_holder() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = manager(LockBackend::File, Some(dir.path().to_path_buf()));
        let b = manager(LockBackend::File, Some(dir.path().to_path_buf()));

        let guard = a.acquire("run", None).await.unwrap();
        let denied = b.acquire("run", None).await;
        assert!(matches!(denied, Err(ArchiveError::LockUnavailable { .. })));

        guard.release().await;
        let guard = b.acquire("run", None).await.unwrap();
        guard.release().await;
    }

    #[tokio::test]
    async fn stale_file_lock_is_taken_over() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("run.lock");
        let stale = LockLease {
            owner: "dead-process".to_string(),
            lock_name: "run".to_string(),
            acquired_at: Utc::now() - chrono::Duration::hours(10),
            expires_at: Utc::now() - chrono::Duration::hours(9),
        };
        std::fs::write(&path, serde_json::to_vec(&stale).unwrap()).unwrap();

        let manager = manager(LockBackend::File, Some(dir.path().to_path_buf()));
        let guard = manager.acquire("run", None).await.unwrap();
        assert!(!guard.is_lost());
        guard.release().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn lease_lock_excludes_and_releases() {
        let store = Arc::new(ArchiveStore::for_tests(Arc::new(InMemory::new())));
        let config = LockConfig {
            backend: LockBackend::Lease,
            ttl_secs: 120,
            heartbeat_secs: 1,
            file_path: None,
        };
        let a = LockManager::new(config.clone(), store.clone(), None);
        let b = LockManager::new(config, store.clone(), None);

        let table = TableId::new("orders", "public", "audit_logs");
        let name = table_lock_name(&table);
        let guard = a.acquire(&name, None).await.unwrap();
        assert!(matches!(
            b.acquire(&name, None).await,
            Err(ArchiveError::LockUnavailable { .. })
        ));
        guard.release().await;

        // Lease object removed; the other manager can take it now.
        let guard = b.acquire(&name, None).await.unwrap();
        guard.release().await;
    }

    #[tokio::test]
    async fn lease_heartbeat_extends_expiry() {
        let store = Arc::new(ArchiveStore::for_tests(Arc::new(InMemory::new())));
        let manager = LockManager::new(
            LockConfig {
                backend: LockBackend::Lease,
                ttl_secs: 120,
                heartbeat_secs: 1,
                file_path: None,
            },
            store.clone(),
            None,
        );
        let guard = manager.acquire("run", None).await.unwrap();
        let key = layout::lock_key(None, "run");
        let before: LockLease =
            serde_json::from_slice(&store.get(&key).await.unwrap()).unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let after: LockLease =
            serde_json::from_slice(&store.get(&key).await.unwrap()).unwrap();
        assert!(after.expires_at > before.expires_at);
        assert!(!guard.is_lost());
        guard.release().await;
    }
}
