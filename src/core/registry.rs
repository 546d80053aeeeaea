//! Session Registry: owns the creation/lookup/destruction algorithm for
//! sandbox sessions (SPEC_FULL.md §4.3) and the per-`(user, session)` lock
//! table that serializes concurrent requests against the same session.
//! Grounded on the teacher's `session_manager.rs` health-check/restart loop
//! and the shared `AppState` pattern in `src/shared/mod.rs`.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use sha2::{Digest, Sha256};
use tokio::sync::Mutex as AsyncMutex;

use crate::config::Config;
use crate::core::driver::{
    retry_transient, ContainerDriver, ContainerSpec, ContainerState, CREATED_AT_LABEL,
    MANAGED_LABEL, SESSION_LABEL, USER_LABEL,
};
use crate::core::kv::{KvDirectory, SessionRecord};
use crate::error::{CoreError, CoreResult};

/// Held while a caller is creating, touching, or destroying a given session.
/// Entries are refcounted so the table doesn't grow unbounded; the last
/// holder to drop its guard removes the entry.
struct LockTable {
    locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl LockTable {
    fn new() -> Self {
        Self {
            locks: StdMutex::new(HashMap::new()),
        }
    }

    fn get(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut guard = self.locks.lock().unwrap();
        match guard.entry(key.to_string()) {
            Entry::Occupied(e) => e.get().clone(),
            Entry::Vacant(e) => {
                let lock = Arc::new(AsyncMutex::new(()));
                e.insert(lock.clone());
                lock
            }
        }
    }

    /// Best-effort cleanup: drop table entries nobody else currently holds.
    /// Called opportunistically after an operation finishes so the table
    /// doesn't grow with every session that's ever been touched.
    fn sweep(&self, key: &str) {
        let mut guard = self.locks.lock().unwrap();
        if let Some(lock) = guard.get(key) {
            if Arc::strong_count(lock) == 1 {
                guard.remove(key);
            }
        }
    }
}

fn lock_key(user_id: &str, session_id: &str) -> String {
    format!("{user_id}\0{session_id}")
}

fn volume_name(user_id: &str, session_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(b"|");
    hasher.update(session_id.as_bytes());
    format!("sandbox-ws-{:x}", hasher.finalize())
}

pub struct SessionHandle {
    pub container_id: String,
    pub session_id: String,
    pub user_id: String,
}

pub struct SessionRegistry {
    kv: Arc<dyn KvDirectory>,
    driver: Arc<dyn ContainerDriver>,
    config: Arc<Config>,
    locks: LockTable,
}

impl SessionRegistry {
    pub fn new(kv: Arc<dyn KvDirectory>, driver: Arc<dyn ContainerDriver>, config: Arc<Config>) -> Self {
        Self {
            kv,
            driver,
            config,
            locks: LockTable::new(),
        }
    }

    /// Looks a session up, creating it if absent. Enforces the 1:1
    /// client-session binding and ownership: a session_id that already
    /// belongs to a different user_id is rejected with `Forbidden` rather
    /// than silently reused.
    pub async fn resolve_or_create(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> CoreResult<SessionHandle> {
        let key = lock_key(user_id, session_id);
        let lock = self.locks.get(&key);
        let _guard = lock.lock().await;
        let result = self.resolve_or_create_locked(user_id, session_id).await;
        drop(_guard);
        drop(lock);
        self.locks.sweep(&key);
        result
    }

    /// Looks a session up without creating one. Used by operations that must
    /// fail on an unknown session rather than create it on demand (SPEC_FULL.md
    /// §7: workspace ops on an unestablished session return `SessionNotFound`).
    pub async fn resolve_existing(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> CoreResult<SessionHandle> {
        let record = self
            .kv
            .get_session(user_id, session_id)
            .await
            .map_err(|e| CoreError::Internal(e.into()))?;

        let Some(record) = record else {
            return Err(CoreError::SessionNotFound {
                user: user_id.to_string(),
                session_id: session_id.to_string(),
            });
        };

        if record.user_id != user_id {
            return Err(CoreError::Forbidden {
                user: user_id.to_string(),
                session_id: session_id.to_string(),
            });
        }

        Ok(SessionHandle {
            container_id: record.container_id,
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
        })
    }

    async fn resolve_or_create_locked(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> CoreResult<SessionHandle> {
        if let Some(record) = self
            .kv
            .get_session(user_id, session_id)
            .await
            .map_err(|e| CoreError::Internal(e.into()))?
        {
            if record.user_id != user_id {
                return Err(CoreError::Forbidden {
                    user: user_id.to_string(),
                    session_id: session_id.to_string(),
                });
            }

            match retry_transient(|| self.driver.inspect(&record.container_id))
                .await
                .map_err(|e| CoreError::EngineUnavailable(e.to_string()))?
                .state
            {
                ContainerState::Running => {
                    return Ok(SessionHandle {
                        container_id: record.container_id,
                        session_id: session_id.to_string(),
                        user_id: user_id.to_string(),
                    });
                }
                ContainerState::Stopped => {
                    retry_transient(|| self.driver.start(&record.container_id))
                        .await
                        .map_err(|e| CoreError::EngineUnavailable(e.to_string()))?;
                    return Ok(SessionHandle {
                        container_id: record.container_id,
                        session_id: session_id.to_string(),
                        user_id: user_id.to_string(),
                    });
                }
                ContainerState::Missing => {
                    // KV record outlived its container (e.g. external
                    // removal). Fall through and recreate from scratch.
                }
            }
        }

        self.create_locked(user_id, session_id).await
    }

    async fn create_locked(&self, user_id: &str, session_id: &str) -> CoreResult<SessionHandle> {
        let now = chrono::Utc::now().timestamp();
        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert(USER_LABEL.to_string(), user_id.to_string());
        labels.insert(SESSION_LABEL.to_string(), session_id.to_string());
        labels.insert(CREATED_AT_LABEL.to_string(), now.to_string());

        let volume = if self.config.workspace_persist_volumes {
            let name = volume_name(user_id, session_id);
            self.driver
                .volume_create(&name)
                .await
                .map_err(|e| CoreError::EngineUnavailable(e.to_string()))?;
            Some(name)
        } else {
            None
        };

        let spec = ContainerSpec {
            image: self.config.container_image.clone(),
            labels,
            env: Vec::new(),
            volume_mount: volume.as_ref().map(|v| (v.clone(), "/workspace".to_string())),
            tmpfs_workspace: volume.is_none(),
            working_dir: "/workspace".to_string(),
            mem_limit: self.config.container_mem_limit,
            cpu_quota_pct: self.config.container_cpu_quota_pct,
            pids_limit: 64,
            nofile_soft: 1024,
            nofile_hard: 2048,
        };

        let container_id = match retry_transient(|| self.driver.create(spec.clone())).await {
            Ok(id) => id,
            Err(e) => {
                // Partial-creation rollback: a volume was provisioned but the
                // container never came up. Remove it so a retry doesn't leak
                // an orphaned volume.
                if let Some(name) = &volume {
                    let _ = self.driver.volume_remove(name).await;
                }
                return Err(CoreError::EngineUnavailable(e.to_string()));
            }
        };

        if let Err(e) = retry_transient(|| self.driver.start(&container_id)).await {
            let _ = self.driver.remove(&container_id, true).await;
            if let Some(name) = &volume {
                let _ = self.driver.volume_remove(name).await;
            }
            return Err(CoreError::EngineUnavailable(e.to_string()));
        }

        let record = SessionRecord {
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            container_id: container_id.clone(),
            volume_name: volume.clone(),
            created_at: now,
            last_touched_at: now,
        };

        if let Err(e) = self
            .kv
            .put_session(&record, self.config.session_ttl.as_secs())
            .await
        {
            let _ = self.driver.remove(&container_id, true).await;
            if let Some(name) = &volume {
                let _ = self.driver.volume_remove(name).await;
            }
            return Err(CoreError::Internal(e.into()));
        }

        Ok(SessionHandle {
            container_id,
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
        })
    }

    /// Refreshes the session's KV TTL. Called after every successful
    /// exec/workspace operation so idle (not active) sessions expire.
    pub async fn touch(&self, user_id: &str, session_id: &str) -> CoreResult<()> {
        self.kv
            .refresh_ttl(user_id, session_id, self.config.session_ttl.as_secs())
            .await
            .map_err(|e| CoreError::Internal(e.into()))
    }

    pub async fn destroy(&self, user_id: &str, session_id: &str) -> CoreResult<()> {
        let key = lock_key(user_id, session_id);
        let lock = self.locks.get(&key);
        let _guard = lock.lock().await;

        let record = self
            .kv
            .get_session(user_id, session_id)
            .await
            .map_err(|e| CoreError::Internal(e.into()))?;

        let Some(record) = record else {
            drop(_guard);
            drop(lock);
            self.locks.sweep(&key);
            return Err(CoreError::SessionNotFound {
                user: user_id.to_string(),
                session_id: session_id.to_string(),
            });
        };

        if record.user_id != user_id {
            drop(_guard);
            drop(lock);
            self.locks.sweep(&key);
            return Err(CoreError::Forbidden {
                user: user_id.to_string(),
                session_id: session_id.to_string(),
            });
        }

        self.driver
            .remove(&record.container_id, true)
            .await
            .map_err(|e| CoreError::EngineUnavailable(e.to_string()))?;

        if self.config.workspace_persist_volumes {
            if let Some(volume) = &record.volume_name {
                let _ = self.driver.volume_remove(volume).await;
            }
        }

        self.kv
            .delete_session(user_id, session_id)
            .await
            .map_err(|e| CoreError::Internal(e.into()))?;

        drop(_guard);
        drop(lock);
        self.locks.sweep(&key);
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Removes a reaper-targeted container, but only if no in-flight request
    /// currently holds the session's lock. Returns `false` (a no-op) when the
    /// lock is held, so the reaper treats the session as active and retries
    /// next sweep — mirroring §4.6's "skip if the lock is held" rule.
    pub async fn reap_if_unlocked(
        &self,
        user_id: &str,
        session_id: &str,
        container_id: &str,
    ) -> CoreResult<bool> {
        let key = lock_key(user_id, session_id);
        let lock = self.locks.get(&key);
        let _guard = match lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => return Ok(false),
        };

        self.driver
            .remove(container_id, true)
            .await
            .map_err(|e| CoreError::EngineUnavailable(e.to_string()))?;

        if !self.config.workspace_persist_volumes {
            if let Ok(Some(record)) = self.kv.get_session(user_id, session_id).await {
                if record.container_id == container_id {
                    if let Some(volume) = &record.volume_name {
                        let _ = self.driver.volume_remove(volume).await;
                    }
                }
            }
        }

        let _ = self.kv.delete_session(user_id, session_id).await;

        drop(_guard);
        drop(lock);
        self.locks.sweep(&key);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::driver::fake::FakeDriver;
    use crate::core::kv::FakeKvDirectory;
    use std::time::Duration;

    fn test_config() -> Config {
        Config {
            session_ttl: Duration::from_secs(1800),
            container_image: "sandbox:latest".to_string(),
            container_mem_limit: 268_435_456,
            container_cpu_quota_pct: 50,
            default_exec_timeout: Duration::from_secs(30),
            allowed_commands: Default::default(),
            cleanup_interval: Duration::from_secs(60),
            cleanup_max_container_age: Duration::from_secs(3600),
            workspace_max_file_size: 10_485_760,
            workspace_persist_volumes: false,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            docker_socket: None,
            jwt_secret: "test-secret".to_string(),
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }

    fn build_registry() -> (SessionRegistry, Arc<FakeDriver>) {
        let kv: Arc<dyn KvDirectory> = Arc::new(FakeKvDirectory::default());
        let driver = Arc::new(FakeDriver::default());
        let registry = SessionRegistry::new(kv, driver.clone(), Arc::new(test_config()));
        (registry, driver)
    }

    #[tokio::test]
    async fn creates_a_new_session_on_first_resolve() {
        let (registry, driver) = build_registry();
        let handle = registry.resolve_or_create("alice", "s1").await.unwrap();
        assert_eq!(handle.user_id, "alice");
        assert_eq!(driver.container_count(), 1);
    }

    #[tokio::test]
    async fn reuses_existing_session_on_second_resolve() {
        let (registry, driver) = build_registry();
        let first = registry.resolve_or_create("alice", "s1").await.unwrap();
        let second = registry.resolve_or_create("alice", "s1").await.unwrap();
        assert_eq!(first.container_id, second.container_id);
        assert_eq!(driver.create_count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejects_cross_user_access_to_same_session_id() {
        let (registry, _driver) = build_registry();
        registry.resolve_or_create("alice", "s1").await.unwrap();
        let err = registry.resolve_or_create("bob", "s1").await.unwrap_err();
        assert!(matches!(err, CoreError::Forbidden { .. }));
    }

    #[tokio::test]
    async fn destroy_removes_container_and_kv_record() {
        let (registry, driver) = build_registry();
        registry.resolve_or_create("alice", "s1").await.unwrap();
        registry.destroy("alice", "s1").await.unwrap();
        assert_eq!(driver.container_count(), 0);
        let err = registry.destroy("alice", "s1").await.unwrap_err();
        assert!(matches!(err, CoreError::SessionNotFound { .. }));
    }

    #[tokio::test]
    async fn rolls_back_volume_when_container_create_fails() {
        let (registry, driver) = build_registry();
        driver
            .fail_creates
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let err = registry.resolve_or_create("alice", "s1").await.unwrap_err();
        assert!(matches!(err, CoreError::EngineUnavailable(_)));
        assert_eq!(driver.volume_count(), 0);
    }

    #[tokio::test]
    async fn recreates_session_when_container_is_externally_missing() {
        let (registry, driver) = build_registry();
        let first = registry.resolve_or_create("alice", "s1").await.unwrap();
        driver.remove(&first.container_id, true).await.unwrap();
        let second = registry.resolve_or_create("alice", "s1").await.unwrap();
        assert_ne!(first.container_id, second.container_id);
    }

    #[tokio::test]
    async fn concurrent_resolves_for_the_same_session_create_exactly_one_container() {
        let kv: Arc<dyn KvDirectory> = Arc::new(FakeKvDirectory::default());
        let driver = Arc::new(FakeDriver::default());
        let registry = Arc::new(SessionRegistry::new(
            kv,
            driver.clone(),
            Arc::new(test_config()),
        ));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.resolve_or_create("alice", "s1").await })
            })
            .collect();

        let mut container_ids = std::collections::HashSet::new();
        for handle in handles {
            let resolved = handle.await.unwrap().unwrap();
            container_ids.insert(resolved.container_id);
        }

        assert_eq!(container_ids.len(), 1, "all callers should observe the same container");
        assert_eq!(driver.create_count.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(driver.container_count(), 1);
    }
}
