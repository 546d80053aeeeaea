//! Reaper: periodic background sweep that removes containers past their max
//! age and reconciles the KV Directory against what the engine actually has
//! running (SPEC_FULL.md §4.6). Polling-loop shape follows the teacher's
//! `session_manager::run` staggered-interval pattern.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::Config;
use crate::core::driver::{ContainerDriver, CREATED_AT_LABEL, MANAGED_LABEL, SESSION_LABEL, USER_LABEL};
use crate::core::kv::KvDirectory;
use crate::core::registry::SessionRegistry;

pub struct Reaper {
    driver: Arc<dyn ContainerDriver>,
    kv: Arc<dyn KvDirectory>,
    registry: Arc<SessionRegistry>,
    config: Arc<Config>,
}

impl Reaper {
    pub fn new(
        driver: Arc<dyn ContainerDriver>,
        kv: Arc<dyn KvDirectory>,
        registry: Arc<SessionRegistry>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            driver,
            kv,
            registry,
            config,
        }
    }

    /// Runs the sweep loop until the process shuts down. Intended to be
    /// spawned once as a background task from `main`.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.config.cleanup_interval);
        loop {
            interval.tick().await;
            if let Err(e) = self.sweep_once().await {
                warn!(error = %e, "reaper sweep failed");
            }
        }
    }

    pub async fn sweep_once(&self) -> anyhow::Result<()> {
        let containers = self
            .driver
            .list(&format!("{MANAGED_LABEL}=true"))
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;

        let now = chrono::Utc::now().timestamp();
        let max_age = self.config.cleanup_max_container_age.as_secs() as i64;
        let mut reaped = 0usize;

        for container in containers {
            let Some(created_at) = container
                .labels
                .get(CREATED_AT_LABEL)
                .and_then(|v| v.parse::<i64>().ok())
            else {
                continue;
            };

            if now - created_at < max_age {
                continue;
            }

            let user_id = container.labels.get(USER_LABEL).cloned().unwrap_or_default();
            let session_id = container.labels.get(SESSION_LABEL).cloned().unwrap_or_default();

            // A session touched since this container's creation timestamp is
            // still active (the KV TTL tracks last-touch, not creation), so
            // skip it even though the container itself has aged out.
            if let Ok(Some(record)) = self.kv.get_session(&user_id, &session_id).await {
                if record.container_id == container.id && record.last_touched_at > created_at {
                    continue;
                }
            }

            // Skip sessions whose lock is currently held: a request is
            // in flight and removing the container underneath it would be
            // unsafe. The next sweep will pick it up once idle.
            match self
                .registry
                .reap_if_unlocked(&user_id, &session_id, &container.id)
                .await
            {
                Ok(true) => reaped += 1,
                Ok(false) => continue,
                Err(e) => {
                    warn!(container_id = %container.id, error = %e, "reaper failed to remove container");
                    continue;
                }
            }
        }

        if reaped > 0 {
            info!(reaped, "reaper swept aged-out containers");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::driver::fake::FakeDriver;
    use crate::core::kv::{FakeKvDirectory, SessionRecord};
    use std::collections::HashSet;

    fn test_config(max_age_secs: u64) -> Config {
        Config {
            session_ttl: Duration::from_secs(1800),
            container_image: "sandbox:latest".to_string(),
            container_mem_limit: 268_435_456,
            container_cpu_quota_pct: 50,
            default_exec_timeout: Duration::from_secs(30),
            allowed_commands: HashSet::new(),
            cleanup_interval: Duration::from_secs(60),
            cleanup_max_container_age: Duration::from_secs(max_age_secs),
            workspace_max_file_size: 10_485_760,
            workspace_persist_volumes: false,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            docker_socket: None,
            jwt_secret: "test-secret".to_string(),
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }

    #[tokio::test]
    async fn reaps_containers_older_than_max_age() {
        let driver = Arc::new(FakeDriver::default());
        let kv: Arc<dyn KvDirectory> = Arc::new(FakeKvDirectory::default());
        let config = Arc::new(test_config(60));
        let registry = Arc::new(SessionRegistry::new(kv.clone(), driver.clone(), config.clone()));

        let mut labels = std::collections::HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert(USER_LABEL.to_string(), "alice".to_string());
        labels.insert(SESSION_LABEL.to_string(), "s1".to_string());
        labels.insert(CREATED_AT_LABEL.to_string(), "1700000000".to_string());

        let container_id = driver
            .create(crate::core::driver::ContainerSpec {
                image: "sandbox:latest".to_string(),
                labels,
                env: vec![],
                volume_mount: None,
                tmpfs_workspace: true,
                working_dir: "/workspace".to_string(),
                mem_limit: 268_435_456,
                cpu_quota_pct: 50,
                pids_limit: 64,
                nofile_soft: 1024,
                nofile_hard: 2048,
            })
            .await
            .unwrap();

        kv.put_session(
            &SessionRecord {
                user_id: "alice".to_string(),
                session_id: "s1".to_string(),
                container_id: container_id.clone(),
                volume_name: None,
                created_at: 1_700_000_000,
                last_touched_at: 1_700_000_000,
            },
            1800,
        )
        .await
        .unwrap();

        let reaper = Reaper::new(driver.clone(), kv.clone(), registry, config);
        reaper.sweep_once().await.unwrap();

        assert_eq!(driver.container_count(), 0);
        assert!(kv.get_session("alice", "s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn skips_recently_touched_sessions() {
        let driver = Arc::new(FakeDriver::default());
        let kv: Arc<dyn KvDirectory> = Arc::new(FakeKvDirectory::default());
        let config = Arc::new(test_config(3600));
        let registry = Arc::new(SessionRegistry::new(kv.clone(), driver.clone(), config.clone()));

        let mut labels = std::collections::HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert(USER_LABEL.to_string(), "alice".to_string());
        labels.insert(SESSION_LABEL.to_string(), "s1".to_string());
        labels.insert(CREATED_AT_LABEL.to_string(), "1700000000".to_string());

        let container_id = driver
            .create(crate::core::driver::ContainerSpec {
                image: "sandbox:latest".to_string(),
                labels,
                env: vec![],
                volume_mount: None,
                tmpfs_workspace: true,
                working_dir: "/workspace".to_string(),
                mem_limit: 268_435_456,
                cpu_quota_pct: 50,
                pids_limit: 64,
                nofile_soft: 1024,
                nofile_hard: 2048,
            })
            .await
            .unwrap();

        kv.put_session(
            &SessionRecord {
                user_id: "alice".to_string(),
                session_id: "s1".to_string(),
                container_id: container_id.clone(),
                volume_name: None,
                created_at: 1_700_000_000,
                last_touched_at: 1_700_050_000,
            },
            1800,
        )
        .await
        .unwrap();

        let reaper = Reaper::new(driver.clone(), kv.clone(), registry, config);
        reaper.sweep_once().await.unwrap();

        assert_eq!(driver.container_count(), 1);
    }
}
