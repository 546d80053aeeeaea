use std::collections::HashSet;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

/// Process-wide configuration, loaded once at startup and handed out by `Arc`.
/// Security-relevant knobs (image, whitelist) fail the process fast if unset
/// or malformed rather than falling back to a baked-in default.
#[derive(Debug, Clone)]
pub struct Config {
    pub session_ttl: Duration,
    pub container_image: String,
    pub container_mem_limit: i64,
    pub container_cpu_quota_pct: u32,
    pub default_exec_timeout: Duration,
    pub allowed_commands: HashSet<String>,
    pub cleanup_interval: Duration,
    pub cleanup_max_container_age: Duration,
    pub workspace_max_file_size: u64,
    pub workspace_persist_volumes: bool,
    pub redis_url: String,
    pub docker_socket: Option<String>,
    pub jwt_secret: String,
    pub bind_addr: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let container_image = std::env::var("CONTAINER_IMAGE")
            .map_err(|_| anyhow!("CONTAINER_IMAGE must be set (no baked-in default)"))?;

        let allowed_commands = parse_csv_set(&env_opt("ALLOWED_COMMANDS").unwrap_or_default());

        let jwt_secret = std::env::var("JWT_SECRET")
            .map_err(|_| anyhow!("JWT_SECRET must be set"))?;

        Ok(Self {
            session_ttl: Duration::from_secs(env_u64("SESSION_TTL_SECONDS", 1800)?),
            container_image,
            container_mem_limit: env_i64("CONTAINER_MEM_LIMIT", 268_435_456)?,
            container_cpu_quota_pct: env_u64("CONTAINER_CPU_QUOTA", 50)? as u32,
            default_exec_timeout: Duration::from_secs(env_u64(
                "DEFAULT_EXEC_TIMEOUT_SECONDS",
                30,
            )?),
            allowed_commands,
            cleanup_interval: Duration::from_secs(env_u64("CLEANUP_INTERVAL_SECONDS", 60)?),
            cleanup_max_container_age: Duration::from_secs(env_u64(
                "CLEANUP_MAX_CONTAINER_AGE_SECONDS",
                3600,
            )?),
            workspace_max_file_size: env_u64("WORKSPACE_MAX_FILE_SIZE_BYTES", 10_485_760)?,
            workspace_persist_volumes: env_bool("WORKSPACE_PERSIST_VOLUMES", false)?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            docker_socket: env_opt("DOCKER_SOCKET"),
            jwt_secret,
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
        })
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match env_opt(key) {
        None => Ok(default),
        Some(v) => v
            .parse()
            .with_context(|| format!("{key} must be a non-negative integer, got '{v}'")),
    }
}

fn env_i64(key: &str, default: i64) -> Result<i64> {
    match env_opt(key) {
        None => Ok(default),
        Some(v) => v
            .parse()
            .with_context(|| format!("{key} must be an integer, got '{v}'")),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match env_opt(key) {
        None => Ok(default),
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => Err(anyhow!("{key} must be a boolean, got '{other}'")),
        },
    }
}

fn parse_csv_set(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_csv_whitelist() {
        let set = parse_csv_set("echo, ls ,cat,,rm");
        assert!(set.contains("echo"));
        assert!(set.contains("ls"));
        assert!(set.contains("cat"));
        assert!(set.contains("rm"));
        assert_eq!(set.len(), 4);
    }

    #[test]
    fn empty_whitelist_allows_nothing() {
        let set = parse_csv_set("");
        assert!(set.is_empty());
    }
}
