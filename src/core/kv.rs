//! KV Directory: the durable, TTL'd mapping from `(user_id, session_id)` to
//! session metadata that survives process restarts. Grounded on the Redis
//! session-store pattern from the composable-rust auth example (connection
//! manager, `set_ex` for TTL'd writes, explicit reverse-index key).

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type KvResult<T> = Result<T, KvError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRecord {
    pub user_id: String,
    pub session_id: String,
    pub container_id: String,
    pub volume_name: Option<String>,
    pub created_at: i64,
    pub last_touched_at: i64,
}

fn session_key(user_id: &str, session_id: &str) -> String {
    format!("sandbox:session:{user_id}:{session_id}")
}

fn reverse_key(container_id: &str) -> String {
    format!("sandbox:container:{container_id}")
}

#[async_trait]
pub trait KvDirectory: Send + Sync {
    async fn get_session(&self, user_id: &str, session_id: &str) -> KvResult<Option<SessionRecord>>;
    async fn put_session(&self, record: &SessionRecord, ttl_secs: u64) -> KvResult<()>;
    async fn refresh_ttl(&self, user_id: &str, session_id: &str, ttl_secs: u64) -> KvResult<()>;
    async fn delete_session(&self, user_id: &str, session_id: &str) -> KvResult<()>;
    async fn get_reverse(&self, container_id: &str) -> KvResult<Option<(String, String)>>;
}

pub struct RedisKvDirectory {
    conn: redis::aio::ConnectionManager,
}

impl RedisKvDirectory {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KvDirectory for RedisKvDirectory {
    async fn get_session(&self, user_id: &str, session_id: &str) -> KvResult<Option<SessionRecord>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(session_key(user_id, session_id))
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn put_session(&self, record: &SessionRecord, ttl_secs: u64) -> KvResult<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(record)?;
        let sk = session_key(&record.user_id, &record.session_id);
        let rk = reverse_key(&record.container_id);
        let reverse_payload = format!("{}:{}", record.user_id, record.session_id);

        redis::pipe()
            .atomic()
            .set_ex(&sk, payload, ttl_secs)
            .set_ex(&rk, reverse_payload, ttl_secs)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn refresh_ttl(&self, user_id: &str, session_id: &str, ttl_secs: u64) -> KvResult<()> {
        let mut conn = self.conn.clone();
        let sk = session_key(user_id, session_id);
        let record: Option<String> = conn
            .get(&sk)
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        let Some(raw) = record else { return Ok(()) };
        let parsed: SessionRecord = serde_json::from_str(&raw)?;
        let rk = reverse_key(&parsed.container_id);
        redis::pipe()
            .atomic()
            .expire(&sk, ttl_secs as i64)
            .expire(&rk, ttl_secs as i64)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn delete_session(&self, user_id: &str, session_id: &str) -> KvResult<()> {
        let mut conn = self.conn.clone();
        let sk = session_key(user_id, session_id);
        let record: Option<String> = conn
            .get(&sk)
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))?;

        let mut pipe = redis::pipe();
        pipe.atomic().del(&sk);
        if let Some(raw) = record {
            if let Ok(parsed) = serde_json::from_str::<SessionRecord>(&raw) {
                pipe.del(reverse_key(&parsed.container_id));
            }
        }
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn get_reverse(&self, container_id: &str) -> KvResult<Option<(String, String)>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(reverse_key(container_id))
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        Ok(raw.and_then(|s| s.split_once(':').map(|(u, sid)| (u.to_string(), sid.to_string()))))
    }
}

/// In-memory fake used by the core's unit tests; mirrors the TTL semantics
/// closely enough for single-threaded test scenarios (no background sweep —
/// expiry is checked lazily on read).
pub struct FakeKvDirectory {
    sessions: StdMutex<HashMap<String, (SessionRecord, i64)>>,
    reverse: StdMutex<HashMap<String, String>>,
    now: StdMutex<i64>,
}

impl Default for FakeKvDirectory {
    fn default() -> Self {
        Self {
            sessions: StdMutex::new(HashMap::new()),
            reverse: StdMutex::new(HashMap::new()),
            now: StdMutex::new(1_700_000_000),
        }
    }
}

impl FakeKvDirectory {
    pub fn advance_clock(&self, secs: i64) {
        *self.now.lock().unwrap() += secs;
    }

    fn key(user_id: &str, session_id: &str) -> String {
        format!("{user_id}:{session_id}")
    }
}

#[async_trait]
impl KvDirectory for FakeKvDirectory {
    async fn get_session(&self, user_id: &str, session_id: &str) -> KvResult<Option<SessionRecord>> {
        let now = *self.now.lock().unwrap();
        let mut guard = self.sessions.lock().unwrap();
        let k = Self::key(user_id, session_id);
        match guard.get(&k) {
            Some((record, expires_at)) if *expires_at > now => Ok(Some(record.clone())),
            Some(_) => {
                guard.remove(&k);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put_session(&self, record: &SessionRecord, ttl_secs: u64) -> KvResult<()> {
        let now = *self.now.lock().unwrap();
        let k = Self::key(&record.user_id, &record.session_id);
        self.sessions
            .lock()
            .unwrap()
            .insert(k, (record.clone(), now + ttl_secs as i64));
        self.reverse
            .lock()
            .unwrap()
            .insert(record.container_id.clone(), format!("{}:{}", record.user_id, record.session_id));
        Ok(())
    }

    async fn refresh_ttl(&self, user_id: &str, session_id: &str, ttl_secs: u64) -> KvResult<()> {
        let now = *self.now.lock().unwrap();
        let mut guard = self.sessions.lock().unwrap();
        if let Some((_, expires_at)) = guard.get_mut(&Self::key(user_id, session_id)) {
            *expires_at = now + ttl_secs as i64;
        }
        Ok(())
    }

    async fn delete_session(&self, user_id: &str, session_id: &str) -> KvResult<()> {
        let k = Self::key(user_id, session_id);
        if let Some((record, _)) = self.sessions.lock().unwrap().remove(&k) {
            self.reverse.lock().unwrap().remove(&record.container_id);
        }
        Ok(())
    }

    async fn get_reverse(&self, container_id: &str) -> KvResult<Option<(String, String)>> {
        Ok(self
            .reverse
            .lock()
            .unwrap()
            .get(container_id)
            .and_then(|s| s.split_once(':').map(|(u, sid)| (u.to_string(), sid.to_string()))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> SessionRecord {
        SessionRecord {
            user_id: "alice".to_string(),
            session_id: "sess-1".to_string(),
            container_id: "cnt-1".to_string(),
            volume_name: None,
            created_at: 1_700_000_000,
            last_touched_at: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn round_trips_a_session_record() {
        let kv = FakeKvDirectory::default();
        let record = sample_record();
        kv.put_session(&record, 60).await.unwrap();

        let fetched = kv.get_session("alice", "sess-1").await.unwrap().unwrap();
        assert_eq!(fetched, record);

        let (user, session) = kv.get_reverse("cnt-1").await.unwrap().unwrap();
        assert_eq!(user, "alice");
        assert_eq!(session, "sess-1");
    }

    #[tokio::test]
    async fn expires_after_ttl_elapses() {
        let kv = FakeKvDirectory::default();
        kv.put_session(&sample_record(), 30).await.unwrap();
        kv.advance_clock(31);
        assert!(kv.get_session("alice", "sess-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn refresh_ttl_extends_expiry() {
        let kv = FakeKvDirectory::default();
        kv.put_session(&sample_record(), 10).await.unwrap();
        kv.advance_clock(5);
        kv.refresh_ttl("alice", "sess-1", 60).await.unwrap();
        kv.advance_clock(20);
        assert!(kv.get_session("alice", "sess-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_removes_both_forward_and_reverse_entries() {
        let kv = FakeKvDirectory::default();
        kv.put_session(&sample_record(), 60).await.unwrap();
        kv.delete_session("alice", "sess-1").await.unwrap();
        assert!(kv.get_session("alice", "sess-1").await.unwrap().is_none());
        assert!(kv.get_reverse("cnt-1").await.unwrap().is_none());
    }
}
