// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Resource Locks
//!
//! Time-boxed mutual exclusion keyed by an application-chosen string, usually
//! `"{resource_type}:{resource_id}"`. A successful acquire returns an opaque
//! token; only that token releases the lock. Every lock expires after its TTL
//! whether or not it was released, which is what frees locks held by crashed
//! workers. There is no renewal, so the TTL must cover the longest expected
//! processing time.
//!
//! Contention is an expected outcome and is reported as `Ok(None)`, not as an
//! error.

use crate::errors::LockError;
use async_trait::async_trait;
use redis::{aio::ConnectionManager, Script};
use std::{collections::HashMap, fmt, time::Duration};
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, error};
use uuid::Uuid;

/// Prefix applied to every key written to Redis.
pub const REDIS_LOCK_PREFIX: &str = "lock:";

// Deletes the key only if it still holds the caller's token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Proof of holding a lock, required to release it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    fn generate() -> Self {
        LockToken(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lock key for a resource.
pub fn resource_key(resource_type: &str, resource_id: i64) -> String {
    format!("{resource_type}:{resource_id}")
}

#[async_trait]
pub trait LockCoordinator: Send + Sync {
    /// Claims `key` for `ttl`. `None` means someone else holds it.
    async fn acquire_lock(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>, LockError>;

    /// Releases `key` if `token` still holds it. `false` when the lock expired
    /// or belongs to another holder.
    async fn release_lock(&self, key: &str, token: &LockToken) -> Result<bool, LockError>;
}

/// Locks shared by every worker connected to the same Redis.
#[derive(Clone)]
pub struct RedisLockCoordinator {
    conn: ConnectionManager,
    release: Script,
}

impl RedisLockCoordinator {
    /// Connects to Redis.
    ///
    /// # Parameters
    /// * `url` - Redis URL, e.g. `redis://127.0.0.1:6379`
    ///
    /// # Returns
    /// A coordinator backed by a reconnecting connection manager, or
    /// `LockError::Connection` when the URL is invalid or Redis unreachable
    pub async fn connect(url: &str) -> Result<Self, LockError> {
        let client = redis::Client::open(url).map_err(|err| {
            error!(error = err.to_string(), "invalid redis url");
            LockError::Connection(err.to_string())
        })?;

        let conn = ConnectionManager::new(client).await.map_err(|err| {
            error!(error = err.to_string(), "failure to connect to redis");
            LockError::Connection(err.to_string())
        })?;

        Ok(Self::with_connection(conn))
    }

    /// Wraps an existing connection manager.
    pub fn with_connection(conn: ConnectionManager) -> Self {
        RedisLockCoordinator {
            conn,
            release: Script::new(RELEASE_SCRIPT),
        }
    }
}

#[async_trait]
impl LockCoordinator for RedisLockCoordinator {
    async fn acquire_lock(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>, LockError> {
        let token = LockToken::generate();
        let mut conn = self.conn.clone();

        let reply: Option<String> = redis::cmd("SET")
            .arg(format!("{REDIS_LOCK_PREFIX}{key}"))
            .arg(token.as_str())
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;

        if reply.is_some() {
            debug!(key = key, "lock acquired");
            Ok(Some(token))
        } else {
            debug!(key = key, "lock busy");
            Ok(None)
        }
    }

    async fn release_lock(&self, key: &str, token: &LockToken) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();

        let deleted: i64 = self
            .release
            .key(format!("{REDIS_LOCK_PREFIX}{key}"))
            .arg(token.as_str())
            .invoke_async(&mut conn)
            .await?;

        Ok(deleted == 1)
    }
}

struct Held {
    token: LockToken,
    expires_at: Instant,
}

/// Locks local to one process. Same semantics as the Redis coordinator, for
/// single-node deployments and tests.
#[derive(Default)]
pub struct InMemoryLockCoordinator {
    held: Mutex<HashMap<String, Held>>,
}

impl InMemoryLockCoordinator {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockCoordinator for InMemoryLockCoordinator {
    async fn acquire_lock(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>, LockError> {
        let mut held = self.held.lock().await;
        let now = Instant::now();

        if held.get(key).is_some_and(|h| h.expires_at > now) {
            return Ok(None);
        }

        let token = LockToken::generate();
        held.insert(
            key.to_owned(),
            Held {
                token: token.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(Some(token))
    }

    async fn release_lock(&self, key: &str, token: &LockToken) -> Result<bool, LockError> {
        let mut held = self.held.lock().await;

        match held.get(key) {
            Some(h) if h.token == *token && h.expires_at > Instant::now() => {
                held.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(30);

    #[test]
    fn keys_combine_type_and_id() {
        assert_eq!(resource_key("document", 42), "document:42");
    }

    #[tokio::test]
    async fn second_acquire_is_denied_until_release() {
        let locks = InMemoryLockCoordinator::new();

        let token = locks.acquire_lock("document:42", TTL).await.unwrap().unwrap();
        assert_eq!(locks.acquire_lock("document:42", TTL).await.unwrap(), None);

        assert!(locks.release_lock("document:42", &token).await.unwrap());
        assert!(locks.acquire_lock("document:42", TTL).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let locks = InMemoryLockCoordinator::new();

        assert!(locks.acquire_lock("document:1", TTL).await.unwrap().is_some());
        assert!(locks.acquire_lock("document:2", TTL).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn only_the_holder_can_release() {
        let locks = InMemoryLockCoordinator::new();

        let _token = locks.acquire_lock("document:42", TTL).await.unwrap().unwrap();
        let stranger = LockToken::generate();

        assert!(!locks.release_lock("document:42", &stranger).await.unwrap());
        assert_eq!(locks.acquire_lock("document:42", TTL).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lock_can_be_taken_over() {
        let locks = InMemoryLockCoordinator::new();

        let stale = locks.acquire_lock("document:42", TTL).await.unwrap().unwrap();
        tokio::time::advance(TTL + Duration::from_millis(1)).await;

        let fresh = locks.acquire_lock("document:42", TTL).await.unwrap().unwrap();
        assert_ne!(stale, fresh);

        // The crashed holder's token no longer releases anything.
        assert!(!locks.release_lock("document:42", &stale).await.unwrap());
        assert!(locks.release_lock("document:42", &fresh).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn release_after_expiry_reports_false() {
        let locks = InMemoryLockCoordinator::new();

        let token = locks.acquire_lock("document:42", TTL).await.unwrap().unwrap();
        tokio::time::advance(TTL).await;

        assert!(!locks.release_lock("document:42", &token).await.unwrap());
    }
}
