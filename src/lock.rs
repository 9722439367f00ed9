use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use uuid::Uuid;

#[derive(Debug)]
pub enum LockError {
    Redis(deadpool_redis::redis::RedisError),
    Pool(deadpool_redis::PoolError),
    InvalidOperation(String),
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::Redis(e) => write!(f, "Redis error: {e}"),
            LockError::Pool(e) => write!(f, "Pool error: {e}"),
            LockError::InvalidOperation(msg) => write!(f, "Invalid operation: {msg}"),
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LockError::Redis(e) => Some(e),
            LockError::Pool(e) => Some(e),
            _ => None,
        }
    }
}

impl From<deadpool_redis::redis::RedisError> for LockError {
    fn from(error: deadpool_redis::redis::RedisError) -> Self {
        LockError::Redis(error)
    }
}

impl From<deadpool_redis::PoolError> for LockError {
    fn from(error: deadpool_redis::PoolError) -> Self {
        LockError::Pool(error)
    }
}

/// A held named lock. The token ties release to the acquisition that created
/// the lock, so a later holder is never released by a stale owner.
#[derive(Debug, Clone)]
struct HeldLock {
    key: String,
    token: String,
}

/// Named, time-boxed mutual exclusion.
///
/// Backed by Redis `SET NX EX` when a pool is configured, otherwise by an
/// in-process map with the same expiry semantics. There is no automatic
/// renewal: the TTL is the upper bound on how long a presumed-dead holder can
/// block others.
#[derive(Debug)]
pub struct LockManager {
    redis_pool: Option<Arc<deadpool_redis::Pool>>,
    local_locks: Arc<DashMap<String, (String, Instant)>>,
    held: Arc<DashMap<String, HeldLock>>,
    prefix: String,
}

impl LockManager {
    pub fn new(pool: Option<Arc<deadpool_redis::Pool>>, prefix: &str) -> Self {
        Self {
            redis_pool: pool,
            local_locks: Arc::new(DashMap::new()),
            held: Arc::new(DashMap::new()),
            prefix: prefix.to_string(),
        }
    }

    fn format_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.prefix, key)
        }
    }

    /// Tries to acquire `lock_name`, retrying until `max_wait` elapses.
    /// Returns `false` when the lock stayed contended for the whole window.
    pub async fn acquire_lock(
        &self,
        lock_name: &str,
        ttl_seconds: u64,
        max_wait: Duration,
    ) -> Result<bool, LockError> {
        let full_key = self.format_key(lock_name);
        let token = Uuid::now_v7().to_string();
        let start = Instant::now();
        let retry_interval = if self.redis_pool.is_some() {
            Duration::from_millis(50)
        } else {
            Duration::from_millis(1)
        };

        loop {
            if self.try_acquire(&full_key, &token, ttl_seconds).await? {
                self.held.insert(
                    lock_name.to_string(),
                    HeldLock {
                        key: full_key,
                        token,
                    },
                );
                return Ok(true);
            }

            if start.elapsed() >= max_wait {
                return Ok(false);
            }

            sleep(retry_interval).await;
        }
    }

    async fn try_acquire(&self, key: &str, token: &str, ttl: u64) -> Result<bool, LockError> {
        if let Some(pool) = &self.redis_pool {
            let mut conn = pool.get().await?;

            let script = r#"
            return redis.call("SET", KEYS[1], ARGV[1], "NX", "EX", ARGV[2])
        "#;

            let result: Option<String> = deadpool_redis::redis::Script::new(script)
                .key(key)
                .arg(token)
                .arg(ttl)
                .invoke_async(&mut conn)
                .await?;

            Ok(result.is_some())
        } else {
            let now = Instant::now();
            match self.local_locks.entry(key.to_string()) {
                dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                    if entry.get().1 < now {
                        entry.insert((token.to_string(), now + Duration::from_secs(ttl)));
                        return Ok(true);
                    }
                    Ok(false)
                }
                dashmap::mapref::entry::Entry::Vacant(entry) => {
                    entry.insert((token.to_string(), now + Duration::from_secs(ttl)));
                    Ok(true)
                }
            }
        }
    }

    /// Releases a lock previously acquired by this manager. Returns `false`
    /// when the lock was not held here or already expired and taken over.
    pub async fn release_lock(&self, lock_name: &str) -> Result<bool, LockError> {
        let Some((_, lock)) = self.held.remove(lock_name) else {
            return Ok(false);
        };

        if let Some(pool) = &self.redis_pool {
            let script = r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                return redis.call("DEL", KEYS[1])
            else
                return 0
            end
        "#;

            let mut conn = pool.get().await?;
            let result: i32 = deadpool_redis::redis::Script::new(script)
                .key(&lock.key)
                .arg(&lock.token)
                .invoke_async(&mut conn)
                .await?;

            Ok(result == 1)
        } else {
            match self.local_locks.entry(lock.key.clone()) {
                dashmap::mapref::entry::Entry::Occupied(entry) => {
                    if entry.get().0 == lock.token {
                        entry.remove();
                        Ok(true)
                    } else {
                        Ok(false)
                    }
                }
                dashmap::mapref::entry::Entry::Vacant(_) => Ok(false),
            }
        }
    }

    pub async fn with_lock<F, R>(
        &self,
        lock_name: &str,
        ttl_seconds: u64,
        max_wait: Duration,
        f: F,
    ) -> Result<Option<R>, LockError>
    where
        F: Future<Output = R>,
    {
        if self.acquire_lock(lock_name, ttl_seconds, max_wait).await? {
            let result = f.await;
            self.release_lock(lock_name).await?;
            Ok(Some(result))
        } else {
            Ok(None)
        }
    }
}
