use crate::errors::CacheError;
use dashmap::DashMap;
use deadpool_redis::Pool;
use deadpool_redis::redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[async_trait::async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError>;
    async fn del(&self, key: &str) -> Result<(), CacheError>;
    async fn set_nx(&self, key: &str, value: &[u8], ttl: Option<Duration>)
    -> Result<bool, CacheError>;
    async fn ping(&self) -> Result<(), CacheError>;
}

struct LocalBackend {
    store: DashMap<String, (Vec<u8>, Option<Instant>)>,
}

impl LocalBackend {
    fn new() -> Self {
        Self {
            store: DashMap::new(),
        }
    }
}

#[async_trait::async_trait]
impl CacheBackend for LocalBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        if let Some(entry) = self.store.get(key) {
            let (val, expires_at) = entry.value();
            if let Some(exp) = expires_at {
                if Instant::now() > *exp {
                    // Lazy deletion: found expired item, remove it.
                    drop(entry);
                    self.store.remove(key);
                    return Ok(None);
                }
            }
            return Ok(Some(val.clone()));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError> {
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.store
            .insert(key.to_string(), (value.to_vec(), expires_at));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        self.store.remove(key);
        Ok(())
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        let now = Instant::now();
        let expires_at = ttl.map(|d| now + d);

        match self.store.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let (_, old_expires_at) = occupied.get();
                if let Some(exp) = old_expires_at {
                    if now < *exp {
                        // Exists and valid
                        return Ok(false);
                    }
                } else {
                    // Exists and no expiry (permanent)
                    return Ok(false);
                }

                // Exists but expired, replace it
                occupied.insert((value.to_vec(), expires_at));
                Ok(true)
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert((value.to_vec(), expires_at));
                Ok(true)
            }
        }
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

pub struct RedisBackend {
    pool: Pool,
}

impl RedisBackend {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| CacheError::Pool(e.to_string()))?;
        let result: Option<Vec<u8>> = conn.get(key).await.map_err(CacheError::Redis)?;
        Ok(result)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| CacheError::Pool(e.to_string()))?;
        if let Some(duration) = ttl {
            let _: () = conn
                .set_ex(key, value, duration.as_secs())
                .await
                .map_err(CacheError::Redis)?;
        } else {
            let _: () = conn.set(key, value).await.map_err(CacheError::Redis)?;
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| CacheError::Pool(e.to_string()))?;
        conn.del(key).await.map_err(CacheError::Redis)
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| CacheError::Pool(e.to_string()))?;

        let result: Option<String> = if let Some(ttl) = ttl {
            deadpool_redis::redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("EX")
                .arg(ttl.as_secs())
                .query_async(&mut conn)
                .await
                .map_err(CacheError::Redis)?
        } else {
            deadpool_redis::redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .query_async(&mut conn)
                .await
                .map_err(CacheError::Redis)?
        };
        Ok(result.is_some())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| CacheError::Pool(e.to_string()))?;
        let _: String = deadpool_redis::redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(CacheError::Redis)?;
        Ok(())
    }
}

/// Typed, namespaced cache entries.
///
/// A type picks its `field`; values are serialized as JSON under
/// `{namespace}:{field}:{id}`.
#[async_trait::async_trait]
pub trait CacheAble: Send + Sync + Sized
where
    Self: Serialize + for<'de> Deserialize<'de> + 'static,
{
    fn field() -> impl AsRef<str>;

    async fn send(&self, id: &str, cache: &CacheService) -> Result<(), CacheError> {
        let key = Self::cache_id(id, cache);
        let content = serde_json::to_vec(self)?;
        cache.backend.set(&key, &content, cache.default_ttl).await?;
        Ok(())
    }

    async fn send_with_ttl(
        &self,
        id: &str,
        cache: &CacheService,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let key = Self::cache_id(id, cache);
        let content = serde_json::to_vec(self)?;
        cache.backend.set(&key, &content, Some(ttl)).await?;
        Ok(())
    }

    async fn sync(id: &str, cache: &CacheService) -> Result<Option<Self>, CacheError> {
        let key = Self::cache_id(id, cache);
        if let Some(bytes) = cache.backend.get(&key).await? {
            let val = serde_json::from_slice(&bytes).map_err(CacheError::Serde)?;
            Ok(Some(val))
        } else {
            Ok(None)
        }
    }

    async fn delete(id: &str, cache: &CacheService) -> Result<(), CacheError> {
        let key = Self::cache_id(id, cache);
        cache.backend.del(&key).await?;
        Ok(())
    }

    fn cache_id(id: &str, cache: &CacheService) -> String {
        format!("{}:{}:{id}", cache.namespace, Self::field().as_ref())
    }
}

pub struct CacheService {
    backend: Arc<dyn CacheBackend>,
    namespace: String,
    default_ttl: Option<Duration>,
}

impl CacheService {
    pub fn new(pool: Option<Pool>, namespace: String, default_ttl: Option<Duration>) -> Self {
        let backend: Arc<dyn CacheBackend> = match pool {
            Some(p) => Arc::new(RedisBackend::new(p)),
            None => Arc::new(LocalBackend::new()),
        };

        CacheService {
            backend,
            namespace,
            default_ttl,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.backend.get(key).await
    }

    pub async fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        self.backend.set(key, value, ttl).await
    }

    pub async fn set_nx(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        self.backend.set_nx(key, value, ttl).await
    }

    pub async fn del(&self, key: &str) -> Result<(), CacheError> {
        self.backend.del(key).await
    }

    pub async fn ping(&self) -> Result<(), CacheError> {
        self.backend.ping().await
    }

    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize, Serialize, Debug, PartialEq)]
    struct Probe {
        name: String,
        value: i32,
    }

    impl CacheAble for Probe {
        fn field() -> impl AsRef<str> {
            "probe"
        }
    }

    fn local_service() -> CacheService {
        CacheService::new(None, "test".to_string(), Some(Duration::from_secs(60)))
    }

    #[tokio::test]
    async fn test_cacheable_round_trip() {
        let cache = local_service();
        let probe = Probe {
            name: "usd".to_string(),
            value: 123,
        };

        probe.send("current", &cache).await.unwrap();

        let fetched = Probe::sync("current", &cache).await.unwrap();
        assert_eq!(fetched, Some(probe));

        Probe::delete("current", &cache).await.unwrap();
        assert_eq!(Probe::sync("current", &cache).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_local_ttl_expiry() {
        let cache = local_service();
        cache
            .set("k", b"v", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(b"v".to_vec()));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_nx_respects_live_entry() {
        let cache = local_service();
        assert!(
            cache
                .set_nx("lock", b"a", Some(Duration::from_secs(60)))
                .await
                .unwrap()
        );
        assert!(
            !cache
                .set_nx("lock", b"b", Some(Duration::from_secs(60)))
                .await
                .unwrap()
        );

        // Expired entries can be re-taken
        cache
            .set("gone", b"a", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(
            cache
                .set_nx("gone", b"b", Some(Duration::from_secs(60)))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_cache_id_namespacing() {
        let cache = local_service();
        assert_eq!(Probe::cache_id("current", &cache), "test:probe:current");
    }
}
