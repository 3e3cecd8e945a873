use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;

use crate::error::{ServiceError, ServiceResult};

/// String key-value store with optional per-entry expiry.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> ServiceResult<Option<String>>;

    /// `ttl = None` stores the entry without expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> ServiceResult<()>;

    /// Returns whether an entry was removed.
    async fn delete(&self, key: &str) -> ServiceResult<bool>;

    async fn exists(&self, key: &str) -> ServiceResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Removes every entry whose key starts with `prefix`; returns the count.
    async fn delete_prefix(&self, prefix: &str) -> ServiceResult<usize>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    ttl: Option<Duration>,
}

/// Each entry carries its own lifetime; overwriting an entry restarts it.
struct EntryTtl;

impl Expiry<String, Entry> for EntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &Entry,
        _created_at: Instant,
    ) -> Option<Duration> {
        entry.ttl
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &Entry,
        _updated_at: Instant,
        _remaining: Option<Duration>,
    ) -> Option<Duration> {
        entry.ttl
    }
}

/// In-process `KvStore` over a moka cache. Expired entries are evicted by the
/// cache itself.
#[derive(Clone)]
pub struct MemoryKv {
    entries: Cache<String, Entry>,
}

impl MemoryKv {
    #[must_use]
    pub fn new() -> Self {
        let entries = Cache::builder()
            .name("klinik-kv")
            .expire_after(EntryTtl)
            .support_invalidation_closures()
            .build();
        Self { entries }
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryKv")
            .field("entry_count", &self.entries.entry_count())
            .finish()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> ServiceResult<Option<String>> {
        Ok(self.entries.get(key).await.map(|entry| entry.value))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> ServiceResult<()> {
        self.entries
            .insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    ttl,
                },
            )
            .await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> ServiceResult<bool> {
        Ok(self.entries.remove(key).await.is_some())
    }

    async fn delete_prefix(&self, prefix: &str) -> ServiceResult<usize> {
        let matching = self
            .entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .count();

        let prefix = prefix.to_string();
        self.entries
            .invalidate_entries_if(move |key, _| key.starts_with(&prefix))
            .map_err(|e| ServiceError::Cache(e.to_string()))?;

        tracing::trace!(matching, "Prefix invalidated");
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn entries_expire() {
        let kv = MemoryKv::new();
        kv.set("session:v1:a:1", "1", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        kv.set("route:v1:GET:/api", "x|read", None).await.unwrap();
        assert!(kv.exists("session:v1:a:1").await.unwrap());

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(!kv.exists("session:v1:a:1").await.unwrap());
        assert_eq!(
            kv.get("route:v1:GET:/api").await.unwrap().as_deref(),
            Some("x|read")
        );
    }

    #[tokio::test]
    async fn overwrite_replaces_the_lifetime() {
        let kv = MemoryKv::new();
        kv.set("view:v1:a", "[]", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        kv.set("view:v1:a", "[1]", None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(kv.get("view:v1:a").await.unwrap().as_deref(), Some("[1]"));
    }

    #[tokio::test]
    async fn delete_prefix_only_touches_matching_keys() {
        let kv = MemoryKv::new();
        kv.set("session:v1:a:1", "1", None).await.unwrap();
        kv.set("session:v1:a:2", "1", None).await.unwrap();
        kv.set("session:v1:b:1", "1", None).await.unwrap();

        assert_eq!(kv.delete_prefix("session:v1:a:").await.unwrap(), 2);
        assert!(!kv.exists("session:v1:a:1").await.unwrap());
        assert!(!kv.exists("session:v1:a:2").await.unwrap());
        assert!(kv.exists("session:v1:b:1").await.unwrap());
    }

    #[tokio::test]
    async fn entries_written_after_a_prefix_delete_survive_it() {
        let kv = MemoryKv::new();
        kv.set("session:v1:a:1", "1", None).await.unwrap();
        kv.delete_prefix("session:v1:a:").await.unwrap();

        kv.set("session:v1:a:2", "1", None).await.unwrap();

        assert!(kv.exists("session:v1:a:2").await.unwrap());
        assert!(!kv.exists("session:v1:a:1").await.unwrap());
    }
}
