//! `(path, method)` to `(resource key, action)` resolution.
//!
//! Storage format, version `v1`:
//!
//! ```text
//! route:v1:{METHOD}:{normalized path}  ->  {resource_key}|{action}
//! ```
//!
//! Entries never expire. Changing the separator or component order requires a
//! full rewarm. The delimited value never leaves this module: callers only see
//! [`RouteTarget`].

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::RwLock;

use klinik_core::constants::{ROUTE_KEY_PREFIX, ROUTE_VALUE_SEPARATOR};
use klinik_db::model::route::{is_param_segment, normalize_method, normalize_path};
use klinik_db::store::{AuthzStore, RouteMapping};

use crate::cache::KvStore;
use crate::error::{ServiceError, ServiceResult};

/// What a route guards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteTarget {
    pub resource_key: String,
    pub action: String,
}

impl RouteTarget {
    fn encode(&self) -> String {
        format!(
            "{}{ROUTE_VALUE_SEPARATOR}{}",
            self.resource_key, self.action
        )
    }

    fn decode(value: &str) -> Option<Self> {
        let (resource_key, action) = value.split_once(ROUTE_VALUE_SEPARATOR)?;
        if resource_key.is_empty() || action.is_empty() || action.contains(ROUTE_VALUE_SEPARATOR) {
            return None;
        }
        Some(Self {
            resource_key: resource_key.to_string(),
            action: action.to_string(),
        })
    }
}

impl From<&RouteMapping> for RouteTarget {
    fn from(mapping: &RouteMapping) -> Self {
        Self {
            resource_key: mapping.resource_key.clone(),
            action: mapping.action.clone(),
        }
    }
}

/// Cache key for an already normalized method and path.
#[must_use]
pub fn route_key(method: &str, path: &str) -> String {
    format!("{ROUTE_KEY_PREFIX}{method}:{path}")
}

#[derive(Debug, Clone)]
struct Template {
    method: String,
    path: String,
    segments: Vec<String>,
    target: RouteTarget,
}

impl Template {
    fn literal_count(&self) -> usize {
        self.segments.iter().filter(|s| !is_param_segment(s)).count()
    }

    fn matches(&self, method: &str, segments: &[&str]) -> bool {
        self.method == method
            && self.segments.len() == segments.len()
            && self
                .segments
                .iter()
                .zip(segments)
                .all(|(pattern, actual)| is_param_segment(pattern) || pattern == actual)
    }
}

fn split_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// ## Summary
/// Route-resource cache over a [`KvStore`], rebuilt from the durable store.
///
/// Exact paths are answered from the key-value store. Paths declared with
/// parameter segments (`/api/users/{id}`) are also kept in an in-memory
/// template table consulted after an exact miss; the most literal template
/// wins.
pub struct RouteCache {
    kv: Arc<dyn KvStore>,
    store: Arc<dyn AuthzStore>,
    templates: RwLock<Vec<Template>>,
    /// resource key -> cache keys written for it
    index: DashMap<String, BTreeSet<String>>,
    /// resource keys cleared and awaiting a lazy reload
    stale: DashSet<String>,
}

impl RouteCache {
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, store: Arc<dyn AuthzStore>) -> Self {
        Self {
            kv,
            store,
            templates: RwLock::new(Vec::new()),
            index: DashMap::new(),
            stale: DashSet::new(),
        }
    }

    /// ## Summary
    /// Drops every `v1` route entry and reloads all mappings from the durable store.
    ///
    /// ## Errors
    /// Store or cache failures.
    #[tracing::instrument(skip(self))]
    pub async fn warm(&self) -> ServiceResult<usize> {
        let mappings = self.store.route_mappings().await?;
        let cleared = self.kv.delete_prefix(ROUTE_KEY_PREFIX).await?;
        self.index.clear();
        self.stale.clear();
        self.templates.write().await.clear();

        for mapping in &mappings {
            self.put(mapping).await?;
        }
        self.sort_templates().await;

        tracing::info!(
            cleared,
            loaded = mappings.len(),
            "Route cache warmed"
        );
        Ok(mappings.len())
    }

    /// Full rebuild triggered by the administrative reload action.
    ///
    /// ## Errors
    /// Store or cache failures.
    pub async fn rewarm(&self) -> ServiceResult<usize> {
        tracing::info!("Route cache rewarm requested");
        self.warm().await
    }

    /// ## Summary
    /// Resolves a request to the resource it touches. `None` is a miss: the
    /// route is not configured and the caller must deny.
    ///
    /// ## Errors
    /// Store or cache failures, and undecodable cache values.
    pub async fn lookup(&self, method: &str, path: &str) -> ServiceResult<Option<RouteTarget>> {
        let Ok(method) = normalize_method(method) else {
            tracing::debug!(method, "Unsupported method; no route mapping");
            return Ok(None);
        };
        let path = normalize_path(path);

        if !self.stale.is_empty() {
            self.reload_stale().await?;
        }

        let key = route_key(&method, &path);
        if let Some(value) = self.kv.get(&key).await? {
            return RouteTarget::decode(&value)
                .map(Some)
                .ok_or_else(|| ServiceError::Cache(format!("undecodable route entry at {key}")));
        }

        let segments = split_segments(&path);
        let templates = self.templates.read().await;
        let hit = templates
            .iter()
            .find(|t| t.matches(&method, &segments))
            .map(|t| {
                tracing::trace!(template = %t.path, %path, "Route matched template");
                t.target.clone()
            });
        Ok(hit)
    }

    /// ## Summary
    /// Clears every route mapped to `resource_key` and marks the key for a
    /// lazy reload on the next lookup. Unrelated routes sharing the key are
    /// cleared with it.
    ///
    /// ## Errors
    /// Cache failures.
    #[tracing::instrument(skip(self))]
    pub async fn invalidate_resource_key(&self, resource_key: &str) -> ServiceResult<()> {
        self.stale.insert(resource_key.to_string());
        let keys = self
            .index
            .remove(resource_key)
            .map(|(_, keys)| keys)
            .unwrap_or_default();
        for key in &keys {
            self.kv.delete(key).await?;
        }
        self.templates
            .write()
            .await
            .retain(|t| t.target.resource_key != resource_key);

        tracing::debug!(cleared = keys.len(), "Route entries invalidated");
        Ok(())
    }

    /// Resource keys waiting for a lazy reload.
    #[must_use]
    pub fn stale_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.stale.iter().map(|k| k.key().clone()).collect();
        keys.sort_unstable();
        keys
    }

    async fn reload_stale(&self) -> ServiceResult<()> {
        for resource_key in self.stale_keys() {
            if self.stale.remove(&resource_key).is_none() {
                continue;
            }
            let mappings = match self.store.route_mappings_for_key(&resource_key).await {
                Ok(mappings) => mappings,
                Err(err) => {
                    self.stale.insert(resource_key);
                    return Err(err.into());
                }
            };
            for mapping in &mappings {
                self.put(mapping).await?;
            }
            tracing::debug!(
                resource_key = %resource_key,
                loaded = mappings.len(),
                "Route entries reloaded"
            );
        }
        self.sort_templates().await;
        Ok(())
    }

    async fn put(&self, mapping: &RouteMapping) -> ServiceResult<()> {
        let Ok(method) = normalize_method(&mapping.method) else {
            tracing::warn!(
                method = %mapping.method,
                path = %mapping.path,
                "Skipping route with unsupported method"
            );
            return Ok(());
        };
        let path = normalize_path(&mapping.path);
        let target = RouteTarget::from(mapping);
        let key = route_key(&method, &path);

        self.kv.set(&key, &target.encode(), None).await?;
        self.index
            .entry(target.resource_key.clone())
            .or_default()
            .insert(key);

        let segments: Vec<String> = split_segments(&path).into_iter().map(str::to_string).collect();
        if segments.iter().any(|s| is_param_segment(s)) {
            let mut templates = self.templates.write().await;
            templates.retain(|t| !(t.method == method && t.path == path));
            templates.push(Template {
                method,
                path,
                segments,
                target,
            });
        }
        Ok(())
    }

    // Most literal segments first, then path order.
    async fn sort_templates(&self) {
        self.templates.write().await.sort_by(|a, b| {
            b.literal_count()
                .cmp(&a.literal_count())
                .then_with(|| a.path.cmp(&b.path))
                .then_with(|| a.method.cmp(&b.method))
        });
    }
}

#[cfg(test)]
mod tests {
    use klinik_db::model::resource::ResourceNodeInput;
    use klinik_db::store::memory::MemoryStore;

    use super::*;
    use crate::cache::MemoryKv;

    fn routed(key: &str, action: &str, method: &str, path: &str) -> ResourceNodeInput {
        ResourceNodeInput {
            label: key.to_string(),
            resource_key: key.to_string(),
            action: action.to_string(),
            parent_id: None,
            view: None,
            data: None,
            route_path: Some(path.to_string()),
            route_method: Some(method.to_string()),
        }
        .validate()
        .unwrap()
    }

    async fn setup(inputs: &[ResourceNodeInput]) -> (Arc<MemoryStore>, Arc<MemoryKv>, RouteCache) {
        let store = Arc::new(MemoryStore::new());
        for input in inputs {
            store.create_resource(input, None).await.unwrap();
        }
        let kv = Arc::new(MemoryKv::new());
        let cache = RouteCache::new(kv.clone(), store.clone());
        cache.warm().await.unwrap();
        (store, kv, cache)
    }

    #[test]
    fn values_split_deterministically() {
        let target = RouteTarget {
            resource_key: "kehadiran.approve".into(),
            action: "update".into(),
        };
        assert_eq!(target.encode(), "kehadiran.approve|update");
        assert_eq!(RouteTarget::decode(&target.encode()), Some(target));
        assert_eq!(RouteTarget::decode("no-separator"), None);
        assert_eq!(RouteTarget::decode("|update"), None);
        assert_eq!(RouteTarget::decode("a|b|c"), None);
    }

    #[tokio::test]
    async fn unmapped_route_is_a_miss() {
        let (_, _, cache) = setup(&[routed("kehadiran.list", "read", "GET", "/api/kehadiran")]).await;
        assert_eq!(cache.lookup("GET", "/api/unknown").await.unwrap(), None);
        assert_eq!(cache.lookup("POST", "/api/kehadiran").await.unwrap(), None);
        assert_eq!(cache.lookup("BREW", "/api/kehadiran").await.unwrap(), None);
    }

    #[tokio::test]
    async fn lookup_normalizes_method_and_path() {
        let (_, kv, cache) = setup(&[routed("kehadiran.list", "read", "get", "/api/kehadiran/")]).await;

        assert!(
            kv.exists("route:v1:GET:/api/kehadiran").await.unwrap(),
            "entry stored under the documented key"
        );
        let hit = cache.lookup("get", "//api/kehadiran/").await.unwrap().unwrap();
        assert_eq!(hit.resource_key, "kehadiran.list");
        assert_eq!(hit.action, "read");
    }

    #[tokio::test]
    async fn templates_match_after_exact_miss() {
        let (_, _, cache) = setup(&[
            routed("pasien.detail", "read", "GET", "/api/pasien/{id}"),
            routed("pasien.riwayat", "read", "GET", "/api/pasien/:id/riwayat"),
            routed("pasien.baru", "read", "GET", "/api/pasien/baru"),
        ])
        .await;

        let detail = cache.lookup("GET", "/api/pasien/42").await.unwrap().unwrap();
        assert_eq!(detail.resource_key, "pasien.detail");
        let history = cache.lookup("GET", "/api/pasien/42/riwayat").await.unwrap().unwrap();
        assert_eq!(history.resource_key, "pasien.riwayat");
        let exact = cache.lookup("GET", "/api/pasien/baru").await.unwrap().unwrap();
        assert_eq!(exact.resource_key, "pasien.baru");
        assert_eq!(cache.lookup("DELETE", "/api/pasien/42").await.unwrap(), None);
    }

    #[tokio::test]
    async fn invalidation_reloads_lazily() {
        let (store, kv, cache) = setup(&[
            routed("ruang.list", "read", "GET", "/api/ruang"),
            routed("ruang.list", "read", "GET", "/api/ruangan"),
            routed("kontrak.list", "read", "GET", "/api/kontrak"),
        ])
        .await;

        cache.invalidate_resource_key("ruang.list").await.unwrap();
        assert!(!kv.exists("route:v1:GET:/api/ruang").await.unwrap());
        assert!(!kv.exists("route:v1:GET:/api/ruangan").await.unwrap());
        assert!(kv.exists("route:v1:GET:/api/kontrak").await.unwrap());
        assert_eq!(cache.stale_keys(), vec!["ruang.list".to_string()]);

        // A route added for the key while it was stale shows up on reload.
        store
            .create_resource(&routed("ruang.list", "read", "GET", "/api/ruang/aktif"), None)
            .await
            .unwrap();

        let hit = cache.lookup("GET", "/api/ruang").await.unwrap().unwrap();
        assert_eq!(hit.resource_key, "ruang.list");
        assert!(cache.stale_keys().is_empty());
        assert!(cache.lookup("GET", "/api/ruang/aktif").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rewarm_drops_entries_of_deleted_nodes() {
        let (store, _, cache) = setup(&[routed("kontrak.list", "read", "GET", "/api/kontrak")]).await;
        let node = store.list_resources().await.unwrap().remove(0);
        store.soft_delete_resource(node.id, None).await.unwrap();

        assert!(cache.lookup("GET", "/api/kontrak").await.unwrap().is_some());
        assert_eq!(cache.rewarm().await.unwrap(), 0);
        assert_eq!(cache.lookup("GET", "/api/kontrak").await.unwrap(), None);
    }
}
