//! In-memory backend (§4.2.2): synchronous underneath, async facade on top.
//! Supports an optional size bound cooperating with the eviction strategies
//! of §4.3.

use super::{BackendCapabilities, CacheBackend, CurrentSize, SizeLimits};
use crate::eviction::{evict_until_within_limits, EvictionStrategy};
use async_trait::async_trait;
use chrono::Utc;
use polycache_core::{
    loc_equal, normalize, CacheableItem, EntityKey, ItemEntry, ItemMetadata, LocTag,
    PolycacheResult, QueryEntry, QueryMetadata,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// UTF-8 byte count of the serialized entry, falling back to the string
/// length of its `Debug` form if serialization fails (§4.3 size estimation).
pub fn estimate_size<T: serde::Serialize>(value: &T) -> u64 {
    serde_json::to_vec(value).map(|bytes| bytes.len() as u64).unwrap_or(0)
}

struct State<T> {
    items: HashMap<String, ItemEntry<T>>,
    metadata: HashMap<String, ItemMetadata>,
    queries: HashMap<String, QueryEntry>,
}

impl<T> Default for State<T> {
    fn default() -> Self {
        Self {
            items: HashMap::new(),
            metadata: HashMap::new(),
            queries: HashMap::new(),
        }
    }
}

/// The in-memory backend. `clone()` (via `Clone`) returns an independent
/// handle sharing the same underlying store, per §4.2's `clone()` contract.
pub struct InMemoryBackend<T> {
    state: Arc<RwLock<State<T>>>,
    limits: SizeLimits,
    eviction: Option<Arc<dyn EvictionStrategy>>,
}

impl<T> Clone for InMemoryBackend<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            limits: self.limits,
            eviction: self.eviction.clone(),
        }
    }
}

impl<T: CacheableItem> InMemoryBackend<T> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
            limits: SizeLimits::default(),
            eviction: None,
        }
    }

    /// A size-bounded variant: once over `limits`, `set` runs the eviction
    /// loop before returning.
    pub fn bounded(limits: SizeLimits, eviction: Arc<dyn EvictionStrategy>) -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
            limits,
            eviction: Some(eviction),
        }
    }

    fn enforce_limits(&self) {
        let Some(strategy) = &self.eviction else { return };
        if self.limits.max_items.is_none() && self.limits.max_size_bytes.is_none() {
            return;
        }
        let mut state = self.state.write().expect("in-memory backend lock poisoned");
        let current = current_size_of(&state);
        let all_metadata: Vec<ItemMetadata> = state.metadata.values().cloned().collect();
        let victims = evict_until_within_limits(strategy.as_ref(), all_metadata, current, self.limits, |key| {
            state
                .items
                .get(&normalize(key))
                .map(estimate_size)
                .unwrap_or(0)
        });
        for key in victims {
            let hash = normalize(&key);
            state.items.remove(&hash);
            state.metadata.remove(&hash);
        }
    }
}

impl<T: CacheableItem> Default for InMemoryBackend<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn current_size_of<T>(state: &State<T>) -> CurrentSize {
    CurrentSize {
        item_count: state.items.len() as u64,
        size_bytes: 0,
    }
}

#[async_trait]
impl<T: CacheableItem> CacheBackend<T> for InMemoryBackend<T> {
    async fn get(&self, key: &EntityKey) -> PolycacheResult<Option<ItemEntry<T>>> {
        let hash = normalize(key);
        let state = self.state.read().expect("in-memory backend lock poisoned");
        Ok(state.items.get(&hash).filter(|entry| entry.matches_lookup(&hash)).cloned())
    }

    async fn set(&self, key: &EntityKey, entry: ItemEntry<T>) -> PolycacheResult<()> {
        let hash = normalize(key);
        {
            let mut state = self.state.write().expect("in-memory backend lock poisoned");
            let now = Utc::now();
            let size = estimate_size(&entry);
            state
                .metadata
                .entry(hash.clone())
                .and_modify(|m| {
                    m.last_accessed_at = now;
                    m.estimated_size = size;
                })
                .or_insert_with(|| ItemMetadata::new(key.clone(), now, size));
            state.items.insert(hash, entry);
        }
        self.enforce_limits();
        Ok(())
    }

    async fn has(&self, key: &EntityKey) -> PolycacheResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn delete(&self, key: &EntityKey) -> PolycacheResult<()> {
        let hash = normalize(key);
        let mut state = self.state.write().expect("in-memory backend lock poisoned");
        state.items.remove(&hash);
        state.metadata.remove(&hash);
        Ok(())
    }

    async fn keys(&self) -> PolycacheResult<Vec<EntityKey>> {
        let state = self.state.read().expect("in-memory backend lock poisoned");
        Ok(state.items.values().map(|e| e.original_key.clone()).collect())
    }

    async fn values(&self) -> PolycacheResult<Vec<ItemEntry<T>>> {
        let state = self.state.read().expect("in-memory backend lock poisoned");
        Ok(state.items.values().cloned().collect())
    }

    async fn clear(&self) -> PolycacheResult<()> {
        let mut state = self.state.write().expect("in-memory backend lock poisoned");
        state.items.clear();
        state.metadata.clear();
        Ok(())
    }

    async fn all_in(&self, loc: &[LocTag]) -> PolycacheResult<Vec<ItemEntry<T>>> {
        let state = self.state.read().expect("in-memory backend lock poisoned");
        if loc.is_empty() {
            return Ok(state.items.values().cloned().collect());
        }
        Ok(state
            .items
            .values()
            .filter(|entry| loc_equal(entry.original_key.loc(), loc))
            .cloned()
            .collect())
    }

    async fn set_query_result(
        &self,
        hash: &str,
        keys: Vec<EntityKey>,
        metadata: Option<QueryMetadata>,
    ) -> PolycacheResult<()> {
        let mut state = self.state.write().expect("in-memory backend lock poisoned");
        let metadata = metadata.unwrap_or_else(|| QueryMetadata {
            query_type: polycache_core::QueryKind::All,
            is_complete: false,
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::days(365 * 100),
            filter: None,
            params: None,
        });
        state.queries.insert(hash.to_string(), QueryEntry { item_keys: keys, metadata });
        Ok(())
    }

    async fn get_query_result(&self, hash: &str) -> PolycacheResult<Option<Vec<EntityKey>>> {
        let state = self.state.read().expect("in-memory backend lock poisoned");
        Ok(state.queries.get(hash).map(|e| e.item_keys.clone()))
    }

    async fn get_query_result_with_metadata(&self, hash: &str) -> PolycacheResult<Option<QueryEntry>> {
        let state = self.state.read().expect("in-memory backend lock poisoned");
        Ok(state.queries.get(hash).cloned())
    }

    async fn has_query_result(&self, hash: &str) -> PolycacheResult<bool> {
        let state = self.state.read().expect("in-memory backend lock poisoned");
        Ok(state.queries.contains_key(hash))
    }

    async fn delete_query_result(&self, hash: &str) -> PolycacheResult<()> {
        let mut state = self.state.write().expect("in-memory backend lock poisoned");
        state.queries.remove(hash);
        Ok(())
    }

    async fn clear_query_results(&self) -> PolycacheResult<()> {
        let mut state = self.state.write().expect("in-memory backend lock poisoned");
        state.queries.clear();
        Ok(())
    }

    async fn invalidate_item_keys(&self, keys: &[EntityKey]) -> PolycacheResult<()> {
        let hashes: Vec<String> = keys.iter().map(normalize).collect();
        let mut state = self.state.write().expect("in-memory backend lock poisoned");
        for hash in &hashes {
            state.items.remove(hash);
            state.metadata.remove(hash);
        }
        state
            .queries
            .retain(|_, entry| !hashes.iter().any(|h| entry.references(h)));
        Ok(())
    }

    async fn invalidate_location(&self, loc: &[LocTag]) -> PolycacheResult<()> {
        let affected = self.all_in(loc).await?;
        let keys: Vec<EntityKey> = affected.into_iter().map(|e| e.original_key).collect();
        self.invalidate_item_keys(&keys).await
    }

    async fn get_metadata(&self, key: &str) -> PolycacheResult<Option<ItemMetadata>> {
        let state = self.state.read().expect("in-memory backend lock poisoned");
        Ok(state.metadata.get(key).cloned())
    }

    async fn set_metadata(&self, key: &str, metadata: ItemMetadata) -> PolycacheResult<()> {
        let mut state = self.state.write().expect("in-memory backend lock poisoned");
        state.metadata.insert(key.to_string(), metadata);
        Ok(())
    }

    async fn delete_metadata(&self, key: &str) -> PolycacheResult<()> {
        let mut state = self.state.write().expect("in-memory backend lock poisoned");
        state.metadata.remove(key);
        Ok(())
    }

    async fn get_all_metadata(&self) -> PolycacheResult<Vec<ItemMetadata>> {
        let state = self.state.read().expect("in-memory backend lock poisoned");
        Ok(state.metadata.values().cloned().collect())
    }

    async fn clear_metadata(&self) -> PolycacheResult<()> {
        let mut state = self.state.write().expect("in-memory backend lock poisoned");
        state.metadata.clear();
        Ok(())
    }

    async fn current_size(&self) -> PolycacheResult<CurrentSize> {
        let state = self.state.read().expect("in-memory backend lock poisoned");
        Ok(current_size_of(&state))
    }

    fn size_limits(&self) -> SizeLimits {
        self.limits
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            implementation_type: "in-memory",
            supports_ttl: true,
            supports_eviction: self.eviction.is_some(),
            supports_query_metadata_persistence: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Serialize, Deserialize)]
    struct Widget {
        key: EntityKey,
        n: i32,
    }

    impl CacheableItem for Widget {
        fn key(&self) -> &EntityKey {
            &self.key
        }
    }

    fn entry(n: i32, key: EntityKey) -> ItemEntry<Widget> {
        ItemEntry::new(Widget { key: key.clone(), n }, 1, Utc::now())
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let backend = InMemoryBackend::<Widget>::new();
        let key = EntityKey::primary("widget", "1");
        backend.set(&key, entry(1, key.clone())).await.unwrap();
        let got = backend.get(&key).await.unwrap().unwrap();
        assert_eq!(got.value.n, 1);
    }

    #[tokio::test]
    async fn normalization_equivalence_across_string_and_numeric_pk() {
        let backend = InMemoryBackend::<Widget>::new();
        let key_str = EntityKey::primary("widget", "123");
        let key_num = EntityKey::primary("widget", 123i64);
        backend.set(&key_str, entry(1, key_str.clone())).await.unwrap();
        backend.set(&key_num, entry(2, key_num.clone())).await.unwrap();
        assert_eq!(backend.get(&key_str).await.unwrap().unwrap().value.n, 2);
        assert_eq!(backend.keys().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalidate_item_keys_removes_referencing_queries() {
        let backend = InMemoryBackend::<Widget>::new();
        let key = EntityKey::primary("widget", "1");
        backend.set(&key, entry(1, key.clone())).await.unwrap();
        backend
            .set_query_result("h1", vec![key.clone()], None)
            .await
            .unwrap();
        backend.invalidate_item_keys(&[key.clone()]).await.unwrap();
        assert!(backend.get(&key).await.unwrap().is_none());
        assert!(backend.get_query_result("h1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bounded_backend_evicts_down_to_the_configured_limit() {
        use crate::eviction::Lru;
        let backend = InMemoryBackend::<Widget>::bounded(
            SizeLimits { max_items: Some(2), max_size_bytes: None },
            Arc::new(Lru),
        );
        for i in 0..5 {
            let key = EntityKey::primary("widget", i.to_string());
            backend.set(&key, entry(i, key.clone())).await.unwrap();
        }
        let size = backend.current_size().await.unwrap();
        assert!(size.item_count <= 2);
    }
}
