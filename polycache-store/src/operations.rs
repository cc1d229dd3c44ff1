//! Operations (§4.6): the read-through / write-through protocol that
//! coordinates the item/query layers, the TTL manager, the event bus and
//! the stats manager against an externally supplied API capability.

use crate::backend::CacheBackend;
use crate::coordinator::TwoLayerCoordinator;
use crate::stats::StatsManager;
use crate::ttl::TtlManager;
use async_trait::async_trait;
use chrono::Utc;
use polycache_core::{
    normalize, ApiError, CacheableItem, EntityKey, ItemEntry, LocTag, PolycacheResult,
    QueryFingerprintInput, QueryKind,
};
use polycache_events::{CacheEvent, EventBus, EventSource, EventType};
use std::sync::Arc;

/// The remote item API Operations reads through and writes through (§6
/// "API capability"). Consumed, never implemented, by this crate outside of
/// tests — production code plugs in its own client.
#[async_trait]
pub trait ApiCapability<T: CacheableItem>: Send + Sync {
    async fn get(&self, key: &EntityKey) -> PolycacheResult<Option<T>>;
    async fn retrieve(&self, key: &EntityKey) -> PolycacheResult<T>;
    async fn one(&self, query: Option<serde_json::Value>, loc: &[LocTag]) -> PolycacheResult<Option<T>>;
    async fn all(&self, query: Option<serde_json::Value>, loc: &[LocTag]) -> PolycacheResult<Vec<T>>;
    async fn find(&self, finder: &str, params: Option<serde_json::Value>, loc: &[LocTag]) -> PolycacheResult<Vec<T>>;
    async fn find_one(&self, finder: &str, params: Option<serde_json::Value>, loc: &[LocTag]) -> PolycacheResult<Option<T>>;
    async fn create(&self, partial: serde_json::Value, loc: &[LocTag]) -> PolycacheResult<T>;
    async fn update(&self, key: &EntityKey, partial: serde_json::Value) -> PolycacheResult<T>;
    async fn remove(&self, key: &EntityKey) -> PolycacheResult<()>;
    async fn set(&self, key: &EntityKey, item: T) -> PolycacheResult<T>;
    async fn action(&self, key: &EntityKey, name: &str, body: Option<serde_json::Value>) -> PolycacheResult<T>;
    async fn all_action(&self, name: &str, body: Option<serde_json::Value>, loc: &[LocTag]) -> PolycacheResult<Vec<T>>;
    async fn facet(&self, key: &EntityKey, name: &str, params: Option<serde_json::Value>) -> PolycacheResult<serde_json::Value>;
    async fn all_facet(&self, name: &str, params: Option<serde_json::Value>, loc: &[LocTag]) -> PolycacheResult<serde_json::Value>;
}

/// Wires a [`TwoLayerCoordinator`] to an [`ApiCapability`], a [`TtlManager`],
/// an [`EventBus`] and a [`StatsManager`] and exposes the §4.6 operation
/// set. Generic over the backend so any [`CacheBackend`] impl in this crate
/// can sit underneath.
pub struct Operations<T, B, A> {
    coordinator: TwoLayerCoordinator<T, B>,
    api: Arc<A>,
    ttl: Arc<TtlManager>,
    bus: EventBus<T>,
    stats: Arc<StatsManager>,
    bypass_cache: bool,
    debug_logging: bool,
}

impl<T, B, A> Operations<T, B, A>
where
    T: CacheableItem,
    B: CacheBackend<T>,
    A: ApiCapability<T>,
{
    pub fn new(
        coordinator: TwoLayerCoordinator<T, B>,
        api: Arc<A>,
        ttl: Arc<TtlManager>,
        bus: EventBus<T>,
        stats: Arc<StatsManager>,
        bypass_cache: bool,
    ) -> Self {
        Self { coordinator, api, ttl, bus, stats, bypass_cache, debug_logging: false }
    }

    /// Enable per-operation `tracing::debug!` output (the `enableDebugLogging`
    /// option, §6): every read-through and write-through logs its key, not
    /// just failures. Off by default since it is far noisier than the
    /// always-on failure logging.
    pub fn with_debug_logging(mut self, enabled: bool) -> Self {
        self.debug_logging = enabled;
        self
    }

    pub fn stats(&self) -> &StatsManager {
        &self.stats
    }

    pub fn bus(&self) -> &EventBus<T> {
        &self.bus
    }

    fn emit_hit(&self, key: &EntityKey, item: &T) {
        let event = CacheEvent::new(EventType::CacheHit, Utc::now(), EventSource::Cache)
            .with_key(key.clone())
            .with_item(item.clone());
        let _ = self.bus.emit(event);
    }

    fn emit_miss(&self, key: &EntityKey) {
        let event = CacheEvent::new(EventType::CacheMiss, Utc::now(), EventSource::Cache).with_key(key.clone());
        let _ = self.bus.emit(event);
    }

    fn emit_mutation(&self, event_type: EventType, key: &EntityKey, item: Option<&T>, previous: Option<&T>) {
        let mut event = CacheEvent::new(event_type, Utc::now(), EventSource::Api).with_key(key.clone());
        if let Some(item) = item {
            event = event.with_item(item.clone());
        }
        if let Some(previous) = previous {
            event = event.with_previous(previous.clone());
        }
        let _ = self.bus.emit(event);
    }

    fn emit_location_invalidated(&self, loc: &[LocTag]) {
        let event = CacheEvent::new(EventType::LocationInvalidated, Utc::now(), EventSource::Api)
            .with_affected_locations(vec![loc.to_vec()]);
        let _ = self.bus.emit(event);
    }

    /// Log and pass through an API-layer failure. Every suspension point
    /// that crosses into the externally supplied capability reports through
    /// here so failures are traceable without the cache itself retrying.
    fn log_api_err(op: &'static str, err: polycache_core::PolycacheError) -> polycache_core::PolycacheError {
        tracing::warn!(op, error = %err, "api call failed");
        err
    }

    /// §4.6 read protocol, single-key form. Used by `get`/`retrieve`/`one`/`find_one`.
    async fn read_through_one(&self, key: &EntityKey, fetch: impl std::future::Future<Output = PolycacheResult<Option<T>>>) -> PolycacheResult<Option<T>> {
        self.stats.record_request();
        self.stats.record_request_in(key.loc());
        if self.bypass_cache {
            return fetch.await;
        }
        if let Some(entry) = self.coordinator.get(key).await? {
            let hash = normalize(key);
            if !self.ttl.is_expired(&hash, Some(entry.timestamp), Utc::now()) {
                self.stats.record_hit();
                self.stats.record_hit_in(key.loc());
                self.emit_hit(key, &entry.value);
                if self.debug_logging {
                    tracing::debug!(key = %hash, "cache hit");
                }
                return Ok(Some(entry.value));
            }
            let _ = self.coordinator.delete(key).await;
        }
        self.stats.record_miss();
        self.stats.record_miss_in(key.loc());
        self.emit_miss(key);
        if self.debug_logging {
            tracing::debug!(key = %normalize(key), "cache miss, reading through to api");
        }
        match fetch.await.map_err(|e| Self::log_api_err("read", e))? {
            Some(item) => {
                self.coordinator.set(key, ItemEntry::new(item.clone(), 1, Utc::now())).await?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    pub async fn get(&self, key: &EntityKey) -> PolycacheResult<Option<T>> {
        self.read_through_one(key, self.api.get(key)).await
    }

    pub async fn retrieve(&self, key: &EntityKey) -> PolycacheResult<T> {
        match self.get(key).await? {
            Some(item) => Ok(item),
            None => {
                // `retrieve` is the non-optional sibling of `get`: fall through to
                // the API's own mandatory-presence call rather than inventing a
                // NotFound kind the taxonomy (§7) doesn't name.
                let item = self.api.retrieve(key).await.map_err(|e| Self::log_api_err("retrieve", e))?;
                self.coordinator.set(key, ItemEntry::new(item.clone(), 1, Utc::now())).await?;
                Ok(item)
            }
        }
    }

    /// Listing read-through, shared by `one`/`all`/`find`/`find_one`/`facet`/`all_facet`.
    async fn read_through_list(
        &self,
        hash: &str,
        input: QueryFingerprintInput,
        loc: &[LocTag],
        fetch: impl std::future::Future<Output = PolycacheResult<Vec<T>>>,
    ) -> PolycacheResult<Vec<T>> {
        self.stats.record_request();
        self.stats.record_request_in(loc);
        if self.bypass_cache {
            return fetch.await;
        }
        let now = Utc::now();
        if let Some(keys) = self.coordinator.get_query_result(hash, now).await? {
            let mut items = Vec::with_capacity(keys.len());
            let mut all_present = true;
            for key in &keys {
                match self.coordinator.get(key).await? {
                    Some(entry) => items.push(entry.value),
                    None => {
                        all_present = false;
                        break;
                    }
                }
            }
            if all_present {
                self.stats.record_hit();
                self.stats.record_hit_in(loc);
                let event = CacheEvent::new(EventType::ItemsQueried, now, EventSource::Cache)
                    .with_affected_locations(vec![loc.to_vec()]);
                let _ = self.bus.emit(event);
                if self.debug_logging {
                    tracing::debug!(query_hash = %hash, "cache hit on query result");
                }
                return Ok(items);
            }
        }
        self.stats.record_miss();
        self.stats.record_miss_in(loc);
        if self.debug_logging {
            tracing::debug!(query_hash = %hash, "query cache miss, reading through to api");
        }
        let items = fetch.await.map_err(|e| Self::log_api_err("list", e))?;
        let mut keys = Vec::with_capacity(items.len());
        for item in &items {
            let key = item.key().clone();
            self.coordinator.set(&key, ItemEntry::new(item.clone(), 1, Utc::now())).await?;
            keys.push(key);
        }
        self.coordinator.set_query_result(hash, keys, &input, Utc::now()).await?;
        let event = CacheEvent::new(EventType::ItemsQueried, Utc::now(), EventSource::Cache)
            .with_affected_locations(vec![loc.to_vec()]);
        let _ = self.bus.emit(event);
        Ok(items)
    }

    pub async fn one(&self, query: Option<serde_json::Value>, loc: &[LocTag]) -> PolycacheResult<Option<T>> {
        let input = QueryFingerprintInput::new(QueryKind::One)
            .with_params(query.clone().unwrap_or(serde_json::Value::Null))
            .with_loc(loc.to_vec());
        let hash = polycache_core::fingerprint(&input);
        let results = self
            .read_through_list(&hash, input, loc, async { Ok(self.api.one(query, loc).await?.into_iter().collect()) })
            .await?;
        Ok(results.into_iter().next())
    }

    pub async fn all(&self, query: Option<serde_json::Value>, loc: &[LocTag]) -> PolycacheResult<Vec<T>> {
        let input = QueryFingerprintInput::new(QueryKind::All)
            .with_params(query.clone().unwrap_or(serde_json::Value::Null))
            .with_loc(loc.to_vec());
        let hash = polycache_core::fingerprint(&input);
        self.read_through_list(&hash, input, loc, self.api.all(query, loc)).await
    }

    pub async fn find(&self, finder: &str, params: Option<serde_json::Value>, loc: &[LocTag]) -> PolycacheResult<Vec<T>> {
        let input = QueryFingerprintInput::new(QueryKind::Find)
            .with_finder(finder)
            .with_params(params.clone().unwrap_or(serde_json::Value::Null))
            .with_loc(loc.to_vec());
        let hash = polycache_core::fingerprint(&input);
        self.read_through_list(&hash, input, loc, self.api.find(finder, params, loc)).await
    }

    pub async fn find_one(&self, finder: &str, params: Option<serde_json::Value>, loc: &[LocTag]) -> PolycacheResult<Option<T>> {
        let input = QueryFingerprintInput::new(QueryKind::FindOne)
            .with_finder(finder)
            .with_params(params.clone().unwrap_or(serde_json::Value::Null))
            .with_loc(loc.to_vec());
        let hash = polycache_core::fingerprint(&input);
        let results = self
            .read_through_list(&hash, input, loc, async {
                Ok(self.api.find_one(finder, params, loc).await?.into_iter().collect())
            })
            .await?;
        Ok(results.into_iter().next())
    }

    /// Write protocol shared by `create`/`update`/`set`/`action`: call the
    /// API first; on success, write through the item layer (which
    /// invalidates referencing queries) and emit `event_type` with
    /// `source='api'`; on failure, the cache is untouched.
    async fn write_through(&self, event_type: EventType, key: EntityKey, item: T, previous: Option<T>) -> PolycacheResult<T> {
        self.coordinator.set(&key, ItemEntry::new(item.clone(), 1, Utc::now())).await?;
        self.emit_mutation(event_type, &key, Some(&item), previous.as_ref());
        Ok(item)
    }

    pub async fn create(&self, partial: serde_json::Value, loc: &[LocTag]) -> PolycacheResult<T> {
        let item = self.api.create(partial, loc).await.map_err(|e| Self::log_api_err("create", e))?;
        let key = item.key().clone();
        self.write_through(EventType::ItemCreated, key, item, None).await
    }

    pub async fn update(&self, key: &EntityKey, partial: serde_json::Value) -> PolycacheResult<T> {
        let previous = self.coordinator.get(key).await?.map(|e| e.value);
        let item = self.api.update(key, partial).await.map_err(|e| Self::log_api_err("update", e))?;
        self.write_through(EventType::ItemUpdated, key.clone(), item, previous).await
    }

    pub async fn set(&self, key: &EntityKey, item: T) -> PolycacheResult<T> {
        let previous = self.coordinator.get(key).await?.map(|e| e.value);
        let item = self.api.set(key, item).await.map_err(|e| Self::log_api_err("set", e))?;
        self.write_through(EventType::ItemUpdated, key.clone(), item, previous).await
    }

    pub async fn remove(&self, key: &EntityKey) -> PolycacheResult<()> {
        let previous = self.coordinator.get(key).await?.map(|e| e.value);
        self.api.remove(key).await.map_err(|e| Self::log_api_err("remove", e))?;
        self.coordinator.delete(key).await?;
        self.emit_mutation(EventType::ItemRemoved, key, None, previous.as_ref());
        Ok(())
    }

    pub async fn action(&self, key: &EntityKey, name: &str, body: Option<serde_json::Value>) -> PolycacheResult<T> {
        let previous = self.coordinator.get(key).await?.map(|e| e.value);
        let item = self.api.action(key, name, body).await.map_err(|e| Self::log_api_err("action", e))?;
        self.write_through(EventType::ItemUpdated, key.clone(), item, previous).await
    }

    /// `allAction`/`facet`/`allFacet`'s siblings may touch many entities at
    /// once; rather than trying to enumerate which keys changed, §4.6 has
    /// them invalidate the whole location they operated on.
    pub async fn all_action(&self, name: &str, body: Option<serde_json::Value>, loc: &[LocTag]) -> PolycacheResult<Vec<T>> {
        let items = self.api.all_action(name, body, loc).await.map_err(|e| Self::log_api_err("all_action", e))?;
        self.coordinator.invalidate_location(loc).await?;
        self.emit_location_invalidated(loc);
        Ok(items)
    }

    pub async fn facet(&self, key: &EntityKey, name: &str, params: Option<serde_json::Value>) -> PolycacheResult<serde_json::Value> {
        let result = self.api.facet(key, name, params).await.map_err(|e| Self::log_api_err("facet", e))?;
        self.coordinator.invalidate_item_keys(std::slice::from_ref(key)).await?;
        Ok(result)
    }

    pub async fn all_facet(&self, name: &str, params: Option<serde_json::Value>, loc: &[LocTag]) -> PolycacheResult<serde_json::Value> {
        let result = self.api.all_facet(name, params, loc).await.map_err(|e| Self::log_api_err("all_facet", e))?;
        self.coordinator.invalidate_location(loc).await?;
        self.emit_location_invalidated(loc);
        Ok(result)
    }

    /// Clears both cache layers and zeroes the stats counters. Not an API
    /// call; purely local bookkeeping reset.
    pub async fn reset(&self) -> PolycacheResult<()> {
        self.coordinator.backend().clear().await?;
        self.coordinator.clear_query_results().await?;
        self.stats.reset();
        let event = CacheEvent::new(EventType::CacheCleared, Utc::now(), EventSource::Cache);
        let _ = self.bus.emit(event);
        Ok(())
    }
}

/// Surfaces an `ApiError` for capability implementations that hit a network
/// or server failure they can't otherwise express through `PolycacheError`.
pub fn api_failure(message: impl Into<String>, retryable: bool) -> polycache_core::PolycacheError {
    ApiError::new(message, retryable).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::InMemoryBackend;
    use polycache_core::EntityKey;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;

    #[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
    struct Widget {
        key: EntityKey,
        n: i32,
    }

    impl CacheableItem for Widget {
        fn key(&self) -> &EntityKey {
            &self.key
        }
    }

    struct StubApi {
        items: Mutex<std::collections::HashMap<String, Widget>>,
        get_calls: std::sync::atomic::AtomicU64,
    }

    impl StubApi {
        fn new(items: Vec<Widget>) -> Self {
            let mut map = std::collections::HashMap::new();
            for item in items {
                map.insert(normalize(&item.key), item);
            }
            Self { items: Mutex::new(map), get_calls: std::sync::atomic::AtomicU64::new(0) }
        }
    }

    #[async_trait]
    impl ApiCapability<Widget> for StubApi {
        async fn get(&self, key: &EntityKey) -> PolycacheResult<Option<Widget>> {
            self.get_calls.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Ok(self.items.lock().unwrap().get(&normalize(key)).cloned())
        }
        async fn retrieve(&self, key: &EntityKey) -> PolycacheResult<Widget> {
            self.get(key).await?.ok_or_else(|| api_failure("not found", false))
        }
        async fn one(&self, _query: Option<serde_json::Value>, _loc: &[LocTag]) -> PolycacheResult<Option<Widget>> {
            Ok(self.items.lock().unwrap().values().next().cloned())
        }
        async fn all(&self, _query: Option<serde_json::Value>, _loc: &[LocTag]) -> PolycacheResult<Vec<Widget>> {
            Ok(self.items.lock().unwrap().values().cloned().collect())
        }
        async fn find(&self, _finder: &str, _params: Option<serde_json::Value>, _loc: &[LocTag]) -> PolycacheResult<Vec<Widget>> {
            Ok(self.items.lock().unwrap().values().cloned().collect())
        }
        async fn find_one(&self, _finder: &str, _params: Option<serde_json::Value>, _loc: &[LocTag]) -> PolycacheResult<Option<Widget>> {
            Ok(self.items.lock().unwrap().values().next().cloned())
        }
        async fn create(&self, _partial: serde_json::Value, _loc: &[LocTag]) -> PolycacheResult<Widget> {
            let item = Widget { key: EntityKey::primary("widget", "new"), n: 0 };
            self.items.lock().unwrap().insert(normalize(&item.key), item.clone());
            Ok(item)
        }
        async fn update(&self, key: &EntityKey, _partial: serde_json::Value) -> PolycacheResult<Widget> {
            let mut items = self.items.lock().unwrap();
            let item = items.get_mut(&normalize(key)).expect("item exists");
            item.n += 1;
            Ok(item.clone())
        }
        async fn remove(&self, key: &EntityKey) -> PolycacheResult<()> {
            self.items.lock().unwrap().remove(&normalize(key));
            Ok(())
        }
        async fn set(&self, key: &EntityKey, item: Widget) -> PolycacheResult<Widget> {
            self.items.lock().unwrap().insert(normalize(key), item.clone());
            Ok(item)
        }
        async fn action(&self, key: &EntityKey, _name: &str, _body: Option<serde_json::Value>) -> PolycacheResult<Widget> {
            self.update(key, serde_json::Value::Null).await
        }
        async fn all_action(&self, _name: &str, _body: Option<serde_json::Value>, _loc: &[LocTag]) -> PolycacheResult<Vec<Widget>> {
            Ok(self.items.lock().unwrap().values().cloned().collect())
        }
        async fn facet(&self, _key: &EntityKey, _name: &str, _params: Option<serde_json::Value>) -> PolycacheResult<serde_json::Value> {
            Ok(serde_json::json!({}))
        }
        async fn all_facet(&self, _name: &str, _params: Option<serde_json::Value>, _loc: &[LocTag]) -> PolycacheResult<serde_json::Value> {
            Ok(serde_json::json!({}))
        }
    }

    fn operations(items: Vec<Widget>) -> Operations<Widget, InMemoryBackend<Widget>, StubApi> {
        let coordinator = TwoLayerCoordinator::new(InMemoryBackend::new(), 5 * 60 * 1000, 60 * 1000);
        Operations::new(
            coordinator,
            Arc::new(StubApi::new(items)),
            Arc::new(TtlManager::new(10 * 60 * 1000)),
            EventBus::new(),
            Arc::new(StatsManager::new()),
            false,
        )
    }

    #[tokio::test]
    async fn scenario_s1_read_through_then_hit() {
        let key = EntityKey::primary("w", "1");
        let ops = operations(vec![Widget { key: key.clone(), n: 1 }]);
        let first = ops.get(&key).await.unwrap();
        assert_eq!(first.unwrap().n, 1);
        let snapshot = ops.stats().snapshot();
        assert_eq!(snapshot.num_requests, 1);
        assert_eq!(snapshot.num_misses, 1);

        let second = ops.get(&key).await.unwrap();
        assert_eq!(second.unwrap().n, 1);
        let snapshot = ops.stats().snapshot();
        assert_eq!(snapshot.num_requests, 2);
        assert_eq!(snapshot.num_hits, 1);
        assert_eq!(snapshot.num_misses, 1);
    }

    #[tokio::test]
    async fn scenario_s3_update_invalidates_the_prior_listing() {
        let key = EntityKey::primary("w", "1");
        let ops = operations(vec![Widget { key: key.clone(), n: 1 }]);
        let first = ops.all(None, &[]).await.unwrap();
        assert_eq!(first.len(), 1);

        ops.update(&key, serde_json::Value::Null).await.unwrap();

        let hash = polycache_core::fingerprint(&QueryFingerprintInput::new(QueryKind::All));
        assert!(ops.coordinator.get_query_result(&hash, Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn scenario_s5_bypass_cache_never_writes_back() {
        let key = EntityKey::primary("w", "1");
        let coordinator = TwoLayerCoordinator::new(InMemoryBackend::new(), 1000, 1000);
        let ops = Operations::new(
            coordinator,
            Arc::new(StubApi::new(vec![Widget { key: key.clone(), n: 1 }])),
            Arc::new(TtlManager::new(10 * 60 * 1000)),
            EventBus::new(),
            Arc::new(StatsManager::new()),
            true,
        );
        let got = ops.get(&key).await.unwrap();
        assert_eq!(got.unwrap().n, 1);
        assert!(ops.coordinator.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_deletes_the_item_and_emits_item_removed() {
        let key = EntityKey::primary("w", "1");
        let ops = operations(vec![Widget { key: key.clone(), n: 1 }]);
        ops.get(&key).await.unwrap();
        let (_, mut receiver) = ops
            .bus()
            .subscribe(polycache_events::SubscriptionOptions::default().with_event_types(vec![EventType::ItemRemoved]))
            .unwrap();
        ops.remove(&key).await.unwrap();
        let event = receiver.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::ItemRemoved);
        assert!(ops.coordinator.get(&key).await.unwrap().is_none());
    }
}
