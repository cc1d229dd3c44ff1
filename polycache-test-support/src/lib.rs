//! Test support for the polycache workspace: an in-memory [`ApiCapability`]
//! double and a [`ManualClock`] for deterministic TTL and ordering tests.
//!
//! Kept in its own crate (rather than behind `#[cfg(test)]` in
//! `polycache-store`) so integration tests in other workspace members can
//! depend on it without pulling in `polycache-store`'s own test module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use polycache_core::{normalize, CacheableItem, EntityKey, Identifier, LocTag, PolycacheResult};
use polycache_store::{api_failure, ApiCapability};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A clock that only advances when told to, so tests can assert exact TTL
/// boundaries instead of racing `Utc::now()`.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Arc::new(Mutex::new(start)) }
    }

    pub fn at_epoch() -> Self {
        Self::new(DateTime::from_timestamp(0, 0).expect("epoch is a valid timestamp"))
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("manual clock lock poisoned")
    }

    pub fn advance(&self, duration: chrono::Duration) -> DateTime<Utc> {
        let mut now = self.now.lock().expect("manual clock lock poisoned");
        *now += duration;
        *now
    }

    pub fn advance_ms(&self, millis: i64) -> DateTime<Utc> {
        self.advance(chrono::Duration::milliseconds(millis))
    }
}

/// Counts how many times each [`ApiCapability`] method was invoked, so a
/// test can assert the cache actually avoided a redundant call rather than
/// just asserting on the returned value.
#[derive(Debug, Default)]
pub struct CallCounts {
    pub get: AtomicU64,
    pub retrieve: AtomicU64,
    pub one: AtomicU64,
    pub all: AtomicU64,
    pub find: AtomicU64,
    pub find_one: AtomicU64,
    pub create: AtomicU64,
    pub update: AtomicU64,
    pub remove: AtomicU64,
    pub set: AtomicU64,
    pub action: AtomicU64,
    pub all_action: AtomicU64,
    pub facet: AtomicU64,
    pub all_facet: AtomicU64,
}

impl CallCounts {
    fn bump(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// An in-memory stand-in for the remote item API, keyed by
/// [`normalize`]d [`EntityKey`]. `create` assigns sequential numeric
/// primary keys under the given `kt`; every other mutating method requires
/// the key to already exist and returns a not-found [`ApiError`] (via
/// [`api_failure`]) otherwise.
pub struct InMemoryApi<T> {
    items: Mutex<HashMap<String, T>>,
    next_id: AtomicU64,
    create_kt: String,
    pub calls: CallCounts,
}

impl<T: Clone> InMemoryApi<T> {
    pub fn new(create_kt: impl Into<String>) -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            create_kt: create_kt.into(),
            calls: CallCounts::default(),
        }
    }

    pub fn with_items(create_kt: impl Into<String>, items: Vec<T>) -> Self
    where
        T: CacheableItem,
    {
        let api = Self::new(create_kt);
        {
            let mut map = api.items.lock().expect("in-memory api lock poisoned");
            for item in items {
                map.insert(normalize(item.key()), item);
            }
        }
        api
    }

    pub fn seed(&self, item: T)
    where
        T: CacheableItem,
    {
        self.items.lock().expect("in-memory api lock poisoned").insert(normalize(item.key()), item);
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.items.lock().expect("in-memory api lock poisoned").contains_key(&normalize(key))
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("in-memory api lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl<T> ApiCapability<T> for InMemoryApi<T>
where
    T: CacheableItem,
{
    async fn get(&self, key: &EntityKey) -> PolycacheResult<Option<T>> {
        CallCounts::bump(&self.calls.get);
        Ok(self.items.lock().expect("in-memory api lock poisoned").get(&normalize(key)).cloned())
    }

    async fn retrieve(&self, key: &EntityKey) -> PolycacheResult<T> {
        CallCounts::bump(&self.calls.retrieve);
        self.items
            .lock()
            .expect("in-memory api lock poisoned")
            .get(&normalize(key))
            .cloned()
            .ok_or_else(|| api_failure(format!("no item for key {key:?}"), false))
    }

    async fn one(&self, _query: Option<serde_json::Value>, loc: &[LocTag]) -> PolycacheResult<Option<T>> {
        CallCounts::bump(&self.calls.one);
        let items = self.items.lock().expect("in-memory api lock poisoned");
        Ok(items.values().find(|item| item_in_loc(*item, loc)).cloned())
    }

    async fn all(&self, _query: Option<serde_json::Value>, loc: &[LocTag]) -> PolycacheResult<Vec<T>> {
        CallCounts::bump(&self.calls.all);
        let items = self.items.lock().expect("in-memory api lock poisoned");
        Ok(items.values().filter(|item| item_in_loc(*item, loc)).cloned().collect())
    }

    async fn find(&self, _finder: &str, _params: Option<serde_json::Value>, loc: &[LocTag]) -> PolycacheResult<Vec<T>> {
        CallCounts::bump(&self.calls.find);
        let items = self.items.lock().expect("in-memory api lock poisoned");
        Ok(items.values().filter(|item| item_in_loc(*item, loc)).cloned().collect())
    }

    async fn find_one(&self, _finder: &str, _params: Option<serde_json::Value>, loc: &[LocTag]) -> PolycacheResult<Option<T>> {
        CallCounts::bump(&self.calls.find_one);
        let items = self.items.lock().expect("in-memory api lock poisoned");
        Ok(items.values().find(|item| item_in_loc(*item, loc)).cloned())
    }

    async fn create(&self, partial: serde_json::Value, _loc: &[LocTag]) -> PolycacheResult<T> {
        CallCounts::bump(&self.calls.create);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let key = EntityKey::primary(self.create_kt.clone(), id.to_string());
        let item = materialize(key, partial)?;
        self.items.lock().expect("in-memory api lock poisoned").insert(normalize(item.key()), item.clone());
        Ok(item)
    }

    async fn update(&self, key: &EntityKey, partial: serde_json::Value) -> PolycacheResult<T> {
        CallCounts::bump(&self.calls.update);
        let mut items = self.items.lock().expect("in-memory api lock poisoned");
        if !items.contains_key(&normalize(key)) {
            return Err(api_failure(format!("no item for key {key:?}"), false));
        }
        let item = materialize(key.clone(), partial)?;
        items.insert(normalize(key), item.clone());
        Ok(item)
    }

    async fn remove(&self, key: &EntityKey) -> PolycacheResult<()> {
        CallCounts::bump(&self.calls.remove);
        self.items.lock().expect("in-memory api lock poisoned").remove(&normalize(key));
        Ok(())
    }

    async fn set(&self, key: &EntityKey, item: T) -> PolycacheResult<T> {
        CallCounts::bump(&self.calls.set);
        self.items.lock().expect("in-memory api lock poisoned").insert(normalize(key), item.clone());
        Ok(item)
    }

    async fn action(&self, key: &EntityKey, _name: &str, body: Option<serde_json::Value>) -> PolycacheResult<T> {
        CallCounts::bump(&self.calls.action);
        self.update(key, body.unwrap_or(serde_json::Value::Null)).await
    }

    async fn all_action(&self, _name: &str, _body: Option<serde_json::Value>, loc: &[LocTag]) -> PolycacheResult<Vec<T>> {
        CallCounts::bump(&self.calls.all_action);
        let items = self.items.lock().expect("in-memory api lock poisoned");
        Ok(items.values().filter(|item| item_in_loc(*item, loc)).cloned().collect())
    }

    async fn facet(&self, _key: &EntityKey, _name: &str, _params: Option<serde_json::Value>) -> PolycacheResult<serde_json::Value> {
        CallCounts::bump(&self.calls.facet);
        Ok(serde_json::json!({}))
    }

    async fn all_facet(&self, _name: &str, _params: Option<serde_json::Value>, _loc: &[LocTag]) -> PolycacheResult<serde_json::Value> {
        CallCounts::bump(&self.calls.all_facet);
        Ok(serde_json::json!({}))
    }
}

/// `InMemoryApi` has no real notion of location beyond what's encoded in
/// the key; this matches `loc` against the item's own key when the key is
/// composite, and treats a primary (locationless) key as a member of every
/// location so `all(loc)` degrades to "every item" when keys aren't
/// composite.
fn item_in_loc<T: CacheableItem>(item: &T, loc: &[LocTag]) -> bool {
    if loc.is_empty() {
        return true;
    }
    let item_loc = item.key().loc();
    if item_loc.is_empty() {
        return true;
    }
    polycache_core::loc_equal(item_loc, loc)
}

/// `create`/`update`/`action` take a `serde_json::Value` partial rather than
/// a typed `T`; this crate has no deserialization logic of its own to offer
/// beyond `serde_json::from_value`, so that's what it falls back to,
/// surfacing a non-retryable [`ApiError`] on a malformed partial.
fn materialize<T: CacheableItem>(key: EntityKey, partial: serde_json::Value) -> PolycacheResult<T> {
    let mut value = partial;
    if let serde_json::Value::Object(map) = &mut value {
        map.insert("key".to_string(), serde_json::to_value(&key).expect("EntityKey serializes"));
    }
    serde_json::from_value(value).map_err(|err| api_failure(format!("malformed partial for {key:?}: {err}"), false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    struct Widget {
        key: EntityKey,
        n: i32,
    }

    impl CacheableItem for Widget {
        fn key(&self) -> &EntityKey {
            &self.key
        }
    }

    #[test]
    fn manual_clock_only_moves_when_advanced() {
        let clock = ManualClock::at_epoch();
        let first = clock.now();
        let second = clock.now();
        assert_eq!(first, second);
        let advanced = clock.advance_ms(1_000);
        assert_eq!(advanced, first + chrono::Duration::milliseconds(1_000));
    }

    #[tokio::test]
    async fn get_returns_seeded_items_and_counts_the_call() {
        let key = EntityKey::primary("widget", "1");
        let api = InMemoryApi::with_items("widget", vec![Widget { key: key.clone(), n: 1 }]);
        let found = api.get(&key).await.unwrap();
        assert_eq!(found.unwrap().n, 1);
        assert_eq!(api.calls.get.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn retrieve_fails_for_a_missing_key() {
        let api: InMemoryApi<Widget> = InMemoryApi::new("widget");
        let result = api.retrieve(&EntityKey::primary("widget", "missing")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn create_assigns_a_sequential_key_under_the_configured_kind() {
        let api: InMemoryApi<Widget> = InMemoryApi::new("widget");
        let first = api.create(serde_json::json!({ "n": 1 }), &[]).await.unwrap();
        let second = api.create(serde_json::json!({ "n": 2 }), &[]).await.unwrap();
        assert_eq!(first.key.pk(), &Identifier::from("1"));
        assert_eq!(second.key.pk(), &Identifier::from("2"));
        assert_eq!(api.len(), 2);
    }

    #[tokio::test]
    async fn update_requires_the_key_to_already_exist() {
        let api: InMemoryApi<Widget> = InMemoryApi::new("widget");
        let result = api.update(&EntityKey::primary("widget", "1"), serde_json::json!({ "n": 1 })).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn remove_is_idempotent_on_an_already_missing_key() {
        let api: InMemoryApi<Widget> = InMemoryApi::new("widget");
        assert!(api.remove(&EntityKey::primary("widget", "1")).await.is_ok());
    }
}
