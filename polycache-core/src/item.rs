//! Item values, their storage shape, and eviction-facing metadata.

use crate::key::EntityKey;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

/// Marker trait for values the cache can hold.
///
/// The core treats the value as opaque beyond its embedded key: `key()`
/// must return the same [`EntityKey`] the value was looked up or stored
/// under. `events`/`refs`/`aggs` are pass-through blobs consumed by the
/// (out-of-scope) aggregator collaborator; the core never inspects them.
pub trait CacheableItem: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn key(&self) -> &EntityKey;

    fn events(&self) -> Option<&serde_json::Value> {
        None
    }

    fn refs(&self) -> Option<&serde_json::Value> {
        None
    }

    fn aggs(&self) -> Option<&serde_json::Value> {
        None
    }
}

/// The storage shape of one cached item (§3 "Item Entry").
///
/// `original_key` is retained so a retrieved entry can be rejected if it
/// doesn't re-hash to the looked-up key (collision detection, invariant 1).
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct ItemEntry<T> {
    pub original_key: EntityKey,
    pub value: T,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
}

impl<T: CacheableItem> ItemEntry<T> {
    pub fn new(value: T, version: u64, timestamp: DateTime<Utc>) -> Self {
        let original_key = value.key().clone();
        Self {
            original_key,
            value,
            version,
            timestamp,
        }
    }

    /// Invariant 1: the entry is only valid for a lookup key if the
    /// retained `original_key` normalizes to the same hash as the lookup.
    pub fn matches_lookup(&self, lookup_hash: &str) -> bool {
        crate::key::normalize(&self.original_key) == lookup_hash
    }
}

/// Per-item bookkeeping consumed by eviction strategies and size-bounded
/// backends (§3 "Item Metadata"). Lives in a sibling namespace from the
/// item entry itself.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct ItemMetadata {
    pub key: EntityKey,
    pub added_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
    pub estimated_size: u64,
    /// Eviction-strategy-private scratch data (e.g. ARC/2Q queue
    /// membership). Opaque to everything but the strategy that wrote it.
    pub strategy_data: Option<serde_json::Value>,
    /// Time-decayed frequency score, maintained by LFU-family strategies.
    pub frequency_score: Option<f64>,
}

impl ItemMetadata {
    pub fn new(key: EntityKey, now: DateTime<Utc>, estimated_size: u64) -> Self {
        Self {
            key,
            added_at: now,
            last_accessed_at: now,
            access_count: 0,
            estimated_size,
            strategy_data: None,
            frequency_score: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Serialize, serde::Deserialize)]
    struct TestItem {
        key: EntityKey,
        n: i32,
    }

    impl CacheableItem for TestItem {
        fn key(&self) -> &EntityKey {
            &self.key
        }
    }

    #[test]
    fn matches_lookup_succeeds_for_the_stored_key() {
        let key = EntityKey::primary("widget", "1");
        let item = TestItem { key: key.clone(), n: 1 };
        let entry = ItemEntry::new(item, 1, Utc::now());
        assert!(entry.matches_lookup(&crate::key::normalize(&key)));
    }

    #[test]
    fn matches_lookup_fails_on_a_hash_collision() {
        let key_a = EntityKey::primary("widget", "1");
        let key_b = EntityKey::primary("widget", "2");
        let item = TestItem { key: key_a, n: 1 };
        let entry = ItemEntry::new(item, 1, Utc::now());
        assert!(!entry.matches_lookup(&crate::key::normalize(&key_b)));
    }
}
