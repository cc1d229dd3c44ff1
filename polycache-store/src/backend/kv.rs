//! String-keyed persistent storage (§4.2.2, §6 "Persisted layout"): a
//! pluggable synchronous key/value store (the "small synchronous web
//! storage" family) wrapped in the async [`CacheBackend`] facade, subject to
//! the quota-retry rules of §4.2.1.

use super::quota::write_with_quota_retry;
use super::{BackendCapabilities, CacheBackend, CurrentSize, SizeLimits};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use polycache_core::{
    loc_equal, normalize, BackendError, CacheableItem, CodecError, EntityKey, ItemEntry,
    ItemMetadata, LocTag, PolycacheResult, QueryEntry, QueryEntryOnDisk, QueryMetadata,
};
use std::marker::PhantomData;

/// The synchronous storage capability a string-keyed backend runs atop
/// (e.g. a browser's `localStorage` analog). `set` returns
/// `BackendError::QuotaExceeded` when the store rejects a write for being
/// full; every other failure is `BackendError::Io`.
pub trait SyncKvStore: Send + Sync {
    fn get(&self, key: &str) -> PolycacheResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> PolycacheResult<()>;
    fn delete(&self, key: &str) -> PolycacheResult<()>;
    fn keys_with_prefix(&self, prefix: &str) -> PolycacheResult<Vec<String>>;
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct OnDiskItem<T> {
    original_key: EntityKey,
    value: T,
    version: u64,
    timestamp: DateTime<Utc>,
}

/// A `CacheBackend` over any [`SyncKvStore`], namespaced by `prefix` per the
/// persisted layout of §6.
pub struct StringStorageBackend<S, T> {
    store: S,
    prefix: String,
    _marker: PhantomData<T>,
}

impl<S: SyncKvStore, T: CacheableItem> StringStorageBackend<S, T> {
    pub fn new(store: S, prefix: impl Into<String>) -> Self {
        Self { store, prefix: prefix.into(), _marker: PhantomData }
    }

    fn item_key(&self, hash: &str) -> String {
        format!("{}:{}", self.prefix, hash)
    }

    fn metadata_key(&self, key: &str) -> String {
        format!("{}:metadata:{}", self.prefix, key)
    }

    fn query_key(&self, hash: &str) -> String {
        format!("{}:query:{}", self.prefix, hash)
    }

    fn item_prefix(&self) -> String {
        format!("{}:", self.prefix)
    }

    fn metadata_prefix(&self) -> String {
        format!("{}:metadata:", self.prefix)
    }

    fn query_prefix(&self) -> String {
        format!("{}:query:", self.prefix)
    }

    fn encode<V: serde::Serialize>(value: &V) -> PolycacheResult<String> {
        reject_cycles(value)?;
        serde_json::to_string(value)
            .map_err(|e| CodecError::EncodeFailed { reason: e.to_string() }.into())
    }

    fn decode<V: serde::de::DeserializeOwned>(raw: &str, key: &str) -> PolycacheResult<V> {
        serde_json::from_str(raw).map_err(|e| {
            BackendError::Corrupt { key: key.to_string(), reason: e.to_string() }.into()
        })
    }

    fn is_item_key(&self, raw_key: &str) -> bool {
        raw_key.starts_with(&self.item_prefix())
            && !raw_key.starts_with(&self.metadata_prefix())
            && !raw_key.starts_with(&self.query_prefix())
    }

    fn item_entries(&self) -> PolycacheResult<Vec<(String, OnDiskItem<T>)>> {
        let mut out = Vec::new();
        for raw_key in self.store.keys_with_prefix(&self.item_prefix())? {
            if !self.is_item_key(&raw_key) {
                continue;
            }
            if let Some(raw_value) = self.store.get(&raw_key)? {
                if let Ok(decoded) = Self::decode::<OnDiskItem<T>>(&raw_value, &raw_key) {
                    out.push((raw_key, decoded));
                }
            }
        }
        Ok(out)
    }

    /// §4.2.1 cleanup: oldest `percent` of item entries (metadata/query
    /// namespaces untouched), by ascending `timestamp`.
    fn cleanup_oldest(&self, percent: f64) -> PolycacheResult<()> {
        let mut entries = self.item_entries()?;
        entries.sort_by_key(|(_, item)| item.timestamp);
        let remove_count = ((entries.len() as f64) * percent).ceil() as usize;
        tracing::debug!(remove_count, percent, "evicting oldest item entries to free quota");
        for (raw_key, _) in entries.into_iter().take(remove_count) {
            self.store.delete(&raw_key)?;
        }
        Ok(())
    }
}

/// Refuse cyclic item graphs with a precondition error instead of hanging
/// (§9 "Cyclic references"). `serde_json` already detects unrepresentable
/// recursive structures that would otherwise overflow the encoder stack;
/// this check converts that failure into the spec's explicit `CodecError`.
fn reject_cycles<V: serde::Serialize>(value: &V) -> PolycacheResult<()> {
    match serde_json::to_value(value) {
        Ok(_) => Ok(()),
        Err(e) if e.to_string().contains("recursion") => Err(CodecError::CyclicReference.into()),
        Err(_) => Ok(()),
    }
}

#[async_trait]
impl<S: SyncKvStore + Send + Sync, T: CacheableItem> CacheBackend<T> for StringStorageBackend<S, T> {
    async fn get(&self, key: &EntityKey) -> PolycacheResult<Option<ItemEntry<T>>> {
        let hash = normalize(key);
        let Some(raw) = self.store.get(&self.item_key(&hash))? else { return Ok(None) };
        let decoded: OnDiskItem<T> = match Self::decode(&raw, &hash) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(key = %hash, error = %e, "corrupt item entry, evicting");
                self.store.delete(&self.item_key(&hash))?;
                return Ok(None);
            }
        };
        let entry = ItemEntry {
            original_key: decoded.original_key,
            value: decoded.value,
            version: decoded.version,
            timestamp: decoded.timestamp,
        };
        if !entry.matches_lookup(&hash) {
            return Ok(None);
        }
        Ok(Some(entry))
    }

    async fn set(&self, key: &EntityKey, entry: ItemEntry<T>) -> PolycacheResult<()> {
        let hash = normalize(key);
        let on_disk = OnDiskItem {
            original_key: entry.original_key.clone(),
            value: entry.value.clone(),
            version: entry.version,
            timestamp: entry.timestamp,
        };
        let encoded = Self::encode(&on_disk)?;
        write_with_quota_retry(
            || self.store.set(&self.item_key(&hash), &encoded),
            |percent| self.cleanup_oldest(percent),
        )?;
        let metadata = ItemMetadata::new(key.clone(), entry.timestamp, encoded.len() as u64);
        let meta_encoded = Self::encode(&metadata)?;
        self.store.set(&self.metadata_key(&hash), &meta_encoded)
    }

    async fn has(&self, key: &EntityKey) -> PolycacheResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn delete(&self, key: &EntityKey) -> PolycacheResult<()> {
        let hash = normalize(key);
        self.store.delete(&self.item_key(&hash))?;
        self.store.delete(&self.metadata_key(&hash))
    }

    async fn keys(&self) -> PolycacheResult<Vec<EntityKey>> {
        Ok(self.item_entries()?.into_iter().map(|(_, item)| item.original_key).collect())
    }

    async fn values(&self) -> PolycacheResult<Vec<ItemEntry<T>>> {
        Ok(self
            .item_entries()?
            .into_iter()
            .map(|(_, item)| ItemEntry {
                original_key: item.original_key,
                value: item.value,
                version: item.version,
                timestamp: item.timestamp,
            })
            .collect())
    }

    async fn clear(&self) -> PolycacheResult<()> {
        for (raw_key, _) in self.item_entries()? {
            self.store.delete(&raw_key)?;
        }
        for raw_key in self.store.keys_with_prefix(&self.metadata_prefix())? {
            self.store.delete(&raw_key)?;
        }
        Ok(())
    }

    async fn all_in(&self, loc: &[LocTag]) -> PolycacheResult<Vec<ItemEntry<T>>> {
        let all = self.values().await?;
        if loc.is_empty() {
            return Ok(all);
        }
        Ok(all.into_iter().filter(|e| loc_equal(e.original_key.loc(), loc)).collect())
    }

    async fn set_query_result(
        &self,
        hash: &str,
        keys: Vec<EntityKey>,
        metadata: Option<QueryMetadata>,
    ) -> PolycacheResult<()> {
        let metadata = metadata.unwrap_or_else(|| QueryMetadata {
            query_type: polycache_core::QueryKind::All,
            is_complete: false,
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::days(365 * 100),
            filter: None,
            params: None,
        });
        let entry = QueryEntry { item_keys: keys, metadata };
        let encoded = Self::encode(&entry)?;
        write_with_quota_retry(
            || self.store.set(&self.query_key(hash), &encoded),
            |percent| self.cleanup_oldest(percent),
        )
    }

    async fn get_query_result(&self, hash: &str) -> PolycacheResult<Option<Vec<EntityKey>>> {
        Ok(self
            .get_query_result_with_metadata(hash)
            .await?
            .map(|entry| entry.item_keys))
    }

    async fn get_query_result_with_metadata(&self, hash: &str) -> PolycacheResult<Option<QueryEntry>> {
        let Some(raw) = self.store.get(&self.query_key(hash))? else { return Ok(None) };
        let on_disk: QueryEntryOnDisk = match Self::decode(&raw, hash) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(query_hash = %hash, error = %e, "corrupt query entry, evicting");
                self.store.delete(&self.query_key(hash))?;
                return Ok(None);
            }
        };
        Ok(Some(on_disk.into_entry(Utc::now())))
    }

    async fn has_query_result(&self, hash: &str) -> PolycacheResult<bool> {
        Ok(self.store.get(&self.query_key(hash))?.is_some())
    }

    async fn delete_query_result(&self, hash: &str) -> PolycacheResult<()> {
        self.store.delete(&self.query_key(hash))
    }

    async fn clear_query_results(&self) -> PolycacheResult<()> {
        for raw_key in self.store.keys_with_prefix(&self.query_prefix())? {
            self.store.delete(&raw_key)?;
        }
        Ok(())
    }

    async fn invalidate_item_keys(&self, keys: &[EntityKey]) -> PolycacheResult<()> {
        let hashes: Vec<String> = keys.iter().map(normalize).collect();
        for key in keys {
            self.delete(key).await?;
        }
        for raw_key in self.store.keys_with_prefix(&self.query_prefix())? {
            let query_hash = raw_key.trim_start_matches(&self.query_prefix()).to_string();
            if let Some(entry) = self.get_query_result_with_metadata(&query_hash).await? {
                if hashes.iter().any(|h| entry.references(h)) {
                    self.store.delete(&raw_key)?;
                }
            }
        }
        Ok(())
    }

    async fn invalidate_location(&self, loc: &[LocTag]) -> PolycacheResult<()> {
        match self.all_in(loc).await {
            Ok(affected) => {
                let keys: Vec<EntityKey> = affected.into_iter().map(|e| e.original_key).collect();
                self.invalidate_item_keys(&keys).await
            }
            Err(_) => self.clear_query_results().await,
        }
    }

    async fn get_metadata(&self, key: &str) -> PolycacheResult<Option<ItemMetadata>> {
        let Some(raw) = self.store.get(&self.metadata_key(key))? else { return Ok(None) };
        Self::decode(&raw, key).map(Some)
    }

    async fn set_metadata(&self, key: &str, metadata: ItemMetadata) -> PolycacheResult<()> {
        let encoded = Self::encode(&metadata)?;
        self.store.set(&self.metadata_key(key), &encoded)
    }

    async fn delete_metadata(&self, key: &str) -> PolycacheResult<()> {
        self.store.delete(&self.metadata_key(key))
    }

    async fn get_all_metadata(&self) -> PolycacheResult<Vec<ItemMetadata>> {
        let mut out = Vec::new();
        for raw_key in self.store.keys_with_prefix(&self.metadata_prefix())? {
            if let Some(raw) = self.store.get(&raw_key)? {
                if let Ok(metadata) = Self::decode(&raw, &raw_key) {
                    out.push(metadata);
                }
            }
        }
        Ok(out)
    }

    async fn clear_metadata(&self) -> PolycacheResult<()> {
        for raw_key in self.store.keys_with_prefix(&self.metadata_prefix())? {
            self.store.delete(&raw_key)?;
        }
        Ok(())
    }

    async fn current_size(&self) -> PolycacheResult<CurrentSize> {
        let entries = self.item_entries()?;
        let size_bytes: u64 = entries
            .iter()
            .filter_map(|(_, item)| serde_json::to_vec(item).ok())
            .map(|bytes| bytes.len() as u64)
            .sum();
        Ok(CurrentSize { item_count: entries.len() as u64, size_bytes })
    }

    fn size_limits(&self) -> SizeLimits {
        SizeLimits::default()
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            implementation_type: "string-storage",
            supports_ttl: true,
            supports_eviction: false,
            supports_query_metadata_persistence: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// An in-memory `SyncKvStore` double with a configurable byte quota, to
    /// exercise the §4.2.1 retry/cleanup path without a real browser store.
    struct MockKvStore {
        data: Mutex<HashMap<String, String>>,
        quota_bytes: Option<usize>,
    }

    impl MockKvStore {
        fn new() -> Self {
            Self { data: Mutex::new(HashMap::new()), quota_bytes: None }
        }

        fn with_quota(quota_bytes: usize) -> Self {
            Self { data: Mutex::new(HashMap::new()), quota_bytes: Some(quota_bytes) }
        }

        fn total_bytes(data: &HashMap<String, String>) -> usize {
            data.values().map(|v| v.len()).sum()
        }
    }

    impl SyncKvStore for MockKvStore {
        fn get(&self, key: &str) -> PolycacheResult<Option<String>> {
            Ok(self.data.lock().unwrap().get(key).cloned())
        }

        fn set(&self, key: &str, value: &str) -> PolycacheResult<()> {
            let mut data = self.data.lock().unwrap();
            if let Some(quota) = self.quota_bytes {
                let projected = Self::total_bytes(&data) + value.len();
                if projected > quota && !data.contains_key(key) {
                    return Err(BackendError::QuotaExceeded { attempts: 0 }.into());
                }
            }
            data.insert(key.to_string(), value.to_string());
            Ok(())
        }

        fn delete(&self, key: &str) -> PolycacheResult<()> {
            self.data.lock().unwrap().remove(key);
            Ok(())
        }

        fn keys_with_prefix(&self, prefix: &str) -> PolycacheResult<Vec<String>> {
            Ok(self
                .data
                .lock()
                .unwrap()
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect())
        }
    }

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

    fn entry(n: i32, key: EntityKey, timestamp: DateTime<Utc>) -> ItemEntry<Widget> {
        ItemEntry::new(Widget { key: key.clone(), n }, 1, timestamp)
    }

    #[tokio::test]
    async fn round_trips_through_the_underlying_store() {
        let backend = StringStorageBackend::<_, Widget>::new(MockKvStore::new(), "pc");
        let key = EntityKey::primary("widget", "1");
        backend.set(&key, entry(1, key.clone(), Utc::now())).await.unwrap();
        let got = backend.get(&key).await.unwrap().unwrap();
        assert_eq!(got.value.n, 1);
    }

    #[tokio::test]
    async fn legacy_bare_array_query_entries_are_readable() {
        let store = MockKvStore::new();
        let key = EntityKey::primary("widget", "1");
        let legacy_json = serde_json::to_string(&vec![key.clone()]).unwrap();
        store.set("pc:query:h1", &legacy_json).unwrap();
        let backend = StringStorageBackend::<_, Widget>::new(store, "pc");
        let result = backend.get_query_result("h1").await.unwrap().unwrap();
        assert_eq!(result, vec![key]);
    }

    #[tokio::test]
    async fn quota_exceeded_triggers_cleanup_then_succeeds() {
        let backend = StringStorageBackend::<_, Widget>::new(MockKvStore::with_quota(400), "pc");
        for i in 0..10 {
            let key = EntityKey::primary("widget", i.to_string());
            let result = backend.set(&key, entry(i, key.clone(), Utc::now())).await;
            assert!(result.is_ok(), "set {i} should eventually succeed via cleanup");
        }
        let size = backend.current_size().await.unwrap();
        assert!(size.item_count < 10, "cleanup should have evicted some earlier entries");
    }
}
