//! Embedded persistent key/value backend (§4.2.2): an LMDB-backed store via
//! `heed`, schema-versioned through [`EmbeddedDbConfig`], with one database
//! per namespace (items, metadata, queries) instead of key-prefixing a
//! single store.

use super::quota::write_with_quota_retry;
use super::{BackendCapabilities, CacheBackend, CurrentSize, SizeLimits};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use heed::types::{SerdeJson, Str};
use heed::{Database, Env, EnvOpenOptions};
use polycache_core::{
    loc_equal, normalize, BackendError, CacheableItem, EmbeddedDbConfig, EntityKey, ItemEntry,
    ItemMetadata, LocTag, PolycacheResult, QueryEntry, QueryEntryOnDisk, QueryMetadata,
};
use std::marker::PhantomData;
use std::path::Path;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct OnDiskItem<T> {
    original_key: EntityKey,
    value: T,
    version: u64,
    timestamp: DateTime<Utc>,
}

/// One LMDB environment, three named databases. Schema upgrades across
/// `config.version` are the caller's responsibility (§4.2.2 "schema
/// upgrades beyond the capability contract" is explicitly out of scope).
pub struct EmbeddedBackend<T> {
    env: Env,
    items: Database<Str, SerdeJson<OnDiskItem<T>>>,
    metadata: Database<Str, SerdeJson<ItemMetadata>>,
    queries: Database<Str, SerdeJson<QueryEntryOnDisk>>,
    config: EmbeddedDbConfig,
    _marker: PhantomData<T>,
}

fn map_heed_err(err: heed::Error) -> BackendError {
    match err {
        heed::Error::Mdb(heed::MdbError::MapFull) => BackendError::QuotaExceeded { attempts: 0 },
        other => {
            tracing::error!(error = %other, "lmdb operation failed");
            BackendError::Io { reason: other.to_string() }
        }
    }
}

impl<T: CacheableItem> EmbeddedBackend<T> {
    pub fn open(path: impl AsRef<Path>, config: EmbeddedDbConfig, map_size_bytes: usize) -> PolycacheResult<Self> {
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size_bytes)
                .max_dbs(3)
                .open(path.as_ref())
                .map_err(map_heed_err)?
        };
        let mut wtxn = env.write_txn().map_err(map_heed_err)?;
        let items = env
            .create_database(&mut wtxn, Some(&format!("{}_items", config.store_name)))
            .map_err(map_heed_err)?;
        let metadata = env
            .create_database(&mut wtxn, Some(&format!("{}_metadata", config.store_name)))
            .map_err(map_heed_err)?;
        let queries = env
            .create_database(&mut wtxn, Some(&format!("{}_queries", config.store_name)))
            .map_err(map_heed_err)?;
        wtxn.commit().map_err(map_heed_err)?;
        tracing::debug!(store_name = %config.store_name, map_size_bytes, "opened lmdb environment");
        Ok(Self { env, items, metadata, queries, config, _marker: PhantomData })
    }

    pub fn config(&self) -> &EmbeddedDbConfig {
        &self.config
    }

    fn item_entries(&self) -> PolycacheResult<Vec<(String, OnDiskItem<T>)>> {
        let rtxn = self.env.read_txn().map_err(map_heed_err)?;
        let mut out = Vec::new();
        for result in self.items.iter(&rtxn).map_err(map_heed_err)? {
            let (hash, item) = result.map_err(map_heed_err)?;
            out.push((hash.to_string(), item));
        }
        Ok(out)
    }

    fn cleanup_oldest(&self, percent: f64) -> PolycacheResult<()> {
        let mut entries = self.item_entries()?;
        entries.sort_by_key(|(_, item)| item.timestamp);
        let remove_count = ((entries.len() as f64) * percent).ceil() as usize;
        tracing::debug!(remove_count, percent, "evicting oldest item entries to free quota");
        let mut wtxn = self.env.write_txn().map_err(map_heed_err)?;
        for (hash, _) in entries.into_iter().take(remove_count) {
            self.items.delete(&mut wtxn, &hash).map_err(map_heed_err)?;
            self.metadata.delete(&mut wtxn, &hash).map_err(map_heed_err)?;
        }
        wtxn.commit().map_err(map_heed_err)?;
        Ok(())
    }
}

#[async_trait]
impl<T: CacheableItem> CacheBackend<T> for EmbeddedBackend<T> {
    async fn get(&self, key: &EntityKey) -> PolycacheResult<Option<ItemEntry<T>>> {
        let hash = normalize(key);
        let rtxn = self.env.read_txn().map_err(map_heed_err)?;
        let Some(on_disk) = self.items.get(&rtxn, &hash).map_err(map_heed_err)? else { return Ok(None) };
        let entry = ItemEntry {
            original_key: on_disk.original_key,
            value: on_disk.value,
            version: on_disk.version,
            timestamp: on_disk.timestamp,
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
        write_with_quota_retry(
            || {
                let mut wtxn = self.env.write_txn().map_err(map_heed_err)?;
                self.items.put(&mut wtxn, &hash, &on_disk).map_err(map_heed_err)?;
                wtxn.commit().map_err(map_heed_err)?;
                Ok(())
            },
            |percent| self.cleanup_oldest(percent),
        )?;
        let size = serde_json::to_vec(&on_disk).map(|b| b.len() as u64).unwrap_or(0);
        let metadata = ItemMetadata::new(key.clone(), entry.timestamp, size);
        let mut wtxn = self.env.write_txn().map_err(map_heed_err)?;
        self.metadata.put(&mut wtxn, &hash, &metadata).map_err(map_heed_err)?;
        wtxn.commit().map_err(map_heed_err)?;
        Ok(())
    }

    async fn has(&self, key: &EntityKey) -> PolycacheResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn delete(&self, key: &EntityKey) -> PolycacheResult<()> {
        let hash = normalize(key);
        let mut wtxn = self.env.write_txn().map_err(map_heed_err)?;
        self.items.delete(&mut wtxn, &hash).map_err(map_heed_err)?;
        self.metadata.delete(&mut wtxn, &hash).map_err(map_heed_err)?;
        wtxn.commit().map_err(map_heed_err)?;
        Ok(())
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
        let mut wtxn = self.env.write_txn().map_err(map_heed_err)?;
        self.items.clear(&mut wtxn).map_err(map_heed_err)?;
        self.metadata.clear(&mut wtxn).map_err(map_heed_err)?;
        wtxn.commit().map_err(map_heed_err)?;
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
        let entry = QueryEntryOnDisk::Current(QueryEntry { item_keys: keys, metadata });
        write_with_quota_retry(
            || {
                let mut wtxn = self.env.write_txn().map_err(map_heed_err)?;
                self.queries.put(&mut wtxn, hash, &entry).map_err(map_heed_err)?;
                wtxn.commit().map_err(map_heed_err)?;
                Ok(())
            },
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
        let rtxn = self.env.read_txn().map_err(map_heed_err)?;
        let Some(on_disk) = self.queries.get(&rtxn, hash).map_err(map_heed_err)? else { return Ok(None) };
        Ok(Some(on_disk.into_entry(Utc::now())))
    }

    async fn has_query_result(&self, hash: &str) -> PolycacheResult<bool> {
        let rtxn = self.env.read_txn().map_err(map_heed_err)?;
        Ok(self.queries.get(&rtxn, hash).map_err(map_heed_err)?.is_some())
    }

    async fn delete_query_result(&self, hash: &str) -> PolycacheResult<()> {
        let mut wtxn = self.env.write_txn().map_err(map_heed_err)?;
        self.queries.delete(&mut wtxn, hash).map_err(map_heed_err)?;
        wtxn.commit().map_err(map_heed_err)?;
        Ok(())
    }

    async fn clear_query_results(&self) -> PolycacheResult<()> {
        let mut wtxn = self.env.write_txn().map_err(map_heed_err)?;
        self.queries.clear(&mut wtxn).map_err(map_heed_err)?;
        wtxn.commit().map_err(map_heed_err)?;
        Ok(())
    }

    async fn invalidate_item_keys(&self, keys: &[EntityKey]) -> PolycacheResult<()> {
        let hashes: Vec<String> = keys.iter().map(normalize).collect();
        for key in keys {
            self.delete(key).await?;
        }
        let rtxn = self.env.read_txn().map_err(map_heed_err)?;
        let mut to_delete = Vec::new();
        for result in self.queries.iter(&rtxn).map_err(map_heed_err)? {
            let (query_hash, on_disk) = result.map_err(map_heed_err)?;
            let entry = on_disk.into_entry(Utc::now());
            if hashes.iter().any(|h| entry.references(h)) {
                to_delete.push(query_hash.to_string());
            }
        }
        drop(rtxn);
        if !to_delete.is_empty() {
            let mut wtxn = self.env.write_txn().map_err(map_heed_err)?;
            for query_hash in to_delete {
                self.queries.delete(&mut wtxn, &query_hash).map_err(map_heed_err)?;
            }
            wtxn.commit().map_err(map_heed_err)?;
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
        let rtxn = self.env.read_txn().map_err(map_heed_err)?;
        Ok(self.metadata.get(&rtxn, key).map_err(map_heed_err)?)
    }

    async fn set_metadata(&self, key: &str, metadata: ItemMetadata) -> PolycacheResult<()> {
        let mut wtxn = self.env.write_txn().map_err(map_heed_err)?;
        self.metadata.put(&mut wtxn, key, &metadata).map_err(map_heed_err)?;
        wtxn.commit().map_err(map_heed_err)?;
        Ok(())
    }

    async fn delete_metadata(&self, key: &str) -> PolycacheResult<()> {
        let mut wtxn = self.env.write_txn().map_err(map_heed_err)?;
        self.metadata.delete(&mut wtxn, key).map_err(map_heed_err)?;
        wtxn.commit().map_err(map_heed_err)?;
        Ok(())
    }

    async fn get_all_metadata(&self) -> PolycacheResult<Vec<ItemMetadata>> {
        let rtxn = self.env.read_txn().map_err(map_heed_err)?;
        let mut out = Vec::new();
        for result in self.metadata.iter(&rtxn).map_err(map_heed_err)? {
            let (_, metadata) = result.map_err(map_heed_err)?;
            out.push(metadata);
        }
        Ok(out)
    }

    async fn clear_metadata(&self) -> PolycacheResult<()> {
        let mut wtxn = self.env.write_txn().map_err(map_heed_err)?;
        self.metadata.clear(&mut wtxn).map_err(map_heed_err)?;
        wtxn.commit().map_err(map_heed_err)?;
        Ok(())
    }

    async fn current_size(&self) -> PolycacheResult<CurrentSize> {
        let entries = self.item_entries()?;
        let size_bytes: u64 = entries
            .iter()
            .filter_map(|(_, item)| serde_json::to_vec(item).ok())
            .map(|b| b.len() as u64)
            .sum();
        Ok(CurrentSize { item_count: entries.len() as u64, size_bytes })
    }

    fn size_limits(&self) -> SizeLimits {
        SizeLimits::default()
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            implementation_type: "embedded-db",
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
    use tempfile::tempdir;

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
    async fn set_then_get_round_trips_through_lmdb() {
        let dir = tempdir().unwrap();
        let backend = EmbeddedBackend::<Widget>::open(
            dir.path(),
            EmbeddedDbConfig::default(),
            10 * 1024 * 1024,
        )
        .unwrap();
        let key = EntityKey::primary("widget", "1");
        backend.set(&key, entry(1, key.clone())).await.unwrap();
        let got = backend.get(&key).await.unwrap().unwrap();
        assert_eq!(got.value.n, 1);
    }

    #[tokio::test]
    async fn invalidate_location_removes_items_and_referencing_queries() {
        let dir = tempdir().unwrap();
        let backend = EmbeddedBackend::<Widget>::open(
            dir.path(),
            EmbeddedDbConfig::default(),
            10 * 1024 * 1024,
        )
        .unwrap();
        let key = EntityKey::composite("widget", "1", vec![polycache_core::LocTag::new("shelf", "a")]);
        backend.set(&key, entry(1, key.clone())).await.unwrap();
        backend
            .set_query_result("h1", vec![key.clone()], None)
            .await
            .unwrap();
        backend
            .invalidate_location(&[polycache_core::LocTag::new("shelf", "a")])
            .await
            .unwrap();
        assert!(backend.get(&key).await.unwrap().is_none());
        assert!(backend.get_query_result("h1").await.unwrap().is_none());
    }
}
