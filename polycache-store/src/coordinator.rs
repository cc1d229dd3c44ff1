//! Two-layer coordinator (§4.5): a backend plus an in-memory query-metadata
//! mirror, so hot-path TTL checks don't always round-trip through the
//! backend's own persisted metadata.

use crate::backend::CacheBackend;
use chrono::{DateTime, Utc};
use polycache_core::{
    normalize, CacheableItem, EntityKey, ItemEntry, LocTag, PolycacheResult, QueryFingerprintInput,
    QueryMetadata,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Wraps a [`CacheBackend`], adding a `queryHash → QueryMetadata` map that's
/// consulted before the backend's own persisted metadata (§4.5 "Read").
///
/// The coordinator never needs to special-case backends that can't persist
/// query metadata themselves ([`BackendCapabilities::supports_query_metadata_persistence`](crate::backend::BackendCapabilities)
/// is `false`): every [`CacheBackend`] implementation in this crate accepts
/// and returns query metadata unconditionally, so the "missing capability is
/// a no-op, not an error" rule in §4.5 falls out for free rather than
/// needing an explicit branch here.
pub struct TwoLayerCoordinator<T, B> {
    backend: Arc<B>,
    query_metadata_map: RwLock<HashMap<String, QueryMetadata>>,
    query_ttl_ms: u64,
    facet_ttl_ms: u64,
    _marker: std::marker::PhantomData<T>,
}

impl<T, B> Clone for TwoLayerCoordinator<T, B>
where
    T: CacheableItem,
    B: CacheBackend<T> + Clone,
{
    /// Clones the underlying backend and wraps it with the same TTL
    /// options, per §4.5 "`clone()` clones the underlying and wraps the
    /// result with the same options." The query-metadata mirror starts
    /// empty in the clone; it rehydrates lazily from the (shared or
    /// independent, depending on the backend's own `clone()` semantics)
    /// persisted metadata on first read.
    fn clone(&self) -> Self {
        Self {
            backend: Arc::new((*self.backend).clone()),
            query_metadata_map: RwLock::new(HashMap::new()),
            query_ttl_ms: self.query_ttl_ms,
            facet_ttl_ms: self.facet_ttl_ms,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T, B> TwoLayerCoordinator<T, B>
where
    T: CacheableItem,
    B: CacheBackend<T>,
{
    pub fn new(backend: B, query_ttl_ms: u64, facet_ttl_ms: u64) -> Self {
        Self {
            backend: Arc::new(backend),
            query_metadata_map: RwLock::new(HashMap::new()),
            query_ttl_ms,
            facet_ttl_ms,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub async fn get(&self, key: &EntityKey) -> PolycacheResult<Option<ItemEntry<T>>> {
        self.backend.get(key).await
    }

    /// `set(k, v)` through the coordinator: write, then drop any query
    /// entry whose stored keys reference `k` (write-through invalidation).
    pub async fn set(&self, key: &EntityKey, entry: ItemEntry<T>) -> PolycacheResult<()> {
        self.backend.set(key, entry).await?;
        self.invalidate_queries_referencing(&[key.clone()]).await
    }

    /// `delete(k)` through the coordinator: delete, then drop any query
    /// entry whose stored keys reference `k`.
    pub async fn delete(&self, key: &EntityKey) -> PolycacheResult<()> {
        self.backend.delete(key).await?;
        self.invalidate_queries_referencing(&[key.clone()]).await
    }

    pub async fn all_in(&self, loc: &[LocTag]) -> PolycacheResult<Vec<ItemEntry<T>>> {
        self.backend.all_in(loc).await
    }

    pub async fn query_in(
        &self,
        loc: &[LocTag],
        predicate: &(dyn Fn(&T) -> bool + Send + Sync),
    ) -> PolycacheResult<Vec<ItemEntry<T>>> {
        self.backend.query_in(loc, predicate).await
    }

    /// Classifies the query by `input.is_complete()` (§4.5 "TTL policy"),
    /// picks `query_ttl_ms` or `facet_ttl_ms` accordingly, and stores both
    /// the metadata (in the mirror) and the full entry (in the backend).
    pub async fn set_query_result(
        &self,
        hash: &str,
        keys: Vec<EntityKey>,
        input: &QueryFingerprintInput,
        now: DateTime<Utc>,
    ) -> PolycacheResult<()> {
        let is_complete = input.is_complete();
        let ttl_ms = if is_complete { self.query_ttl_ms } else { self.facet_ttl_ms };
        let metadata = QueryMetadata {
            query_type: input.kind,
            is_complete,
            created_at: now,
            expires_at: now + chrono::Duration::milliseconds(ttl_ms as i64),
            filter: None,
            params: input.params.clone(),
        };
        self.backend.set_query_result(hash, keys, Some(metadata.clone())).await?;
        self.query_metadata_map
            .write()
            .expect("query metadata map lock poisoned")
            .insert(hash.to_string(), metadata);
        Ok(())
    }

    /// §4.5 "Read": mirror first, backend metadata second, expiry check
    /// last; a hit returns the backend's stored `itemKeys`.
    pub async fn get_query_result(&self, hash: &str, now: DateTime<Utc>) -> PolycacheResult<Option<Vec<EntityKey>>> {
        let mirrored = self
            .query_metadata_map
            .read()
            .expect("query metadata map lock poisoned")
            .get(hash)
            .cloned();

        let metadata = match mirrored {
            Some(metadata) => Some(metadata),
            None => match self.backend.get_query_result_with_metadata(hash).await? {
                Some(entry) => {
                    self.query_metadata_map
                        .write()
                        .expect("query metadata map lock poisoned")
                        .insert(hash.to_string(), entry.metadata.clone());
                    Some(entry.metadata)
                }
                None => None,
            },
        };

        let Some(metadata) = metadata else { return Ok(None) };
        if now >= metadata.expires_at {
            self.delete_query_result(hash).await?;
            return Ok(None);
        }
        self.backend.get_query_result(hash).await
    }

    pub async fn delete_query_result(&self, hash: &str) -> PolycacheResult<()> {
        self.backend.delete_query_result(hash).await?;
        self.query_metadata_map.write().expect("query metadata map lock poisoned").remove(hash);
        Ok(())
    }

    pub async fn clear_query_results(&self) -> PolycacheResult<()> {
        self.backend.clear_query_results().await?;
        self.query_metadata_map.write().expect("query metadata map lock poisoned").clear();
        Ok(())
    }

    /// Bulk invalidation: delete the items, then drop any query entry that
    /// referenced one of them.
    pub async fn invalidate_item_keys(&self, keys: &[EntityKey]) -> PolycacheResult<()> {
        self.backend.invalidate_item_keys(keys).await?;
        self.prune_stale_mirror_entries().await
    }

    /// Resolve affected keys via `allIn(loc)`, delete them, then clear any
    /// query entry referencing one; falls back to clearing every query on
    /// resolution failure (§4.5).
    pub async fn invalidate_location(&self, loc: &[LocTag]) -> PolycacheResult<()> {
        self.backend.invalidate_location(loc).await?;
        self.prune_stale_mirror_entries().await
    }

    async fn invalidate_queries_referencing(&self, keys: &[EntityKey]) -> PolycacheResult<()> {
        let hashes: Vec<String> = keys.iter().map(normalize).collect();
        let candidates: Vec<String> = self
            .query_metadata_map
            .read()
            .expect("query metadata map lock poisoned")
            .keys()
            .cloned()
            .collect();
        for query_hash in candidates {
            if let Some(entry) = self.backend.get_query_result_with_metadata(&query_hash).await? {
                if hashes.iter().any(|h| entry.references(h)) {
                    self.delete_query_result(&query_hash).await?;
                }
            } else {
                // The backend no longer has this entry; drop the stale mirror row.
                self.query_metadata_map.write().expect("query metadata map lock poisoned").remove(&query_hash);
            }
        }
        Ok(())
    }

    /// After a backend-side bulk invalidation, the mirror may hold entries
    /// the backend already dropped; reconcile by dropping any mirror row
    /// the backend no longer recognizes.
    async fn prune_stale_mirror_entries(&self) -> PolycacheResult<()> {
        let candidates: Vec<String> = self
            .query_metadata_map
            .read()
            .expect("query metadata map lock poisoned")
            .keys()
            .cloned()
            .collect();
        for query_hash in candidates {
            if !self.backend.has_query_result(&query_hash).await? {
                self.query_metadata_map.write().expect("query metadata map lock poisoned").remove(&query_hash);
            }
        }
        Ok(())
    }
}
