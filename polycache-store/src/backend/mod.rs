//! The backend contract (§4.2 "Backend (CacheMap contract)"): three disjoint
//! namespaces — items, item metadata, query results — under one async,
//! language-neutral capability interface.
//!
//! Concrete families live in sibling modules: [`memory`] (in-memory, with an
//! optional size-bounded variant), [`embedded`] (an LMDB-backed persistent
//! store via `heed`), and [`kv`] (a pluggable synchronous string-keyed store,
//! for the "small synchronous web storage" family of §4.2.2).

pub mod embedded;
pub mod kv;
pub mod memory;
pub mod quota;

use async_trait::async_trait;
use polycache_core::{CacheableItem, EntityKey, ItemEntry, ItemMetadata, LocTag, PolycacheResult, QueryEntry, QueryMetadata};

/// `{itemCount, sizeBytes}` — invariant 5: `item_count` never counts query
/// or metadata entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CurrentSize {
    pub item_count: u64,
    pub size_bytes: u64,
}

/// `{maxItems|null, maxSizeBytes|null}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SizeLimits {
    pub max_items: Option<u64>,
    pub max_size_bytes: Option<u64>,
}

/// A stable identity tag plus a feature descriptor, returned by
/// [`CacheBackend::capabilities`] instead of relying on introspection (§9
/// "Multi-backend polymorphism").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCapabilities {
    pub implementation_type: &'static str,
    pub supports_ttl: bool,
    pub supports_eviction: bool,
    /// Whether the backend can persist query metadata itself, or whether the
    /// coordinator must keep it purely in its in-memory map (§4.5).
    pub supports_query_metadata_persistence: bool,
}

/// The persistence capability one backend family provides for one item
/// type, per §4.2.
#[async_trait]
pub trait CacheBackend<T: CacheableItem>: Send + Sync {
    async fn get(&self, key: &EntityKey) -> PolycacheResult<Option<ItemEntry<T>>>;
    async fn set(&self, key: &EntityKey, entry: ItemEntry<T>) -> PolycacheResult<()>;
    async fn has(&self, key: &EntityKey) -> PolycacheResult<bool>;
    async fn delete(&self, key: &EntityKey) -> PolycacheResult<()>;
    async fn keys(&self) -> PolycacheResult<Vec<EntityKey>>;
    async fn values(&self) -> PolycacheResult<Vec<ItemEntry<T>>>;
    async fn clear(&self) -> PolycacheResult<()>;

    /// All items whose key's `loc` equals `loc`; an empty `loc` returns
    /// every item regardless of location.
    async fn all_in(&self, loc: &[LocTag]) -> PolycacheResult<Vec<ItemEntry<T>>>;

    /// `allIn(loc)` filtered client-side by `predicate`.
    async fn query_in(
        &self,
        loc: &[LocTag],
        predicate: &(dyn Fn(&T) -> bool + Send + Sync),
    ) -> PolycacheResult<Vec<ItemEntry<T>>> {
        Ok(self
            .all_in(loc)
            .await?
            .into_iter()
            .filter(|entry| predicate(&entry.value))
            .collect())
    }

    async fn set_query_result(
        &self,
        hash: &str,
        keys: Vec<EntityKey>,
        metadata: Option<QueryMetadata>,
    ) -> PolycacheResult<()>;
    async fn get_query_result(&self, hash: &str) -> PolycacheResult<Option<Vec<EntityKey>>>;
    async fn get_query_result_with_metadata(&self, hash: &str) -> PolycacheResult<Option<QueryEntry>>;
    async fn has_query_result(&self, hash: &str) -> PolycacheResult<bool>;
    async fn delete_query_result(&self, hash: &str) -> PolycacheResult<()>;
    async fn clear_query_results(&self) -> PolycacheResult<()>;

    /// Deletes the given items, then deletes any query entry whose
    /// `item_keys` references one of them (normalized).
    async fn invalidate_item_keys(&self, keys: &[EntityKey]) -> PolycacheResult<()>;

    /// Deletes all items in `loc` (or every primary item if `loc` is empty),
    /// then invalidates queries referencing any removed key; falls back to
    /// `clear_query_results` if resolving affected keys fails.
    async fn invalidate_location(&self, loc: &[LocTag]) -> PolycacheResult<()>;

    async fn get_metadata(&self, key: &str) -> PolycacheResult<Option<ItemMetadata>>;
    async fn set_metadata(&self, key: &str, metadata: ItemMetadata) -> PolycacheResult<()>;
    async fn delete_metadata(&self, key: &str) -> PolycacheResult<()>;
    async fn get_all_metadata(&self) -> PolycacheResult<Vec<ItemMetadata>>;
    async fn clear_metadata(&self) -> PolycacheResult<()>;

    async fn current_size(&self) -> PolycacheResult<CurrentSize>;
    fn size_limits(&self) -> SizeLimits;
    fn capabilities(&self) -> BackendCapabilities;
}
