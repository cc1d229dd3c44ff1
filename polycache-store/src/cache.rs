//! Cache facade (§4.9): thin composition over [`Operations`], owning the
//! destruction lifecycle.

use crate::backend::CacheBackend;
use crate::operations::{ApiCapability, Operations};
use crate::stats::StatsSnapshot;
use polycache_core::CacheableItem;
use polycache_events::{EventBus, SubscriptionHandle, SubscriptionOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

/// The registry/coordinate capability consumed at construction (§6
/// "Registry / coordinate capability"): identifies the entity-type
/// hierarchy and scopes a cache instance operates within. Opaque to the
/// cache itself, which only carries it through — never mutated, never
/// interpreted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Coordinate {
    pub kta: Vec<String>,
    pub scopes: Vec<String>,
}

/// Owns the coordinator, API, TTL manager, event bus and stats manager for
/// one cache instance, and forwards the small public surface §4.9 names:
/// `subscribe/unsubscribe/getStats/destroy`. Everything else (the
/// read-through/write-through operations) lives on [`Operations`], reached
/// via [`Cache::operations`].
pub struct Cache<T, B, A> {
    operations: Operations<T, B, A>,
    destroyed: Arc<AtomicBool>,
    coordinate: Option<Coordinate>,
}

impl<T, B, A> Cache<T, B, A>
where
    T: CacheableItem,
    B: CacheBackend<T>,
    A: ApiCapability<T>,
{
    pub fn new(operations: Operations<T, B, A>) -> Self {
        Self { operations, destroyed: Arc::new(AtomicBool::new(false)), coordinate: None }
    }

    /// Attach the registry/coordinate capability this instance was
    /// constructed with. Purely a carried-through value; nothing on `Cache`
    /// reads it back except [`Cache::coordinate`].
    pub fn with_coordinate(mut self, coordinate: Coordinate) -> Self {
        self.coordinate = Some(coordinate);
        self
    }

    pub fn coordinate(&self) -> Option<&Coordinate> {
        self.coordinate.as_ref()
    }

    pub fn operations(&self) -> &Operations<T, B, A> {
        &self.operations
    }

    pub fn bus(&self) -> &EventBus<T> {
        self.operations.bus()
    }

    pub fn subscribe(
        &self,
        options: SubscriptionOptions<T>,
    ) -> polycache_core::PolycacheResult<(SubscriptionHandle, UnboundedReceiver<polycache_events::CacheEvent<T>>)> {
        let result = self.operations.bus().subscribe(options)?;
        self.operations.stats().record_subscribe();
        Ok(result)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let removed = self.operations.bus().unsubscribe(handle);
        if removed {
            self.operations.stats().record_unsubscribe();
        }
        removed
    }

    pub fn get_stats(&self) -> StatsSnapshot {
        self.operations.stats().snapshot()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Idempotent: cancels the sweep, clears subscriptions, and leaves the
    /// backend handle to be dropped with this `Cache` (§3 invariant 6, §5
    /// "Cancellation & timeouts").
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.operations.bus().destroy();
    }
}
