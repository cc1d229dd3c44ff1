//! Stats manager (§4.8): monotonic request/hit/miss/subscription counters.

use polycache_core::{normalize, EntityKey, LocTag};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// A snapshot of [`StatsManager`]'s counters at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub num_requests: u64,
    pub num_hits: u64,
    pub num_misses: u64,
    pub num_subscriptions: u64,
    pub num_unsubscriptions: u64,
    pub active_subscriptions: u64,
}

/// A per-location request/hit/miss breakdown, additive to the global
/// counters `StatsSnapshot` carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocationStats {
    pub num_requests: u64,
    pub num_hits: u64,
    pub num_misses: u64,
}

/// Same fields as [`LocationStats`], plain counters rather than atomics: the
/// whole entry sits behind the table's mutex already.
#[derive(Default)]
struct LocationCounters {
    num_requests: u64,
    num_hits: u64,
    num_misses: u64,
}

/// Canonicalize a location path into the key the per-location table is
/// indexed by, reusing `normalize` over a throwaway key that carries only
/// the location (kt/pk are fixed placeholders, irrelevant to the hash).
fn location_key(loc: &[LocTag]) -> String {
    normalize(&EntityKey::composite("__location__", "", loc.to_vec()))
}

/// `numRequests/numHits/numMisses/numSubscriptions/numUnsubscriptions` are
/// monotonic — `numSubscriptions` never decrements on unsubscribe.
/// `activeSubscriptions` is `numSubscriptions - numUnsubscriptions` and is
/// kept as its own counter rather than computed, so it stays correct under
/// concurrent access without re-reading two other atomics.
#[derive(Default)]
pub struct StatsManager {
    num_requests: AtomicU64,
    num_hits: AtomicU64,
    num_misses: AtomicU64,
    num_subscriptions: AtomicU64,
    num_unsubscriptions: AtomicU64,
    active_subscriptions: AtomicU64,
    per_location: Mutex<HashMap<String, LocationCounters>>,
}

impl StatsManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.num_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hit(&self) {
        self.num_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.num_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_subscribe(&self) {
        self.num_subscriptions.fetch_add(1, Ordering::Relaxed);
        self.active_subscriptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unsubscribe(&self) {
        self.num_unsubscriptions.fetch_add(1, Ordering::Relaxed);
        self.active_subscriptions.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1))).ok();
    }

    /// Additive to `record_request`: also bump the named location's own
    /// breakdown, read back via [`Self::stats_for_location`].
    pub fn record_request_in(&self, loc: &[LocTag]) {
        if loc.is_empty() {
            return;
        }
        let mut table = self.per_location.lock().expect("stats mutex poisoned");
        table.entry(location_key(loc)).or_default().num_requests += 1;
    }

    pub fn record_hit_in(&self, loc: &[LocTag]) {
        if loc.is_empty() {
            return;
        }
        let mut table = self.per_location.lock().expect("stats mutex poisoned");
        table.entry(location_key(loc)).or_default().num_hits += 1;
    }

    pub fn record_miss_in(&self, loc: &[LocTag]) {
        if loc.is_empty() {
            return;
        }
        let mut table = self.per_location.lock().expect("stats mutex poisoned");
        table.entry(location_key(loc)).or_default().num_misses += 1;
    }

    /// The request/hit/miss breakdown recorded for `loc`, or all zeroes if
    /// nothing has been recorded there yet.
    pub fn stats_for_location(&self, loc: &[LocTag]) -> LocationStats {
        let table = self.per_location.lock().expect("stats mutex poisoned");
        table
            .get(&location_key(loc))
            .map(|c| LocationStats {
                num_requests: c.num_requests,
                num_hits: c.num_hits,
                num_misses: c.num_misses,
            })
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            num_requests: self.num_requests.load(Ordering::Relaxed),
            num_hits: self.num_hits.load(Ordering::Relaxed),
            num_misses: self.num_misses.load(Ordering::Relaxed),
            num_subscriptions: self.num_subscriptions.load(Ordering::Relaxed),
            num_unsubscriptions: self.num_unsubscriptions.load(Ordering::Relaxed),
            active_subscriptions: self.active_subscriptions.load(Ordering::Relaxed),
        }
    }

    /// The fraction of requests that were hits, or `0.0` with no requests
    /// yet recorded. Not part of §4.8's counter table; a convenience
    /// derived metric consumers otherwise compute themselves on every read.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.num_hits.load(Ordering::Relaxed);
        let requests = self.num_requests.load(Ordering::Relaxed);
        if requests == 0 {
            0.0
        } else {
            hits as f64 / requests as f64
        }
    }

    pub fn reset(&self) {
        self.num_requests.store(0, Ordering::Relaxed);
        self.num_hits.store(0, Ordering::Relaxed);
        self.num_misses.store(0, Ordering::Relaxed);
        self.num_subscriptions.store(0, Ordering::Relaxed);
        self.num_unsubscriptions.store(0, Ordering::Relaxed);
        self.active_subscriptions.store(0, Ordering::Relaxed);
        self.per_location.lock().expect("stats mutex poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscriptions_are_monotonic_while_active_tracks_the_live_count() {
        let stats = StatsManager::new();
        stats.record_subscribe();
        stats.record_subscribe();
        stats.record_unsubscribe();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.num_subscriptions, 2);
        assert_eq!(snapshot.num_unsubscriptions, 1);
        assert_eq!(snapshot.active_subscriptions, 1);
    }

    #[test]
    fn hit_rate_is_zero_with_no_requests() {
        let stats = StatsManager::new();
        assert_eq!(stats.hit_rate(), 0.0);
    }

    #[test]
    fn hit_rate_reflects_hits_over_requests() {
        let stats = StatsManager::new();
        stats.record_request();
        stats.record_hit();
        stats.record_request();
        stats.record_miss();
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[test]
    fn reset_zeroes_every_counter() {
        let stats = StatsManager::new();
        stats.record_request();
        stats.record_subscribe();
        stats.reset();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot, StatsSnapshot::default());
    }

    #[test]
    fn stats_for_an_untracked_location_are_all_zero() {
        let stats = StatsManager::new();
        let loc = vec![LocTag::new("shelf", "a")];
        assert_eq!(stats.stats_for_location(&loc), LocationStats::default());
    }

    #[test]
    fn per_location_counters_are_additive_to_the_global_ones() {
        let stats = StatsManager::new();
        let shelf_a = vec![LocTag::new("shelf", "a")];
        let shelf_b = vec![LocTag::new("shelf", "b")];

        stats.record_request();
        stats.record_request_in(&shelf_a);
        stats.record_hit();
        stats.record_hit_in(&shelf_a);

        stats.record_request();
        stats.record_request_in(&shelf_b);
        stats.record_miss();
        stats.record_miss_in(&shelf_b);

        let global = stats.snapshot();
        assert_eq!(global.num_requests, 2);
        assert_eq!(global.num_hits, 1);
        assert_eq!(global.num_misses, 1);

        let a = stats.stats_for_location(&shelf_a);
        assert_eq!(a.num_requests, 1);
        assert_eq!(a.num_hits, 1);
        assert_eq!(a.num_misses, 0);

        let b = stats.stats_for_location(&shelf_b);
        assert_eq!(b.num_requests, 1);
        assert_eq!(b.num_misses, 1);
    }

    #[test]
    fn reset_clears_per_location_counters_too() {
        let stats = StatsManager::new();
        let loc = vec![LocTag::new("shelf", "a")];
        stats.record_request_in(&loc);
        stats.reset();
        assert_eq!(stats.stats_for_location(&loc), LocationStats::default());
    }

    #[test]
    fn read_through_hit_then_miss_matches_scenario_s1() {
        let stats = StatsManager::new();
        stats.record_request();
        stats.record_miss();
        stats.record_request();
        stats.record_hit();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.num_requests, 2);
        assert_eq!(snapshot.num_hits, 1);
        assert_eq!(snapshot.num_misses, 1);
    }
}
