//! Eviction strategies (§4.3).
//!
//! Each strategy is a pure function of an [`ItemMetadata`] snapshot: it
//! never reaches outside the snapshot it's given, so `select_victim` can be
//! called against a point-in-time copy without locking the backend for the
//! duration of the scan.

use crate::backend::{CurrentSize, SizeLimits};
use chrono::{DateTime, Utc};
use polycache_core::{normalize, ConfigError, EntityKey, EvictionPolicy, ItemMetadata, PolycacheResult};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// `{onAccess, onInsert, selectVictim}` per §4.3.
pub trait EvictionStrategy: Send + Sync {
    fn on_access(&self, metadata: &mut ItemMetadata, now: DateTime<Utc>);
    fn on_insert(&self, metadata: &mut ItemMetadata, now: DateTime<Utc>);

    /// Picks the next item to evict, or `None` if `all_metadata` is empty.
    /// Ties are broken by lexicographic order of the normalized key.
    fn select_victim(
        &self,
        all_metadata: &[ItemMetadata],
        current_size: CurrentSize,
        limits: SizeLimits,
    ) -> Option<EntityKey>;
}

fn over_limits(current: CurrentSize, limits: SizeLimits) -> bool {
    limits.max_items.is_some_and(|max| current.item_count > max)
        || limits.max_size_bytes.is_some_and(|max| current.size_bytes > max)
}

/// Repeatedly asks `strategy` for a victim and removes it from the local
/// snapshot until `current_size` respects `limits`, never evicting the last
/// remaining item. Returns the ordered list of keys the caller should
/// actually delete from the backend.
pub fn evict_until_within_limits(
    strategy: &dyn EvictionStrategy,
    mut all_metadata: Vec<ItemMetadata>,
    mut current_size: CurrentSize,
    limits: SizeLimits,
    estimated_size_of: impl Fn(&EntityKey) -> u64,
) -> Vec<EntityKey> {
    let mut victims = Vec::new();
    while all_metadata.len() > 1 && over_limits(current_size, limits) {
        let Some(victim) = strategy.select_victim(&all_metadata, current_size, limits) else {
            break;
        };
        let victim_hash = normalize(&victim);
        let removed_size = estimated_size_of(&victim);
        all_metadata.retain(|m| normalize(&m.key) != victim_hash);
        current_size.item_count = current_size.item_count.saturating_sub(1);
        current_size.size_bytes = current_size.size_bytes.saturating_sub(removed_size);
        victims.push(victim);
    }
    victims
}

fn break_ties_by_key<'a>(
    candidates: impl Iterator<Item = &'a ItemMetadata>,
    mut better: impl FnMut(&ItemMetadata, &ItemMetadata) -> std::cmp::Ordering,
) -> Option<EntityKey> {
    candidates
        .min_by(|a, b| better(a, b).then_with(|| normalize(&a.key).cmp(&normalize(&b.key))))
        .map(|m| m.key.clone())
}

pub struct Lru;

impl EvictionStrategy for Lru {
    fn on_access(&self, metadata: &mut ItemMetadata, now: DateTime<Utc>) {
        metadata.last_accessed_at = now;
        metadata.access_count += 1;
    }

    fn on_insert(&self, metadata: &mut ItemMetadata, now: DateTime<Utc>) {
        metadata.last_accessed_at = now;
    }

    fn select_victim(&self, all: &[ItemMetadata], _s: CurrentSize, _l: SizeLimits) -> Option<EntityKey> {
        break_ties_by_key(all.iter(), |a, b| a.last_accessed_at.cmp(&b.last_accessed_at))
    }
}

pub struct Mru;

impl EvictionStrategy for Mru {
    fn on_access(&self, metadata: &mut ItemMetadata, now: DateTime<Utc>) {
        metadata.last_accessed_at = now;
        metadata.access_count += 1;
    }

    fn on_insert(&self, metadata: &mut ItemMetadata, now: DateTime<Utc>) {
        metadata.last_accessed_at = now;
    }

    fn select_victim(&self, all: &[ItemMetadata], _s: CurrentSize, _l: SizeLimits) -> Option<EntityKey> {
        break_ties_by_key(all.iter(), |a, b| b.last_accessed_at.cmp(&a.last_accessed_at))
    }
}

pub struct Fifo;

impl EvictionStrategy for Fifo {
    fn on_access(&self, metadata: &mut ItemMetadata, _now: DateTime<Utc>) {
        metadata.access_count += 1;
    }

    fn on_insert(&self, metadata: &mut ItemMetadata, now: DateTime<Utc>) {
        metadata.added_at = now;
    }

    fn select_victim(&self, all: &[ItemMetadata], _s: CurrentSize, _l: SizeLimits) -> Option<EntityKey> {
        break_ties_by_key(all.iter(), |a, b| a.added_at.cmp(&b.added_at))
    }
}

/// LFU, optionally with a time-decayed frequency score instead of a raw
/// access counter.
pub struct Lfu {
    pub time_decayed: bool,
}

impl Lfu {
    /// Halve the score every hour of inactivity, then add one for this
    /// access — an arbitrary but monotonically-decaying-with-idle-time
    /// formula in the spirit of §4.3's "time-decayed frequency".
    fn decayed_score(previous: f64, last_accessed_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let idle_hours = (now - last_accessed_at).num_seconds().max(0) as f64 / 3600.0;
        previous * 0.5f64.powf(idle_hours) + 1.0
    }
}

impl EvictionStrategy for Lfu {
    fn on_access(&self, metadata: &mut ItemMetadata, now: DateTime<Utc>) {
        if self.time_decayed {
            let previous = metadata.frequency_score.unwrap_or(0.0);
            metadata.frequency_score = Some(Self::decayed_score(previous, metadata.last_accessed_at, now));
        }
        metadata.access_count += 1;
        metadata.last_accessed_at = now;
    }

    fn on_insert(&self, metadata: &mut ItemMetadata, now: DateTime<Utc>) {
        metadata.last_accessed_at = now;
        if self.time_decayed {
            metadata.frequency_score = Some(1.0);
        }
    }

    fn select_victim(&self, all: &[ItemMetadata], _s: CurrentSize, _l: SizeLimits) -> Option<EntityKey> {
        if self.time_decayed {
            break_ties_by_key(all.iter(), |a, b| {
                a.frequency_score
                    .unwrap_or(0.0)
                    .partial_cmp(&b.frequency_score.unwrap_or(0.0))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
        } else {
            break_ties_by_key(all.iter(), |a, b| a.access_count.cmp(&b.access_count))
        }
    }
}

/// Deterministic pseudo-random victim selection: hashes each candidate's
/// normalized key together with its access count so the "random" choice is
/// still a pure function of the metadata snapshot.
pub struct Random;

fn random_score(metadata: &ItemMetadata) -> u64 {
    let mut hasher = DefaultHasher::new();
    normalize(&metadata.key).hash(&mut hasher);
    metadata.access_count.hash(&mut hasher);
    hasher.finish()
}

impl EvictionStrategy for Random {
    fn on_access(&self, metadata: &mut ItemMetadata, now: DateTime<Utc>) {
        metadata.last_accessed_at = now;
        metadata.access_count += 1;
    }

    fn on_insert(&self, metadata: &mut ItemMetadata, now: DateTime<Utc>) {
        metadata.last_accessed_at = now;
    }

    fn select_victim(&self, all: &[ItemMetadata], _s: CurrentSize, _l: SizeLimits) -> Option<EntityKey> {
        break_ties_by_key(all.iter(), |a, b| random_score(a).cmp(&random_score(b)))
    }
}

/// Simplified Adaptive Replacement Cache: items live in either the recency
/// list (`T1`) or the frequency list (`T2`), tagged via
/// `ItemMetadata::strategy_data`. A fixed target fraction `p` of capacity is
/// reserved for `T1`; ghost-list (`B1`/`B2`) history adaptation is not
/// tracked, since `select_victim` must stay a pure function of the metadata
/// snapshot it's handed.
pub struct ArcStrategy {
    pub p: f64,
}

impl Default for ArcStrategy {
    fn default() -> Self {
        Self { p: 0.5 }
    }
}

fn arc_list(metadata: &ItemMetadata) -> &'static str {
    match metadata.strategy_data.as_ref().and_then(|v| v.get("list")).and_then(|v| v.as_str()) {
        Some("t2") => "t2",
        _ => "t1",
    }
}

impl EvictionStrategy for ArcStrategy {
    fn on_access(&self, metadata: &mut ItemMetadata, now: DateTime<Utc>) {
        metadata.last_accessed_at = now;
        metadata.access_count += 1;
        metadata.strategy_data = Some(serde_json::json!({ "list": "t2" }));
    }

    fn on_insert(&self, metadata: &mut ItemMetadata, now: DateTime<Utc>) {
        metadata.last_accessed_at = now;
        metadata.strategy_data = Some(serde_json::json!({ "list": "t1" }));
    }

    fn select_victim(&self, all: &[ItemMetadata], current: CurrentSize, limits: SizeLimits) -> Option<EntityKey> {
        let capacity = limits.max_items.unwrap_or(current.item_count.max(1)) as f64;
        let t1_target = capacity * self.p;
        let t1_count = all.iter().filter(|m| arc_list(m) == "t1").count() as f64;
        let from = if t1_count > t1_target { "t1" } else { "t2" };
        let candidates = all.iter().filter(|m| arc_list(m) == from);
        let victim = break_ties_by_key(candidates, |a, b| a.last_accessed_at.cmp(&b.last_accessed_at));
        victim.or_else(|| break_ties_by_key(all.iter(), |a, b| a.last_accessed_at.cmp(&b.last_accessed_at)))
    }
}

/// 2Q: a recency queue `A1` sized to `hot_ratio` of capacity, and a
/// frequency-ordered main queue `Am` for everything promoted out of `A1` on
/// a second access.
pub struct TwoQ {
    pub hot_ratio: f64,
}

fn two_q_list(metadata: &ItemMetadata) -> &'static str {
    match metadata.strategy_data.as_ref().and_then(|v| v.get("list")).and_then(|v| v.as_str()) {
        Some("am") => "am",
        _ => "a1",
    }
}

impl EvictionStrategy for TwoQ {
    fn on_access(&self, metadata: &mut ItemMetadata, now: DateTime<Utc>) {
        metadata.last_accessed_at = now;
        metadata.access_count += 1;
        metadata.strategy_data = Some(serde_json::json!({ "list": "am" }));
    }

    fn on_insert(&self, metadata: &mut ItemMetadata, now: DateTime<Utc>) {
        metadata.added_at = now;
        metadata.last_accessed_at = now;
        metadata.strategy_data = Some(serde_json::json!({ "list": "a1" }));
    }

    fn select_victim(&self, all: &[ItemMetadata], current: CurrentSize, limits: SizeLimits) -> Option<EntityKey> {
        let capacity = limits.max_items.unwrap_or(current.item_count.max(1)) as f64;
        let a1_target = capacity * self.hot_ratio;
        let a1_count = all.iter().filter(|m| two_q_list(m) == "a1").count() as f64;
        if a1_count > a1_target {
            if let Some(victim) = break_ties_by_key(
                all.iter().filter(|m| two_q_list(m) == "a1"),
                |a, b| a.added_at.cmp(&b.added_at),
            ) {
                return Some(victim);
            }
        }
        break_ties_by_key(
            all.iter().filter(|m| two_q_list(m) == "am"),
            |a, b| a.last_accessed_at.cmp(&b.last_accessed_at),
        )
        .or_else(|| break_ties_by_key(all.iter(), |a, b| a.last_accessed_at.cmp(&b.last_accessed_at)))
    }
}

/// Builds the configured strategy, rejecting unknown/contradictory
/// configuration per §4.3's validation rules (`CacheOptions::validate`
/// already rejects an invalid `hot_ratio`; this only maps the policy enum).
pub fn build_strategy(policy: &EvictionPolicy) -> PolycacheResult<Box<dyn EvictionStrategy>> {
    Ok(match policy {
        EvictionPolicy::Lru => Box::new(Lru),
        EvictionPolicy::Mru => Box::new(Mru),
        EvictionPolicy::Fifo => Box::new(Fifo),
        EvictionPolicy::Lfu { time_decayed } => Box::new(Lfu { time_decayed: *time_decayed }),
        EvictionPolicy::Random => Box::new(Random),
        EvictionPolicy::Arc => Box::new(ArcStrategy::default()),
        EvictionPolicy::TwoQ { hot_ratio } => {
            if !(*hot_ratio > 0.0 && *hot_ratio < 1.0) {
                return Err(ConfigError::InvalidValue {
                    field: "eviction_policy.hot_ratio".to_string(),
                    value: hot_ratio.to_string(),
                    reason: "2Q hot_ratio must be in (0.0, 1.0)".to_string(),
                }
                .into());
            }
            Box::new(TwoQ { hot_ratio: *hot_ratio })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(kt: &str, pk: &str, accessed_secs_ago: i64) -> ItemMetadata {
        let now = Utc::now();
        ItemMetadata::new(
            EntityKey::primary(kt, pk),
            now - chrono::Duration::seconds(accessed_secs_ago),
            1,
        )
    }

    #[test]
    fn lru_evicts_the_least_recently_accessed() {
        let strategy = Lru;
        let all = vec![meta("w", "1", 10), meta("w", "2", 100), meta("w", "3", 1)];
        let victim = strategy.select_victim(&all, CurrentSize::default(), SizeLimits::default());
        assert_eq!(victim, Some(EntityKey::primary("w", "2")));
    }

    #[test]
    fn mru_evicts_the_most_recently_accessed() {
        let strategy = Mru;
        let all = vec![meta("w", "1", 10), meta("w", "2", 100), meta("w", "3", 1)];
        let victim = strategy.select_victim(&all, CurrentSize::default(), SizeLimits::default());
        assert_eq!(victim, Some(EntityKey::primary("w", "3")));
    }

    #[test]
    fn ties_break_lexicographically_by_normalized_key() {
        let strategy = Lru;
        let now = Utc::now();
        let all = vec![
            ItemMetadata::new(EntityKey::primary("w", "2"), now, 1),
            ItemMetadata::new(EntityKey::primary("w", "1"), now, 1),
        ];
        let victim = strategy.select_victim(&all, CurrentSize::default(), SizeLimits::default());
        assert_eq!(victim, Some(EntityKey::primary("w", "1")));
    }

    #[test]
    fn select_victim_is_deterministic_given_the_same_snapshot() {
        let strategy = Random;
        let all = vec![meta("w", "1", 10), meta("w", "2", 20), meta("w", "3", 30)];
        let a = strategy.select_victim(&all, CurrentSize::default(), SizeLimits::default());
        let b = strategy.select_victim(&all, CurrentSize::default(), SizeLimits::default());
        assert_eq!(a, b);
    }

    #[test]
    fn eviction_loop_stops_at_a_single_remaining_item() {
        let strategy = Lru;
        let all = vec![meta("w", "1", 10), meta("w", "2", 20)];
        let limits = SizeLimits { max_items: Some(0), max_size_bytes: None };
        let current = CurrentSize { item_count: 2, size_bytes: 0 };
        let victims = evict_until_within_limits(&strategy, all, current, limits, |_| 0);
        assert_eq!(victims.len(), 1);
    }

    #[test]
    fn two_q_without_a_valid_hot_ratio_is_rejected() {
        let result = build_strategy(&EvictionPolicy::TwoQ { hot_ratio: 1.5 });
        assert!(result.is_err());
    }
}
