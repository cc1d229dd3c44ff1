//! Subscription filters (§4.7 "Subscription filtering").

use crate::event::{CacheEvent, EventType};
use polycache_core::{loc_equal, normalize, EntityKey, LocTag};
use std::sync::Arc;

/// Options a subscriber provides when calling `subscribe` (§3
/// "Subscription").
#[derive(Clone)]
pub struct SubscriptionOptions<T> {
    pub event_types: Option<Vec<EventType>>,
    pub keys: Option<Vec<EntityKey>>,
    pub locations: Option<Vec<Vec<LocTag>>>,
    pub query: Option<Arc<dyn Fn(&T) -> bool + Send + Sync>>,
    pub use_weak_ref: bool,
    pub debounce_ms: Option<u64>,
}

impl<T> Default for SubscriptionOptions<T> {
    fn default() -> Self {
        Self {
            event_types: None,
            keys: None,
            locations: None,
            query: None,
            use_weak_ref: false,
            debounce_ms: None,
        }
    }
}

impl<T> SubscriptionOptions<T> {
    pub fn with_event_types(mut self, types: Vec<EventType>) -> Self {
        self.event_types = Some(types);
        self
    }

    pub fn with_keys(mut self, keys: Vec<EntityKey>) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn with_locations(mut self, locations: Vec<Vec<LocTag>>) -> Self {
        self.locations = Some(locations);
        self
    }

    pub fn with_query(mut self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.query = Some(Arc::new(predicate));
        self
    }

    pub fn with_weak_ref(mut self, use_weak_ref: bool) -> Self {
        self.use_weak_ref = use_weak_ref;
        self
    }

    pub fn with_debounce_ms(mut self, debounce_ms: u64) -> Self {
        self.debounce_ms = Some(debounce_ms);
        self
    }

    /// An event is delivered iff every filter the subscriber provided
    /// matches; omitted filters are not constraints.
    pub fn matches(&self, event: &CacheEvent<T>) -> bool
    where
        T: Clone,
    {
        if let Some(types) = &self.event_types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }

        if let Some(keys) = &self.keys {
            let event_hash = event.key.as_ref().map(normalize);
            let hit = event_hash
                .as_ref()
                .map(|h| keys.iter().any(|k| &normalize(k) == h))
                .unwrap_or(false);
            if !hit {
                return false;
            }
        }

        if let Some(locations) = &self.locations {
            let affected = event.affected_locations.as_deref().unwrap_or(&[]);
            let hit = locations
                .iter()
                .any(|sub_loc| affected.iter().any(|ev_loc| loc_equal(sub_loc, ev_loc)));
            if !hit {
                return false;
            }
        }

        if let Some(predicate) = &self.query {
            let hit = event.item.as_ref().map(|item| predicate(item)).unwrap_or(false);
            if !hit {
                return false;
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventSource;
    use chrono::Utc;

    fn event(event_type: EventType, key: Option<EntityKey>) -> CacheEvent<i32> {
        let mut e = CacheEvent::new(event_type, Utc::now(), EventSource::Cache);
        if let Some(k) = key {
            e = e.with_key(k);
        }
        e
    }

    #[test]
    fn no_filters_matches_everything() {
        let opts = SubscriptionOptions::<i32>::default();
        assert!(opts.matches(&event(EventType::ItemCreated, None)));
    }

    #[test]
    fn event_type_filter_excludes_non_members() {
        let opts = SubscriptionOptions::<i32>::default()
            .with_event_types(vec![EventType::ItemCreated]);
        assert!(opts.matches(&event(EventType::ItemCreated, None)));
        assert!(!opts.matches(&event(EventType::ItemRemoved, None)));
    }

    #[test]
    fn key_filter_uses_normalized_equality() {
        let key_a = EntityKey::primary("widget", "1");
        let key_b = EntityKey::primary("widget", 1i64);
        let opts = SubscriptionOptions::<i32>::default().with_keys(vec![key_a]);
        assert!(opts.matches(&event(EventType::ItemUpdated, Some(key_b))));
    }

    #[test]
    fn key_filter_rejects_events_with_no_key() {
        let key_a = EntityKey::primary("widget", "1");
        let opts = SubscriptionOptions::<i32>::default().with_keys(vec![key_a]);
        assert!(!opts.matches(&event(EventType::CacheCleared, None)));
    }

    #[test]
    fn query_filter_inspects_the_event_item() {
        let opts = SubscriptionOptions::<i32>::default().with_query(|n: &i32| *n > 10);
        let mut low = event(EventType::ItemCreated, None);
        low.item = Some(5);
        let mut high = event(EventType::ItemCreated, None);
        high.item = Some(20);
        assert!(!opts.matches(&low));
        assert!(opts.matches(&high));
    }
}
