//! The cache event shape (§4.7 "Event shape").

use chrono::{DateTime, Utc};
use polycache_core::{EntityKey, LocTag};
use serde::Serialize;

/// The kind of cache event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ItemCreated,
    ItemUpdated,
    ItemRemoved,
    ItemsQueried,
    CacheHit,
    CacheMiss,
    CacheCleared,
    QueryInvalidated,
    LocationInvalidated,
}

/// Who caused the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Api,
    Cache,
    External,
}

/// A typed cache event dispatched by the [`crate::bus::EventBus`].
#[derive(Debug, Clone, Serialize)]
pub struct CacheEvent<T> {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub source: EventSource,
    pub key: Option<EntityKey>,
    pub item: Option<T>,
    pub previous: Option<T>,
    pub affected_locations: Option<Vec<Vec<LocTag>>>,
}

impl<T> CacheEvent<T> {
    pub fn new(event_type: EventType, timestamp: DateTime<Utc>, source: EventSource) -> Self {
        Self {
            event_type,
            timestamp,
            source,
            key: None,
            item: None,
            previous: None,
            affected_locations: None,
        }
    }

    pub fn with_key(mut self, key: EntityKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_item(mut self, item: T) -> Self {
        self.item = Some(item);
        self
    }

    pub fn with_previous(mut self, previous: T) -> Self {
        self.previous = Some(previous);
        self
    }

    pub fn with_affected_locations(mut self, locations: Vec<Vec<LocTag>>) -> Self {
        self.affected_locations = Some(locations);
        self
    }
}
