//! TTL manager (§4.4): a default time-to-live plus per-key overrides.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

/// Holds a default TTL (milliseconds) and a per-key override map.
///
/// `ttl_ms = 0` disables caching for that read entirely; a missing
/// `timestamp` on the entry being checked is always treated as non-expiring
/// (legacy-entry policy), which is why [`TtlManager::is_expired`] takes an
/// `Option<DateTime<Utc>>` rather than requiring one.
pub struct TtlManager {
    default_ttl_ms: u64,
    overrides: RwLock<HashMap<String, u64>>,
}

impl TtlManager {
    pub fn new(default_ttl_ms: u64) -> Self {
        Self { default_ttl_ms, overrides: RwLock::new(HashMap::new()) }
    }

    pub fn set_override(&self, key: impl Into<String>, ttl_ms: u64) {
        self.overrides.write().expect("ttl overrides lock poisoned").insert(key.into(), ttl_ms);
    }

    pub fn clear_override(&self, key: &str) {
        self.overrides.write().expect("ttl overrides lock poisoned").remove(key);
    }

    /// The override for `key`, or the default if none was set.
    pub fn get_ttl(&self, key: &str) -> u64 {
        self.overrides
            .read()
            .expect("ttl overrides lock poisoned")
            .get(key)
            .copied()
            .unwrap_or(self.default_ttl_ms)
    }

    /// Whether an entry with the given `timestamp` (if any) has expired for
    /// `key`, as of `now`. `ttl=0` means "disabled": every read is treated
    /// as a miss. A missing timestamp never expires.
    pub fn is_expired(&self, key: &str, timestamp: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let ttl_ms = self.get_ttl(key);
        if ttl_ms == 0 {
            return true;
        }
        let Some(timestamp) = timestamp else { return false };
        let age = now.signed_duration_since(timestamp);
        age.num_milliseconds() >= ttl_ms as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn get_ttl_falls_back_to_default_without_an_override() {
        let manager = TtlManager::new(1000);
        assert_eq!(manager.get_ttl("widget:1"), 1000);
    }

    #[test]
    fn per_key_override_takes_precedence_over_the_default() {
        let manager = TtlManager::new(1000);
        manager.set_override("widget:1", 50);
        assert_eq!(manager.get_ttl("widget:1"), 50);
        assert_eq!(manager.get_ttl("widget:2"), 1000);
    }

    #[test]
    fn zero_ttl_disables_caching_regardless_of_age() {
        let manager = TtlManager::new(0);
        let now = Utc::now();
        assert!(manager.is_expired("widget:1", Some(now), now));
    }

    #[test]
    fn missing_timestamp_never_expires() {
        let manager = TtlManager::new(50);
        assert!(!manager.is_expired("widget:1", None, Utc::now()));
    }

    #[test]
    fn entry_older_than_ttl_is_expired() {
        let manager = TtlManager::new(50);
        let stored = Utc::now() - Duration::milliseconds(60);
        assert!(manager.is_expired("widget:1", Some(stored), Utc::now()));
    }

    #[test]
    fn entry_within_ttl_is_not_expired() {
        let manager = TtlManager::new(1000);
        let stored = Utc::now() - Duration::milliseconds(10);
        assert!(!manager.is_expired("widget:1", Some(stored), Utc::now()));
    }

    #[test]
    fn clearing_an_override_restores_the_default() {
        let manager = TtlManager::new(1000);
        manager.set_override("widget:1", 50);
        manager.clear_override("widget:1");
        assert_eq!(manager.get_ttl("widget:1"), 1000);
    }
}
