//! Cache configuration (§6 "Configuration options").

use crate::error::{ConfigError, PolycacheResult};
use serde::{Deserialize, Serialize};

/// Which backend family a cache instance is backed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheType {
    InMemory,
    BoundedInMemory,
    EmbeddedDb,
    StringStorage,
}

/// Eviction strategy selection (§4.3). 2Q carries its own split-size
/// validation requirement; the other strategies need no extra parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EvictionPolicy {
    Lru,
    Lfu { time_decayed: bool },
    Fifo,
    Mru,
    Random,
    Arc,
    /// `hot_ratio` is the fraction of capacity reserved for the A1 (recency)
    /// queue before items are promoted to Am (frequency); must be in
    /// `(0.0, 1.0)`.
    TwoQ { hot_ratio: f64 },
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        EvictionPolicy::Lru
    }
}

/// Bounds for the bounded in-memory backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub max_items: Option<u64>,
    pub max_size_bytes: Option<u64>,
}

/// Embedded persistent key/value backend identity (§4.2.2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedDbConfig {
    pub db_name: String,
    pub version: u32,
    pub store_name: String,
}

impl Default for EmbeddedDbConfig {
    fn default() -> Self {
        Self {
            db_name: "polycache".to_string(),
            version: 1,
            store_name: "items".to_string(),
        }
    }
}

/// String-keyed persistent storage namespacing (§4.2.2, §6 persisted
/// layout).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebStorageConfig {
    pub key_prefix: String,
    pub compress: bool,
}

impl Default for WebStorageConfig {
    fn default() -> Self {
        Self {
            key_prefix: "polycache".to_string(),
            compress: false,
        }
    }
}

/// The full option table exposed to cache consumers (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheOptions {
    pub cache_type: CacheType,
    pub bypass_cache: bool,
    /// Default per-item TTL in milliseconds; `0` disables the TTL check.
    pub ttl_ms: u64,
    pub memory_config: MemoryConfig,
    pub eviction_policy: EvictionPolicy,
    pub embedded_db_config: EmbeddedDbConfig,
    pub web_storage_config: WebStorageConfig,
    pub auto_sync: bool,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub enable_debug_logging: bool,
    pub query_ttl_ms: u64,
    pub facet_ttl_ms: u64,
    pub item_ttl_ms: u64,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            cache_type: CacheType::InMemory,
            bypass_cache: false,
            ttl_ms: 0,
            memory_config: MemoryConfig::default(),
            eviction_policy: EvictionPolicy::default(),
            embedded_db_config: EmbeddedDbConfig::default(),
            web_storage_config: WebStorageConfig::default(),
            auto_sync: false,
            max_retries: 3,
            retry_delay_ms: 100,
            enable_debug_logging: false,
            query_ttl_ms: 5 * 60 * 1000,
            facet_ttl_ms: 60 * 1000,
            item_ttl_ms: 10 * 60 * 1000,
        }
    }
}

impl CacheOptions {
    pub fn with_cache_type(mut self, cache_type: CacheType) -> Self {
        self.cache_type = cache_type;
        self
    }

    pub fn with_bypass_cache(mut self, bypass: bool) -> Self {
        self.bypass_cache = bypass;
        self
    }

    pub fn with_eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = policy;
        self
    }

    pub fn with_memory_config(mut self, config: MemoryConfig) -> Self {
        self.memory_config = config;
        self
    }

    pub fn with_query_ttl_ms(mut self, ms: u64) -> Self {
        self.query_ttl_ms = ms;
        self
    }

    pub fn with_facet_ttl_ms(mut self, ms: u64) -> Self {
        self.facet_ttl_ms = ms;
        self
    }

    pub fn with_item_ttl_ms(mut self, ms: u64) -> Self {
        self.item_ttl_ms = ms;
        self
    }

    /// Validate the configuration (§4.3 "Configuration validation").
    pub fn validate(&self) -> PolycacheResult<()> {
        if let Some(max_items) = self.memory_config.max_items {
            if max_items == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "memory_config.max_items".to_string(),
                    value: max_items.to_string(),
                    reason: "must be greater than 0 when set".to_string(),
                }
                .into());
            }
        }

        if matches!(self.cache_type, CacheType::BoundedInMemory)
            && self.memory_config.max_items.is_none()
            && self.memory_config.max_size_bytes.is_none()
        {
            return Err(ConfigError::IncompatibleOptions {
                option_a: "cache_type=BoundedInMemory".to_string(),
                option_b: "memory_config.{max_items,max_size_bytes} both unset".to_string(),
            }
            .into());
        }

        if let EvictionPolicy::TwoQ { hot_ratio } = self.eviction_policy {
            if !(hot_ratio > 0.0 && hot_ratio < 1.0) {
                return Err(ConfigError::InvalidValue {
                    field: "eviction_policy.hot_ratio".to_string(),
                    value: hot_ratio.to_string(),
                    reason: "2Q hot_ratio must be in (0.0, 1.0)".to_string(),
                }
                .into());
            }
        }

        if self.max_retries > 0 && self.retry_delay_ms == 0 {
            return Err(ConfigError::IncompatibleOptions {
                option_a: "max_retries > 0".to_string(),
                option_b: "retry_delay_ms = 0".to_string(),
            }
            .into());
        }

        Ok(())
    }
}
