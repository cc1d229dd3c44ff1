//! Query fingerprints and the query-result storage shape.

use crate::key::{loc_equal, normalize, EntityKey, LocTag};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The kind of listing a query fingerprint was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryKind {
    All,
    One,
    Find,
    FindOne,
    Facet,
    AllFacet,
}

/// The inputs that determine a query fingerprint, pre-canonicalization.
#[derive(Debug, Clone)]
pub struct QueryFingerprintInput {
    pub kind: QueryKind,
    pub finder: Option<String>,
    pub params: Option<serde_json::Value>,
    pub loc: Vec<LocTag>,
}

impl QueryFingerprintInput {
    pub fn new(kind: QueryKind) -> Self {
        Self {
            kind,
            finder: None,
            params: None,
            loc: Vec::new(),
        }
    }

    pub fn with_finder(mut self, finder: impl Into<String>) -> Self {
        self.finder = Some(finder.into());
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_loc(mut self, loc: Vec<LocTag>) -> Self {
        self.loc = loc;
        self
    }

    /// A query is complete when it is an unfiltered, unfaceted `all` over
    /// the whole set: `all` kind, no finder name, no params/filter object.
    pub fn is_complete(&self) -> bool {
        matches!(self.kind, QueryKind::All)
            && self.finder.is_none()
            && self.params.as_ref().map(is_empty_params).unwrap_or(true)
    }
}

fn is_empty_params(v: &serde_json::Value) -> bool {
    match v {
        serde_json::Value::Null => true,
        serde_json::Value::Object(m) => m.is_empty(),
        _ => false,
    }
}

/// Build the canonical JSON form of a query's fingerprint inputs.
/// Canonicalization relies on `serde_json::Map` being `BTreeMap`-backed in
/// this workspace (no `preserve_order` feature anywhere), so every object
/// level, at any depth inside `params`, serializes with lexicographically
/// sorted keys for free.
fn canonical_json(input: &QueryFingerprintInput) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    map.insert(
        "kind".to_string(),
        serde_json::to_value(input.kind).expect("QueryKind always serializes"),
    );
    map.insert(
        "finder".to_string(),
        input
            .finder
            .clone()
            .map(serde_json::Value::String)
            .unwrap_or(serde_json::Value::Null),
    );
    map.insert(
        "params".to_string(),
        input.params.clone().unwrap_or(serde_json::Value::Null),
    );
    let loc_value = serde_json::to_value(
        input
            .loc
            .iter()
            .map(|t| {
                let mut m = serde_json::Map::new();
                m.insert("kt".to_string(), serde_json::Value::String(t.kt.clone()));
                m.insert(
                    "lk".to_string(),
                    serde_json::to_value(&t.lk).expect("Identifier always serializes"),
                );
                serde_json::Value::Object(m)
            })
            .collect::<Vec<_>>(),
    )
    .expect("loc always serializes");
    map.insert("loc".to_string(), loc_value);
    serde_json::Value::Object(map)
}

/// Build the deterministic fingerprint for a query: a SHA-256 digest, hex
/// encoded, of the canonical JSON form of its inputs. Hashing down to a
/// fixed-width digest (rather than using the canonical JSON string itself)
/// keeps the fingerprint a stable, bounded-length key regardless of how
/// large `params` gets.
pub fn fingerprint(input: &QueryFingerprintInput) -> String {
    let canonical = serde_json::to_string(&canonical_json(input))
        .expect("canonical query value is always valid JSON");
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)
}

/// Metadata attached to a query entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryMetadata {
    pub query_type: QueryKind,
    pub is_complete: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub filter: Option<serde_json::Value>,
    pub params: Option<serde_json::Value>,
}

/// The current on-disk shape of a query entry: a list of item keys plus
/// metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryEntry {
    pub item_keys: Vec<EntityKey>,
    pub metadata: QueryMetadata,
}

impl QueryEntry {
    pub fn references(&self, key_hash: &str) -> bool {
        self.item_keys.iter().any(|k| normalize(k) == key_hash)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.metadata.expires_at
    }
}

/// Readers must accept either the current `{itemKeys, metadata}` shape or
/// the legacy bare-array form written by older backends (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryEntryOnDisk {
    Current(QueryEntry),
    Legacy(Vec<EntityKey>),
}

impl QueryEntryOnDisk {
    /// Normalize either on-disk shape into a `QueryEntry`, synthesizing
    /// non-expiring metadata for the legacy bare-array form (it predates
    /// the TTL split and was written when entries did not expire).
    pub fn into_entry(self, now: DateTime<Utc>) -> QueryEntry {
        match self {
            QueryEntryOnDisk::Current(entry) => entry,
            QueryEntryOnDisk::Legacy(item_keys) => QueryEntry {
                item_keys,
                metadata: QueryMetadata {
                    query_type: QueryKind::All,
                    is_complete: true,
                    created_at: now,
                    expires_at: now + chrono::Duration::days(365 * 100),
                    filter: None,
                    params: None,
                },
            },
        }
    }
}

pub fn locations_equal(a: &[LocTag], b: &[LocTag]) -> bool {
    loc_equal(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_with_no_params_is_complete() {
        let input = QueryFingerprintInput::new(QueryKind::All);
        assert!(input.is_complete());
    }

    #[test]
    fn all_with_empty_object_params_is_complete() {
        let input = QueryFingerprintInput::new(QueryKind::All)
            .with_params(serde_json::json!({}));
        assert!(input.is_complete());
    }

    #[test]
    fn find_is_never_complete() {
        let input = QueryFingerprintInput::new(QueryKind::Find).with_finder("byOwner");
        assert!(!input.is_complete());
    }

    #[test]
    fn all_with_nonempty_params_is_partial() {
        let input = QueryFingerprintInput::new(QueryKind::All)
            .with_params(serde_json::json!({ "status": "active" }));
        assert!(!input.is_complete());
    }

    #[test]
    fn fingerprint_is_stable_across_param_insertion_order() {
        let a = QueryFingerprintInput::new(QueryKind::Find)
            .with_finder("byOwner")
            .with_params(serde_json::json!({ "a": 1, "b": 2 }));
        let b = QueryFingerprintInput::new(QueryKind::Find)
            .with_finder("byOwner")
            .with_params(serde_json::json!({ "b": 2, "a": 1 }));
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn fingerprint_differs_on_finder_name() {
        let a = QueryFingerprintInput::new(QueryKind::Find).with_finder("byOwner");
        let b = QueryFingerprintInput::new(QueryKind::Find).with_finder("byTag");
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn legacy_bare_array_deserializes_into_query_entry() {
        let key = EntityKey::primary("widget", "1");
        let legacy = serde_json::to_string(&vec![key.clone()]).unwrap();
        let on_disk: QueryEntryOnDisk = serde_json::from_str(&legacy).unwrap();
        let entry = on_disk.into_entry(Utc::now());
        assert_eq!(entry.item_keys, vec![key]);
        assert!(entry.metadata.is_complete);
    }
}
