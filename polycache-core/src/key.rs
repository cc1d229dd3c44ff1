//! Entity keys and their deterministic normalization.
//!
//! An [`EntityKey`] identifies one cached entity: either a root-level
//! primary key, or a composite key nested under an ordered location path
//! (the chain of parent containers the entity lives under). Identifiers are
//! either strings or numbers; [`normalize`] coerces both to the same string
//! representation so `"123"` and `123` address the same cache slot.

use serde::{Deserialize, Serialize};

/// A `pk`/`lk` identifier: a string, a number, or absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Identifier {
    Str(String),
    Num(f64),
    Null,
}

impl Identifier {
    fn canonical_json(&self) -> serde_json::Value {
        match self {
            Identifier::Null => serde_json::Value::Null,
            Identifier::Str(s) => serde_json::Value::String(s.clone()),
            Identifier::Num(n) => serde_json::Value::String(format_number(*n)),
        }
    }
}

impl From<&str> for Identifier {
    fn from(s: &str) -> Self {
        Identifier::Str(s.to_string())
    }
}

impl From<String> for Identifier {
    fn from(s: String) -> Self {
        Identifier::Str(s)
    }
}

impl From<i64> for Identifier {
    fn from(n: i64) -> Self {
        Identifier::Num(n as f64)
    }
}

impl From<f64> for Identifier {
    fn from(n: f64) -> Self {
        Identifier::Num(n)
    }
}

/// Finite numbers: shortest round-trip decimal, no locale, no trailing `.0`.
fn format_number(n: f64) -> String {
    format!("{n}")
}

/// One element of a composite key's location path: a type tag plus the
/// identifier of the parent container at that level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocTag {
    pub kt: String,
    pub lk: Identifier,
}

impl LocTag {
    pub fn new(kt: impl Into<String>, lk: impl Into<Identifier>) -> Self {
        Self {
            kt: kt.into(),
            lk: lk.into(),
        }
    }

    fn canonical_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert("kt".to_string(), serde_json::Value::String(self.kt.clone()));
        map.insert("lk".to_string(), self.lk.canonical_json());
        serde_json::Value::Object(map)
    }
}

/// Maximum length of a composite key's location path (§3).
pub const MAX_LOCATION_DEPTH: usize = 5;

/// A polymorphic handle identifying one cached entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityKey {
    Primary {
        kt: String,
        pk: Identifier,
    },
    Composite {
        kt: String,
        pk: Identifier,
        loc: Vec<LocTag>,
    },
}

impl EntityKey {
    pub fn primary(kt: impl Into<String>, pk: impl Into<Identifier>) -> Self {
        EntityKey::Primary {
            kt: kt.into(),
            pk: pk.into(),
        }
    }

    pub fn composite(kt: impl Into<String>, pk: impl Into<Identifier>, loc: Vec<LocTag>) -> Self {
        EntityKey::Composite {
            kt: kt.into(),
            pk: pk.into(),
            loc,
        }
    }

    pub fn kt(&self) -> &str {
        match self {
            EntityKey::Primary { kt, .. } => kt,
            EntityKey::Composite { kt, .. } => kt,
        }
    }

    pub fn pk(&self) -> &Identifier {
        match self {
            EntityKey::Primary { pk, .. } => pk,
            EntityKey::Composite { pk, .. } => pk,
        }
    }

    pub fn loc(&self) -> &[LocTag] {
        match self {
            EntityKey::Primary { .. } => &[],
            EntityKey::Composite { loc, .. } => loc,
        }
    }

    fn canonical_json(&self) -> serde_json::Value {
        // serde_json::Map is BTreeMap-backed (the `preserve_order` feature is
        // not enabled anywhere in this workspace), so object keys serialize
        // lexicographically for free.
        let mut map = serde_json::Map::new();
        map.insert("kt".to_string(), serde_json::Value::String(self.kt().to_string()));
        map.insert("pk".to_string(), self.pk().canonical_json());
        if let EntityKey::Composite { loc, .. } = self {
            let arr = loc.iter().map(LocTag::canonical_json).collect();
            map.insert("loc".to_string(), serde_json::Value::Array(arr));
        }
        serde_json::Value::Object(map)
    }
}

/// Build the deterministic normalized string for a key: sorted-key JSON with
/// `pk`/`lk` coerced to their canonical string form.
pub fn normalize(key: &EntityKey) -> String {
    serde_json::to_string(&key.canonical_json()).expect("canonical key value is always valid JSON")
}

/// Compare two location paths element-wise after canonicalizing each tag's
/// `lk` to string (§4.1 `locEqual`).
pub fn loc_equal(a: &[LocTag], b: &[LocTag]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).all(|(x, y)| x.canonical_json() == y.canonical_json())
}
