//! Cache key definitions.
//!
//! A [`CacheKey`] is an ordered list of segments describing a resource path,
//! e.g. `["documents", "list", {"status": "active"}]`. Keys compare by their
//! canonical serialization, so two keys built from structurally equal inputs
//! are always equal regardless of object field order.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Raised when a key cannot be built. These are programmer errors and are
/// never stored on a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("cache key must contain at least one segment")]
    Empty,
    #[error("failed to serialize key segment: {0}")]
    Serialize(String),
}

/// A single key segment.
#[derive(Debug, Clone)]
pub enum KeySegment {
    Str(String),
    Int(i64),
    /// Any plain serializable value (filters, pagination, ...).
    Object(Value),
}

impl KeySegment {
    /// Build an object segment from any serializable value.
    pub fn object<T: Serialize + ?Sized>(value: &T) -> Result<Self, KeyError> {
        serde_json::to_value(value)
            .map(Self::Object)
            .map_err(|err| KeyError::Serialize(err.to_string()))
    }

    /// Deterministic serialization of this segment.
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        match self {
            Self::Str(value) => out.push_str(&Value::String(value.clone()).to_string()),
            Self::Int(value) => out.push_str(&value.to_string()),
            Self::Object(value) => write_canonical(value, &mut out),
        }
        out
    }
}

impl From<&str> for KeySegment {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for KeySegment {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<&String> for KeySegment {
    fn from(value: &String) -> Self {
        Self::Str(value.clone())
    }
}

impl From<i64> for KeySegment {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for KeySegment {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for KeySegment {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<Uuid> for KeySegment {
    fn from(value: Uuid) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<Value> for KeySegment {
    fn from(value: Value) -> Self {
        Self::Object(value)
    }
}

/// Write `value` as compact JSON with object keys sorted at every depth.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            out.push('{');
            for (index, (name, item)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(name.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Hierarchical identifier of a cached resource.
///
/// Equality, hashing and ordering use the canonical segment strings only.
#[derive(Clone)]
pub struct CacheKey {
    segments: Vec<KeySegment>,
    canonical: Vec<String>,
}

impl CacheKey {
    /// Start a key from its first segment, usually the resource domain.
    pub fn root(segment: impl Into<KeySegment>) -> Self {
        let segment = segment.into();
        Self {
            canonical: vec![segment.canonical()],
            segments: vec![segment],
        }
    }

    /// Build a key from a non-empty list of segments.
    pub fn from_segments<I, S>(segments: I) -> Result<Self, KeyError>
    where
        I: IntoIterator<Item = S>,
        S: Into<KeySegment>,
    {
        let segments: Vec<KeySegment> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(KeyError::Empty);
        }
        let canonical = segments.iter().map(KeySegment::canonical).collect();
        Ok(Self {
            segments,
            canonical,
        })
    }

    /// Append a segment.
    #[must_use]
    pub fn push(mut self, segment: impl Into<KeySegment>) -> Self {
        let segment = segment.into();
        self.canonical.push(segment.canonical());
        self.segments.push(segment);
        self
    }

    /// Append a serializable object segment.
    pub fn with_object<T: Serialize + ?Sized>(self, value: &T) -> Result<Self, KeyError> {
        Ok(self.push(KeySegment::object(value)?))
    }

    pub fn segments(&self) -> &[KeySegment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Always false: keys have at least one segment.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Key without its last segment, or `None` for a single-segment key.
    pub fn parent(&self) -> Option<Self> {
        if self.segments.len() < 2 {
            return None;
        }
        let end = self.segments.len() - 1;
        Some(Self {
            segments: self.segments[..end].to_vec(),
            canonical: self.canonical[..end].to_vec(),
        })
    }

    /// True when `prefix` matches the leading segments of this key.
    ///
    /// Matching is segment-wise: `["a", "b"]` is a prefix of
    /// `["a", "b", 1]` but not of `["a", "bc"]`.
    pub fn starts_with(&self, prefix: &CacheKey) -> bool {
        self.canonical.starts_with(&prefix.canonical)
    }

    pub(crate) fn canonical_segments(&self) -> &[String] {
        &self.canonical
    }

    /// Canonical serialization of the whole key.
    pub fn canonical(&self) -> String {
        format!("[{}]", self.canonical.join(","))
    }
}

/// Canonical string form used for equality and logging.
pub fn canonicalize(key: &CacheKey) -> String {
    key.canonical()
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl PartialOrd for CacheKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CacheKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical.cmp(&other.canonical)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.canonical())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::hash_map::DefaultHasher;

    use serde_json::json;

    use super::*;

    fn hash_of(key: &CacheKey) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn object_field_order_does_not_matter() {
        let a = CacheKey::root("documents")
            .push("list")
            .push(json!({"status": "active", "page": 2, "sort": {"by": "name", "dir": "asc"}}));
        let b = CacheKey::root("documents")
            .push("list")
            .push(json!({"sort": {"dir": "asc", "by": "name"}, "page": 2, "status": "active"}));

        assert_eq!(a, b);
        assert_eq!(canonicalize(&a), canonicalize(&b));
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn canonical_form_is_stable() {
        let key = CacheKey::root("documents")
            .push("list")
            .push(json!({"z": [3, 1], "a": null, "m": "x\"y"}));

        insta::assert_snapshot!(
            canonicalize(&key),
            @r#"["documents","list",{"a":null,"m":"x\"y","z":[3,1]}]"#
        );
    }

    #[test]
    fn array_order_is_significant() {
        let a = CacheKey::root("tags").push(json!(["a", "b"]));
        let b = CacheKey::root("tags").push(json!(["b", "a"]));
        assert_ne!(a, b);
    }

    #[test]
    fn string_and_integer_segments_differ() {
        let text = CacheKey::root("docs").push("detail").push("42");
        let number = CacheKey::root("docs").push("detail").push(42);
        assert_ne!(text, number);
        assert_eq!(number, CacheKey::root("docs").push("detail").push(json!(42)));
    }

    #[test]
    fn prefix_matching_is_segment_wise() {
        let prefix = CacheKey::root("documents").push("list");
        let child = CacheKey::root("documents")
            .push("list")
            .push(json!({"status": "active"}));
        let lookalike = CacheKey::root("documents").push("lists");
        let other = CacheKey::root("folders").push("list");

        assert!(child.starts_with(&prefix));
        assert!(prefix.starts_with(&prefix));
        assert!(!lookalike.starts_with(&prefix));
        assert!(!other.starts_with(&prefix));
        assert!(!prefix.starts_with(&child));
    }

    #[test]
    fn empty_key_is_rejected() {
        let err = CacheKey::from_segments(Vec::<KeySegment>::new()).unwrap_err();
        assert_eq!(err, KeyError::Empty);
    }

    #[test]
    fn parent_drops_last_segment() {
        let key = CacheKey::from_segments(["docs", "detail", "42"]).expect("valid key");
        let parent = key.parent().expect("has parent");
        assert_eq!(parent, CacheKey::from_segments(["docs", "detail"]).expect("valid key"));
        assert!(CacheKey::root("docs").parent().is_none());
    }

    #[test]
    fn with_object_serializes_structs() {
        #[derive(Serialize)]
        struct Filters {
            status: &'static str,
            page: u32,
        }

        let key = CacheKey::root("workflows")
            .push("list")
            .with_object(&Filters {
                status: "running",
                page: 1,
            })
            .expect("serializable filters");

        assert_eq!(
            key,
            CacheKey::root("workflows")
                .push("list")
                .push(json!({"page": 1, "status": "running"}))
        );
    }

    #[test]
    fn ordering_groups_prefixes_together() {
        let mut keys = vec![
            CacheKey::from_segments(["b"]).expect("valid"),
            CacheKey::from_segments(["a", "z"]).expect("valid"),
            CacheKey::from_segments(["a"]).expect("valid"),
            CacheKey::from_segments(["a", "b"]).expect("valid"),
        ];
        keys.sort();
        let rendered: Vec<String> = keys.iter().map(canonicalize).collect();
        assert_eq!(rendered, vec![r#"["a"]"#, r#"["a","b"]"#, r#"["a","z"]"#, r#"["b"]"#]);
    }
}
