//! Query keys and their canonical fingerprints.

use std::fmt::{self, Debug, Display};
use std::hash::{Hash, Hasher};

use serde::{Serialize, Serializer};
use serde_json::{Number, Value};
use thiserror::Error;

/// Errors raised while building a [`QueryKey`] from arbitrary serializable data.
#[derive(Debug, Error)]
pub enum KeyError {
    /// A key part could not be converted into JSON.
    #[error("query key could not be serialized: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The value did not serialize to a JSON array.
    #[error("query key must serialize to a JSON array, got {found}")]
    NotAnArray {
        /// The JSON kind that was produced instead.
        found: &'static str,
    },
}

/// Structured cache key: an ordered sequence of JSON values.
///
/// Two keys are the same cache slot iff their [fingerprints](QueryKey::fingerprint)
/// match. Object members are compared without regard to order, sequence members
/// in order.
///
/// ```
/// use query_cache::query_key;
///
/// let a = query_key!["todos", { "page": 1, "status": "done" }];
/// let b = query_key!["todos", { "status": "done", "page": 1 }];
/// assert_eq!(a, b);
/// assert!(a.matches_prefix(&query_key!["todos"]));
/// ```
#[derive(Clone)]
pub struct QueryKey {
    parts: Vec<Value>,
    fingerprint: String,
}

impl QueryKey {
    /// Create a key from its parts.
    pub fn new(parts: impl IntoIterator<Item = Value>) -> Self {
        let parts: Vec<Value> = parts.into_iter().collect();
        let fingerprint = fingerprint_parts(&parts);
        Self { parts, fingerprint }
    }

    /// Create a key from any value that serializes to a JSON array.
    pub fn from_serialize<S: Serialize + ?Sized>(value: &S) -> Result<Self, KeyError> {
        match serde_json::to_value(value)? {
            Value::Array(parts) => Ok(Self::new(parts)),
            other => Err(KeyError::NotAnArray {
                found: kind_name(&other),
            }),
        }
    }

    /// Return a new key with `part` appended.
    #[must_use]
    pub fn with(&self, part: impl Into<Value>) -> Self {
        let mut parts = self.parts.clone();
        parts.push(part.into());
        Self::new(parts)
    }

    /// The ordered key parts.
    pub fn parts(&self) -> &[Value] {
        &self.parts
    }

    /// Canonical string identity of this key.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Returns `true` if `partial` is a prefix of this key.
    ///
    /// Sequence parts must match position by position; an object part matches
    /// when every member present in the partial object matches recursively.
    pub fn matches_prefix(&self, partial: &QueryKey) -> bool {
        partial.parts.len() <= self.parts.len()
            && self
                .parts
                .iter()
                .zip(&partial.parts)
                .all(|(value, partial)| partial_match(value, partial))
    }
}

/// Compute the fingerprint of a sequence of key parts.
pub fn fingerprint_parts(parts: &[Value]) -> String {
    let mut out = String::new();
    write_sequence(parts, &mut out);
    out
}

/// Structural partial match of `value` against `partial`.
pub fn partial_match(value: &Value, partial: &Value) -> bool {
    match (value, partial) {
        (Value::Object(value), Value::Object(partial)) => partial.iter().all(|(name, expected)| {
            value
                .get(name)
                .is_some_and(|actual| partial_match(actual, expected))
        }),
        (Value::Array(value), Value::Array(partial)) => {
            partial.len() <= value.len()
                && value
                    .iter()
                    .zip(partial)
                    .all(|(actual, expected)| partial_match(actual, expected))
        }
        (Value::Number(value), Value::Number(partial)) => {
            canonical_number(value) == canonical_number(partial)
        }
        (value, partial) => value == partial,
    }
}

// Integral floats are written as integers, so `1.0` and `1` name one key.
fn canonical_number(number: &Number) -> String {
    const EXACT: f64 = 9_007_199_254_740_992.0;
    match number.as_f64() {
        Some(float) if number.is_f64() && float.fract() == 0.0 && float.abs() < EXACT => {
            (float as i64).to_string()
        }
        _ => number.to_string(),
    }
}

fn write_sequence(items: &[Value], out: &mut String) {
    out.push('[');
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_canonical(item, out);
    }
    out.push(']');
}

// Object members are emitted in sorted order regardless of how the map
// implementation stores them.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut members: Vec<_> = map.iter().collect();
            members.sort_by(|(a, _), (b, _)| a.cmp(b));
            out.push('{');
            for (i, (name, member)) in members.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(name.clone()).to_string());
                out.push(':');
                write_canonical(member, out);
            }
            out.push('}');
        }
        Value::Array(items) => write_sequence(items, out),
        Value::Number(number) => out.push_str(&canonical_number(number)),
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

impl Debug for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryKey({})", self.fingerprint)
    }
}

impl Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fingerprint)
    }
}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fingerprint.hash(state);
    }
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint
    }
}

impl Eq for QueryKey {}

impl Serialize for QueryKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.parts.serialize(serializer)
    }
}

impl From<Vec<Value>> for QueryKey {
    fn from(parts: Vec<Value>) -> Self {
        Self::new(parts)
    }
}

/// A JSON array becomes the key parts; any other value becomes a single part.
impl From<Value> for QueryKey {
    fn from(value: Value) -> Self {
        match value {
            Value::Array(parts) => Self::new(parts),
            other => Self::new([other]),
        }
    }
}

impl From<&str> for QueryKey {
    fn from(part: &str) -> Self {
        Self::new([Value::from(part)])
    }
}

impl From<String> for QueryKey {
    fn from(part: String) -> Self {
        Self::new([Value::from(part)])
    }
}

/// Build a [`QueryKey`] from JSON literal parts.
///
/// ```
/// use query_cache::query_key;
///
/// let key = query_key!["todo", 5, { "preview": true }];
/// assert_eq!(key.parts().len(), 3);
/// ```
#[macro_export]
macro_rules! query_key {
    ($($part:tt)*) => {
        $crate::QueryKey::from($crate::__private::serde_json::json!([$($part)*]))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fingerprint_ignores_object_member_order() {
        let a = QueryKey::new([json!("todos"), json!({"a": 1, "b": {"x": [1, 2], "y": null}})]);
        let b = QueryKey::new([json!("todos"), json!({"b": {"y": null, "x": [1, 2]}, "a": 1})]);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_respects_sequence_order() {
        let a = QueryKey::new([json!("a"), json!("b")]);
        let b = QueryKey::new([json!("b"), json!("a")]);
        assert_ne!(a, b);

        let nested_a = QueryKey::new([json!([1, 2])]);
        let nested_b = QueryKey::new([json!([2, 1])]);
        assert_ne!(nested_a, nested_b);
    }

    #[test]
    fn test_fingerprint_distinguishes_types() {
        let string = QueryKey::new([json!("1")]);
        let number = QueryKey::new([json!(1)]);
        assert_ne!(string, number);
        assert_eq!(string.fingerprint(), r#"["1"]"#);
        assert_eq!(number.fingerprint(), "[1]");
    }

    #[test]
    fn test_fingerprint_integral_floats_match_integers() {
        assert_eq!(query_key![1], query_key![1.0]);
        assert_eq!(query_key![{"page": 2.0}].fingerprint(), r#"[{"page":2}]"#);
        assert_eq!(query_key![-0.0].fingerprint(), "[0]");
        assert_ne!(query_key![1], query_key![1.5]);
        assert!(query_key!["todos", {"page": 2}].matches_prefix(&query_key!["todos", {"page": 2.0}]));
    }

    #[test]
    fn test_fingerprint_escapes_member_names() {
        let key = QueryKey::new([json!({"a\"b": 1})]);
        assert_eq!(key.fingerprint(), r#"[{"a\"b":1}]"#);
    }

    #[test]
    fn test_prefix_matching() {
        let key = query_key!["todos", {"status": "done", "page": 2}, 7];
        assert!(key.matches_prefix(&query_key![]));
        assert!(key.matches_prefix(&query_key!["todos"]));
        assert!(key.matches_prefix(&query_key!["todos", {"page": 2}]));
        assert!(key.matches_prefix(&key.clone()));
        assert!(!key.matches_prefix(&query_key!["todos", {"page": 3}]));
        assert!(!key.matches_prefix(&query_key!["todo"]));
        assert!(!query_key!["todos"].matches_prefix(&key));
    }

    #[test]
    fn test_partial_match_arrays_as_prefixes() {
        assert!(partial_match(&json!([1, 2, 3]), &json!([1, 2])));
        assert!(!partial_match(&json!([1, 2]), &json!([1, 2, 3])));
        assert!(!partial_match(&json!([1, 2]), &json!({"0": 1})));
    }

    #[test]
    fn test_from_serialize() {
        #[derive(Serialize)]
        struct Page(&'static str, u32);

        let key = QueryKey::from_serialize(&Page("todos", 3)).unwrap();
        assert_eq!(key, query_key!["todos", 3]);

        let err = QueryKey::from_serialize(&"todos").unwrap_err();
        assert!(matches!(err, KeyError::NotAnArray { found: "a string" }));
    }

    #[test]
    fn test_conversions() {
        assert_eq!(QueryKey::from("todos"), query_key!["todos"]);
        assert_eq!(QueryKey::from(json!(["a", 1])), query_key!["a", 1]);
        assert_eq!(QueryKey::from(json!(5)), query_key![5]);
        assert_eq!(query_key!["a"].with(1), query_key!["a", 1]);
        assert_eq!(query_key![-1, 2.5], QueryKey::new([json!(-1), json!(2.5)]));
    }
}
