//! # Canonical Serialization
//!
//! [`CanonicalBytes`] is the only construction path for bytes that feed a
//! digest. Audit entries are hash-chained, so the API process, the CLI, and
//! a database replay must all serialize an entry to the same bytes.
//!
//! ## Coercion Rules
//!
//! 1. Integral floats become integers (`85.0` → `85`), so a risk score sent
//!    as `85` and one computed as `85.0` digest identically.
//! 2. RFC 3339 strings are normalized to UTC with a `Z` suffix, truncated to
//!    seconds.
//! 3. Object keys are sorted lexicographically.
//! 4. Output uses compact separators (no whitespace).

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::CanonicalizationError;

/// Bytes produced exclusively by canonical JSON serialization.
///
/// The inner `Vec<u8>` is private; the only constructor is
/// [`CanonicalBytes::new()`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalBytes(Vec<u8>);

impl CanonicalBytes {
    /// Construct canonical bytes from any serializable value.
    pub fn new(obj: &impl Serialize) -> Result<Self, CanonicalizationError> {
        let value = serde_json::to_value(obj)?;
        let coerced = coerce(value);
        Ok(Self(serde_json::to_vec(&coerced)?))
    }

    /// Access the canonical bytes for digest computation.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume and return the inner byte vector.
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl AsRef<[u8]> for CanonicalBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

fn coerce(value: Value) -> Value {
    match value {
        Value::Number(n) => {
            if n.is_f64() {
                if let Some(f) = n.as_f64() {
                    if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                        return Value::from(f as i64);
                    }
                }
            }
            Value::Number(n)
        }
        Value::Object(map) => {
            // Rebuild through a sorted vector so ordering holds even when
            // serde_json is compiled with `preserve_order`.
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (k, v) in entries {
                sorted.insert(k, coerce(v));
            }
            Value::Object(sorted)
        }
        Value::Array(arr) => Value::Array(arr.into_iter().map(coerce).collect()),
        Value::String(s) => match chrono::DateTime::parse_from_rfc3339(&s) {
            Ok(dt) => Value::String(
                dt.with_timezone(&chrono::Utc)
                    .format("%Y-%m-%dT%H:%M:%SZ")
                    .to_string(),
            ),
            Err(_) => Value::String(s),
        },
        other => other,
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn json_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| serde_json::json!(n)),
            "[a-zA-Z0-9_ ]{0,30}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 32, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,8}", inner, 0..6)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn canonical_bytes_deterministic(value in json_value()) {
            let a = CanonicalBytes::new(&value).unwrap();
            let b = CanonicalBytes::new(&value).unwrap();
            prop_assert_eq!(a.as_bytes(), b.as_bytes());
        }

        #[test]
        fn canonical_bytes_are_valid_json(value in json_value()) {
            let cb = CanonicalBytes::new(&value).unwrap();
            prop_assert!(serde_json::from_slice::<Value>(cb.as_bytes()).is_ok());
        }
    }
}
