//! Shard key values and the total order over them
//!
//! Every bound comparison in the system goes through the `Ord` implementation
//! of [`KeyValue`] / [`ShardKey`]:
//!
//! `MinKey < numbers < strings < MaxKey`
//!
//! Numbers are compared by their real value regardless of representation
//! (`Int(1) == Double(1.0)`, `Double(-0.0) == Int(0)`), strings by code point.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Shard key errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("Incomparable keys {left} and {right}: field count differs")]
    Incomparable { left: String, right: String },
    #[error("Unsupported shard key value for field '{field}': {reason}")]
    UnsupportedType { field: String, reason: String },
    #[error("Document is missing shard key field '{0}'")]
    MissingField(String),
    #[error("Invalid shard key pattern: {0}")]
    InvalidPattern(String),
}

/// 2^63 as f64, the first double above every i64
const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;

/// A single shard key field value
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum KeyValue {
    MinKey,
    Int(i64),
    Double(f64),
    String(String),
    MaxKey,
}

impl KeyValue {
    /// Build a double value, rejecting NaN (it has no place in a total order)
    pub fn double(field: &str, value: f64) -> Result<Self, KeyError> {
        if value.is_nan() {
            return Err(KeyError::UnsupportedType {
                field: field.to_string(),
                reason: "NaN".to_string(),
            });
        }
        Ok(KeyValue::Double(value))
    }

    /// Convert a JSON value into a key value.
    ///
    /// `{"$minKey": 1}` and `{"$maxKey": 1}` denote the sentinels.
    pub fn from_json(field: &str, value: &Value) -> Result<Self, KeyError> {
        match value {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(KeyValue::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Self::double(field, f)
                } else {
                    Err(KeyError::UnsupportedType {
                        field: field.to_string(),
                        reason: format!("number {} out of range", n),
                    })
                }
            }
            Value::String(s) => Ok(KeyValue::String(s.clone())),
            Value::Object(map) if map.len() == 1 && map.contains_key("$minKey") => {
                Ok(KeyValue::MinKey)
            }
            Value::Object(map) if map.len() == 1 && map.contains_key("$maxKey") => {
                Ok(KeyValue::MaxKey)
            }
            other => Err(KeyError::UnsupportedType {
                field: field.to_string(),
                reason: format!("{} values cannot be shard keys", json_type_name(other)),
            }),
        }
    }

    /// JSON form used by the admin API
    pub fn to_json(&self) -> Value {
        match self {
            KeyValue::MinKey => serde_json::json!({ "$minKey": 1 }),
            KeyValue::MaxKey => serde_json::json!({ "$maxKey": 1 }),
            KeyValue::Int(i) => Value::from(*i),
            KeyValue::Double(f) => Value::from(*f),
            KeyValue::String(s) => Value::from(s.clone()),
        }
    }

    pub fn is_sentinel(&self) -> bool {
        matches!(self, KeyValue::MinKey | KeyValue::MaxKey)
    }

    fn type_rank(&self) -> u8 {
        match self {
            KeyValue::MinKey => 0,
            KeyValue::Int(_) | KeyValue::Double(_) => 1,
            KeyValue::String(_) => 2,
            KeyValue::MaxKey => 3,
        }
    }

    /// 64-bit hash of the value, used for hashed shard keys.
    ///
    /// Integral doubles hash like the equal integer so `1` and `1.0` land in
    /// the same chunk.
    pub fn hashed(&self) -> i64 {
        let mut hasher = Sha256::new();
        match self {
            KeyValue::MinKey => hasher.update([0u8]),
            KeyValue::Int(i) => {
                hasher.update([1u8]);
                hasher.update(i.to_le_bytes());
            }
            KeyValue::Double(f) => {
                if f.fract() == 0.0 && *f >= -TWO_POW_63 && *f < TWO_POW_63 {
                    hasher.update([1u8]);
                    hasher.update((*f as i64).to_le_bytes());
                } else {
                    hasher.update([2u8]);
                    hasher.update(f.to_bits().to_le_bytes());
                }
            }
            KeyValue::String(s) => {
                hasher.update([3u8]);
                hasher.update(s.as_bytes());
            }
            KeyValue::MaxKey => hasher.update([4u8]),
        }
        let digest = hasher.finalize();
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        i64::from_le_bytes(prefix)
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// NaN never gets past [`KeyValue::double`]; it would sort below every number.
fn compare_doubles(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

/// Exact comparison of an integer against a double, without the precision
/// loss of casting the integer to f64.
fn compare_int_double(i: i64, d: f64) -> Ordering {
    if d.is_nan() {
        return Ordering::Greater;
    }
    if d >= TWO_POW_63 {
        return Ordering::Less;
    }
    if d < -TWO_POW_63 {
        return Ordering::Greater;
    }
    let whole = d.trunc();
    match i.cmp(&(whole as i64)) {
        Ordering::Equal => {
            let frac = d - whole;
            if frac > 0.0 {
                Ordering::Less
            } else if frac < 0.0 {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        }
        ord => ord,
    }
}

impl Ord for KeyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.type_rank().cmp(&other.type_rank()) {
            Ordering::Equal => {}
            ord => return ord,
        }
        match (self, other) {
            (KeyValue::Int(a), KeyValue::Int(b)) => a.cmp(b),
            (KeyValue::Double(a), KeyValue::Double(b)) => compare_doubles(*a, *b),
            (KeyValue::Int(a), KeyValue::Double(b)) => compare_int_double(*a, *b),
            (KeyValue::Double(a), KeyValue::Int(b)) => compare_int_double(*b, *a).reverse(),
            // UTF-8 byte order is code point order
            (KeyValue::String(a), KeyValue::String(b)) => a.as_bytes().cmp(b.as_bytes()),
            _ => Ordering::Equal,
        }
    }
}

impl PartialOrd for KeyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for KeyValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for KeyValue {}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::MinKey => write!(f, "MinKey"),
            KeyValue::MaxKey => write!(f, "MaxKey"),
            KeyValue::Int(i) => write!(f, "{}", i),
            KeyValue::Double(d) => write!(f, "{:?}", d),
            KeyValue::String(s) => write!(f, "{:?}", s),
        }
    }
}

/// A full shard key: one value per field of the key pattern
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardKey(pub Vec<KeyValue>);

impl ShardKey {
    pub fn new(values: Vec<KeyValue>) -> Self {
        Self(values)
    }

    /// Single-field key
    pub fn single(value: KeyValue) -> Self {
        Self(vec![value])
    }

    /// The global minimum for a key with `width` fields
    pub fn min(width: usize) -> Self {
        Self(vec![KeyValue::MinKey; width])
    }

    /// The global maximum for a key with `width` fields
    pub fn max(width: usize) -> Self {
        Self(vec![KeyValue::MaxKey; width])
    }

    pub fn width(&self) -> usize {
        self.0.len()
    }

    pub fn values(&self) -> &[KeyValue] {
        &self.0
    }

    pub fn is_global_min(&self) -> bool {
        self.0.iter().all(|v| matches!(v, KeyValue::MinKey))
    }

    pub fn is_global_max(&self) -> bool {
        self.0.iter().all(|v| matches!(v, KeyValue::MaxKey))
    }

    /// Compare two keys, failing when their field counts differ.
    pub fn try_cmp(&self, other: &ShardKey) -> Result<Ordering, KeyError> {
        if self.width() != other.width() {
            return Err(KeyError::Incomparable {
                left: self.to_string(),
                right: other.to_string(),
            });
        }
        Ok(self.cmp(other))
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ ")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, " }}")
    }
}

/// How a single shard key field is derived from a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Ascending,
    Hashed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyField {
    pub name: String,
    pub kind: FieldKind,
}

/// Shard key pattern, e.g. `{a: 1}` or `{a: "hashed"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPattern {
    fields: Vec<KeyField>,
}

impl KeyPattern {
    pub fn new(fields: Vec<KeyField>) -> Result<Self, KeyError> {
        if fields.is_empty() {
            return Err(KeyError::InvalidPattern("pattern has no fields".into()));
        }
        let hashed = fields.iter().filter(|f| f.kind == FieldKind::Hashed).count();
        if hashed > 1 {
            return Err(KeyError::InvalidPattern(
                "at most one hashed field is allowed".into(),
            ));
        }
        for (i, field) in fields.iter().enumerate() {
            if field.name.is_empty() || field.name.starts_with('$') {
                return Err(KeyError::InvalidPattern(format!(
                    "invalid field name '{}'",
                    field.name
                )));
            }
            if fields[..i].iter().any(|f| f.name == field.name) {
                return Err(KeyError::InvalidPattern(format!(
                    "duplicate field '{}'",
                    field.name
                )));
            }
        }
        Ok(Self { fields })
    }

    /// Parse `{"a": 1, "b": "hashed"}` (field order is significant)
    pub fn from_json(spec: &Value) -> Result<Self, KeyError> {
        let map = spec
            .as_object()
            .ok_or_else(|| KeyError::InvalidPattern(format!("expected an object, got {}", spec)))?;
        let mut fields = Vec::with_capacity(map.len());
        for (name, kind) in map {
            let kind = match kind {
                Value::Number(n) if n.as_f64() == Some(1.0) => FieldKind::Ascending,
                Value::String(s) if s == "hashed" => FieldKind::Hashed,
                other => {
                    return Err(KeyError::InvalidPattern(format!(
                        "field '{}' has unsupported direction {}",
                        name, other
                    )))
                }
            };
            fields.push(KeyField {
                name: name.clone(),
                kind,
            });
        }
        Self::new(fields)
    }

    pub fn to_json(&self) -> Value {
        let mut map = serde_json::Map::new();
        for field in &self.fields {
            let kind = match field.kind {
                FieldKind::Ascending => Value::from(1),
                FieldKind::Hashed => Value::from("hashed"),
            };
            map.insert(field.name.clone(), kind);
        }
        Value::Object(map)
    }

    pub fn fields(&self) -> &[KeyField] {
        &self.fields
    }

    pub fn width(&self) -> usize {
        self.fields.len()
    }

    pub fn is_hashed(&self) -> bool {
        self.fields.iter().any(|f| f.kind == FieldKind::Hashed)
    }

    pub fn global_min(&self) -> ShardKey {
        ShardKey::min(self.width())
    }

    pub fn global_max(&self) -> ShardKey {
        ShardKey::max(self.width())
    }

    /// Check that `key` has exactly one value per pattern field.
    pub fn validate(&self, key: &ShardKey) -> Result<(), KeyError> {
        if key.width() != self.width() {
            return Err(KeyError::Incomparable {
                left: self.to_json().to_string(),
                right: key.to_string(),
            });
        }
        Ok(())
    }

    /// Extract the (hashed where applicable) shard key of a document or an
    /// equality query such as `{a: 20}`.
    pub fn extract_key(&self, doc: &Value) -> Result<ShardKey, KeyError> {
        let mut values = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let raw = lookup_path(doc, &field.name)
                .ok_or_else(|| KeyError::MissingField(field.name.clone()))?;
            let value = KeyValue::from_json(&field.name, raw)?;
            if value.is_sentinel() {
                return Err(KeyError::UnsupportedType {
                    field: field.name.clone(),
                    reason: "MinKey/MaxKey cannot appear in documents".into(),
                });
            }
            values.push(match field.kind {
                FieldKind::Ascending => value,
                FieldKind::Hashed => KeyValue::Int(value.hashed()),
            });
        }
        Ok(ShardKey(values))
    }

    /// Parse a raw key-space point such as a split point `{a: 500}`.
    ///
    /// Unlike [`extract_key`](Self::extract_key) no hashing is applied: for a
    /// hashed pattern the caller already speaks in hashed values.
    pub fn parse_bound(&self, bound: &Value) -> Result<ShardKey, KeyError> {
        let mut values = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let raw = lookup_path(bound, &field.name)
                .ok_or_else(|| KeyError::MissingField(field.name.clone()))?;
            values.push(KeyValue::from_json(&field.name, raw)?);
        }
        if let Some(map) = bound.as_object() {
            if map.len() != self.fields.len() {
                return Err(KeyError::Incomparable {
                    left: self.to_json().to_string(),
                    right: bound.to_string(),
                });
            }
        }
        Ok(ShardKey(values))
    }

    /// Render a key as a JSON document keyed by field names
    pub fn key_to_json(&self, key: &ShardKey) -> Value {
        let mut map = serde_json::Map::new();
        for (field, value) in self.fields.iter().zip(key.values()) {
            map.insert(field.name.clone(), value.to_json());
        }
        Value::Object(map)
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

/// Resolve a dotted path (`a.b.c`) inside a JSON document
fn lookup_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    if let Some(v) = doc.get(path) {
        return Some(v);
    }
    let mut current = doc;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn int(i: i64) -> KeyValue {
        KeyValue::Int(i)
    }

    fn dbl(f: f64) -> KeyValue {
        KeyValue::Double(f)
    }

    fn s(v: &str) -> KeyValue {
        KeyValue::String(v.to_string())
    }

    #[test]
    fn test_type_bracket_order() {
        let ordered = vec![
            KeyValue::MinKey,
            dbl(f64::NEG_INFINITY),
            dbl(-1e300),
            int(i64::MIN),
            int(-100),
            dbl(-0.5),
            int(0),
            dbl(1e-130),
            int(500),
            dbl(205000000.0),
            int(i64::MAX),
            dbl(f64::INFINITY),
            s(""),
            s("!"),
            s("1"),
            s("a"),
            s("|"),
            s("￥"),
            KeyValue::MaxKey,
        ];
        for pair in ordered.windows(2) {
            assert!(pair[0] < pair[1], "{} should sort before {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_numbers_compare_by_value() {
        assert_eq!(int(1), dbl(1.0));
        assert_eq!(int(0), dbl(-0.0));
        assert!(int(2) > dbl(1.999999));
        assert!(int(-2) < dbl(-1.5));
        // 2^53 + 1 is not representable as f64; the comparison must stay exact
        let big = (1i64 << 53) + 1;
        assert!(int(big) > dbl((1i64 << 53) as f64));
        assert!(int(i64::MAX) < dbl(TWO_POW_63));
        assert_eq!(int(i64::MIN), dbl(-TWO_POW_63));
    }

    #[test]
    fn test_nan_rejected() {
        assert!(matches!(
            KeyValue::double("a", f64::NAN),
            Err(KeyError::UnsupportedType { .. })
        ));
    }

    #[test]
    fn test_from_json() {
        assert_eq!(KeyValue::from_json("a", &json!(500)).unwrap(), int(500));
        assert_eq!(KeyValue::from_json("a", &json!(0.25)).unwrap(), dbl(0.25));
        assert_eq!(
            KeyValue::from_json("a", &json!({"$minKey": 1})).unwrap(),
            KeyValue::MinKey
        );
        assert!(KeyValue::from_json("a", &json!(null)).is_err());
        assert!(KeyValue::from_json("a", &json!([1, 2])).is_err());
    }

    #[test]
    fn test_incomparable_widths() {
        let a = ShardKey::single(int(1));
        let b = ShardKey::new(vec![int(1), int(2)]);
        assert!(matches!(a.try_cmp(&b), Err(KeyError::Incomparable { .. })));
        assert_eq!(a.try_cmp(&ShardKey::single(int(3))).unwrap(), Ordering::Less);
    }

    #[test]
    fn test_pattern_parse_and_extract() {
        let pattern = KeyPattern::from_json(&json!({"a": 1, "b": 1})).unwrap();
        assert_eq!(pattern.width(), 2);
        let key = pattern.extract_key(&json!({"b": "x", "a": 7, "c": 1})).unwrap();
        assert_eq!(key, ShardKey::new(vec![int(7), s("x")]));
        assert!(matches!(
            pattern.extract_key(&json!({"a": 1})),
            Err(KeyError::MissingField(f)) if f == "b"
        ));
    }

    #[test]
    fn test_pattern_rejects_bad_specs() {
        assert!(KeyPattern::from_json(&json!({})).is_err());
        assert!(KeyPattern::from_json(&json!({"a": -1})).is_err());
        assert!(KeyPattern::from_json(&json!({"a": "hashed", "b": "hashed"})).is_err());
        assert!(KeyPattern::from_json(&json!([1])).is_err());
    }

    #[test]
    fn test_hashed_extract() {
        let pattern = KeyPattern::from_json(&json!({"a": "hashed"})).unwrap();
        assert!(pattern.is_hashed());
        let k1 = pattern.extract_key(&json!({"a": 1})).unwrap();
        let k2 = pattern.extract_key(&json!({"a": 1.0})).unwrap();
        let k3 = pattern.extract_key(&json!({"a": 2})).unwrap();
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
        assert!(matches!(k1.values()[0], KeyValue::Int(_)));
    }

    #[test]
    fn test_dotted_path() {
        let pattern = KeyPattern::from_json(&json!({"user.id": 1})).unwrap();
        let key = pattern.extract_key(&json!({"user": {"id": 42}})).unwrap();
        assert_eq!(key, ShardKey::single(int(42)));
    }

    #[test]
    fn test_parse_bound_keeps_sentinels() {
        let pattern = KeyPattern::from_json(&json!({"a": 1})).unwrap();
        let min = pattern.parse_bound(&json!({"a": {"$minKey": 1}})).unwrap();
        assert!(min.is_global_min());
        assert!(pattern.parse_bound(&json!({"a": 1, "b": 2})).is_err());
    }
}
