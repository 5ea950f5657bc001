//! The column type registry: a process of dispatching reads and writes by a
//! type name string, standing in for the original's `type2iter`/`typed_writer`
//! dicts. The spec puts the codecs themselves out of scope; this module
//! ships a handful of built-ins sufficient to exercise the writer/reader
//! paths end-to-end, and leaves room for a caller to register more.

use chrono::NaiveDate;
use common::errors::ValidationError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

/// A single cell value. One variant per built-in codec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    Str(String),
    Date(NaiveDate),
}

/// A type the registry knows how to hash-partition, order for min/max
/// tracking, and validate against its declared column type.
pub trait ColumnCodec: Send + Sync {
    /// The registry key this codec is installed under (`"int64"`, ...).
    fn type_name(&self) -> &'static str;

    /// Whether `v` is a legal value for a column of this type.
    fn validate(&self, v: &Value) -> bool;

    /// Hash used for hashlabel partitioning: `hash(v) % SLICES == sliceno`.
    fn hash(&self, v: &Value) -> u64;

    /// Ordering used to track running min/max; `None` if `a`/`b` aren't of
    /// this codec's type (programmer error upstream, never reached in
    /// practice since `validate` gates every write).
    fn compare(&self, a: &Value, b: &Value) -> Option<Ordering>;
}

fn seahash_bytes(bytes: &[u8]) -> u64 {
    seahash::hash(bytes)
}

struct Int64Codec;
impl ColumnCodec for Int64Codec {
    fn type_name(&self) -> &'static str {
        "int64"
    }
    fn validate(&self, v: &Value) -> bool {
        matches!(v, Value::Int(_))
    }
    fn hash(&self, v: &Value) -> u64 {
        match v {
            Value::Int(i) => seahash_bytes(&i.to_le_bytes()),
            _ => 0,
        }
    }
    fn compare(&self, a: &Value, b: &Value) -> Option<Ordering> {
        match (a, b) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

struct Float64Codec;
impl ColumnCodec for Float64Codec {
    fn type_name(&self) -> &'static str {
        "float64"
    }
    fn validate(&self, v: &Value) -> bool {
        matches!(v, Value::Float(_))
    }
    fn hash(&self, v: &Value) -> u64 {
        match v {
            Value::Float(f) => seahash_bytes(&f.to_bits().to_le_bytes()),
            _ => 0,
        }
    }
    fn compare(&self, a: &Value, b: &Value) -> Option<Ordering> {
        match (a, b) {
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

struct BoolCodec;
impl ColumnCodec for BoolCodec {
    fn type_name(&self) -> &'static str {
        "bool"
    }
    fn validate(&self, v: &Value) -> bool {
        matches!(v, Value::Bool(_))
    }
    fn hash(&self, v: &Value) -> u64 {
        match v {
            Value::Bool(b) => seahash_bytes(&[*b as u8]),
            _ => 0,
        }
    }
    fn compare(&self, a: &Value, b: &Value) -> Option<Ordering> {
        match (a, b) {
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

struct BytesCodec;
impl ColumnCodec for BytesCodec {
    fn type_name(&self) -> &'static str {
        "bytes"
    }
    fn validate(&self, v: &Value) -> bool {
        matches!(v, Value::Bytes(_))
    }
    fn hash(&self, v: &Value) -> u64 {
        match v {
            Value::Bytes(b) => seahash_bytes(b),
            _ => 0,
        }
    }
    fn compare(&self, a: &Value, b: &Value) -> Option<Ordering> {
        match (a, b) {
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

struct UnicodeCodec;
impl ColumnCodec for UnicodeCodec {
    fn type_name(&self) -> &'static str {
        "unicode"
    }
    fn validate(&self, v: &Value) -> bool {
        matches!(v, Value::Str(_))
    }
    fn hash(&self, v: &Value) -> u64 {
        match v {
            Value::Str(s) => seahash_bytes(s.as_bytes()),
            _ => 0,
        }
    }
    fn compare(&self, a: &Value, b: &Value) -> Option<Ordering> {
        match (a, b) {
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

struct DateCodec;
impl ColumnCodec for DateCodec {
    fn type_name(&self) -> &'static str {
        "date"
    }
    fn validate(&self, v: &Value) -> bool {
        matches!(v, Value::Date(_))
    }
    fn hash(&self, v: &Value) -> u64 {
        match v {
            Value::Date(d) => seahash_bytes(&d.num_days_from_ce().to_le_bytes()),
            _ => 0,
        }
    }
    fn compare(&self, a: &Value, b: &Value) -> Option<Ordering> {
        match (a, b) {
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

/// Process-wide-usable registry of column codecs, keyed by type name.
/// Ships with the built-in primitives; a caller may `register` more.
pub struct ColumnTypeRegistry {
    codecs: HashMap<&'static str, Arc<dyn ColumnCodec>>,
}

impl ColumnTypeRegistry {
    /// A registry populated with `int64`, `float64`, `bool`, `bytes`,
    /// `unicode` and `date`.
    pub fn with_builtins() -> Self {
        let mut reg = Self { codecs: HashMap::new() };
        reg.register(Arc::new(Int64Codec));
        reg.register(Arc::new(Float64Codec));
        reg.register(Arc::new(BoolCodec));
        reg.register(Arc::new(BytesCodec));
        reg.register(Arc::new(UnicodeCodec));
        reg.register(Arc::new(DateCodec));
        reg
    }

    pub fn register(&mut self, codec: Arc<dyn ColumnCodec>) {
        self.codecs.insert(codec.type_name(), codec);
    }

    pub fn get(&self, type_name: &str) -> Result<Arc<dyn ColumnCodec>, ValidationError> {
        self.codecs
            .get(type_name)
            .cloned()
            .ok_or_else(|| ValidationError::UnknownColumnType(type_name.to_string()))
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.codecs.contains_key(type_name)
    }
}

impl Default for ColumnTypeRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_knows_all_primitives() {
        let reg = ColumnTypeRegistry::with_builtins();
        for t in ["int64", "float64", "bool", "bytes", "unicode", "date"] {
            assert!(reg.contains(t), "missing codec for {t}");
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        let reg = ColumnTypeRegistry::with_builtins();
        assert!(matches!(reg.get("imaginary"), Err(ValidationError::UnknownColumnType(_))));
    }

    #[test]
    fn int64_hash_is_deterministic() {
        let codec = Int64Codec;
        let a = codec.hash(&Value::Int(42));
        let b = codec.hash(&Value::Int(42));
        assert_eq!(a, b);
        assert_ne!(a, codec.hash(&Value::Int(43)));
    }

    #[test]
    fn compare_rejects_mismatched_variants() {
        let codec = Int64Codec;
        assert_eq!(codec.compare(&Value::Int(1), &Value::Float(1.0)), None);
        assert_eq!(codec.compare(&Value::Int(1), &Value::Int(2)), Some(Ordering::Less));
    }
}
