//! Data wrappers: pluggable scanners for external file formats.
//!
//! A wrapper owns everything the manager needs to know about one foreign
//! table's source: how to scan it for chunk metadata, how to fill chunk
//! buffers, and how to snapshot its internal state so a restart can skip
//! the source rescan.

pub mod columnar;
pub mod delimited;
pub mod source;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use strata_common::{
    BufferMap, ChunkMetadataVector, ColumnStats, Datum, Error, Result, ScalarType,
};

/// Capability set a data wrapper exposes to the foreign-storage manager
pub trait DataWrapper: Send + Sync {
    /// Scan the source and emit one metadata record per data-bearing chunk
    fn populate_chunk_metadata(&self, out: &mut ChunkMetadataVector) -> Result<()>;

    /// Fill every buffer in `required`. Entries in `optional` (typically
    /// other physical chunks of the same fragment) may be filled
    /// opportunistically; declining them is never an error.
    fn populate_chunk_buffers(&self, required: &BufferMap, optional: &BufferMap) -> Result<()>;

    /// Write a JSON snapshot sufficient to avoid re-scanning the source
    fn serialize_internals(&self, path: &Path) -> Result<()>;

    /// Rebuild wrapper state from a snapshot plus the cached metadata.
    /// Sets the restored flag.
    fn restore_internals(&self, path: &Path, metadata: &ChunkMetadataVector) -> Result<()>;

    /// True iff the wrapper was last brought up from a snapshot without a
    /// source rescan
    fn is_restored(&self) -> bool;
}

/// Test seam: a wrapper that composes over the real one it replaced
pub trait MockDataWrapper: DataWrapper {
    fn set_parent(&self, parent: Arc<dyn DataWrapper>);
}

/// One parsed source value on its way into a chunk
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int(i64),
    Double(f64),
    Text(String),
    Array(Vec<Value>),
}

/// Dictionary for text columns: chunks carry fixed 4-byte ids, the
/// wrapper owns the id-to-string mapping. Ids are assigned in first-seen
/// order and survive snapshots.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Dictionary {
    strings: Vec<String>,
    #[serde(skip)]
    by_value: HashMap<String, i32>,
}

/// Dictionary id used for NULL text values
pub const NULL_DICT_ID: i32 = i32::MIN;

impl Dictionary {
    /// Id for `value`, interning it on first sight
    pub fn intern(&mut self, value: &str) -> i32 {
        if let Some(id) = self.by_value.get(value) {
            return *id;
        }
        let id = self.strings.len() as i32;
        self.strings.push(value.to_string());
        self.by_value.insert(value.to_string(), id);
        id
    }

    /// Build a dictionary from an existing id-ordered string list
    pub fn from_strings(strings: Vec<String>) -> Self {
        let mut dict = Self {
            strings,
            by_value: HashMap::new(),
        };
        dict.rebuild_index();
        dict
    }

    pub fn strings(&self) -> &[String] {
        &self.strings
    }

    pub fn lookup(&self, id: i32) -> Option<&str> {
        usize::try_from(id).ok().and_then(|i| self.strings.get(i)).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    /// Rebuild the reverse index after deserialization
    pub fn rebuild_index(&mut self) {
        self.by_value = self
            .strings
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i as i32))
            .collect();
    }
}

// ── value encoding ───────────────────────────────────────────────────────
//
// Fixed-width NULL sentinels: the minimum representable value for integer
// kinds, NaN payloads for floats, NULL_DICT_ID for text ids.

pub(crate) fn encode_scalar(scalar: ScalarType, value: &Value, out: &mut Vec<u8>) -> Result<()> {
    match scalar {
        ScalarType::Boolean | ScalarType::TinyInt => {
            let encoded: i8 = match value {
                Value::Null => i8::MIN,
                Value::Int(v) => *v as i8,
                _ => return Err(type_error(scalar, value)),
            };
            out.extend_from_slice(&encoded.to_le_bytes());
        }
        ScalarType::SmallInt => {
            let encoded: i16 = match value {
                Value::Null => i16::MIN,
                Value::Int(v) => *v as i16,
                _ => return Err(type_error(scalar, value)),
            };
            out.extend_from_slice(&encoded.to_le_bytes());
        }
        ScalarType::Int => {
            let encoded: i32 = match value {
                Value::Null => i32::MIN,
                Value::Int(v) => *v as i32,
                _ => return Err(type_error(scalar, value)),
            };
            out.extend_from_slice(&encoded.to_le_bytes());
        }
        ScalarType::BigInt => {
            let encoded: i64 = match value {
                Value::Null => i64::MIN,
                Value::Int(v) => *v,
                _ => return Err(type_error(scalar, value)),
            };
            out.extend_from_slice(&encoded.to_le_bytes());
        }
        ScalarType::Float => {
            let encoded: f32 = match value {
                Value::Null => f32::NAN,
                Value::Double(v) => *v as f32,
                Value::Int(v) => *v as f32,
                _ => return Err(type_error(scalar, value)),
            };
            out.extend_from_slice(&encoded.to_le_bytes());
        }
        ScalarType::Double => {
            let encoded: f64 = match value {
                Value::Null => f64::NAN,
                Value::Double(v) => *v,
                Value::Int(v) => *v as f64,
                _ => return Err(type_error(scalar, value)),
            };
            out.extend_from_slice(&encoded.to_le_bytes());
        }
    }
    Ok(())
}

fn type_error(scalar: ScalarType, value: &Value) -> Error {
    Error::internal(format!("cannot encode {value:?} as {scalar:?}"))
}

/// Running min/max/null-count accumulator for one chunk
#[derive(Default)]
pub(crate) struct StatsCollector {
    stats: ColumnStats,
}

impl StatsCollector {
    pub fn observe(&mut self, value: &Value) {
        match value {
            Value::Null => self.stats.null_count += 1,
            Value::Int(v) => self.observe_datum(Datum::Int(*v)),
            Value::Double(v) => self.observe_datum(Datum::Double(*v)),
            Value::Text(v) => self.observe_datum(Datum::Text(v.clone())),
            Value::Array(elements) => {
                for element in elements {
                    self.observe(element);
                }
            }
        }
    }

    fn observe_datum(&mut self, datum: Datum) {
        let lower = match (&self.stats.min, &datum) {
            (None, _) => true,
            (Some(current), candidate) => datum_lt(candidate, current),
        };
        if lower {
            self.stats.min = Some(datum.clone());
        }
        let higher = match (&self.stats.max, &datum) {
            (None, _) => true,
            (Some(current), candidate) => datum_lt(current, candidate),
        };
        if higher {
            self.stats.max = Some(datum);
        }
    }

    pub fn finish(self) -> ColumnStats {
        self.stats
    }
}

fn datum_lt(a: &Datum, b: &Datum) -> bool {
    match (a, b) {
        (Datum::Int(a), Datum::Int(b)) => a < b,
        (Datum::Double(a), Datum::Double(b)) => a < b,
        (Datum::Text(a), Datum::Text(b)) => a < b,
        (Datum::Int(a), Datum::Double(b)) => (*a as f64) < *b,
        (Datum::Double(a), Datum::Int(b)) => *a < (*b as f64),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dictionary_assigns_first_seen_ids() {
        let mut dict = Dictionary::default();
        assert_eq!(dict.intern("a"), 0);
        assert_eq!(dict.intern("aa"), 1);
        assert_eq!(dict.intern("a"), 0);
        assert_eq!(dict.lookup(1), Some("aa"));
        assert_eq!(dict.lookup(5), None);
    }

    #[test]
    fn test_dictionary_index_rebuild() {
        let mut dict = Dictionary::default();
        dict.intern("x");
        dict.intern("y");
        let json = serde_json::to_string(&dict).unwrap();
        let mut restored: Dictionary = serde_json::from_str(&json).unwrap();
        restored.rebuild_index();
        assert_eq!(restored.intern("x"), 0);
        assert_eq!(restored.intern("z"), 2);
    }

    #[test]
    fn test_encode_int_and_null() {
        let mut out = Vec::new();
        encode_scalar(ScalarType::Int, &Value::Int(7), &mut out).unwrap();
        encode_scalar(ScalarType::Int, &Value::Null, &mut out).unwrap();
        assert_eq!(&out[..4], &7i32.to_le_bytes());
        assert_eq!(&out[4..], &i32::MIN.to_le_bytes());
    }

    #[test]
    fn test_encode_float_null_sentinels_are_nan() {
        let mut out = Vec::new();
        encode_scalar(ScalarType::Float, &Value::Null, &mut out).unwrap();
        encode_scalar(ScalarType::Double, &Value::Null, &mut out).unwrap();

        assert_eq!(&out[..4], &f32::NAN.to_le_bytes());
        assert_eq!(&out[4..], &f64::NAN.to_le_bytes());
        assert!(f32::from_le_bytes(out[..4].try_into().unwrap()).is_nan());
        assert!(f64::from_le_bytes(out[4..].try_into().unwrap()).is_nan());
    }

    #[test]
    fn test_encode_float_values() {
        let mut out = Vec::new();
        encode_scalar(ScalarType::Double, &Value::Double(2.5), &mut out).unwrap();
        encode_scalar(ScalarType::Float, &Value::Double(-1.25), &mut out).unwrap();
        encode_scalar(ScalarType::Float, &Value::Int(3), &mut out).unwrap();
        assert_eq!(&out[..8], &2.5f64.to_le_bytes());
        assert_eq!(&out[8..12], &(-1.25f32).to_le_bytes());
        assert_eq!(&out[12..], &3.0f32.to_le_bytes());
    }

    #[test]
    fn test_stats_skip_nulls() {
        let mut stats = StatsCollector::default();
        stats.observe(&Value::Array(vec![
            Value::Int(3),
            Value::Null,
            Value::Int(1),
        ]));
        stats.observe(&Value::Null);
        let stats = stats.finish();
        assert_eq!(stats.min, Some(Datum::Int(1)));
        assert_eq!(stats.max, Some(Datum::Int(3)));
        assert_eq!(stats.null_count, 2);
    }
}
