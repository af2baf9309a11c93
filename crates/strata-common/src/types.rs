//! Chunk keys and chunk metadata.
//!
//! A chunk key is an ordered sequence of integers with semantically fixed
//! positions: `[db_id, table_id, column_id, fragment_id, varlen_kind]`.
//! Prefixes are meaningful: a 2-element key addresses a whole table, a
//! 4-element key a fixed-length data chunk, and a 5-element key one half of
//! a variable-length column (data or index). All interpretation of key
//! positions lives here; the rest of the workspace goes through these
//! helpers.

use serde::{Deserialize, Serialize};
use std::fmt;

const DB_IDX: usize = 0;
const TABLE_IDX: usize = 1;
const COLUMN_IDX: usize = 2;
const FRAGMENT_IDX: usize = 3;
const VARLEN_IDX: usize = 4;

/// Discriminates the two physical chunks of a variable-length column
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum VarlenKind {
    Data = 1,
    Index = 2,
}

/// Composite key addressing a cached chunk, a column, or a whole table
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkKey(Vec<i32>);

impl ChunkKey {
    /// Key for a whole table (2-element prefix)
    #[must_use]
    pub fn table(db_id: i32, table_id: i32) -> Self {
        Self(vec![db_id, table_id])
    }

    /// Key for a fixed-length data chunk
    #[must_use]
    pub fn data(db_id: i32, table_id: i32, column_id: i32, fragment_id: i32) -> Self {
        Self(vec![db_id, table_id, column_id, fragment_id])
    }

    /// Key for one half of a variable-length column
    #[must_use]
    pub fn varlen(
        db_id: i32,
        table_id: i32,
        column_id: i32,
        fragment_id: i32,
        kind: VarlenKind,
    ) -> Self {
        Self(vec![db_id, table_id, column_id, fragment_id, kind as i32])
    }

    pub fn db_id(&self) -> i32 {
        self.0[DB_IDX]
    }

    pub fn table_id(&self) -> i32 {
        self.0[TABLE_IDX]
    }

    /// Column id of a chunk-level key
    pub fn column_id(&self) -> i32 {
        debug_assert!(self.0.len() > COLUMN_IDX);
        self.0[COLUMN_IDX]
    }

    /// Fragment id of a chunk-level key
    pub fn fragment_id(&self) -> i32 {
        debug_assert!(self.0.len() > FRAGMENT_IDX);
        self.0[FRAGMENT_IDX]
    }

    pub fn is_table_key(&self) -> bool {
        self.0.len() == 2
    }

    pub fn is_varlen_key(&self) -> bool {
        self.0.len() == 5
    }

    pub fn is_varlen_data_key(&self) -> bool {
        self.is_varlen_key() && self.0[VARLEN_IDX] == VarlenKind::Data as i32
    }

    pub fn is_varlen_index_key(&self) -> bool {
        self.is_varlen_key() && self.0[VARLEN_IDX] == VarlenKind::Index as i32
    }

    /// The 2-element `(db_id, table_id)` prefix of this key
    #[must_use]
    pub fn table_prefix(&self) -> ChunkKey {
        ChunkKey::table(self.db_id(), self.table_id())
    }

    /// True if this key starts with `prefix`
    pub fn has_prefix(&self, prefix: &ChunkKey) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }

    /// The index-chunk sibling of a varlen data key
    #[must_use]
    pub fn varlen_index_sibling(&self) -> ChunkKey {
        debug_assert!(self.is_varlen_data_key());
        ChunkKey::varlen(
            self.db_id(),
            self.table_id(),
            self.column_id(),
            self.fragment_id(),
            VarlenKind::Index,
        )
    }

    /// Smallest key ordered after every key that has `self` as a prefix.
    /// Used for half-open range scans over ordered maps.
    #[must_use]
    pub fn prefix_upper_bound(&self) -> ChunkKey {
        let mut bound = self.0.clone();
        let last = bound
            .last_mut()
            .expect("chunk keys are never empty");
        *last = last.saturating_add(1);
        ChunkKey(bound)
    }

    /// Key suffix below the table prefix, e.g. `[column_id, fragment_id]`
    pub fn suffix(&self) -> &[i32] {
        &self.0[2..]
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.0
    }

    /// Rebuild a key from a table prefix and a stored suffix
    #[must_use]
    pub fn from_prefix_and_suffix(prefix: &ChunkKey, suffix: &[i32]) -> Self {
        let mut parts = vec![prefix.db_id(), prefix.table_id()];
        parts.extend_from_slice(suffix);
        Self(parts)
    }
}

impl fmt::Debug for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkKey{:?}", self.0)
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{part}")?;
        }
        write!(f, "]")
    }
}

/// A single typed value carried by chunk statistics
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Datum {
    Int(i64),
    Double(f64),
    Text(String),
}

/// Per-column summary statistics for one chunk
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    pub min: Option<Datum>,
    pub max: Option<Datum>,
    pub null_count: u64,
}

/// Per-chunk summary emitted by a metadata scan.
///
/// Populatable without reading chunk payloads when the source format keeps
/// row-group statistics.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Logical byte size of the data chunk
    pub num_bytes: u64,
    /// Number of rows covered by the chunk
    pub num_rows: u64,
    pub stats: ColumnStats,
}

/// Ordered collection of `(key, metadata)` pairs produced by metadata scans
pub type ChunkMetadataVector = Vec<(ChunkKey, ChunkMetadata)>;
