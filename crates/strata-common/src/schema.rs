//! Column schemas and logical-to-physical chunk expansion.
//!
//! A logical column occupies one physical chunk per fragment when its
//! element type is fixed-length, and exactly two (data + index) when it is
//! variable-length. `expand_logical_column` is the only place that mapping
//! is computed.

use crate::error::{Error, Result};
use crate::types::{ChunkKey, VarlenKind};
use serde::{Deserialize, Serialize};

/// Fixed-width scalar kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarType {
    Boolean,
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Float,
    Double,
}

impl ScalarType {
    /// Encoded width of one value in bytes
    pub const fn width(self) -> usize {
        match self {
            Self::Boolean | Self::TinyInt => 1,
            Self::SmallInt => 2,
            Self::Int | Self::Float => 4,
            Self::BigInt | Self::Double => 8,
        }
    }
}

/// Element type of a column as declared in the catalog
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementType {
    Scalar(ScalarType),
    /// Dictionary-encoded text; chunks hold fixed 4-byte dictionary ids
    Text,
    /// Uncompressed text; variable-length
    VarText,
    /// Array of a fixed-width scalar; variable-length
    Array(ScalarType),
}

impl ElementType {
    /// True if the column occupies a data chunk plus an index chunk
    pub fn is_var_len(&self) -> bool {
        matches!(self, Self::VarText | Self::Array(_))
    }

    /// Encoded width of one value for fixed-length types
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            Self::Scalar(scalar) => Some(scalar.width()),
            Self::Text => Some(4),
            Self::VarText | Self::Array(_) => None,
        }
    }
}

/// One column of a foreign table. Column ids are 1-based and stable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnDesc {
    pub id: i32,
    pub name: String,
    pub element_type: ElementType,
}

/// Ordered column set of a foreign table
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    columns: Vec<ColumnDesc>,
}

impl TableSchema {
    /// Build a schema from `(name, element_type)` pairs, assigning 1-based ids
    pub fn new(columns: impl IntoIterator<Item = (String, ElementType)>) -> Self {
        let columns = columns
            .into_iter()
            .enumerate()
            .map(|(i, (name, element_type))| ColumnDesc {
                id: i as i32 + 1,
                name,
                element_type,
            })
            .collect();
        Self { columns }
    }

    pub fn columns(&self) -> &[ColumnDesc] {
        &self.columns
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, column_id: i32) -> Option<&ColumnDesc> {
        self.columns.iter().find(|c| c.id == column_id)
    }
}

/// Physical chunk keys a logical column occupies in one fragment: one key
/// for fixed-length columns, `[data, index]` (suffixes 1 then 2) for
/// variable-length columns.
pub fn expand_logical_column(
    schema: &TableSchema,
    db_id: i32,
    table_id: i32,
    column_id: i32,
    fragment_id: i32,
) -> Result<Vec<ChunkKey>> {
    let column = schema.column(column_id).ok_or_else(|| {
        Error::internal(format!(
            "unknown column id {column_id} for table ({db_id}, {table_id})"
        ))
    })?;

    let keys = if column.element_type.is_var_len() {
        vec![
            ChunkKey::varlen(db_id, table_id, column_id, fragment_id, VarlenKind::Data),
            ChunkKey::varlen(db_id, table_id, column_id, fragment_id, VarlenKind::Index),
        ]
    } else {
        vec![ChunkKey::data(db_id, table_id, column_id, fragment_id)]
    };
    Ok(keys)
}
