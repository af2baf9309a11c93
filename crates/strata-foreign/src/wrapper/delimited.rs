//! Delimited-text data wrapper.
//!
//! Scans comma-delimited files (single file, directory, tar archive, or
//! gzip-compressed), splits rows into fragments, and encodes columns into
//! chunk form. Text columns are dictionary-encoded; the dictionary lives
//! in wrapper state and travels with the snapshot. Array fields use the
//! `{v1,v2,...}` notation with `NULL` elements.

use super::source::{list_source, open_entry, SourceEntry, SourceLedger};
use super::{encode_scalar, DataWrapper, Dictionary, StatsCollector, Value, NULL_DICT_ID};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use strata_catalog::ForeignTable;
use strata_common::{
    BufferMap, ChunkKey, ChunkMetadata, ChunkMetadataVector, ColumnDesc, ColumnStats,
    ElementType, Encoding, Error, Result, ScalarType, VarlenKind,
};
use tracing::debug;

#[derive(Default, Serialize, Deserialize)]
struct DelimitedState {
    ledger: SourceLedger,
    fragments: Vec<FragmentSpan>,
    dictionaries: BTreeMap<i32, Dictionary>,
}

#[derive(Clone, Serialize, Deserialize)]
struct FragmentSpan {
    fragment_id: i32,
    row_offset: u64,
    row_count: u64,
}

/// Data wrapper for delimited text sources
pub struct DelimitedDataWrapper {
    table: Arc<ForeignTable>,
    state: Mutex<DelimitedState>,
    restored: AtomicBool,
}

impl DelimitedDataWrapper {
    pub fn new(table: Arc<ForeignTable>) -> Self {
        Self {
            table,
            state: Mutex::new(DelimitedState::default()),
            restored: AtomicBool::new(false),
        }
    }

    /// Read and parse every row of the source, in entry order
    fn read_rows(&self, entries: &[SourceEntry]) -> Result<Vec<Vec<Value>>> {
        let schema = &self.table.schema;
        let mut rows = Vec::new();
        for entry in entries {
            let reader = open_entry(entry)?;
            let mut csv_reader = csv::ReaderBuilder::new()
                .has_headers(false)
                .flexible(true)
                .from_reader(reader);
            for record in csv_reader.records() {
                let record = record.map_err(|e| Error::CorruptSource {
                    path: entry.name.clone(),
                    reason: e.to_string(),
                })?;
                if record.len() != schema.num_columns() {
                    return Err(Error::SchemaMismatch {
                        expected: schema.num_columns(),
                        found: record.len(),
                        path: entry.name.clone(),
                    });
                }
                let mut row = Vec::with_capacity(schema.num_columns());
                for (column, raw) in schema.columns().iter().zip(record.iter()) {
                    row.push(parse_field(column, raw, &entry.name)?);
                }
                rows.push(row);
            }
        }
        Ok(rows)
    }
}

impl DataWrapper for DelimitedDataWrapper {
    fn populate_chunk_metadata(&self, out: &mut ChunkMetadataVector) -> Result<()> {
        let entries = list_source(&self.table.file_path)?;
        let mut state = self.state.lock();
        if self.table.is_append_mode() && !state.ledger.is_empty() {
            state.ledger.check_append_growth(&entries)?;
        }

        let rows = self.read_rows(&entries)?;
        let fragment_size = self.table.fragment_size.max(1) as usize;
        let db_id = self.table.db_id;
        let table_id = self.table.id;

        state.fragments.clear();
        for (index, rows_chunk) in rows.chunks(fragment_size).enumerate() {
            let fragment_id = index as i32;
            state.fragments.push(FragmentSpan {
                fragment_id,
                row_offset: index as u64 * fragment_size as u64,
                row_count: rows_chunk.len() as u64,
            });
            for column in self.table.schema.columns() {
                let values: Vec<&Value> = rows_chunk
                    .iter()
                    .map(|row| &row[column.id as usize - 1])
                    .collect();
                let dict = state.dictionaries.entry(column.id).or_default();
                let encoded = encode_column(column, &values, dict)?;
                let key = data_chunk_key(db_id, table_id, column, fragment_id);
                out.push((
                    key,
                    ChunkMetadata {
                        num_bytes: encoded.data.len() as u64,
                        num_rows: rows_chunk.len() as u64,
                        stats: encoded.stats,
                    },
                ));
            }
        }
        state.ledger.record(&entries);
        debug!(
            "delimited scan of {}: {} rows, {} fragments",
            self.table.file_path.display(),
            rows.len(),
            state.fragments.len()
        );
        Ok(())
    }

    fn populate_chunk_buffers(&self, required: &BufferMap, _optional: &BufferMap) -> Result<()> {
        if required.is_empty() {
            return Ok(());
        }
        let entries = list_source(&self.table.file_path)?;
        let rows = self.read_rows(&entries)?;
        let mut state = self.state.lock();

        let mut by_fragment: BTreeMap<i32, Vec<&ChunkKey>> = BTreeMap::new();
        for key in required.keys() {
            by_fragment.entry(key.fragment_id()).or_default().push(key);
        }

        for (fragment_id, keys) in by_fragment {
            let span = state
                .fragments
                .iter()
                .find(|f| f.fragment_id == fragment_id)
                .cloned()
                .ok_or_else(|| {
                    Error::internal(format!(
                        "no scanned fragment {fragment_id} for table \"{}\"",
                        self.table.name
                    ))
                })?;
            let start = (span.row_offset as usize).min(rows.len());
            let end = (start + span.row_count as usize).min(rows.len());
            let rows_chunk = &rows[start..end];

            let mut column_ids: Vec<i32> = keys.iter().map(|k| k.column_id()).collect();
            column_ids.sort_unstable();
            column_ids.dedup();

            for column_id in column_ids {
                let column = self.table.schema.column(column_id).ok_or_else(|| {
                    Error::internal(format!(
                        "chunk requested for unknown column id {column_id}"
                    ))
                })?;
                let values: Vec<&Value> = rows_chunk
                    .iter()
                    .map(|row| &row[column_id as usize - 1])
                    .collect();
                let dict = state.dictionaries.entry(column_id).or_default();
                let encoded = encode_column(column, &values, dict)?;
                for key in keys.iter().filter(|k| k.column_id() == column_id) {
                    let buffer = &required[*key];
                    let mut locked = buffer.lock();
                    if key.is_varlen_index_key() {
                        let index = encoded.index.as_ref().ok_or_else(|| {
                            Error::internal(format!(
                                "index chunk requested for fixed-length column \"{}\"",
                                column.name
                            ))
                        })?;
                        locked.write(index);
                        locked.set_encoding(Encoding::varlen(
                            column.element_type.clone(),
                            VarlenKind::Index,
                        ));
                    } else {
                        locked.write(&encoded.data);
                        let encoding = if key.is_varlen_data_key() {
                            Encoding::varlen(column.element_type.clone(), VarlenKind::Data)
                        } else {
                            Encoding::fixed(column.element_type.clone())
                        };
                        locked.set_encoding(encoding);
                    }
                    locked.clear_dirty();
                }
            }
        }
        Ok(())
    }

    fn serialize_internals(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let state = self.state.lock();
        let json = serde_json::to_string_pretty(&*state)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    fn restore_internals(&self, path: &Path, _metadata: &ChunkMetadataVector) -> Result<()> {
        let contents = std::fs::read_to_string(path)?;
        let mut restored: DelimitedState = serde_json::from_str(&contents)?;
        for dict in restored.dictionaries.values_mut() {
            dict.rebuild_index();
        }
        *self.state.lock() = restored;
        self.restored.store(true, Ordering::Release);
        Ok(())
    }

    fn is_restored(&self) -> bool {
        self.restored.load(Ordering::Acquire)
    }
}

fn data_chunk_key(db_id: i32, table_id: i32, column: &ColumnDesc, fragment_id: i32) -> ChunkKey {
    if column.element_type.is_var_len() {
        ChunkKey::varlen(db_id, table_id, column.id, fragment_id, VarlenKind::Data)
    } else {
        ChunkKey::data(db_id, table_id, column.id, fragment_id)
    }
}

fn parse_field(column: &ColumnDesc, raw: &str, entry_name: &str) -> Result<Value> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Value::Null);
    }
    match &column.element_type {
        ElementType::Scalar(scalar) => parse_scalar(*scalar, raw, entry_name),
        ElementType::Text | ElementType::VarText => Ok(Value::Text(raw.to_string())),
        ElementType::Array(scalar) => {
            let inner = raw
                .strip_prefix('{')
                .and_then(|s| s.strip_suffix('}'))
                .ok_or_else(|| Error::CorruptSource {
                    path: entry_name.to_string(),
                    reason: format!("malformed array literal \"{raw}\""),
                })?;
            let mut elements = Vec::new();
            if !inner.trim().is_empty() {
                for element in inner.split(',') {
                    let element = element.trim();
                    if element.is_empty() || element.eq_ignore_ascii_case("null") {
                        elements.push(Value::Null);
                    } else {
                        elements.push(parse_scalar(*scalar, element, entry_name)?);
                    }
                }
            }
            Ok(Value::Array(elements))
        }
    }
}

fn parse_scalar(scalar: ScalarType, raw: &str, entry_name: &str) -> Result<Value> {
    let parse_error = || Error::CorruptSource {
        path: entry_name.to_string(),
        reason: format!("cannot parse \"{raw}\" as {scalar:?}"),
    };
    match scalar {
        ScalarType::Boolean => match raw.to_ascii_lowercase().as_str() {
            "true" | "t" | "1" => Ok(Value::Int(1)),
            "false" | "f" | "0" => Ok(Value::Int(0)),
            _ => Err(parse_error()),
        },
        ScalarType::TinyInt | ScalarType::SmallInt | ScalarType::Int | ScalarType::BigInt => {
            raw.parse::<i64>().map(Value::Int).map_err(|_| parse_error())
        }
        ScalarType::Float | ScalarType::Double => raw
            .parse::<f64>()
            .map(Value::Double)
            .map_err(|_| parse_error()),
    }
}

pub(crate) struct EncodedColumn {
    pub data: Vec<u8>,
    pub index: Option<Vec<u8>>,
    pub stats: ColumnStats,
}

/// Encode one column of one fragment into chunk form
pub(crate) fn encode_column(
    column: &ColumnDesc,
    values: &[&Value],
    dict: &mut Dictionary,
) -> Result<EncodedColumn> {
    let mut stats = StatsCollector::default();
    let mut data = Vec::new();

    match &column.element_type {
        ElementType::Scalar(scalar) => {
            for value in values {
                stats.observe(value);
                encode_scalar(*scalar, value, &mut data)?;
            }
            Ok(EncodedColumn {
                data,
                index: None,
                stats: stats.finish(),
            })
        }
        ElementType::Text => {
            for value in values {
                stats.observe(value);
                let id = match value {
                    Value::Null => NULL_DICT_ID,
                    Value::Text(s) => dict.intern(s),
                    other => {
                        return Err(Error::internal(format!(
                            "cannot dictionary-encode {other:?} for column \"{}\"",
                            column.name
                        )))
                    }
                };
                data.extend_from_slice(&id.to_le_bytes());
            }
            Ok(EncodedColumn {
                data,
                index: None,
                stats: stats.finish(),
            })
        }
        ElementType::VarText => {
            let mut offsets: Vec<u8> = Vec::with_capacity((values.len() + 1) * 8);
            offsets.extend_from_slice(&0u64.to_le_bytes());
            for value in values {
                stats.observe(value);
                match value {
                    Value::Null => {}
                    Value::Text(s) => data.extend_from_slice(s.as_bytes()),
                    other => {
                        return Err(Error::internal(format!(
                            "cannot encode {other:?} as text for column \"{}\"",
                            column.name
                        )))
                    }
                }
                offsets.extend_from_slice(&(data.len() as u64).to_le_bytes());
            }
            Ok(EncodedColumn {
                data,
                index: Some(offsets),
                stats: stats.finish(),
            })
        }
        ElementType::Array(scalar) => {
            let mut offsets: Vec<u8> = Vec::with_capacity((values.len() + 1) * 8);
            offsets.extend_from_slice(&0u64.to_le_bytes());
            for value in values {
                stats.observe(value);
                match value {
                    Value::Null => {}
                    Value::Array(elements) => {
                        for element in elements {
                            encode_scalar(*scalar, element, &mut data)?;
                        }
                    }
                    other => {
                        return Err(Error::internal(format!(
                            "cannot encode {other:?} as array for column \"{}\"",
                            column.name
                        )))
                    }
                }
                offsets.extend_from_slice(&(data.len() as u64).to_le_bytes());
            }
            Ok(EncodedColumn {
                data,
                index: Some(offsets),
                stats: stats.finish(),
            })
        }
    }
}
