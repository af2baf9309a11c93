//! Columnar-binary data wrapper and file format.
//!
//! File layout:
//!
//! ```text
//! +-------------------+
//! |  Magic "SCOL"     |  4 bytes
//! |  Version          |  u32 le
//! +-------------------+
//! |  Column payloads  |  row group 0 column chunks, row group 1, ...
//! +-------------------+
//! |  Footer (JSON)    |  schema + per-row-group byte ranges and stats
//! +-------------------+
//! |  Footer length    |  u64 le
//! |  Magic "SCOL"     |  4 bytes
//! +-------------------+
//! ```
//!
//! The footer carries min/max/null-count statistics per column chunk, so a
//! metadata scan reads the footer only and never touches payload bytes.
//! Row groups map one-to-one onto fragments. Text columns hold per-row-group
//! local dictionary ids; the wrapper remaps them into its table-level
//! dictionary during buffer population.

use super::delimited::encode_column;
use super::source::{list_source, SourceLedger};
use super::{DataWrapper, Dictionary, Value, NULL_DICT_ID};
use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use strata_catalog::ForeignTable;
use strata_common::{
    BufferMap, ChunkKey, ChunkMetadata, ChunkMetadataVector, ColumnStats, Datum, ElementType,
    Encoding, Error, Result, TableSchema, VarlenKind,
};
use tracing::debug;

/// Magic bytes of the columnar file format
pub const MAGIC: [u8; 4] = *b"SCOL";

/// Current format version
pub const FORMAT_VERSION: u32 = 1;

const HEADER_LEN: u64 = 8;
const TRAILER_LEN: u64 = 12;

#[derive(Serialize, Deserialize)]
struct FileFooter {
    schema: Vec<FooterColumn>,
    row_groups: Vec<RowGroupMeta>,
}

#[derive(Serialize, Deserialize)]
struct FooterColumn {
    id: i32,
    name: String,
    element_type: ElementType,
}

#[derive(Clone, Serialize, Deserialize)]
struct RowGroupMeta {
    row_count: u64,
    columns: Vec<ColumnChunkMeta>,
}

#[derive(Clone, Serialize, Deserialize)]
struct ColumnChunkMeta {
    column_id: i32,
    data_offset: u64,
    data_len: u64,
    index_offset: u64,
    index_len: u64,
    null_count: u64,
    min: Option<Datum>,
    max: Option<Datum>,
    /// Row-group-local dictionary for text columns
    dict: Option<Vec<String>>,
}

fn corrupt(path: &Path, reason: impl Into<String>) -> Error {
    Error::CorruptSource {
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

fn read_footer(path: &Path) -> Result<FileFooter> {
    let mut file = File::open(path).map_err(|e| Error::SourceUnavailable {
        path: path.display().to_string(),
        source: e,
    })?;
    let file_len = file.metadata()?.len();
    if file_len < HEADER_LEN + TRAILER_LEN {
        return Err(corrupt(path, "file too small for header and trailer"));
    }

    let mut header = [0u8; HEADER_LEN as usize];
    file.read_exact(&mut header)?;
    let mut buf = &header[..];
    let mut magic = [0u8; 4];
    buf.copy_to_slice(&mut magic);
    if magic != MAGIC {
        return Err(corrupt(path, "invalid magic"));
    }
    let version = buf.get_u32_le();
    if version != FORMAT_VERSION {
        return Err(corrupt(path, format!("unsupported format version: {version}")));
    }

    let mut trailer = [0u8; TRAILER_LEN as usize];
    file.seek(SeekFrom::End(-(TRAILER_LEN as i64)))?;
    file.read_exact(&mut trailer)?;
    let mut buf = &trailer[..];
    let footer_len = buf.get_u64_le();
    let mut trailer_magic = [0u8; 4];
    buf.copy_to_slice(&mut trailer_magic);
    if trailer_magic != MAGIC {
        return Err(corrupt(path, "invalid trailer magic"));
    }
    if footer_len > file_len - HEADER_LEN - TRAILER_LEN {
        return Err(corrupt(path, "footer length exceeds file size"));
    }

    file.seek(SeekFrom::End(-(TRAILER_LEN as i64) - footer_len as i64))?;
    let mut footer_bytes = vec![0u8; footer_len as usize];
    file.read_exact(&mut footer_bytes)?;
    serde_json::from_slice(&footer_bytes).map_err(|e| corrupt(path, format!("bad footer: {e}")))
}

fn read_range(file: &mut File, offset: u64, len: u64) -> Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut bytes = vec![0u8; len as usize];
    file.read_exact(&mut bytes)?;
    Ok(bytes)
}

// ── writer ───────────────────────────────────────────────────────────────

/// Produces columnar files the wrapper can scan
pub struct ColumnarFileWriter {
    schema: TableSchema,
    row_group_size: u64,
    rows: Vec<Vec<Value>>,
}

impl ColumnarFileWriter {
    pub fn new(schema: TableSchema, row_group_size: u64) -> Self {
        assert!(row_group_size > 0, "row group size must be positive");
        Self {
            schema,
            row_group_size,
            rows: Vec::new(),
        }
    }

    pub fn append_row(&mut self, row: Vec<Value>) -> Result<()> {
        if row.len() != self.schema.num_columns() {
            return Err(Error::internal(format!(
                "row arity {} does not match schema arity {}",
                row.len(),
                self.schema.num_columns()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn finish(&self, path: &Path) -> Result<()> {
        let mut payload = Vec::new();
        let mut row_groups = Vec::new();

        for rows_chunk in self.rows.chunks(self.row_group_size as usize) {
            let mut columns = Vec::new();
            for column in self.schema.columns() {
                let values: Vec<&Value> = rows_chunk
                    .iter()
                    .map(|row| &row[column.id as usize - 1])
                    .collect();
                let mut local_dict = Dictionary::default();
                let encoded = encode_column(column, &values, &mut local_dict)?;

                let data_offset = HEADER_LEN + payload.len() as u64;
                let data_len = encoded.data.len() as u64;
                payload.extend_from_slice(&encoded.data);
                let (index_offset, index_len) = match &encoded.index {
                    Some(index) => {
                        let offset = HEADER_LEN + payload.len() as u64;
                        payload.extend_from_slice(index);
                        (offset, index.len() as u64)
                    }
                    None => (0, 0),
                };

                columns.push(ColumnChunkMeta {
                    column_id: column.id,
                    data_offset,
                    data_len,
                    index_offset,
                    index_len,
                    null_count: encoded.stats.null_count,
                    min: encoded.stats.min,
                    max: encoded.stats.max,
                    dict: matches!(column.element_type, ElementType::Text)
                        .then(|| local_dict.strings().to_vec()),
                });
            }
            row_groups.push(RowGroupMeta {
                row_count: rows_chunk.len() as u64,
                columns,
            });
        }

        let footer = FileFooter {
            schema: self
                .schema
                .columns()
                .iter()
                .map(|c| FooterColumn {
                    id: c.id,
                    name: c.name.clone(),
                    element_type: c.element_type.clone(),
                })
                .collect(),
            row_groups,
        };
        let footer_json = serde_json::to_vec(&footer)?;

        let mut out = BytesMut::with_capacity(
            HEADER_LEN as usize + payload.len() + footer_json.len() + TRAILER_LEN as usize,
        );
        out.put_slice(&MAGIC);
        out.put_u32_le(FORMAT_VERSION);
        out.put_slice(&payload);
        out.put_slice(&footer_json);
        out.put_u64_le(footer_json.len() as u64);
        out.put_slice(&MAGIC);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, &out)?;
        Ok(())
    }
}

// ── wrapper ──────────────────────────────────────────────────────────────

#[derive(Default, Serialize, Deserialize)]
struct ColumnarState {
    ledger: SourceLedger,
    fragments: Vec<ColumnarFragment>,
    dictionaries: BTreeMap<i32, Dictionary>,
}

#[derive(Clone, Serialize, Deserialize)]
struct ColumnarFragment {
    fragment_id: i32,
    path: String,
    row_count: u64,
    columns: Vec<ColumnChunkMeta>,
}

/// Data wrapper for columnar binary sources
pub struct ColumnarDataWrapper {
    table: Arc<ForeignTable>,
    state: Mutex<ColumnarState>,
    restored: AtomicBool,
}

impl ColumnarDataWrapper {
    pub fn new(table: Arc<ForeignTable>) -> Self {
        Self {
            table,
            state: Mutex::new(ColumnarState::default()),
            restored: AtomicBool::new(false),
        }
    }

    fn validate_schema(&self, footer: &FileFooter, entry_name: &str) -> Result<()> {
        let schema = &self.table.schema;
        if footer.schema.len() != schema.num_columns() {
            return Err(Error::SchemaMismatch {
                expected: schema.num_columns(),
                found: footer.schema.len(),
                path: entry_name.to_string(),
            });
        }
        for (declared, on_disk) in schema.columns().iter().zip(&footer.schema) {
            if declared.element_type != on_disk.element_type {
                return Err(Error::SchemaTypeMismatch {
                    column: declared.name.clone(),
                    path: entry_name.to_string(),
                });
            }
        }
        Ok(())
    }
}

impl DataWrapper for ColumnarDataWrapper {
    fn populate_chunk_metadata(&self, out: &mut ChunkMetadataVector) -> Result<()> {
        let entries = list_source(&self.table.file_path)?;
        if let Some(member) = entries.iter().find(|e| e.member.is_some()) {
            return Err(corrupt(
                &member.path,
                "archive sources are not supported for columnar tables",
            ));
        }

        let mut state = self.state.lock();
        if self.table.is_append_mode() && !state.ledger.is_empty() {
            state.ledger.check_append_growth(&entries)?;
        }

        let db_id = self.table.db_id;
        let table_id = self.table.id;
        state.fragments.clear();
        let mut fragment_id = 0i32;
        for entry in &entries {
            let footer = read_footer(&entry.path)?;
            self.validate_schema(&footer, &entry.name)?;
            for row_group in &footer.row_groups {
                for chunk in &row_group.columns {
                    let column = self.table.schema.column(chunk.column_id).ok_or_else(|| {
                        corrupt(&entry.path, format!("unknown column id {}", chunk.column_id))
                    })?;
                    let key = if column.element_type.is_var_len() {
                        ChunkKey::varlen(db_id, table_id, column.id, fragment_id, VarlenKind::Data)
                    } else {
                        ChunkKey::data(db_id, table_id, column.id, fragment_id)
                    };
                    out.push((
                        key,
                        ChunkMetadata {
                            num_bytes: chunk.data_len,
                            num_rows: row_group.row_count,
                            stats: ColumnStats {
                                min: chunk.min.clone(),
                                max: chunk.max.clone(),
                                null_count: chunk.null_count,
                            },
                        },
                    ));
                }
                state.fragments.push(ColumnarFragment {
                    fragment_id,
                    path: entry.path.display().to_string(),
                    row_count: row_group.row_count,
                    columns: row_group.columns.clone(),
                });
                fragment_id += 1;
            }
        }
        state.ledger.record(&entries);
        debug!(
            "columnar scan of {}: {} fragments",
            self.table.file_path.display(),
            state.fragments.len()
        );
        Ok(())
    }

    fn populate_chunk_buffers(&self, required: &BufferMap, _optional: &BufferMap) -> Result<()> {
        if required.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();

        let mut by_fragment: BTreeMap<i32, Vec<&ChunkKey>> = BTreeMap::new();
        for key in required.keys() {
            by_fragment.entry(key.fragment_id()).or_default().push(key);
        }

        for (fragment_id, keys) in by_fragment {
            let fragment = state
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
            let path = Path::new(&fragment.path);
            let mut file = File::open(path).map_err(|e| Error::SourceUnavailable {
                path: fragment.path.clone(),
                source: e,
            })?;

            for key in keys {
                let chunk = fragment
                    .columns
                    .iter()
                    .find(|c| c.column_id == key.column_id())
                    .ok_or_else(|| {
                        Error::internal(format!(
                            "chunk requested for unknown column id {}",
                            key.column_id()
                        ))
                    })?;
                let column = self
                    .table
                    .schema
                    .column(key.column_id())
                    .expect("scanned columns exist in the catalog schema");

                let bytes = if key.is_varlen_index_key() {
                    read_range(&mut file, chunk.index_offset, chunk.index_len)?
                } else {
                    let raw = read_range(&mut file, chunk.data_offset, chunk.data_len)?;
                    match &chunk.dict {
                        Some(local_strings) => {
                            let local = Dictionary::from_strings(local_strings.clone());
                            let table_dict =
                                state.dictionaries.entry(key.column_id()).or_default();
                            remap_dictionary_ids(&raw, &local, table_dict, path)?
                        }
                        None => raw,
                    }
                };

                let buffer = &required[key];
                let mut locked = buffer.lock();
                locked.write(&bytes);
                let encoding = match key.is_varlen_key() {
                    true if key.is_varlen_index_key() => {
                        Encoding::varlen(column.element_type.clone(), VarlenKind::Index)
                    }
                    true => Encoding::varlen(column.element_type.clone(), VarlenKind::Data),
                    false => Encoding::fixed(column.element_type.clone()),
                };
                locked.set_encoding(encoding);
                locked.clear_dirty();
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
        let mut restored: ColumnarState = serde_json::from_str(&contents)?;
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

/// Rewrite row-group-local dictionary ids as table-level ids
fn remap_dictionary_ids(
    raw: &[u8],
    local: &Dictionary,
    table_dict: &mut Dictionary,
    path: &Path,
) -> Result<Vec<u8>> {
    if raw.len() % 4 != 0 {
        return Err(corrupt(path, "dictionary column chunk is not id-aligned"));
    }
    let mut out = Vec::with_capacity(raw.len());
    for id_bytes in raw.chunks_exact(4) {
        let id = i32::from_le_bytes(id_bytes.try_into().expect("chunks_exact yields 4 bytes"));
        let mapped = if id == NULL_DICT_ID {
            NULL_DICT_ID
        } else {
            let value = local
                .lookup(id)
                .ok_or_else(|| corrupt(path, format!("dictionary id {id} out of range")))?;
            table_dict.intern(value)
        };
        out.extend_from_slice(&mapped.to_le_bytes());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as OptionMap;
    use strata_catalog::{Catalog, DataWrapperType};
    use strata_common::{new_shared_buffer, ScalarType};
    use tempfile::TempDir;

    fn schema() -> TableSchema {
        TableSchema::new([
            ("i".to_string(), ElementType::Scalar(ScalarType::Int)),
            ("t".to_string(), ElementType::Text),
        ])
    }

    fn write_example(path: &Path, rows: &[(i64, &str)], row_group_size: u64) {
        let mut writer = ColumnarFileWriter::new(schema(), row_group_size);
        for (i, t) in rows {
            writer
                .append_row(vec![Value::Int(*i), Value::Text(t.to_string())])
                .unwrap();
        }
        writer.finish(path).unwrap();
    }

    fn table_over(catalog: &Catalog, name: &str, path: &Path) -> Arc<ForeignTable> {
        let options: OptionMap<String, String> =
            [("file_path".to_string(), path.display().to_string())]
                .into_iter()
                .collect();
        catalog
            .create_foreign_table(name, schema(), DataWrapperType::Columnar, &options)
            .unwrap()
    }

    fn decode_i32s(bytes: &[u8]) -> Vec<i32> {
        bytes
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn test_metadata_from_footer_stats() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("example.scol");
        write_example(&path, &[(1, "a"), (2, "aa"), (3, "aaa")], 2);

        let catalog = Catalog::new(1);
        let table = table_over(&catalog, "t", &path);
        let wrapper = ColumnarDataWrapper::new(table);

        let mut metadata = ChunkMetadataVector::new();
        wrapper.populate_chunk_metadata(&mut metadata).unwrap();

        // 2 row groups x 2 columns
        assert_eq!(metadata.len(), 4);
        let (key, meta) = &metadata[0];
        assert_eq!(key.fragment_id(), 0);
        assert_eq!(meta.num_rows, 2);
        assert_eq!(meta.stats.min, Some(Datum::Int(1)));
        assert_eq!(meta.stats.max, Some(Datum::Int(2)));
        let (_, last) = &metadata[3];
        assert_eq!(last.num_rows, 1);
    }

    #[test]
    fn test_metadata_scan_never_reads_payload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("example.scol");
        write_example(&path, &[(7, "x")], 1);

        // Scribble over the payload region; header, footer, and trailer stay
        let mut bytes = std::fs::read(&path).unwrap();
        let footer = read_footer(&path).unwrap();
        let data_start = footer.row_groups[0].columns[0].data_offset as usize;
        let data_end = data_start + footer.row_groups[0].columns[0].data_len as usize;
        for byte in &mut bytes[data_start..data_end] {
            *byte = 0xFF;
        }
        std::fs::write(&path, &bytes).unwrap();

        let catalog = Catalog::new(1);
        let table = table_over(&catalog, "t", &path);
        let wrapper = ColumnarDataWrapper::new(table);
        let mut metadata = ChunkMetadataVector::new();
        wrapper.populate_chunk_metadata(&mut metadata).unwrap();
        assert_eq!(metadata.len(), 2);
    }

    #[test]
    fn test_buffer_population_remaps_dictionaries() {
        let dir = TempDir::new().unwrap();
        // Two files with overlapping local dictionaries
        write_example(&dir.path().join("a.scol"), &[(1, "x"), (2, "y")], 2);
        write_example(&dir.path().join("b.scol"), &[(3, "y"), (4, "z")], 2);

        let catalog = Catalog::new(1);
        let table = table_over(&catalog, "t", dir.path());
        let wrapper = ColumnarDataWrapper::new(table);
        let mut metadata = ChunkMetadataVector::new();
        wrapper.populate_chunk_metadata(&mut metadata).unwrap();

        let frag0_text = ChunkKey::data(1, 1, 2, 0);
        let frag1_text = ChunkKey::data(1, 1, 2, 1);
        let required = BufferMap::from([
            (frag0_text.clone(), new_shared_buffer()),
            (frag1_text.clone(), new_shared_buffer()),
        ]);
        wrapper
            .populate_chunk_buffers(&required, &BufferMap::new())
            .unwrap();

        // Table-level ids: x=0, y=1 from file a; y stays 1, z=2 from file b
        assert_eq!(decode_i32s(required[&frag0_text].lock().as_slice()), vec![0, 1]);
        assert_eq!(decode_i32s(required[&frag1_text].lock().as_slice()), vec![1, 2]);
    }

    #[test]
    fn test_fixed_columns_roundtrip_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("example.scol");
        write_example(&path, &[(10, "a"), (20, "b"), (30, "c")], 8);

        let catalog = Catalog::new(1);
        let table = table_over(&catalog, "t", &path);
        let wrapper = ColumnarDataWrapper::new(table);
        wrapper
            .populate_chunk_metadata(&mut ChunkMetadataVector::new())
            .unwrap();

        let int_key = ChunkKey::data(1, 1, 1, 0);
        let required = BufferMap::from([(int_key.clone(), new_shared_buffer())]);
        wrapper
            .populate_chunk_buffers(&required, &BufferMap::new())
            .unwrap();
        assert_eq!(decode_i32s(required[&int_key].lock().as_slice()), vec![10, 20, 30]);
    }

    #[test]
    fn test_corrupt_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.scol");
        std::fs::write(&path, b"not a columnar file at all........").unwrap();

        let catalog = Catalog::new(1);
        let table = table_over(&catalog, "t", &path);
        let wrapper = ColumnarDataWrapper::new(table);
        let err = wrapper
            .populate_chunk_metadata(&mut ChunkMetadataVector::new())
            .unwrap_err();
        assert!(matches!(err, Error::CorruptSource { .. }));
        assert!(err.to_string().contains("bad.scol"));
    }

    #[test]
    fn test_schema_mismatch_against_footer() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("narrow.scol");
        let narrow = TableSchema::new([("i".to_string(), ElementType::Scalar(ScalarType::Int))]);
        let mut writer = ColumnarFileWriter::new(narrow, 2);
        writer.append_row(vec![Value::Int(1)]).unwrap();
        writer.finish(&path).unwrap();

        let catalog = Catalog::new(1);
        let table = table_over(&catalog, "t", &path);
        let wrapper = ColumnarDataWrapper::new(table);
        let err = wrapper
            .populate_chunk_metadata(&mut ChunkMetadataVector::new())
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Mismatched number of logical columns: expected 2, found 1: \
             in file \"narrow.scol\""
        );
    }
}
