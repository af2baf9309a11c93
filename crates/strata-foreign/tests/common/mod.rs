#![allow(dead_code)]

//! Shared fixtures for the foreign-storage scenario tests.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use strata_cache::ChunkCache;
use strata_catalog::{Catalog, DataWrapperType, ForeignTable};
use strata_common::{
    BufferMap, ChunkBuffer, ChunkKey, ChunkMetadataVector, ElementType, Result, TableSchema,
};
use strata_foreign::wrapper::{DataWrapper, MockDataWrapper};
use strata_foreign::ForeignStorageMgr;
use tempfile::TempDir;

pub struct TestEnv {
    pub dir: TempDir,
    pub catalog: Arc<Catalog>,
    pub cache: Option<Arc<ChunkCache>>,
    pub mgr: Arc<ForeignStorageMgr>,
}

impl TestEnv {
    pub fn with_cache() -> Self {
        Self::build(TempDir::new().unwrap(), true)
    }

    pub fn without_cache() -> Self {
        Self::build(TempDir::new().unwrap(), false)
    }

    fn build(dir: TempDir, cache_enabled: bool) -> Self {
        let catalog = Catalog::new(1);
        let cache = cache_enabled
            .then(|| Arc::new(ChunkCache::new(dir.path().join("disk_cache")).unwrap()));
        let mgr = ForeignStorageMgr::new(Arc::clone(&catalog), cache.clone());
        Self {
            dir,
            catalog,
            cache,
            mgr,
        }
    }

    /// Tear down catalog, cache, and manager; keep the directory (and with
    /// it the disk cache) and bring up fresh instances over it
    pub fn restart(self) -> Self {
        let TestEnv { dir, .. } = self;
        Self::build(dir, true)
    }

    pub fn cache(&self) -> &Arc<ChunkCache> {
        self.cache.as_ref().expect("test env has a cache")
    }

    pub fn data_path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn create_delimited_table(
        &self,
        name: &str,
        columns: &[(&str, ElementType)],
        file_path: &Path,
        extra_options: &[(&str, &str)],
    ) -> Arc<ForeignTable> {
        let schema = TableSchema::new(
            columns
                .iter()
                .map(|(name, ty)| (name.to_string(), ty.clone())),
        );
        let mut options: BTreeMap<String, String> =
            [("file_path".to_string(), file_path.display().to_string())]
                .into_iter()
                .collect();
        for (key, value) in extra_options {
            options.insert(key.to_string(), value.to_string());
        }
        self.catalog
            .create_foreign_table(name, schema, DataWrapperType::Delimited, &options)
            .unwrap()
    }

    pub fn create_columnar_table(
        &self,
        name: &str,
        columns: &[(&str, ElementType)],
        file_path: &Path,
        extra_options: &[(&str, &str)],
    ) -> Arc<ForeignTable> {
        let schema = TableSchema::new(
            columns
                .iter()
                .map(|(name, ty)| (name.to_string(), ty.clone())),
        );
        let mut options: BTreeMap<String, String> =
            [("file_path".to_string(), file_path.display().to_string())]
                .into_iter()
                .collect();
        for (key, value) in extra_options {
            options.insert(key.to_string(), value.to_string());
        }
        self.catalog
            .create_foreign_table(name, schema, DataWrapperType::Columnar, &options)
            .unwrap()
    }

    pub fn table_metadata(&self, table: &ForeignTable) -> ChunkMetadataVector {
        let mut out = ChunkMetadataVector::new();
        self.mgr
            .get_chunk_metadata_vec_for_key_prefix(&mut out, &table.table_key())
            .unwrap();
        out
    }

    pub fn fetch(&self, key: &ChunkKey) -> ChunkBuffer {
        let mut destination = ChunkBuffer::new();
        self.mgr.fetch_buffer(key, &mut destination, 0).unwrap();
        destination
    }
}

pub fn write_rows(path: &Path, rows: &[&str]) {
    let mut contents = rows.join("\n");
    contents.push('\n');
    std::fs::write(path, contents).unwrap();
}

pub fn decode_i32s(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

pub fn decode_u64s(bytes: &[u8]) -> Vec<u64> {
    bytes
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

/// Epoch seconds formatted the way `refresh_start_date_time` expects
pub fn start_date_time_in(seconds_from_now: i64) -> String {
    let when = chrono::Utc::now() + chrono::Duration::seconds(seconds_from_now);
    when.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Mock wrapper that can be told to fail, delegating to the wrapper it
/// replaced otherwise
#[derive(Default)]
pub struct FlakyDataWrapper {
    parent: Mutex<Option<Arc<dyn DataWrapper>>>,
    throw_on_metadata_scan: AtomicBool,
    throw_on_chunk_fetch: AtomicBool,
}

impl FlakyDataWrapper {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn throw_on_metadata_scan(&self, throw: bool) {
        self.throw_on_metadata_scan.store(throw, Ordering::Release);
    }

    pub fn throw_on_chunk_fetch(&self, throw: bool) {
        self.throw_on_chunk_fetch.store(throw, Ordering::Release);
    }

    fn parent(&self) -> Arc<dyn DataWrapper> {
        self.parent
            .lock()
            .clone()
            .expect("mock wrapper has a parent")
    }
}

impl DataWrapper for FlakyDataWrapper {
    fn populate_chunk_metadata(&self, out: &mut ChunkMetadataVector) -> Result<()> {
        if self.throw_on_metadata_scan.load(Ordering::Acquire) {
            return Err(strata_common::Error::internal(
                "populate_chunk_metadata mock failure",
            ));
        }
        self.parent().populate_chunk_metadata(out)
    }

    fn populate_chunk_buffers(&self, required: &BufferMap, optional: &BufferMap) -> Result<()> {
        if self.throw_on_chunk_fetch.load(Ordering::Acquire) {
            return Err(strata_common::Error::internal(
                "populate_chunk_buffers mock failure",
            ));
        }
        self.parent().populate_chunk_buffers(required, optional)
    }

    fn serialize_internals(&self, path: &Path) -> Result<()> {
        self.parent().serialize_internals(path)
    }

    fn restore_internals(&self, path: &Path, metadata: &ChunkMetadataVector) -> Result<()> {
        self.parent().restore_internals(path, metadata)
    }

    fn is_restored(&self) -> bool {
        self.parent().is_restored()
    }
}

impl MockDataWrapper for FlakyDataWrapper {
    fn set_parent(&self, parent: Arc<dyn DataWrapper>) {
        *self.parent.lock() = Some(parent);
    }
}
