//! The foreign-storage manager.
//!
//! Owns per-table data wrappers, brokers chunk-fetch requests against the
//! disk cache, and holds the temporary chunk map used when the cache is
//! disabled and a wrapper emits sibling chunks the caller did not ask for.

use crate::wrapper::columnar::ColumnarDataWrapper;
use crate::wrapper::delimited::DelimitedDataWrapper;
use crate::wrapper::{DataWrapper, MockDataWrapper};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use strata_cache::ChunkCache;
use strata_catalog::{Catalog, DataWrapperType};
use strata_common::{
    new_shared_buffer, schema::expand_logical_column, BufferMap, ChunkBuffer, ChunkKey,
    ChunkMetadataVector, Error, Result, SharedBuffer,
};
use tracing::debug;

/// The buffer-manager capability set consumed by query execution. Foreign
/// storage serves the read path; every mutating operation is unsupported.
pub trait BufferMgr: Send + Sync {
    fn mgr_name(&self) -> &'static str;

    fn fetch_buffer(
        &self,
        key: &ChunkKey,
        destination: &mut ChunkBuffer,
        num_bytes: usize,
    ) -> Result<()>;
    fn get_chunk_metadata_vec(&self, out: &mut ChunkMetadataVector) -> Result<()>;
    fn get_chunk_metadata_vec_for_key_prefix(
        &self,
        out: &mut ChunkMetadataVector,
        prefix: &ChunkKey,
    ) -> Result<()>;

    fn create_buffer(&self, key: &ChunkKey, page_size: usize, initial_size: usize)
        -> Result<SharedBuffer>;
    fn put_buffer(
        &self,
        key: &ChunkKey,
        source: &ChunkBuffer,
        num_bytes: usize,
    ) -> Result<SharedBuffer>;
    fn delete_buffer(&self, key: &ChunkKey) -> Result<()>;
    fn delete_buffers_with_prefix(&self, prefix: &ChunkKey) -> Result<()>;
    fn is_buffer_on_device(&self, key: &ChunkKey) -> Result<bool>;
    fn num_chunks(&self) -> Result<usize>;
    fn alloc(&self, num_bytes: usize) -> Result<SharedBuffer>;
    fn free(&self, buffer: SharedBuffer) -> Result<()>;
    fn max_size(&self) -> Result<usize>;
    fn in_use_size(&self) -> Result<usize>;
    fn allocated_size(&self) -> Result<usize>;
    fn is_allocation_capped(&self) -> Result<bool>;
    fn checkpoint(&self) -> Result<()>;
    fn checkpoint_table(&self, db_id: i32, table_id: i32) -> Result<()>;
    fn print_slabs(&self) -> Result<String>;
    fn clear_slabs(&self) -> Result<()>;
}

/// Brokers chunk requests between query execution, data wrappers, and the
/// disk cache
pub struct ForeignStorageMgr {
    pub(crate) catalog: Arc<Catalog>,
    pub(crate) cache: Option<Arc<ChunkCache>>,
    pub(crate) wrappers: RwLock<BTreeMap<ChunkKey, Arc<dyn DataWrapper>>>,
    pub(crate) temp_chunk_buffers: RwLock<BTreeMap<ChunkKey, SharedBuffer>>,
}

impl ForeignStorageMgr {
    pub fn new(catalog: Arc<Catalog>, cache: Option<Arc<ChunkCache>>) -> Arc<Self> {
        Arc::new(Self {
            catalog,
            cache,
            wrappers: RwLock::new(BTreeMap::new()),
            temp_chunk_buffers: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn is_cache_enabled(&self) -> bool {
        self.cache.is_some()
    }

    pub fn cache(&self) -> Option<&Arc<ChunkCache>> {
        self.cache.as_ref()
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    // ── fetch path ───────────────────────────────────────────────────────

    /// Fill `destination` with the bytes of chunk `key`, populating the
    /// wrapper and the cache as needed. `num_bytes` of zero means the whole
    /// chunk.
    pub fn fetch_buffer(
        &self,
        key: &ChunkKey,
        destination: &mut ChunkBuffer,
        num_bytes: usize,
    ) -> Result<()> {
        assert!(!destination.is_dirty());

        let mut cached = true;
        let mut buffer = self
            .cache
            .as_ref()
            .and_then(|cache| cache.get_cached_chunk_if_exists(key));

        let mut buffer_from_map = false;
        if self.cache.is_none() && buffer.is_none() {
            if let Some(temp) = self.temp_chunk_buffers.read().get(key) {
                buffer = Some(SharedBuffer::clone(temp));
                buffer_from_map = true;
            }
        }

        let mut chunk_keys = Vec::new();
        if buffer.is_none() {
            if self.create_data_wrapper_if_not_exists(key)? {
                let table_key = key.table_prefix();
                // Prefer the on-disk snapshot; fall back to a full scan
                if !self.recover_data_wrapper_from_disk(&table_key)? {
                    let mut metadata = ChunkMetadataVector::new();
                    self.get_data_wrapper(&table_key)?
                        .populate_chunk_metadata(&mut metadata)?;
                }
            }
            cached = false;
            let required = self.get_chunk_buffers_to_populate(key, &mut chunk_keys)?;
            debug_assert!(required.contains_key(key));
            let optional = BufferMap::new();
            self.get_data_wrapper(key)?
                .populate_chunk_buffers(&required, &optional)?;
            buffer = Some(SharedBuffer::clone(&required[key]));
        }
        let buffer = buffer.expect("fetch path always produces a buffer");

        // Read the source buffer into the destination unless the wrapper
        // populated the destination's buffer directly (no cache, no temp)
        if self.cache.is_some() || buffer_from_map || cached {
            buffer.lock().copy_to(destination, num_bytes);
        } else {
            *destination = buffer.lock().take();
        }

        if buffer_from_map {
            self.temp_chunk_buffers.write().remove(key);
        }

        // Write back to the cache only on a miss
        if !cached {
            if let Some(cache) = &self.cache {
                cache.cache_table_chunks(&chunk_keys)?;
            }
        }
        Ok(())
    }

    /// Build the buffer set a wrapper must populate to serve `key`: one
    /// buffer per physical chunk of the key's logical column in the key's
    /// fragment. With the cache enabled the buffers are cache-pending; with
    /// it disabled the destination chunk gets a direct buffer and the
    /// siblings go through the temp map until claimed.
    fn get_chunk_buffers_to_populate(
        &self,
        destination_key: &ChunkKey,
        chunk_keys: &mut Vec<ChunkKey>,
    ) -> Result<BufferMap> {
        let table = self
            .catalog
            .get_foreign_table(destination_key.db_id(), destination_key.table_id())?;
        *chunk_keys = expand_logical_column(
            &table.schema,
            destination_key.db_id(),
            destination_key.table_id(),
            destination_key.column_id(),
            destination_key.fragment_id(),
        )?;

        if let Some(cache) = &self.cache {
            return Ok(cache.get_chunk_buffers_for_caching(chunk_keys));
        }

        let mut buffers = BufferMap::new();
        buffers.insert(destination_key.clone(), new_shared_buffer());
        for chunk_key in chunk_keys.iter() {
            if chunk_key != destination_key {
                let buffer = new_shared_buffer();
                self.temp_chunk_buffers
                    .write()
                    .insert(chunk_key.clone(), SharedBuffer::clone(&buffer));
                buffers.insert(chunk_key.clone(), buffer);
            }
        }
        Ok(buffers)
    }

    // ── metadata paths ───────────────────────────────────────────────────

    /// Scan every known wrapper for metadata; with the cache enabled, also
    /// persist wrapper snapshots and promote the metadata
    pub fn get_chunk_metadata_vec(&self, out: &mut ChunkMetadataVector) -> Result<()> {
        {
            let wrappers = self.wrappers.read();
            for (table_key, wrapper) in wrappers.iter() {
                wrapper.populate_chunk_metadata(out)?;
                if let Some(cache) = &self.cache {
                    wrapper.serialize_internals(&cache.wrapper_metadata_path(table_key))?;
                }
            }
        }
        if let Some(cache) = &self.cache {
            cache.cache_metadata_vec(out)?;
        }
        Ok(())
    }

    /// Metadata for one table. Fast paths in order: cached metadata,
    /// restart recovery without a wrapper, full wrapper scan.
    pub fn get_chunk_metadata_vec_for_key_prefix(
        &self,
        out: &mut ChunkMetadataVector,
        prefix: &ChunkKey,
    ) -> Result<()> {
        assert!(prefix.is_table_key());
        if let Some(cache) = &self.cache {
            if cache.has_cached_metadata_for_key_prefix(prefix) {
                cache.get_cached_metadata_vec_for_key_prefix(out, prefix);
                return Ok(());
            }
            if !self.wrappers.read().contains_key(prefix)
                && cache.recover_cache_for_table(out, prefix)?
            {
                return Ok(());
            }
        }
        self.create_data_wrapper_if_not_exists(prefix)?;
        let wrapper = self.get_data_wrapper(prefix)?;
        wrapper.populate_chunk_metadata(out)?;
        if let Some(cache) = &self.cache {
            wrapper.serialize_internals(&cache.wrapper_metadata_path(prefix))?;
            cache.cache_metadata_vec(out)?;
        }
        Ok(())
    }

    // ── wrapper lifecycle ────────────────────────────────────────────────

    /// Returns true when a wrapper was created by this call
    pub(crate) fn create_data_wrapper_if_not_exists(&self, key: &ChunkKey) -> Result<bool> {
        let table_key = key.table_prefix();
        let mut wrappers = self.wrappers.write();
        if wrappers.contains_key(&table_key) {
            return Ok(false);
        }
        let table = self
            .catalog
            .get_foreign_table(key.db_id(), key.table_id())?;
        let wrapper: Arc<dyn DataWrapper> = match table.wrapper_type {
            DataWrapperType::Delimited => Arc::new(DelimitedDataWrapper::new(table)),
            DataWrapperType::Columnar => Arc::new(ColumnarDataWrapper::new(table)),
        };
        wrappers.insert(table_key.clone(), wrapper);
        debug!("created data wrapper for table prefix {table_key}");
        Ok(true)
    }

    pub(crate) fn get_data_wrapper(&self, key: &ChunkKey) -> Result<Arc<dyn DataWrapper>> {
        let table_key = key.table_prefix();
        self.wrappers
            .read()
            .get(&table_key)
            .cloned()
            .ok_or_else(|| Error::internal(format!("no data wrapper for table prefix {table_key}")))
    }

    pub fn has_data_wrapper_for_chunk(&self, key: &ChunkKey) -> bool {
        self.wrappers.read().contains_key(&key.table_prefix())
    }

    pub fn is_datawrapper_restored(&self, key: &ChunkKey) -> bool {
        if !self.has_data_wrapper_for_chunk(key) {
            return false;
        }
        self.get_data_wrapper(key)
            .map(|w| w.is_restored())
            .unwrap_or(false)
    }

    /// Test seam: replace the wrapper of a table with a mock that composes
    /// over the prior instance
    pub fn set_data_wrapper(&self, table_key: &ChunkKey, mock: Arc<dyn MockDataWrapper>) {
        assert!(table_key.is_table_key());
        let mut wrappers = self.wrappers.write();
        let parent = wrappers
            .get(table_key)
            .cloned()
            .expect("set_data_wrapper requires an existing wrapper");
        mock.set_parent(parent);
        wrappers.insert(table_key.clone(), mock);
    }

    /// Rebuild a wrapper from the cache directory snapshot, if both the
    /// snapshot and recovered metadata exist
    pub(crate) fn recover_data_wrapper_from_disk(&self, table_key: &ChunkKey) -> Result<bool> {
        let Some(cache) = &self.cache else {
            return Ok(false);
        };
        let mut metadata = ChunkMetadataVector::new();
        let mut has_cached_metadata = false;
        if cache.has_cached_metadata_for_key_prefix(table_key) {
            cache.get_cached_metadata_vec_for_key_prefix(&mut metadata, table_key);
            has_cached_metadata = true;
        }
        if !has_cached_metadata {
            has_cached_metadata = cache.recover_cache_for_table(&mut metadata, table_key)?;
        }
        let snapshot = cache.wrapper_metadata_path(table_key);
        if snapshot.exists() && has_cached_metadata {
            self.get_data_wrapper(table_key)?
                .restore_internals(&snapshot, &metadata)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    // ── teardown ─────────────────────────────────────────────────────────

    /// Drop everything related to one table: its wrapper, its cache
    /// entries (snapshot included), and its temp-map entries
    pub fn remove_table_related_ds(&self, db_id: i32, table_id: i32) -> Result<()> {
        let table_key = ChunkKey::table(db_id, table_id);
        self.wrappers.write().remove(&table_key);

        if let Some(cache) = &self.cache {
            cache.clear_for_table_prefix(&table_key)?;
            let snapshot = cache.wrapper_metadata_path(&table_key);
            if snapshot.exists() {
                std::fs::remove_file(snapshot)?;
            }
        }

        self.clear_temp_chunk_buffer_map_entries_for_table(&table_key);
        Ok(())
    }

    pub(crate) fn clear_temp_chunk_buffer_map_entries_for_table(&self, table_key: &ChunkKey) {
        assert!(table_key.is_table_key());
        let mut temp = self.temp_chunk_buffers.write();
        let doomed: Vec<ChunkKey> = temp
            .range(table_key.clone()..table_key.prefix_upper_bound())
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            temp.remove(&key);
        }
    }
}

impl BufferMgr for ForeignStorageMgr {
    fn mgr_name(&self) -> &'static str {
        "foreign_storage_mgr"
    }

    fn fetch_buffer(
        &self,
        key: &ChunkKey,
        destination: &mut ChunkBuffer,
        num_bytes: usize,
    ) -> Result<()> {
        ForeignStorageMgr::fetch_buffer(self, key, destination, num_bytes)
    }

    fn get_chunk_metadata_vec(&self, out: &mut ChunkMetadataVector) -> Result<()> {
        ForeignStorageMgr::get_chunk_metadata_vec(self, out)
    }

    fn get_chunk_metadata_vec_for_key_prefix(
        &self,
        out: &mut ChunkMetadataVector,
        prefix: &ChunkKey,
    ) -> Result<()> {
        ForeignStorageMgr::get_chunk_metadata_vec_for_key_prefix(self, out, prefix)
    }

    fn create_buffer(
        &self,
        _key: &ChunkKey,
        _page_size: usize,
        _initial_size: usize,
    ) -> Result<SharedBuffer> {
        Err(Error::Unsupported("create_buffer"))
    }

    fn put_buffer(
        &self,
        _key: &ChunkKey,
        _source: &ChunkBuffer,
        _num_bytes: usize,
    ) -> Result<SharedBuffer> {
        Err(Error::Unsupported("put_buffer"))
    }

    fn delete_buffer(&self, _key: &ChunkKey) -> Result<()> {
        Err(Error::Unsupported("delete_buffer"))
    }

    fn delete_buffers_with_prefix(&self, _prefix: &ChunkKey) -> Result<()> {
        Err(Error::Unsupported("delete_buffers_with_prefix"))
    }

    fn is_buffer_on_device(&self, _key: &ChunkKey) -> Result<bool> {
        Err(Error::Unsupported("is_buffer_on_device"))
    }

    fn num_chunks(&self) -> Result<usize> {
        Err(Error::Unsupported("num_chunks"))
    }

    fn alloc(&self, _num_bytes: usize) -> Result<SharedBuffer> {
        Err(Error::Unsupported("alloc"))
    }

    fn free(&self, _buffer: SharedBuffer) -> Result<()> {
        Err(Error::Unsupported("free"))
    }

    fn max_size(&self) -> Result<usize> {
        Err(Error::Unsupported("max_size"))
    }

    fn in_use_size(&self) -> Result<usize> {
        Err(Error::Unsupported("in_use_size"))
    }

    fn allocated_size(&self) -> Result<usize> {
        Err(Error::Unsupported("allocated_size"))
    }

    fn is_allocation_capped(&self) -> Result<bool> {
        Err(Error::Unsupported("is_allocation_capped"))
    }

    fn checkpoint(&self) -> Result<()> {
        Err(Error::Unsupported("checkpoint"))
    }

    fn checkpoint_table(&self, _db_id: i32, _table_id: i32) -> Result<()> {
        Err(Error::Unsupported("checkpoint_table"))
    }

    fn print_slabs(&self) -> Result<String> {
        Err(Error::Unsupported("print_slabs"))
    }

    fn clear_slabs(&self) -> Result<()> {
        Err(Error::Unsupported("clear_slabs"))
    }
}
