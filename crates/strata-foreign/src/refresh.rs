//! Table refresh: reconciling cached state with the external source.
//!
//! Two modes. Evict simply drops the table's cache entries; the next query
//! repopulates from the source. Reconcile rescans metadata and eagerly
//! re-populates previously-cached chunks, with an append-mode fast path
//! that only revisits the last (possibly still growing) fragment and any
//! new ones.

use crate::manager::ForeignStorageMgr;
use std::collections::BTreeMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use strata_catalog::{options::parse_refresh_command_options, Catalog};
use strata_common::{BufferMap, ChunkKey, ChunkMetadataVector, Error, Result};
use tracing::{info, warn};

/// Soft budget for one bulk reconcile. Checked between fragments;
/// exceeding it abandons the remaining fragments with a warning.
pub const MAX_REFRESH_TIME: Duration = Duration::from_secs(60 * 60);

/// Seconds since the Unix epoch
pub fn epoch_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

impl ForeignStorageMgr {
    /// Refresh one table, either evicting its cache entries wholesale or
    /// reconciling them chunk-by-chunk
    pub fn refresh_table(&self, table_key: &ChunkKey, evict_cached_entries: bool) -> Result<()> {
        self.clear_temp_chunk_buffer_map_entries_for_table(table_key);
        if evict_cached_entries {
            self.evict_table_from_cache(table_key)
        } else {
            self.refresh_table_in_cache(table_key)
        }
    }

    fn evict_table_from_cache(&self, table_key: &ChunkKey) -> Result<()> {
        let Some(cache) = &self.cache else {
            return Ok(());
        };
        assert!(table_key.is_table_key());
        cache.clear_for_table_prefix(table_key)
    }

    fn refresh_table_in_cache(&self, table_key: &ChunkKey) -> Result<()> {
        let Some(cache) = self.cache.clone() else {
            return Ok(());
        };
        assert!(table_key.is_table_key());
        let table = self
            .catalog
            .get_foreign_table(table_key.db_id(), table_key.table_id())?;
        let append_mode = table.is_append_mode();

        // The wrapper must exist before any metadata is cleared; when
        // appending, bring back its last persisted state
        if self.create_data_wrapper_if_not_exists(table_key)? && append_mode {
            self.recover_data_wrapper_from_disk(table_key)?;
        }

        let old_chunk_keys = cache.get_cached_chunks_for_key_prefix(table_key);
        let wrapper = self.get_data_wrapper(table_key)?;

        // Rescan metadata; failures here leave the cache untouched
        let mut metadata_vec = ChunkMetadataVector::new();
        wrapper.populate_chunk_metadata(&mut metadata_vec)?;
        wrapper.serialize_internals(&cache.wrapper_metadata_path(table_key))?;

        let mut last_frag_id = 0;
        if append_mode {
            if cache.has_cached_metadata_for_key_prefix(table_key) {
                let mut cached_metadata = ChunkMetadataVector::new();
                cache.get_cached_metadata_vec_for_key_prefix(&mut cached_metadata, table_key);
                for (key, _) in &cached_metadata {
                    last_frag_id = last_frag_id.max(key.fragment_id());
                }
            }
        } else {
            cache.clear_for_table_prefix(table_key)?;
        }

        let reconcile = || -> Result<()> {
            if append_mode {
                // Only the last previously-known fragment and newer ones
                // can have changed
                let new_metadata: ChunkMetadataVector = metadata_vec
                    .iter()
                    .filter(|(key, _)| key.fragment_id() >= last_frag_id)
                    .cloned()
                    .collect();
                cache.cache_metadata_vec(&new_metadata)?;
            } else {
                cache.cache_metadata_vec(&metadata_vec)?;
            }

            if old_chunk_keys.is_empty() {
                return Ok(());
            }

            // Re-cache previously-cached chunks one fragment at a time
            let optional_buffers = BufferMap::new();
            let mut chunk_keys_to_be_cached: Vec<ChunkKey> = Vec::new();
            let mut chunk_keys_in_fragment: Vec<ChunkKey> = Vec::new();
            let mut fragment_id = old_chunk_keys[0].fragment_id();
            let mut total_time = Duration::ZERO;
            let mut fragment_start = Instant::now();

            for chunk_key in &old_chunk_keys {
                if append_mode && chunk_key.fragment_id() < last_frag_id {
                    continue;
                }
                if !cache.is_metadata_cached(chunk_key) {
                    continue;
                }
                if chunk_key.fragment_id() != fragment_id {
                    if !chunk_keys_in_fragment.is_empty() {
                        let required =
                            cache.get_chunk_buffers_for_caching(&chunk_keys_in_fragment);
                        wrapper.populate_chunk_buffers(&required, &optional_buffers)?;
                        chunk_keys_in_fragment.clear();
                    }

                    // Buffers for the previous fragment are populated at
                    // this point; stop if the refresh budget is spent
                    total_time += fragment_start.elapsed();
                    if total_time >= MAX_REFRESH_TIME {
                        warn!(
                            "refresh time exceeded for table key {table_key} \
                             after fragment id {fragment_id}"
                        );
                        break;
                    }
                    fragment_start = Instant::now();
                    fragment_id = chunk_key.fragment_id();
                }
                if chunk_key.is_varlen_key() {
                    debug_assert!(chunk_key.is_varlen_data_key());
                    let index_key = chunk_key.varlen_index_sibling();
                    chunk_keys_in_fragment.push(index_key.clone());
                    chunk_keys_to_be_cached.push(index_key);
                }
                chunk_keys_in_fragment.push(chunk_key.clone());
                chunk_keys_to_be_cached.push(chunk_key.clone());
            }
            if !chunk_keys_in_fragment.is_empty() {
                let required = cache.get_chunk_buffers_for_caching(&chunk_keys_in_fragment);
                wrapper.populate_chunk_buffers(&required, &optional_buffers)?;
            }
            cache.cache_table_chunks(&chunk_keys_to_be_cached)?;
            Ok(())
        };

        reconcile().map_err(|e| Error::PostEvictionRefresh(Box::new(e)))?;
        info!("refreshed table prefix {table_key} (append_mode: {append_mode})");
        Ok(())
    }
}

/// Entry point for a `REFRESH FOREIGN TABLES` command on one table:
/// parses the WITH-clause options, drives the manager, and records the
/// refresh bookkeeping in the catalog.
pub fn refresh_foreign_table(
    catalog: &Catalog,
    mgr: &ForeignStorageMgr,
    table_name: &str,
    options: &BTreeMap<String, String>,
) -> Result<()> {
    let evict = parse_refresh_command_options(options)?;
    let table = catalog.foreign_table_by_name(table_name)?;
    mgr.refresh_table(&table.table_key(), evict)?;

    let now = epoch_now();
    table.set_last_refresh_time(now);
    let next = if table.is_scheduled() {
        table.refresh.interval_secs.map(|interval| now + interval)
    } else {
        None
    };
    table.set_next_refresh_time(next);
    Ok(())
}

/// Refresh several tables in command order, stopping at the first failure
pub fn refresh_foreign_tables(
    catalog: &Catalog,
    mgr: &ForeignStorageMgr,
    table_names: &[String],
    options: &BTreeMap<String, String>,
) -> Result<()> {
    for name in table_names {
        refresh_foreign_table(catalog, mgr, name, options)?;
    }
    Ok(())
}
