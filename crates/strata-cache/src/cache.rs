//! The chunk cache proper.
//!
//! On-disk layout, one directory per `(db_id, table_id)`:
//!
//! ```text
//! <root>/
//! ├── table_1_1/
//! │   ├── chunk_metadata.json      per-chunk metadata sidecar
//! │   ├── wrapper_metadata.json    wrapper snapshot (written by the manager)
//! │   ├── chunk_1_0                fixed-length chunk, column 1 fragment 0
//! │   ├── chunk_2_0_1              varlen data half
//! │   └── chunk_2_0_2              varlen index half
//! └── table_1_2/
//! ```
//!
//! Chunk files hold raw buffer bytes and are byte-identical across a
//! write/read cycle. Metadata records exist for data-bearing keys only;
//! index halves are cached as chunks without their own metadata record.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use strata_common::{
    new_shared_buffer, BufferMap, ChunkBuffer, ChunkKey, ChunkMetadata, ChunkMetadataVector,
    Error, Result, SharedBuffer,
};
use tracing::{debug, info, warn};

/// File name of the wrapper snapshot inside a table's cache directory
pub const WRAPPER_METADATA_FILE: &str = "wrapper_metadata.json";

const CHUNK_METADATA_FILE: &str = "chunk_metadata.json";
const CHUNK_FILE_PREFIX: &str = "chunk_";
const TABLE_DIR_PREFIX: &str = "table_";

#[derive(Serialize, Deserialize)]
struct SidecarEntry {
    suffix: Vec<i32>,
    metadata: ChunkMetadata,
}

#[derive(Default)]
struct CacheState {
    metadata: BTreeMap<ChunkKey, ChunkMetadata>,
    chunks: BTreeMap<ChunkKey, SharedBuffer>,
    /// Buffers handed out for caching, exclusive to the holder until
    /// promoted by `cache_table_chunks` or replaced by a later request
    pending: BTreeMap<ChunkKey, SharedBuffer>,
}

/// Disk-backed memoization of chunk buffers and metadata
pub struct ChunkCache {
    root: PathBuf,
    state: RwLock<CacheState>,
    num_metadata_added: AtomicU64,
    num_chunks_added: AtomicU64,
}

impl ChunkCache {
    /// Open (and create if needed) a cache rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        info!("opened chunk cache at {}", root.display());
        Ok(Self {
            root,
            state: RwLock::new(CacheState::default()),
            num_metadata_added: AtomicU64::new(0),
            num_chunks_added: AtomicU64::new(0),
        })
    }

    // ── lookups ──────────────────────────────────────────────────────────

    /// Buffer lookup only; no loading work
    pub fn get_cached_chunk_if_exists(&self, key: &ChunkKey) -> Option<SharedBuffer> {
        self.state.read().chunks.get(key).cloned()
    }

    pub fn is_metadata_cached(&self, key: &ChunkKey) -> bool {
        self.state.read().metadata.contains_key(key)
    }

    pub fn has_cached_metadata_for_key_prefix(&self, prefix: &ChunkKey) -> bool {
        let state = self.state.read();
        state
            .metadata
            .range(prefix.clone()..prefix.prefix_upper_bound())
            .next()
            .is_some()
    }

    pub fn get_cached_metadata_vec_for_key_prefix(
        &self,
        out: &mut ChunkMetadataVector,
        prefix: &ChunkKey,
    ) {
        let state = self.state.read();
        for (key, metadata) in state
            .metadata
            .range(prefix.clone()..prefix.prefix_upper_bound())
        {
            out.push((key.clone(), metadata.clone()));
        }
    }

    /// Keys of cached chunks under `prefix`, in key order. Index halves of
    /// varlen columns are omitted; callers re-derive them from the data key.
    pub fn get_cached_chunks_for_key_prefix(&self, prefix: &ChunkKey) -> Vec<ChunkKey> {
        let state = self.state.read();
        state
            .chunks
            .range(prefix.clone()..prefix.prefix_upper_bound())
            .map(|(key, _)| key.clone())
            .filter(|key| !key.is_varlen_index_key())
            .collect()
    }

    pub fn num_cached_metadata(&self) -> usize {
        self.state.read().metadata.len()
    }

    pub fn num_cached_chunks(&self) -> usize {
        self.state.read().chunks.len()
    }

    /// Monotonic count of metadata records promoted over the process lifetime
    pub fn num_metadata_added(&self) -> u64 {
        self.num_metadata_added.load(Ordering::Relaxed)
    }

    /// Monotonic count of chunks promoted over the process lifetime
    pub fn num_chunks_added(&self) -> u64 {
        self.num_chunks_added.load(Ordering::Relaxed)
    }

    // ── promotion ────────────────────────────────────────────────────────

    /// Hand out empty buffers for the caller (a data wrapper, driven by the
    /// manager) to fill. The buffers stay exclusive to the caller until
    /// `cache_table_chunks` promotes them; an abandoned set is simply
    /// replaced by the next request for the same keys.
    pub fn get_chunk_buffers_for_caching(&self, keys: &[ChunkKey]) -> BufferMap {
        let mut state = self.state.write();
        let mut buffers = BufferMap::new();
        for key in keys {
            let buffer = new_shared_buffer();
            state.pending.insert(key.clone(), SharedBuffer::clone(&buffer));
            buffers.insert(key.clone(), buffer);
        }
        buffers
    }

    /// Promote metadata records to durable cache entries
    pub fn cache_metadata_vec(&self, metadata_vec: &ChunkMetadataVector) -> Result<()> {
        if metadata_vec.is_empty() {
            return Ok(());
        }
        let mut touched_tables = Vec::new();
        {
            let mut state = self.state.write();
            for (key, metadata) in metadata_vec {
                state.metadata.insert(key.clone(), metadata.clone());
                let prefix = key.table_prefix();
                if !touched_tables.contains(&prefix) {
                    touched_tables.push(prefix);
                }
            }
        }
        for prefix in &touched_tables {
            self.write_metadata_sidecar(prefix)?;
        }
        self.num_metadata_added
            .fetch_add(metadata_vec.len() as u64, Ordering::Relaxed);
        debug!("cached {} metadata records", metadata_vec.len());
        Ok(())
    }

    /// Promote previously handed-out pending buffers to durable entries.
    /// The second writer of a key wins: promotion replaces any older entry
    /// atomically from the manager's perspective.
    pub fn cache_table_chunks(&self, keys: &[ChunkKey]) -> Result<()> {
        for key in keys {
            let buffer = {
                let mut state = self.state.write();
                let buffer = state.pending.remove(key).ok_or_else(|| {
                    Error::internal(format!("no pending buffer for chunk key {key}"))
                })?;
                buffer.lock().clear_dirty();
                state
                    .chunks
                    .insert(key.clone(), SharedBuffer::clone(&buffer));
                buffer
            };
            self.write_chunk_file(key, &buffer.lock())?;
            self.num_chunks_added.fetch_add(1, Ordering::Relaxed);
        }
        debug!("cached {} chunks", keys.len());
        Ok(())
    }

    // ── eviction ─────────────────────────────────────────────────────────

    /// Drop every chunk and metadata record under `prefix`, in memory and
    /// on disk. The wrapper snapshot in the table directory is untouched;
    /// it belongs to the manager.
    pub fn clear_for_table_prefix(&self, prefix: &ChunkKey) -> Result<()> {
        debug_assert!(prefix.is_table_key());
        {
            let mut state = self.state.write();
            let upper = prefix.prefix_upper_bound();
            let chunk_keys: Vec<ChunkKey> = state
                .chunks
                .range(prefix.clone()..upper.clone())
                .map(|(k, _)| k.clone())
                .collect();
            for key in chunk_keys {
                state.chunks.remove(&key);
            }
            let metadata_keys: Vec<ChunkKey> = state
                .metadata
                .range(prefix.clone()..upper.clone())
                .map(|(k, _)| k.clone())
                .collect();
            for key in metadata_keys {
                state.metadata.remove(&key);
            }
            let pending_keys: Vec<ChunkKey> = state
                .pending
                .range(prefix.clone()..upper)
                .map(|(k, _)| k.clone())
                .collect();
            for key in pending_keys {
                state.pending.remove(&key);
            }
        }

        let dir = self.get_cache_directory_for_table_prefix(prefix);
        if dir.exists() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with(CHUNK_FILE_PREFIX) || name == CHUNK_METADATA_FILE {
                    std::fs::remove_file(entry.path())?;
                }
            }
        }
        info!("cleared cache entries for table prefix {prefix}");
        Ok(())
    }

    /// Drop every cached entry of every table
    pub fn clear(&self) -> Result<()> {
        let prefixes: std::collections::BTreeSet<ChunkKey> = {
            let state = self.state.read();
            state
                .metadata
                .keys()
                .chain(state.chunks.keys())
                .map(ChunkKey::table_prefix)
                .collect()
        };
        for prefix in prefixes {
            self.clear_for_table_prefix(&prefix)?;
        }
        // Also sweep tables only present on disk
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if let Some(prefix) = parse_table_dir_name(&entry.file_name().to_string_lossy()) {
                self.clear_for_table_prefix(&prefix)?;
            }
        }
        Ok(())
    }

    // ── recovery ─────────────────────────────────────────────────────────

    /// Scan the on-disk layout for `table_prefix`. When entries exist,
    /// restore their metadata into `out` (and the in-memory map) and load
    /// the chunk files back as cached buffers. Returns true when any
    /// metadata was recovered. Recovery does not advance the promotion
    /// counters.
    pub fn recover_cache_for_table(
        &self,
        out: &mut ChunkMetadataVector,
        table_prefix: &ChunkKey,
    ) -> Result<bool> {
        debug_assert!(table_prefix.is_table_key());
        let dir = self.get_cache_directory_for_table_prefix(table_prefix);
        let sidecar = dir.join(CHUNK_METADATA_FILE);
        if !sidecar.exists() {
            return Ok(false);
        }

        let contents = std::fs::read_to_string(&sidecar)?;
        let entries: Vec<SidecarEntry> = serde_json::from_str(&contents)?;
        if entries.is_empty() {
            return Ok(false);
        }

        let mut state = self.state.write();
        for entry in &entries {
            let key = ChunkKey::from_prefix_and_suffix(table_prefix, &entry.suffix);
            state.metadata.insert(key.clone(), entry.metadata.clone());
            out.push((key, entry.metadata.clone()));
        }

        let mut recovered_chunks = 0usize;
        for dir_entry in std::fs::read_dir(&dir)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name();
            let Some(suffix) = parse_chunk_file_name(&name.to_string_lossy()) else {
                continue;
            };
            let key = ChunkKey::from_prefix_and_suffix(table_prefix, &suffix);
            let bytes = std::fs::read(dir_entry.path())?;
            state
                .chunks
                .insert(key, SharedBuffer::new(Mutex::new(ChunkBuffer::with_data(bytes))));
            recovered_chunks += 1;
        }
        info!(
            "recovered {} metadata records and {} chunks for table prefix {}",
            entries.len(),
            recovered_chunks,
            table_prefix
        );
        Ok(true)
    }

    /// Stable cache directory for one `(db_id, table_id)`
    pub fn get_cache_directory_for_table_prefix(&self, prefix: &ChunkKey) -> PathBuf {
        debug_assert!(prefix.is_table_key());
        self.root.join(format!(
            "{TABLE_DIR_PREFIX}{}_{}",
            prefix.db_id(),
            prefix.table_id()
        ))
    }

    /// Path of the wrapper snapshot for one table
    pub fn wrapper_metadata_path(&self, prefix: &ChunkKey) -> PathBuf {
        self.get_cache_directory_for_table_prefix(prefix)
            .join(WRAPPER_METADATA_FILE)
    }

    // ── disk helpers ─────────────────────────────────────────────────────

    fn write_metadata_sidecar(&self, prefix: &ChunkKey) -> Result<()> {
        let entries: Vec<SidecarEntry> = {
            let state = self.state.read();
            state
                .metadata
                .range(prefix.clone()..prefix.prefix_upper_bound())
                .map(|(key, metadata)| SidecarEntry {
                    suffix: key.suffix().to_vec(),
                    metadata: metadata.clone(),
                })
                .collect()
        };
        let dir = self.get_cache_directory_for_table_prefix(prefix);
        std::fs::create_dir_all(&dir)?;
        let json = serde_json::to_string_pretty(&entries)?;
        std::fs::write(dir.join(CHUNK_METADATA_FILE), json)?;
        Ok(())
    }

    fn write_chunk_file(&self, key: &ChunkKey, buffer: &ChunkBuffer) -> Result<()> {
        let dir = self.get_cache_directory_for_table_prefix(&key.table_prefix());
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(chunk_file_name(key)), buffer.as_slice())?;
        Ok(())
    }
}

fn chunk_file_name(key: &ChunkKey) -> String {
    let suffix: Vec<String> = key.suffix().iter().map(i32::to_string).collect();
    format!("{CHUNK_FILE_PREFIX}{}", suffix.join("_"))
}

fn parse_chunk_file_name(name: &str) -> Option<Vec<i32>> {
    let rest = name.strip_prefix(CHUNK_FILE_PREFIX)?;
    let parts: Vec<i32> = rest
        .split('_')
        .map(str::parse)
        .collect::<std::result::Result<_, _>>()
        .ok()?;
    if parts.len() == 2 || parts.len() == 3 {
        Some(parts)
    } else {
        warn!("ignoring unrecognized chunk file name \"{name}\"");
        None
    }
}

fn parse_table_dir_name(name: &str) -> Option<ChunkKey> {
    let rest = name.strip_prefix(TABLE_DIR_PREFIX)?;
    let mut parts = rest.split('_');
    let db_id: i32 = parts.next()?.parse().ok()?;
    let table_id: i32 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(ChunkKey::table(db_id, table_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::{ColumnStats, Datum, VarlenKind};
    use tempfile::TempDir;

    fn cache() -> (TempDir, ChunkCache) {
        let dir = TempDir::new().unwrap();
        let cache = ChunkCache::new(dir.path().join("cache")).unwrap();
        (dir, cache)
    }

    fn metadata(num_rows: u64) -> ChunkMetadata {
        ChunkMetadata {
            num_bytes: num_rows * 4,
            num_rows,
            stats: ColumnStats {
                min: Some(Datum::Int(0)),
                max: Some(Datum::Int(num_rows as i64)),
                null_count: 0,
            },
        }
    }

    fn promote_chunk(cache: &ChunkCache, key: &ChunkKey, bytes: &[u8]) {
        let buffers = cache.get_chunk_buffers_for_caching(std::slice::from_ref(key));
        buffers[key].lock().write(bytes);
        cache.cache_table_chunks(std::slice::from_ref(key)).unwrap();
    }

    #[test]
    fn test_metadata_promotion_and_lookup() {
        let (_dir, cache) = cache();
        let key = ChunkKey::data(1, 1, 1, 0);
        cache
            .cache_metadata_vec(&vec![(key.clone(), metadata(3))])
            .unwrap();

        assert!(cache.is_metadata_cached(&key));
        assert!(cache.has_cached_metadata_for_key_prefix(&ChunkKey::table(1, 1)));
        assert!(!cache.has_cached_metadata_for_key_prefix(&ChunkKey::table(1, 2)));
        assert_eq!(cache.num_metadata_added(), 1);

        let mut out = ChunkMetadataVector::new();
        cache.get_cached_metadata_vec_for_key_prefix(&mut out, &ChunkKey::table(1, 1));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1.num_rows, 3);
    }

    #[test]
    fn test_chunk_promotion_counters() {
        let (_dir, cache) = cache();
        let key = ChunkKey::data(1, 1, 1, 0);
        cache
            .cache_metadata_vec(&vec![(key.clone(), metadata(2))])
            .unwrap();
        promote_chunk(&cache, &key, &[1, 0, 0, 0, 2, 0, 0, 0]);

        assert_eq!(cache.num_chunks_added(), 1);
        assert_eq!(cache.num_cached_chunks(), 1);
        let buffer = cache.get_cached_chunk_if_exists(&key).unwrap();
        assert_eq!(buffer.lock().as_slice(), &[1, 0, 0, 0, 2, 0, 0, 0]);
        // If a chunk is cached its metadata is cached too
        assert!(cache.is_metadata_cached(&key));
    }

    #[test]
    fn test_promotion_without_pending_buffer_is_an_error() {
        let (_dir, cache) = cache();
        let key = ChunkKey::data(1, 1, 1, 0);
        assert!(cache.cache_table_chunks(&[key]).is_err());
    }

    #[test]
    fn test_repeated_handout_replaces_pending() {
        let (_dir, cache) = cache();
        let key = ChunkKey::data(1, 1, 1, 0);
        let first = cache.get_chunk_buffers_for_caching(std::slice::from_ref(&key));
        first[&key].lock().write(&[1]);
        // A second writer requests the same key; its buffer wins
        let second = cache.get_chunk_buffers_for_caching(std::slice::from_ref(&key));
        second[&key].lock().write(&[2]);
        cache.cache_table_chunks(std::slice::from_ref(&key)).unwrap();
        let cached = cache.get_cached_chunk_if_exists(&key).unwrap();
        assert_eq!(cached.lock().as_slice(), &[2]);
    }

    #[test]
    fn test_clear_for_table_prefix() {
        let (_dir, cache) = cache();
        let keep = ChunkKey::data(1, 2, 1, 0);
        let drop0 = ChunkKey::data(1, 1, 1, 0);
        let drop1 = ChunkKey::varlen(1, 1, 2, 0, VarlenKind::Data);
        cache
            .cache_metadata_vec(&vec![
                (drop0.clone(), metadata(1)),
                (drop1.clone(), metadata(1)),
                (keep.clone(), metadata(1)),
            ])
            .unwrap();
        promote_chunk(&cache, &drop0, &[1]);
        promote_chunk(&cache, &keep, &[2]);

        cache.clear_for_table_prefix(&ChunkKey::table(1, 1)).unwrap();

        assert!(!cache.is_metadata_cached(&drop0));
        assert!(!cache.is_metadata_cached(&drop1));
        assert!(cache.get_cached_chunk_if_exists(&drop0).is_none());
        assert!(cache.is_metadata_cached(&keep));
        assert!(cache.get_cached_chunk_if_exists(&keep).is_some());
        // Counters are monotonic across eviction
        assert_eq!(cache.num_metadata_added(), 3);
        assert_eq!(cache.num_chunks_added(), 2);

        let dir = cache.get_cache_directory_for_table_prefix(&ChunkKey::table(1, 1));
        assert!(!dir.join("chunk_1_0").exists());
    }

    #[test]
    fn test_recover_cache_for_table() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("cache");
        let data_key = ChunkKey::varlen(1, 1, 1, 0, VarlenKind::Data);
        let index_key = data_key.varlen_index_sibling();
        let fixed_key = ChunkKey::data(1, 1, 2, 0);

        {
            let cache = ChunkCache::new(&root).unwrap();
            cache
                .cache_metadata_vec(&vec![
                    (data_key.clone(), metadata(3)),
                    (fixed_key.clone(), metadata(3)),
                ])
                .unwrap();
            let keys = vec![data_key.clone(), index_key.clone(), fixed_key.clone()];
            let buffers = cache.get_chunk_buffers_for_caching(&keys);
            buffers[&data_key].lock().write(&[10, 11]);
            buffers[&index_key].lock().write(&[0, 2]);
            buffers[&fixed_key].lock().write(&[7; 12]);
            cache.cache_table_chunks(&keys).unwrap();
        }

        // Fresh cache instance over the same directory
        let cache = ChunkCache::new(&root).unwrap();
        assert_eq!(cache.num_cached_metadata(), 0);
        let mut out = ChunkMetadataVector::new();
        let recovered = cache
            .recover_cache_for_table(&mut out, &ChunkKey::table(1, 1))
            .unwrap();
        assert!(recovered);
        assert_eq!(out.len(), 2);
        assert_eq!(cache.num_cached_metadata(), 2);
        assert_eq!(cache.num_cached_chunks(), 3);
        // Recovery restores bytes but does not advance promotion counters
        assert_eq!(cache.num_chunks_added(), 0);
        let buffer = cache.get_cached_chunk_if_exists(&data_key).unwrap();
        assert_eq!(buffer.lock().as_slice(), &[10, 11]);

        // Unknown tables recover nothing
        let mut none = ChunkMetadataVector::new();
        assert!(!cache
            .recover_cache_for_table(&mut none, &ChunkKey::table(1, 9))
            .unwrap());
    }

    #[test]
    fn test_cached_chunk_listing_skips_index_keys() {
        let (_dir, cache) = cache();
        let data_key = ChunkKey::varlen(1, 1, 1, 0, VarlenKind::Data);
        let index_key = data_key.varlen_index_sibling();
        cache
            .cache_metadata_vec(&vec![(data_key.clone(), metadata(1))])
            .unwrap();
        let keys = vec![data_key.clone(), index_key.clone()];
        let buffers = cache.get_chunk_buffers_for_caching(&keys);
        buffers[&data_key].lock().write(&[1]);
        buffers[&index_key].lock().write(&[0, 1]);
        cache.cache_table_chunks(&keys).unwrap();

        let listed = cache.get_cached_chunks_for_key_prefix(&ChunkKey::table(1, 1));
        assert_eq!(listed, vec![data_key]);
    }

    #[test]
    fn test_chunk_file_names() {
        assert_eq!(chunk_file_name(&ChunkKey::data(1, 2, 3, 4)), "chunk_3_4");
        assert_eq!(
            chunk_file_name(&ChunkKey::varlen(1, 2, 3, 4, VarlenKind::Index)),
            "chunk_3_4_2"
        );
        assert_eq!(parse_chunk_file_name("chunk_3_4"), Some(vec![3, 4]));
        assert_eq!(parse_chunk_file_name("chunk_3_4_2"), Some(vec![3, 4, 2]));
        assert_eq!(parse_chunk_file_name("wrapper_metadata.json"), None);
    }
}
