//! Disk-backed chunk cache.
//!
//! The cache memoizes chunk buffers and per-chunk metadata for the
//! foreign-storage manager. Every promoted entry also lands on disk under
//! a per-table directory, which is enough to rebuild the cache across
//! process restarts without touching the external source.

mod cache;

pub use cache::{ChunkCache, WRAPPER_METADATA_FILE};
