//! Shared types for the strata foreign-storage subsystem.
//!
//! This crate defines the vocabulary the rest of the workspace speaks:
//! chunk keys and their interpretation helpers, chunk metadata, column
//! schemas, chunk buffers, configuration structures, and the common
//! error type.

pub mod buffer;
pub mod config;
pub mod error;
pub mod schema;
pub mod types;

pub use buffer::{new_shared_buffer, BufferMap, ChunkBuffer, Encoding, SharedBuffer};
pub use error::{Error, Result};
pub use schema::{ColumnDesc, ElementType, ScalarType, TableSchema};
pub use types::{
    ChunkKey, ChunkMetadata, ChunkMetadataVector, ColumnStats, Datum, VarlenKind,
};
