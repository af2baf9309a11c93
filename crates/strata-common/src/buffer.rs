//! Chunk buffers.
//!
//! A buffer is an owned byte region with an attached encoding describing
//! its element type. A buffer is either dirty (mutated by a client since
//! the last sync) or clean; the foreign-storage manager only ever writes
//! into non-dirty destinations.

use crate::schema::ElementType;
use crate::types::VarlenKind;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::types::ChunkKey;

/// Describes the byte layout of a chunk buffer
#[derive(Clone, Debug, PartialEq)]
pub struct Encoding {
    pub element_type: ElementType,
    /// Which half of a variable-length column this buffer holds, if any
    pub varlen_kind: Option<VarlenKind>,
}

impl Encoding {
    pub fn fixed(element_type: ElementType) -> Self {
        Self {
            element_type,
            varlen_kind: None,
        }
    }

    pub fn varlen(element_type: ElementType, kind: VarlenKind) -> Self {
        Self {
            element_type,
            varlen_kind: Some(kind),
        }
    }
}

/// Owned byte region handed between wrappers, cache, and query execution
#[derive(Debug, Default)]
pub struct ChunkBuffer {
    data: Vec<u8>,
    encoding: Option<Encoding>,
    dirty: bool,
}

impl ChunkBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data,
            encoding: None,
            dirty: false,
        }
    }

    /// Replace the buffer contents
    pub fn write(&mut self, data: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(data);
    }

    pub fn append(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn encoding(&self) -> Option<&Encoding> {
        self.encoding.as_ref()
    }

    pub fn set_encoding(&mut self, encoding: Encoding) {
        self.encoding = Some(encoding);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Copy the first `num_bytes` of this buffer into `dst`; zero means the
    /// whole buffer. Encoding travels with the bytes.
    pub fn copy_to(&self, dst: &mut ChunkBuffer, num_bytes: usize) {
        let len = if num_bytes == 0 {
            self.data.len()
        } else {
            num_bytes.min(self.data.len())
        };
        dst.write(&self.data[..len]);
        if let Some(encoding) = &self.encoding {
            dst.set_encoding(encoding.clone());
        }
    }

    /// Move the contents out, leaving this buffer empty
    pub fn take(&mut self) -> ChunkBuffer {
        ChunkBuffer {
            data: std::mem::take(&mut self.data),
            encoding: self.encoding.take(),
            dirty: self.dirty,
        }
    }
}

/// Shared handle to a chunk buffer. The cache hands these out for pending
/// writes; holders have exclusive use until promotion.
pub type SharedBuffer = Arc<Mutex<ChunkBuffer>>;

/// Ordered buffer map passed to data wrappers for population
pub type BufferMap = BTreeMap<ChunkKey, SharedBuffer>;

/// Allocate a fresh shared buffer
pub fn new_shared_buffer() -> SharedBuffer {
    Arc::new(Mutex::new(ChunkBuffer::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ElementType, ScalarType};

    #[test]
    fn test_copy_to_full_and_partial() {
        let mut src = ChunkBuffer::new();
        src.write(&[1, 2, 3, 4]);
        src.set_encoding(Encoding::fixed(ElementType::Scalar(ScalarType::TinyInt)));

        let mut dst = ChunkBuffer::new();
        src.copy_to(&mut dst, 0);
        assert_eq!(dst.as_slice(), &[1, 2, 3, 4]);
        assert!(dst.encoding().is_some());

        let mut partial = ChunkBuffer::new();
        src.copy_to(&mut partial, 2);
        assert_eq!(partial.as_slice(), &[1, 2]);
    }

    #[test]
    fn test_dirty_flag() {
        let mut buffer = ChunkBuffer::new();
        assert!(!buffer.is_dirty());
        buffer.set_dirty();
        assert!(buffer.is_dirty());
        buffer.clear_dirty();
        assert!(!buffer.is_dirty());
    }

    #[test]
    fn test_take_drains_contents() {
        let mut buffer = ChunkBuffer::new();
        buffer.write(&[9, 9]);
        let taken = buffer.take();
        assert_eq!(taken.as_slice(), &[9, 9]);
        assert!(buffer.is_empty());
    }
}
