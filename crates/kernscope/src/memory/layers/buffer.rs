//! In-memory physical layer.
//!
//! Holds a capture (or a synthetic one) entirely in memory. Reads follow the
//! same bound rules as [`super::MmapFileLayer`].

use crate::memory::error::{LayerError, LayerResult};
use crate::memory::traits::MemoryLayer;

/// A physical layer backed by an owned byte buffer.
pub struct BufferLayer {
    name: String,
    data: Vec<u8>,
}

impl BufferLayer {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        BufferLayer {
            name: name.into(),
            data,
        }
    }

    /// A zero-filled layer of `size` bytes.
    pub fn zeroed(name: impl Into<String>, size: usize) -> Self {
        Self::new(name, vec![0u8; size])
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Overwrite bytes at `offset`, growing the buffer if needed.
    ///
    /// Only used while assembling a layer; once shared behind an `Arc` the
    /// buffer is never touched again.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) {
        let end = offset + bytes.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[offset..end].copy_from_slice(bytes);
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.write(offset, &value.to_le_bytes());
    }

    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.write(offset, &value.to_le_bytes());
    }
}

impl MemoryLayer for BufferLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self, offset: u64, length: usize, pad: bool) -> LayerResult<Vec<u8>> {
        let size = self.data.len() as u64;

        if offset > size || (offset == size && length > 0) {
            if pad {
                return Ok(vec![0u8; length]);
            }
            return Err(LayerError::invalid_address(
                &self.name,
                offset,
                "Offset outside of the buffer boundaries",
            ));
        }

        let start = offset as usize;
        let available = self.data.len() - start;
        if length <= available {
            Ok(self.data[start..start + length].to_vec())
        } else if pad {
            let mut result = Vec::with_capacity(length);
            result.extend_from_slice(&self.data[start..]);
            result.resize(length, 0);
            Ok(result)
        } else {
            Err(LayerError::invalid_address(
                &self.name,
                size,
                "Could not read sufficient bytes from the buffer",
            ))
        }
    }

    fn is_valid(&self, offset: u64, length: u64) -> bool {
        length > 0
            && offset
                .checked_add(length)
                .map_or(false, |end| end <= self.data.len() as u64)
    }

    fn maximum_address(&self) -> u64 {
        (self.data.len() as u64).saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_and_pad() {
        let layer = BufferLayer::new("buf", b"Hello".to_vec());
        assert_eq!(layer.read(1, 3, false).unwrap(), b"ell");
        assert_eq!(layer.read(3, 5, true).unwrap(), b"lo\0\0\0");
        assert_eq!(layer.read(100, 2, true).unwrap(), b"\0\0");
        assert!(layer.read(3, 5, false).is_err());
        assert!(layer.read(100, 2, false).unwrap_err().is_unmapped());
    }

    #[test]
    fn test_write_grows() {
        let mut layer = BufferLayer::zeroed("buf", 4);
        layer.write_u32(6, 0xAABBCCDD);
        assert_eq!(layer.len(), 10);
        assert_eq!(layer.read(6, 4, false).unwrap(), vec![0xDD, 0xCC, 0xBB, 0xAA]);
    }

    #[test]
    fn test_is_valid() {
        let layer = BufferLayer::zeroed("buf", 10);
        assert!(layer.is_valid(0, 10));
        assert!(layer.is_valid(9, 1));
        assert!(!layer.is_valid(10, 1));
        assert!(!layer.is_valid(0, 0));
        assert!(!layer.is_valid(u64::MAX, 2));
    }
}
