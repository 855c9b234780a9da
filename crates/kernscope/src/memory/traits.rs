//! Core traits for abstracting memory access.
//!
//! The [`MemoryLayer`] trait lets the overlay and walkers work with any byte
//! space: a capture file, an in-memory buffer, or a translated virtual space
//! stacked on top of either.

use crate::memory::error::{LayerError, LayerResult};
use serde::Serialize;

/// One run of a translated range.
///
/// Segments returned by a single mapping call are contiguous in virtual
/// order and never overlap. Unmapped runs carry `mapped == false` and a
/// meaningless `physical_start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranslationSegment {
    pub virtual_start: u64,
    pub physical_start: u64,
    pub length: u64,
    pub mapped: bool,
    /// Name of the layer `physical_start` refers to.
    pub layer: Option<String>,
}

impl TranslationSegment {
    pub fn mapped(virtual_start: u64, physical_start: u64, length: u64, layer: &str) -> Self {
        TranslationSegment {
            virtual_start,
            physical_start,
            length,
            mapped: true,
            layer: Some(layer.to_string()),
        }
    }

    pub fn unmapped(virtual_start: u64, length: u64) -> Self {
        TranslationSegment {
            virtual_start,
            physical_start: 0,
            length,
            mapped: false,
            layer: None,
        }
    }

    pub fn virtual_end(&self) -> u64 {
        self.virtual_start + self.length
    }
}

/// An addressable byte space.
pub trait MemoryLayer: Send + Sync {
    /// Unique name of this layer.
    fn name(&self) -> &str;

    /// Read `length` bytes starting at `offset`.
    ///
    /// With `pad`, bytes that cannot be read are returned as zeros and the
    /// result always has exactly `length` bytes. Without it, any unreadable
    /// byte fails the whole read.
    fn read(&self, offset: u64, length: usize, pad: bool) -> LayerResult<Vec<u8>>;

    /// Check if the address range `[offset, offset+length)` is fully readable.
    fn is_valid(&self, offset: u64, length: u64) -> bool;

    fn minimum_address(&self) -> u64 {
        0
    }

    /// Maximum valid address in this layer.
    fn maximum_address(&self) -> u64;

    /// Names of the layers this one reads through.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Resolve a range into segments of the layer below.
    ///
    /// Physical layers map onto themselves: one mapped segment for the part
    /// inside the layer's bounds, one unmapped segment for anything beyond.
    fn mapping(&self, offset: u64, length: u64) -> LayerResult<Vec<TranslationSegment>> {
        if length == 0 {
            return Ok(Vec::new());
        }
        let end = offset
            .checked_add(length)
            .ok_or_else(|| LayerError::InvalidParameter(format!("range {:#x}+{:#x} overflows", offset, length)))?;
        let limit = self.maximum_address().saturating_add(1);
        let mut segments = Vec::with_capacity(2);
        if offset < limit {
            let mapped_end = end.min(limit);
            segments.push(TranslationSegment::mapped(offset, offset, mapped_end - offset, self.name()));
            if mapped_end < end {
                segments.push(TranslationSegment::unmapped(mapped_end, end - mapped_end));
            }
        } else {
            segments.push(TranslationSegment::unmapped(offset, length));
        }
        Ok(segments)
    }

    /// Read a little- or big-endian unsigned integer of `width` bytes.
    fn read_uint(&self, offset: u64, width: usize, big_endian: bool) -> LayerResult<u64> {
        if !(1..=8).contains(&width) {
            return Err(LayerError::InvalidParameter(format!(
                "unsupported integer width: {}",
                width
            )));
        }
        let bytes = self.read(offset, width, false)?;
        let mut buf = [0u8; 8];
        if big_endian {
            buf[8 - width..].copy_from_slice(&bytes);
            Ok(u64::from_be_bytes(buf))
        } else {
            buf[..width].copy_from_slice(&bytes);
            Ok(u64::from_le_bytes(buf))
        }
    }
}
