//! Virtual-to-physical address translation.
//!
//! A [`Translator`] answers single-address lookups (for field reads and
//! pointer dereference) and range lookups (for scanning and padded reads).
//! [`PagingTranslator`] implements the x86 family of multi-level page tables
//! from an [`ArchProfile`] describing the level layout:
//!
//! - `intel32`: 2-level, 4-byte entries, 4 MiB large pages
//! - `intel_pae`: 3-level, 8-byte entries, 2 MiB large pages
//! - `intel64`: 4-level, 8-byte entries, 2 MiB / 1 GiB large pages

pub mod paging;

pub use paging::{ArchProfile, PagingLevel, PagingTranslator};

use crate::memory::error::{LayerError, LayerResult};
use crate::memory::traits::{MemoryLayer, TranslationSegment};
use std::sync::Arc;

/// Address translation for one paging convention.
pub trait Translator: Send + Sync {
    /// Translate a single address into `(physical_address, page_size)`.
    ///
    /// A missing translation fails with [`LayerError::UnmappedMemory`], whose
    /// `invalid_bits` tells range lookups how far to skip.
    fn translate(&self, offset: u64) -> LayerResult<(u64, u64)>;

    /// The translation root (page-table base) this translator walks from.
    fn root(&self) -> u64;

    /// Smallest page size of the convention.
    fn page_size(&self) -> u64;

    /// Highest translatable address.
    fn maximum_address(&self) -> u64;

    /// The layer physical addresses refer to.
    fn base_layer(&self) -> &Arc<dyn MemoryLayer>;

    fn base_layer_name(&self) -> &str {
        self.base_layer().name()
    }

    /// Resolve `[offset, offset+length)` into contiguous segments.
    ///
    /// Adjacent mapped runs that are also physically contiguous are merged,
    /// as are adjacent unmapped runs. Errors other than a missing
    /// translation are returned as-is.
    fn mapping(&self, offset: u64, length: u64) -> LayerResult<Vec<TranslationSegment>> {
        let mut segments: Vec<TranslationSegment> = Vec::new();
        if length == 0 {
            return Ok(segments);
        }
        offset.checked_add(length - 1).ok_or_else(|| {
            LayerError::InvalidParameter(format!("range {:#x}+{:#x} overflows", offset, length))
        })?;

        let layer_name = self.base_layer_name().to_string();
        let mut current = offset;
        let mut remaining = length;

        while remaining > 0 {
            match self.translate(current) {
                Ok((physical, page_size)) => {
                    let chunk = (page_size - current % page_size).min(remaining);
                    match segments.last_mut() {
                        Some(last)
                            if last.mapped
                                && last.physical_start + last.length == physical =>
                        {
                            last.length += chunk;
                        }
                        _ => segments.push(TranslationSegment::mapped(
                            current,
                            physical,
                            chunk,
                            &layer_name,
                        )),
                    }
                    current = current.wrapping_add(chunk);
                    remaining -= chunk;
                }
                Err(e) if e.is_unmapped() => {
                    let skip = match &e {
                        LayerError::UnmappedMemory { invalid_bits, .. } if *invalid_bits < 64 => {
                            let skip_mask = (1u64 << invalid_bits) - 1;
                            skip_mask - (current & skip_mask) + 1
                        }
                        LayerError::UnmappedMemory { .. } => remaining,
                        _ => self.page_size() - current % self.page_size(),
                    };
                    let skip = skip.min(remaining);
                    match segments.last_mut() {
                        Some(last) if !last.mapped => last.length += skip,
                        _ => segments.push(TranslationSegment::unmapped(current, skip)),
                    }
                    current = current.wrapping_add(skip);
                    remaining -= skip;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(segments)
    }
}
