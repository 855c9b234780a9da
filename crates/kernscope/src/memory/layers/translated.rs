//! Translator-backed virtual layer.

use crate::memory::error::{LayerError, LayerResult};
use crate::memory::traits::{MemoryLayer, TranslationSegment};
use crate::memory::translators::{ArchProfile, PagingTranslator, Translator};
use std::sync::Arc;

/// A virtual address space stacked on a lower layer through a [`Translator`].
///
/// Reads resolve the requested range into segments and concatenate the
/// physical reads. Unmapped segments are zero-filled with `pad`; otherwise
/// the first one fails the read with `UnmappedMemory`.
pub struct TranslationLayer {
    name: String,
    translator: Box<dyn Translator>,
}

impl TranslationLayer {
    pub fn new(name: impl Into<String>, translator: Box<dyn Translator>) -> Self {
        TranslationLayer {
            name: name.into(),
            translator,
        }
    }

    /// A paged layer rooted at `root` over `base`.
    ///
    /// Fails with `InvalidAddressSpace` if the root does not validate; the
    /// layer must not be used in that case.
    pub fn paged(
        name: impl Into<String>,
        base: Arc<dyn MemoryLayer>,
        root: u64,
        profile: ArchProfile,
        cache_size: usize,
    ) -> LayerResult<Self> {
        let name = name.into();
        let translator = PagingTranslator::new(name.clone(), base, root, profile, cache_size)?;
        Ok(Self::new(name, Box::new(translator)))
    }

    pub fn translator(&self) -> &dyn Translator {
        self.translator.as_ref()
    }

    /// Translate a single address.
    pub fn translate(&self, offset: u64) -> LayerResult<(u64, u64)> {
        self.translator.translate(offset)
    }
}

impl MemoryLayer for TranslationLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self, offset: u64, length: usize, pad: bool) -> LayerResult<Vec<u8>> {
        let base = self.translator.base_layer();
        let segments = self.translator.mapping(offset, length as u64)?;

        if !pad {
            if let Some(gap) = segments.iter().find(|s| !s.mapped) {
                // Surface the translator's own fault for the first missing byte.
                return Err(match self.translator.translate(gap.virtual_start) {
                    Err(e) => e,
                    Ok(_) => LayerError::unmapped(
                        &self.name,
                        gap.virtual_start,
                        0,
                        0,
                        format!("Layer {} cannot map offset: {:#x}", self.name, gap.virtual_start),
                    ),
                });
            }
        }

        let mut output = Vec::with_capacity(length);
        for segment in segments {
            if segment.mapped {
                let chunk = base.read(segment.physical_start, segment.length as usize, pad)?;
                output.extend_from_slice(&chunk);
            } else {
                output.resize(output.len() + segment.length as usize, 0);
            }
        }

        Ok(output)
    }

    fn is_valid(&self, offset: u64, length: u64) -> bool {
        if length == 0 {
            return false;
        }
        let base = self.translator.base_layer();
        match self.translator.mapping(offset, length) {
            Ok(segments) => segments
                .iter()
                .all(|s| s.mapped && base.is_valid(s.physical_start, s.length)),
            Err(_) => false,
        }
    }

    fn maximum_address(&self) -> u64 {
        self.translator.maximum_address()
    }

    fn dependencies(&self) -> Vec<String> {
        vec![self.translator.base_layer_name().to_string()]
    }

    fn mapping(&self, offset: u64, length: u64) -> LayerResult<Vec<TranslationSegment>> {
        self.translator.mapping(offset, length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::PageTableBuilder;

    /// Two-level table: one mapped page at 0x1000, page 0x2000 unmapped.
    fn two_level_layer() -> TranslationLayer {
        let mut builder = PageTableBuilder::new(ArchProfile::intel32());
        builder.map(0x1000, 0x7000);
        builder.write(0x7000, &[0xAB; 0x1000]);
        builder.write(0x7000, b"mapped");
        // Same page table as 0x1000, explicitly not present.
        builder.unmap(0x2000);
        let (phys, root) = builder.finish();
        TranslationLayer::paged("virtual", phys, root, ArchProfile::intel32(), 64).unwrap()
    }

    #[test]
    fn test_unmapped_page_fails_without_pad() {
        let layer = two_level_layer();
        let err = layer.read(0x2000, 0x10, false).unwrap_err();
        assert!(matches!(err, LayerError::UnmappedMemory { .. }), "{err}");
        assert!(!layer.is_valid(0x2000, 1));
        assert!(layer.is_valid(0x1000, 0x1000));
    }

    #[test]
    fn test_oversized_unpadded_read_fails_early() {
        let layer = two_level_layer();
        // Mostly unmapped; must fail on the gap rather than allocate.
        let err = layer.read(0x1000, 0xFFFF_0000, false).unwrap_err();
        assert!(matches!(err, LayerError::UnmappedMemory { .. }), "{err}");
    }

    #[test]
    fn test_unmapped_page_zero_filled_with_pad() {
        let layer = two_level_layer();
        let data = layer.read(0x2000, 0x1800, true).unwrap();
        assert_eq!(data.len(), 0x1800);
        assert!(data.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_spanning_read() {
        let layer = two_level_layer();
        let data = layer.read(0x1FF0, 0x20, true).unwrap();
        assert_eq!(data.len(), 0x20);
        assert_eq!(&data[..0x10], &[0xAB; 0x10]);
        assert_eq!(&data[0x10..], &[0u8; 0x10]);

        let data = layer.read(0x1000, 6, false).unwrap();
        assert_eq!(data, b"mapped");

        // Without padding the spanning read fails as a whole.
        assert!(layer.read(0x1FF0, 0x20, false).unwrap_err().is_unmapped());
    }

    #[test]
    fn test_layer_metadata() {
        let layer = two_level_layer();
        assert_eq!(layer.name(), "virtual");
        assert_eq!(layer.dependencies(), vec!["physical".to_string()]);
        assert_eq!(layer.maximum_address(), 0xFFFF_FFFF);
        assert_eq!(layer.translate(0x1004).unwrap(), (0x7004, 0x1000));
    }
}
