//! Generic multi-level page-table walker.
//!
//! The walk follows the Intel layout: each level consumes `bits` of the
//! virtual address as an index into a table of `entry_size`-byte entries,
//! bit 0 marks an entry present, and bit 7 (PS) on a level that allows it
//! terminates the walk early with a large page.

use crate::memory::error::{LayerError, LayerResult};
use crate::memory::traits::MemoryLayer;
use crate::memory::translators::Translator;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Arc;

const PAGE_PRESENT: u64 = 1 << 0;
const PAGE_PSE: u64 = 1 << 7;
/// PAT bit for large pages; shares a position with the low frame bits.
const PAGE_PAT_LARGE: u64 = 1 << 12;

const DEFAULT_CACHE_SIZE: usize = 4096;

/// One level of a page-table hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagingLevel {
    pub name: String,
    /// Number of virtual address bits indexing this level.
    pub bits: u32,
    /// Whether a PS entry at this level maps a large page.
    pub large_pages: bool,
}

impl PagingLevel {
    fn new(name: &str, bits: u32, large_pages: bool) -> Self {
        PagingLevel {
            name: name.to_string(),
            bits,
            large_pages,
        }
    }
}

/// Architecture profile: the shape of a paging hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchProfile {
    pub name: String,
    /// Levels from the root table down to the page table.
    pub levels: Vec<PagingLevel>,
    pub page_shift: u32,
    /// Width of one table entry in bytes (4 or 8).
    pub entry_size: usize,
    pub max_physical_bits: u32,
    pub max_virtual_bits: u32,
    /// Addresses above `max_virtual_bits` are valid when they sign-extend it.
    #[serde(default)]
    pub sign_extended: bool,
}

impl ArchProfile {
    /// Classic 32-bit paging.
    pub fn intel32() -> Self {
        ArchProfile {
            name: "intel32".to_string(),
            levels: vec![
                PagingLevel::new("page directory", 10, true),
                PagingLevel::new("page table", 10, false),
            ],
            page_shift: 12,
            entry_size: 4,
            max_physical_bits: 32,
            max_virtual_bits: 32,
            sign_extended: false,
        }
    }

    /// 32-bit paging with physical address extension.
    pub fn intel_pae() -> Self {
        ArchProfile {
            name: "intel_pae".to_string(),
            levels: vec![
                PagingLevel::new("page directory pointer", 2, false),
                PagingLevel::new("page directory", 9, true),
                PagingLevel::new("page table", 9, false),
            ],
            page_shift: 12,
            entry_size: 8,
            max_physical_bits: 36,
            max_virtual_bits: 32,
            sign_extended: false,
        }
    }

    /// x86-64 4-level paging.
    pub fn intel64() -> Self {
        ArchProfile {
            name: "intel64".to_string(),
            levels: vec![
                PagingLevel::new("page map layer 4", 9, false),
                PagingLevel::new("page directory pointer", 9, true),
                PagingLevel::new("page directory", 9, true),
                PagingLevel::new("page table", 9, false),
            ],
            page_shift: 12,
            entry_size: 8,
            max_physical_bits: 52,
            max_virtual_bits: 48,
            sign_extended: true,
        }
    }

    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "intel32" | "intel" => Some(Self::intel32()),
            "intel_pae" | "pae" => Some(Self::intel_pae()),
            "intel64" | "intel32e" | "x64" => Some(Self::intel64()),
            _ => None,
        }
    }

    /// Check the levels exactly cover the virtual address width.
    pub fn validate(&self) -> LayerResult<()> {
        let covered: u32 = self.levels.iter().map(|l| l.bits).sum::<u32>() + self.page_shift;
        if self.levels.is_empty() || covered != self.max_virtual_bits {
            return Err(LayerError::InvalidParameter(format!(
                "profile '{}' covers {} bits, expected {}",
                self.name, covered, self.max_virtual_bits
            )));
        }
        if self.entry_size != 4 && self.entry_size != 8 {
            return Err(LayerError::InvalidParameter(format!(
                "profile '{}' has unsupported entry size {}",
                self.name, self.entry_size
            )));
        }
        if self.max_physical_bits == 0 || self.max_physical_bits > 64 {
            return Err(LayerError::InvalidParameter(format!(
                "profile '{}' has invalid physical width {}",
                self.name, self.max_physical_bits
            )));
        }
        Ok(())
    }

    pub fn page_size(&self) -> u64 {
        1u64 << self.page_shift
    }

    fn entry_shift(&self) -> u32 {
        self.entry_size.trailing_zeros()
    }

    /// Required alignment of the root table.
    pub fn root_alignment(&self) -> u64 {
        let first = self.levels.first().map_or(0, |l| l.bits);
        1u64 << (first + self.entry_shift())
    }

    /// Clear the low bits of a raw root register value (PCID and cache
    /// control flags) that do not address the root table.
    pub fn strip_root(&self, raw: u64) -> u64 {
        raw & !(self.root_alignment() - 1)
    }

    pub fn maximum_address(&self) -> u64 {
        if self.sign_extended {
            u64::MAX
        } else {
            mask(u64::MAX, self.max_virtual_bits - 1, 0)
        }
    }

    /// True when `addr` is representable under this profile.
    pub fn is_canonical(&self, addr: u64) -> bool {
        if !self.sign_extended {
            return addr <= self.maximum_address();
        }
        let top = self.max_virtual_bits - 1;
        let high = addr >> top;
        high == 0 || high == (u64::MAX >> top)
    }
}

impl Default for ArchProfile {
    fn default() -> Self {
        Self::intel64()
    }
}

/// Keep bits `low_bit..=high_bit` of `value`.
#[inline]
pub(crate) fn mask(value: u64, high_bit: u32, low_bit: u32) -> u64 {
    let high_mask = if high_bit >= 63 {
        u64::MAX
    } else {
        (1u64 << (high_bit + 1)).wrapping_sub(1)
    };
    let low_mask = if low_bit >= 64 {
        u64::MAX
    } else {
        (1u64 << low_bit).wrapping_sub(1)
    };
    value & (high_mask ^ low_mask)
}

#[inline]
fn page_is_valid(entry: u64) -> bool {
    entry & PAGE_PRESENT != 0
}

/// Entry value and bit position reached by a walk.
type CacheEntry = (u64, u32);

/// Page-table translator with LRU caches.
///
/// The entry cache maps page addresses to their final entry; the table cache
/// holds raw tables read from the base layer. Tables whose entries are all
/// identical are treated as invalid.
pub struct PagingTranslator {
    /// Name of the layer this translator serves, used in errors.
    name: String,
    base_layer: Arc<dyn MemoryLayer>,
    profile: ArchProfile,
    root: u64,
    initial_entry: u64,
    initial_position: u32,
    entry_cache: Mutex<LruCache<u64, CacheEntry>>,
    table_cache: Mutex<LruCache<u64, Option<Arc<Vec<u8>>>>>,
}

impl PagingTranslator {
    /// Build a translator over `base_layer` rooted at `root`.
    ///
    /// The root must be non-zero, aligned for the profile's first table,
    /// inside the physical address width and readable from the base layer.
    pub fn new(
        name: impl Into<String>,
        base_layer: Arc<dyn MemoryLayer>,
        root: u64,
        profile: ArchProfile,
        cache_size: usize,
    ) -> LayerResult<Self> {
        let name = name.into();
        profile.validate()?;

        if root == 0 {
            return Err(LayerError::invalid_address_space(&name, root, "Translation root is zero"));
        }
        if root & (profile.root_alignment() - 1) != 0 {
            return Err(LayerError::invalid_address_space(
                &name,
                root,
                format!("Translation root is not {:#x}-aligned", profile.root_alignment()),
            ));
        }
        if mask(root, profile.max_physical_bits - 1, 0) != root {
            return Err(LayerError::invalid_address_space(
                &name,
                root,
                format!(
                    "Translation root exceeds {}-bit physical addressing",
                    profile.max_physical_bits
                ),
            ));
        }
        let root_table_size = Self::table_size(&profile, &profile.levels[0]);
        if !base_layer.is_valid(root, root_table_size as u64) {
            return Err(LayerError::invalid_address_space(
                &name,
                root,
                format!("Root table is not readable from layer '{}'", base_layer.name()),
            ));
        }

        let initial_position = profile.max_virtual_bits - 1;
        let initial_entry = mask(root, profile.max_physical_bits - 1, 0) | PAGE_PRESENT;

        let cache_size = NonZeroUsize::new(cache_size)
            .unwrap_or(NonZeroUsize::MIN.saturating_add(DEFAULT_CACHE_SIZE - 1));
        let table_cache_size = cache_size.saturating_add(1);

        Ok(PagingTranslator {
            name,
            base_layer,
            profile,
            root,
            initial_entry,
            initial_position,
            entry_cache: Mutex::new(LruCache::new(cache_size)),
            table_cache: Mutex::new(LruCache::new(table_cache_size)),
        })
    }

    pub fn profile(&self) -> &ArchProfile {
        &self.profile
    }

    /// Drop all cached entries and tables.
    pub fn clear_cache(&self) {
        self.entry_cache.lock().clear();
        self.table_cache.lock().clear();
    }

    fn table_size(profile: &ArchProfile, level: &PagingLevel) -> usize {
        (1usize << level.bits) * profile.entry_size
    }

    fn read_entry(&self, table: &[u8], index: usize) -> Option<u64> {
        let start = index * self.profile.entry_size;
        let raw = table.get(start..start + self.profile.entry_size)?;
        let mut buf = [0u8; 8];
        buf[..raw.len()].copy_from_slice(raw);
        Some(u64::from_le_bytes(buf))
    }

    /// Fetch a table, rejecting unreadable ones and ones whose entries are
    /// all the same value.
    fn get_valid_table(&self, base_address: u64, table_size: usize) -> Option<Arc<Vec<u8>>> {
        if let Some(cached) = self.table_cache.lock().get(&base_address) {
            return cached.clone();
        }

        let table = match self.base_layer.read(base_address, table_size, false) {
            Ok(t) => t,
            Err(_) => {
                self.table_cache.lock().put(base_address, None);
                return None;
            }
        };

        let entry_size = self.profile.entry_size;
        if table_size >= self.profile.page_size() as usize && table.len() >= entry_size {
            let first = &table[..entry_size];
            if table.chunks_exact(entry_size).all(|chunk| chunk == first) {
                self.table_cache.lock().put(base_address, None);
                return None;
            }
        }

        let table = Arc::new(table);
        self.table_cache.lock().put(base_address, Some(table.clone()));
        Some(table)
    }

    /// Walk the hierarchy for a page address, returning the final entry and
    /// the bit position below which the entry's page offset starts.
    fn translate_entry(&self, page_address: u64) -> LayerResult<CacheEntry> {
        if let Some(cached) = self.entry_cache.lock().get(&page_address) {
            return Ok(*cached);
        }

        if !self.profile.is_canonical(page_address) {
            return Err(LayerError::unmapped(
                &self.name,
                page_address,
                self.profile.page_shift,
                self.initial_entry,
                "Address outside the virtual address range",
            ));
        }

        let mut position = self.initial_position;
        let mut entry = self.initial_entry;

        for level in &self.profile.levels {
            if !page_is_valid(entry) {
                return Err(LayerError::unmapped(
                    &self.name,
                    page_address,
                    position + 1,
                    entry,
                    format!("Page Fault at entry {:#x} in table {}", entry, level.name),
                ));
            }

            let table_size = Self::table_size(&self.profile, level);
            let base_address = mask(
                entry,
                self.profile.max_physical_bits - 1,
                level.bits + self.profile.entry_shift(),
            );
            let table = self.get_valid_table(base_address, table_size).ok_or_else(|| {
                LayerError::unmapped(
                    &self.name,
                    page_address,
                    position + 1,
                    entry,
                    format!("Page Fault at entry {:#x} in table {}", entry, level.name),
                )
            })?;

            let start = position;
            position -= level.bits;
            let index = (mask(page_address, start, position + 1) >> (position + 1)) as usize;

            entry = self.read_entry(&table, index).ok_or_else(|| {
                LayerError::unmapped(
                    &self.name,
                    page_address,
                    position + 1,
                    entry,
                    "Entry offset out of bounds",
                )
            })?;

            if level.large_pages && entry & PAGE_PSE != 0 {
                entry &= !PAGE_PAT_LARGE;
                break;
            }
        }

        let result = (entry, position);
        self.entry_cache.lock().put(page_address, result);
        Ok(result)
    }
}

impl Translator for PagingTranslator {
    fn translate(&self, offset: u64) -> LayerResult<(u64, u64)> {
        let page_address = offset & !(self.profile.page_size() - 1);
        let (entry, position) = self.translate_entry(page_address)?;

        if !page_is_valid(entry) {
            return Err(LayerError::unmapped(
                &self.name,
                offset,
                position + 1,
                entry,
                format!("Page Fault at entry {:#x} in page entry", entry),
            ));
        }

        let physical = mask(entry, self.profile.max_physical_bits - 1, position + 1)
            | mask(offset, position, 0);
        Ok((physical, 1u64 << (position + 1)))
    }

    fn root(&self) -> u64 {
        self.root
    }

    fn page_size(&self) -> u64 {
        self.profile.page_size()
    }

    fn maximum_address(&self) -> u64 {
        self.profile.maximum_address()
    }

    fn base_layer(&self) -> &Arc<dyn MemoryLayer> {
        &self.base_layer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::layers::BufferLayer;
    use crate::testutil::PageTableBuilder;

    #[test]
    fn test_mask() {
        assert_eq!(mask(0xFF, 7, 0), 0xFF);
        assert_eq!(mask(0xFF, 7, 4), 0xF0);
        assert_eq!(mask(0x12345678, 15, 8), 0x5600);
        assert_eq!(mask(u64::MAX, 63, 0), u64::MAX);
    }

    #[test]
    fn test_profiles_validate() {
        for profile in [ArchProfile::intel32(), ArchProfile::intel_pae(), ArchProfile::intel64()] {
            profile.validate().unwrap();
        }
        assert_eq!(ArchProfile::intel32().root_alignment(), 0x1000);
        assert_eq!(ArchProfile::intel_pae().root_alignment(), 0x20);
        assert_eq!(ArchProfile::intel64().root_alignment(), 0x1000);
        assert_eq!(ArchProfile::intel64().strip_root(0x1aa002), 0x1aa000);

        let mut broken = ArchProfile::intel32();
        broken.levels.pop();
        assert!(broken.validate().is_err());
    }

    #[test]
    fn test_canonical_addresses() {
        let p = ArchProfile::intel64();
        assert!(p.is_canonical(0x7FFF_FFFF_F000));
        assert!(p.is_canonical(0xFFFF_F800_0000_0000));
        assert!(!p.is_canonical(0x0000_8000_0000_0000));
        let p = ArchProfile::intel32();
        assert!(p.is_canonical(0xFFFF_F000));
        assert!(!p.is_canonical(0x1_0000_0000));
    }

    #[test]
    fn test_intel32_walk() {
        let mut builder = PageTableBuilder::new(ArchProfile::intel32());
        builder.map(0x0040_1000, 0x0009_0000);
        let (phys, root) = builder.finish();
        let t = PagingTranslator::new("virt", phys, root, ArchProfile::intel32(), 16).unwrap();

        assert_eq!(t.translate(0x0040_1234).unwrap(), (0x0009_0234, 0x1000));
        let err = t.translate(0x0040_2000).unwrap_err();
        assert!(matches!(err, LayerError::UnmappedMemory { invalid_bits: 12, .. }));
        let err = t.translate(0x0080_0000).unwrap_err();
        assert!(matches!(err, LayerError::UnmappedMemory { invalid_bits: 22, .. }));
    }

    #[test]
    fn test_intel32_upper_half() {
        let mut builder = PageTableBuilder::new(ArchProfile::intel32());
        builder.map(0x8000_1000, 0x9000);
        let (phys, root) = builder.finish();
        let t = PagingTranslator::new("kernel", phys, root, ArchProfile::intel32(), 16).unwrap();
        assert_eq!(t.translate(0x8000_1234).unwrap(), (0x9234, 0x1000));
        assert!(ArchProfile::intel_pae().is_canonical(0xC000_0000));
    }

    #[test]
    fn test_intel64_walk_and_large_page() {
        let mut builder = PageTableBuilder::new(ArchProfile::intel64());
        builder.map(0xFFFF_F800_0000_1000, 0x5000);
        builder.map_large(0x0000_0000_4000_0000, 0x20_0000, 2);
        let (phys, root) = builder.finish();
        let t = PagingTranslator::new("kernel", phys, root, ArchProfile::intel64(), 16).unwrap();

        assert_eq!(t.translate(0xFFFF_F800_0000_1008).unwrap(), (0x5008, 0x1000));
        assert_eq!(
            t.translate(0x0000_0000_4001_2345).unwrap(),
            (0x21_2345, 0x20_0000)
        );
        assert!(t.translate(0x0000_8000_0000_0000).unwrap_err().is_unmapped());
    }

    #[test]
    fn test_mapping_coalesces_gaps() {
        let mut builder = PageTableBuilder::new(ArchProfile::intel32());
        builder.map(0x1000, 0x8000);
        builder.map(0x2000, 0x9000);
        builder.map(0x5000, 0xA000);
        let (phys, root) = builder.finish();
        let t = PagingTranslator::new("virt", phys, root, ArchProfile::intel32(), 16).unwrap();

        let segments = t.mapping(0x1800, 0x4000).unwrap();
        assert_eq!(segments.len(), 3);
        assert!(segments[0].mapped);
        assert_eq!((segments[0].virtual_start, segments[0].length), (0x1800, 0x1800));
        assert_eq!(segments[0].physical_start, 0x8800);
        assert!(!segments[1].mapped);
        assert_eq!((segments[1].virtual_start, segments[1].length), (0x3000, 0x2000));
        assert!(segments[2].mapped);
        assert_eq!(segments[2].virtual_end(), 0x5800);
    }

    #[test]
    fn test_invalid_roots() {
        let phys: Arc<dyn MemoryLayer> = Arc::new(BufferLayer::zeroed("physical", 0x4000));
        let cases = [0u64, 0x1234, 0x1_0000_0000, 0x8000];
        for root in cases {
            let err = PagingTranslator::new("p", phys.clone(), root, ArchProfile::intel32(), 16)
                .err()
                .unwrap();
            assert!(
                matches!(err, LayerError::InvalidAddressSpace { .. }),
                "root {:#x} accepted",
                root
            );
        }
    }

    #[test]
    fn test_duplicate_table_rejected() {
        let mut phys = BufferLayer::zeroed("physical", 0x3000);
        // Root directory whose every entry points at the same table.
        for i in 0..1024 {
            phys.write_u32(0x1000 + i * 4, 0x2003);
        }
        let phys: Arc<dyn MemoryLayer> = Arc::new(phys);
        let t = PagingTranslator::new("p", phys, 0x1000, ArchProfile::intel32(), 16).unwrap();
        assert!(t.translate(0x1000).unwrap_err().is_unmapped());
    }
}
