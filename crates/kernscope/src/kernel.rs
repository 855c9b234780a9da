//! The kernel virtual address space of a capture.

use crate::config::Config;
use crate::memory::error::LayerResult;
use crate::memory::layers::TranslationLayer;
use crate::memory::registry::LayerRegistry;
use crate::memory::traits::MemoryLayer;
use crate::memory::translators::ArchProfile;
use crate::objects::error::ObjectResult;
use crate::objects::typed::TypedObject;
use isf::Catalog;
use std::sync::Arc;
use tracing::debug;

/// Name of the kernel virtual layer.
pub const KERNEL_LAYER: &str = "kernel";

/// A kernel address space bound to its symbol catalog.
///
/// Symbol addresses in the catalog are relative to `kernel_base`, the
/// kernel's load address in its virtual space.
pub struct KernelSpace {
    physical: Arc<dyn MemoryLayer>,
    layer: Arc<TranslationLayer>,
    catalog: Arc<Catalog>,
    kernel_base: u64,
    profile: ArchProfile,
    registry: LayerRegistry,
    config: Config,
}

impl KernelSpace {
    /// Build the kernel layer over `physical` from the page-table `root`
    /// and register both layers. `root` must already be a table address;
    /// flag bits are not stripped here.
    pub fn new(
        physical: Arc<dyn MemoryLayer>,
        catalog: Arc<Catalog>,
        root: u64,
        kernel_base: u64,
        profile: ArchProfile,
        config: Config,
    ) -> ObjectResult<Self> {
        profile.validate()?;
        let layer = Arc::new(TranslationLayer::paged(
            KERNEL_LAYER,
            physical.clone(),
            root,
            profile.clone(),
            config.translation_cache_size,
        )?);

        let registry = LayerRegistry::new();
        registry.register(physical.clone())?;
        registry.register(layer.clone())?;

        debug!(
            root = %format_args!("{:#x}", root),
            kernel_base = %format_args!("{:#x}", kernel_base),
            arch = %profile.name,
            "kernel layer ready"
        );

        Ok(KernelSpace {
            physical,
            layer,
            catalog,
            kernel_base,
            profile,
            registry,
            config,
        })
    }

    pub fn physical(&self) -> &Arc<dyn MemoryLayer> {
        &self.physical
    }

    /// The kernel virtual layer.
    pub fn layer(&self) -> Arc<dyn MemoryLayer> {
        self.layer.clone()
    }

    pub fn layer_name(&self) -> &str {
        self.layer.name()
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn kernel_base(&self) -> u64 {
        self.kernel_base
    }

    pub fn profile(&self) -> &ArchProfile {
        &self.profile
    }

    pub fn registry(&self) -> &LayerRegistry {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Absolute virtual address of a kernel symbol.
    pub fn symbol_address(&self, name: &str) -> ObjectResult<u64> {
        Ok(self.kernel_base.wrapping_add(self.catalog.get_symbol(name)?))
    }

    /// Overlay `type_name` at a kernel virtual address.
    pub fn object(&self, type_name: &str, offset: u64) -> ObjectResult<TypedObject> {
        TypedObject::new(self.catalog.clone(), self.layer(), type_name, offset)
    }

    pub fn object_from_symbol(&self, symbol: &str, type_name: &str) -> ObjectResult<TypedObject> {
        self.object(type_name, self.symbol_address(symbol)?)
    }

    /// Physical address backing a kernel virtual address.
    pub fn physical_offset(&self, address: u64) -> LayerResult<u64> {
        self.layer.translate(address).map(|(physical, _)| physical)
    }

    /// Read `count` 32-bit signed integers at a kernel symbol.
    pub fn symbol_ints(&self, symbol: &str, count: usize) -> ObjectResult<Vec<i32>> {
        let address = self.symbol_address(symbol)?;
        let bytes = self.layer.read(address, count * 4, false)?;
        let endian = self.catalog.endian();
        Ok(bytes
            .chunks_exact(4)
            .map(|c| crate::objects::value::decode_uint(c, endian) as u32 as i32)
            .collect())
    }
}
