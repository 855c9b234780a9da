//! Per-process address spaces derived from kernel process objects.

use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::kernel::KernelSpace;
use crate::memory::layers::TranslationLayer;
use crate::memory::registry::LayerRegistry;
use crate::memory::traits::MemoryLayer;
use crate::objects::error::ObjectResult;
use crate::objects::typed::TypedObject;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// A registered per-process layer, released from the registry on drop.
pub struct ProcessLayer {
    layer: Arc<dyn MemoryLayer>,
    registry: LayerRegistry,
    pid: u64,
}

impl ProcessLayer {
    pub fn layer(&self) -> &Arc<dyn MemoryLayer> {
        &self.layer
    }

    pub fn name(&self) -> &str {
        self.layer.name()
    }

    pub fn pid(&self) -> u64 {
        self.pid
    }
}

impl fmt::Debug for ProcessLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessLayer")
            .field("name", &self.name())
            .field("pid", &self.pid)
            .finish()
    }
}

impl Drop for ProcessLayer {
    fn drop(&mut self) {
        if self.registry.release(self.layer.name()).is_some() {
            debug!(layer = self.layer.name(), "released process layer");
        }
    }
}

/// Build and register the virtual layer of `process`.
///
/// The page-table root is read through the layout's `dtb` path, translated
/// through the kernel layer when the layout stores it as a kernel virtual
/// address, and stripped of flag bits. Failures are recorded to
/// `diagnostics` and returned; nothing is registered in that case.
pub fn derive_process_layer(
    kernel: &KernelSpace,
    process: &TypedObject,
    diagnostics: &Diagnostics,
) -> ObjectResult<ProcessLayer> {
    let layout = &kernel.config().process;
    let result: ObjectResult<ProcessLayer> = (|| {
        let pid = process.path_unsigned(&layout.pid)?;
        let mut root = process.path_unsigned(&layout.dtb)?;
        if layout.dtb_is_virtual {
            root = kernel.physical_offset(root)?;
        }
        let root = kernel.profile().strip_root(root);

        let prefix = format!("{}_Process{}", kernel.layer_name(), pid);
        let layer = kernel.registry().register_unique(&prefix, |name| {
            let layer = TranslationLayer::paged(
                name,
                kernel.physical().clone(),
                root,
                kernel.profile().clone(),
                kernel.config().translation_cache_size,
            )?;
            Ok(Arc::new(layer) as Arc<dyn MemoryLayer>)
        })?;
        debug!(
            layer = layer.name(),
            root = %format_args!("{:#x}", root),
            "derived process layer"
        );
        Ok(ProcessLayer {
            layer,
            registry: kernel.registry().clone(),
            pid,
        })
    })();

    if let Err(e) = &result {
        diagnostics.record(
            DiagnosticKind::LayerDerivation,
            Some(process.offset()),
            format!("cannot derive process layer: {}", e),
        );
    }
    result
}
