//! Capture opening.

use crate::memory::error::LayerResult;
use crate::memory::layers::MmapFileLayer;
use crate::memory::traits::MemoryLayer;
use std::sync::Arc;
use tracing::debug;

/// Name given to the physical layer of a capture.
pub const PHYSICAL_LAYER: &str = "physical";

/// Open a raw physical capture as the base layer of a stack.
///
/// Accepts a filesystem path or a `file://` URL.
pub fn open_capture(path: &str) -> LayerResult<Arc<dyn MemoryLayer>> {
    let layer = MmapFileLayer::open(PHYSICAL_LAYER, path)?;
    debug!(
        path = %layer.path().display(),
        size = layer.maximum_address().saturating_add(1),
        "opened capture"
    );
    Ok(Arc::new(layer))
}
