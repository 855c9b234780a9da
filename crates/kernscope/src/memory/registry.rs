//! Named layer store.
//!
//! Every layer in a run is registered under a unique name so typed objects,
//! diagnostics and dumps can refer to it. Per-process layers are registered
//! on derivation and released when that process is done.

use crate::memory::error::{LayerError, LayerResult};
use crate::memory::traits::MemoryLayer;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Shared name → layer map.
#[derive(Clone, Default)]
pub struct LayerRegistry {
    layers: Arc<RwLock<HashMap<String, Arc<dyn MemoryLayer>>>>,
}

impl LayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a layer under its own name.
    pub fn register(&self, layer: Arc<dyn MemoryLayer>) -> LayerResult<()> {
        let mut layers = self.layers.write();
        let name = layer.name().to_string();
        if layers.contains_key(&name) {
            return Err(LayerError::DuplicateLayer(name));
        }
        layers.insert(name, layer);
        Ok(())
    }

    /// Pick a free name starting with `prefix`, build the layer with it and
    /// register the result.
    ///
    /// The name is `prefix` itself when free, otherwise `prefix_1`,
    /// `prefix_2`, ... The registry stays locked while `build` runs so two
    /// callers never receive the same name.
    pub fn register_unique<F>(&self, prefix: &str, build: F) -> LayerResult<Arc<dyn MemoryLayer>>
    where
        F: FnOnce(String) -> LayerResult<Arc<dyn MemoryLayer>>,
    {
        let mut layers = self.layers.write();
        let name = free_name(&layers, prefix);
        let layer = build(name.clone())?;
        if layer.name() != name {
            return Err(LayerError::InvalidParameter(format!(
                "layer built as '{}' but '{}' was allocated",
                layer.name(),
                name
            )));
        }
        layers.insert(name, layer.clone());
        Ok(layer)
    }

    pub fn get(&self, name: &str) -> LayerResult<Arc<dyn MemoryLayer>> {
        self.layers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| LayerError::UnknownLayer(name.to_string()))
    }

    /// Remove a layer. Existing `Arc`s stay usable; the name becomes free.
    pub fn release(&self, name: &str) -> Option<Arc<dyn MemoryLayer>> {
        self.layers.write().remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.layers.read().contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.layers.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.layers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.read().is_empty()
    }
}

fn free_name(layers: &HashMap<String, Arc<dyn MemoryLayer>>, prefix: &str) -> String {
    if !layers.contains_key(prefix) {
        return prefix.to_string();
    }
    (1u64..)
        .map(|n| format!("{}_{}", prefix, n))
        .find(|candidate| !layers.contains_key(candidate))
        .unwrap_or_else(|| prefix.to_string())
}
