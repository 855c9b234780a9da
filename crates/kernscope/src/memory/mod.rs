pub mod error;
pub mod image;
pub mod layers;
pub mod registry;
pub mod traits;
pub mod translators;

pub use error::{LayerError, LayerResult};
pub use image::open_capture;
pub use registry::LayerRegistry;
pub use traits::{MemoryLayer, TranslationSegment};
