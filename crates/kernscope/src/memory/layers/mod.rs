//! Layer implementations.
//!
//! Physical layers ([`MmapFileLayer`], [`BufferLayer`]) sit at the bottom of
//! a stack; [`TranslationLayer`] stacks a virtual space on top of one.

pub mod buffer;
pub mod mmap_file;
pub mod translated;

pub use buffer::BufferLayer;
pub use mmap_file::MmapFileLayer;
pub use translated::TranslationLayer;
