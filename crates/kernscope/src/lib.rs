//! kernscope: memory introspection over physical captures.
//!
//! Layered address translation, a typed overlay driven by an ISF catalog,
//! and safe traversal of the kernel's intrusive lists and trees.

pub mod config;
pub mod diagnostics;
pub mod kernel;
pub mod layout;
pub mod memory;
pub mod objects;
pub mod plugins;
pub mod process;

#[cfg(test)]
mod testutil;

pub use config::Config;
pub use diagnostics::{DiagnosticKind, Diagnostics};
pub use kernel::KernelSpace;
