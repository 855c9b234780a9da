//! Usage plugins built on kernel space, the typed overlay and the walkers.
//!
//! Each plugin takes field names from the configured layouts, so the same
//! code serves Windows and Linux captures.

pub mod dump;
pub mod elfs;
pub mod pslist;
pub mod regions;
