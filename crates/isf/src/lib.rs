//! ISF (Intermediate Symbol Format) symbol/type catalog.
//!
//! Parses the JSON-based ISF files that describe an operating system build:
//! structure layouts, primitive widths, enumerations and symbol addresses.
//! Loading resolves every field to a concrete [`FieldType`] once, producing an
//! immutable [`Catalog`] that many readers can share.
//!
//! - Parsing of `.json` and `.json.xz` (LZMA-compressed) ISF files
//! - O(1) lookup of types, fields and symbols by name
//! - Validated field offsets via [`Catalog::relative_child_offset`]
//!
//! # Example
//!
//! ```rust,ignore
//! use isf::parse_isf_file;
//!
//! let catalog = parse_isf_file("ntkrnlmp.pdb/GUID/ntkrnlmp.json.xz")?;
//! let eprocess = catalog.get_type("_EPROCESS")?;
//! let links = catalog.relative_child_offset("_EPROCESS", "ActiveProcessLinks")?;
//! ```

pub mod catalog;
pub mod descriptor;
pub mod error;
pub mod parser;
pub mod types;

// Re-export key types at crate root.
pub use catalog::{child_offset, Catalog};
pub use descriptor::{
    AggregateKind, BaseKind, Endian, EnumDescriptor, FieldDescriptor, FieldType,
    SymbolDescriptor, TypeDescriptor,
};
pub use error::{IsfError, IsfResult};
pub use parser::{parse_isf_bytes, parse_isf_file, parse_isf_str};
pub use types::Metadata;
