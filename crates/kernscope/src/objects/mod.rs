//! Typed overlays onto memory layers and traversal of intrusive structures.

pub mod error;
pub mod list;
pub mod path;
pub mod strings;
pub mod tree;
pub mod typed;
pub mod value;

pub use error::{ObjectError, ObjectResult};
pub use list::{ListWalker, DEFAULT_MAX_NODES};
pub use path::{FieldPath, Step};
pub use strings::{decode_text, Encoding, OnDecodeError};
pub use tree::{TreeWalker, DEFAULT_MAX_TREE_NODES};
pub use typed::{read_pointer, TypedObject};
pub use value::Value;
