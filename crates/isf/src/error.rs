//! Error types for the ISF crate.

use thiserror::Error;

/// Catalog loading and lookup errors.
#[derive(Debug, Error)]
pub enum IsfError {
    #[error("ISF file not found: {0}")]
    FileNotFound(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("XZ/LZMA decompression error: {0}")]
    Decompression(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),

    #[error("Type not found: {0}")]
    TypeNotFound(String),

    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("Field not found: {field} in type {type_name}")]
    FieldNotFound { type_name: String, field: String },

    #[error("Field {type_name}.{field} at offset {offset:#x} lies outside the type (size {size:#x})")]
    OffsetOutOfBounds {
        type_name: String,
        field: String,
        offset: usize,
        size: usize,
    },

    #[error("Invalid type description in {context}: {msg}")]
    InvalidType { context: String, msg: String },
}

impl IsfError {
    /// True for the lookup family: a missing type, symbol or field.
    ///
    /// These indicate that the catalog does not describe the OS build in the
    /// capture, as opposed to corruption inside the capture itself.
    pub fn is_lookup(&self) -> bool {
        matches!(
            self,
            IsfError::TypeNotFound(_) | IsfError::SymbolNotFound(_) | IsfError::FieldNotFound { .. }
        )
    }
}

pub type IsfResult<T> = Result<T, IsfError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_classification() {
        assert!(IsfError::TypeNotFound("_EPROCESS".into()).is_lookup());
        assert!(IsfError::SymbolNotFound("PsActiveProcessHead".into()).is_lookup());
        assert!(IsfError::FieldNotFound {
            type_name: "_EPROCESS".into(),
            field: "Pcb".into()
        }
        .is_lookup());
        assert!(!IsfError::OffsetOutOfBounds {
            type_name: "_EPROCESS".into(),
            field: "Pcb".into(),
            offset: 16,
            size: 8,
        }
        .is_lookup());
    }

    #[test]
    fn test_out_of_bounds_message() {
        let err = IsfError::OffsetOutOfBounds {
            type_name: "_LIST_ENTRY".into(),
            field: "Blink".into(),
            offset: 0x10,
            size: 0x10,
        };
        let msg = err.to_string();
        assert!(msg.contains("_LIST_ENTRY.Blink"));
        assert!(msg.contains("0x10"));
    }
}
