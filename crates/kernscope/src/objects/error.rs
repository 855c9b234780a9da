//! Errors raised by typed objects and walkers.

use crate::memory::error::LayerError;
use isf::IsfError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ObjectError {
    /// The catalog does not describe a requested type, symbol or field.
    #[error("Lookup failed: {0}")]
    Lookup(#[from] IsfError),

    #[error("Type '{type_name}' has no field '{field}'")]
    MissingField { type_name: String, field: String },

    #[error("Field {type_name}.{field} at offset {offset:#x} lies outside the type (size {size:#x})")]
    OffsetOutOfBounds {
        type_name: String,
        field: String,
        offset: usize,
        size: usize,
    },

    /// The bytes behind an object could not be read.
    #[error(transparent)]
    Memory(#[from] LayerError),

    #[error("Null pointer in {type_name}.{field}")]
    NullPointer { type_name: String, field: String },

    #[error("Field {type_name}.{field} is not {expected}")]
    InvalidFieldType {
        type_name: String,
        field: String,
        expected: &'static str,
    },

    #[error("Invalid {encoding} text in {field}")]
    Encoding { field: String, encoding: &'static str },

    /// An intrusive structure stopped making sense mid-walk.
    #[error("Corrupt list anchored at {anchor:#x}: {reason} at {at:#x} after {yielded} node(s)")]
    CorruptList {
        anchor: u64,
        at: u64,
        yielded: usize,
        reason: String,
    },

    #[error("Invalid field path '{path}': {msg}")]
    InvalidPath { path: String, msg: String },

    #[error("Bad {type_name} signature at {address:#x}")]
    InvalidSignature { type_name: String, address: u64 },

    #[error("Malformed {type_name} at {address:#x}: {reason}")]
    MalformedHeader {
        type_name: String,
        address: u64,
        reason: String,
    },

    /// The configuration has no layout for the requested operation.
    #[error("No {0} layout configured")]
    NotConfigured(&'static str),
}

impl ObjectError {
    /// Map catalog errors onto the overlay's own variants where they mean
    /// the same thing, keeping the rest as lookups.
    pub fn from_isf(err: IsfError) -> Self {
        match err {
            IsfError::FieldNotFound { type_name, field } => {
                ObjectError::MissingField { type_name, field }
            }
            IsfError::OffsetOutOfBounds {
                type_name,
                field,
                offset,
                size,
            } => ObjectError::OffsetOutOfBounds {
                type_name,
                field,
                offset,
                size,
            },
            other => ObjectError::Lookup(other),
        }
    }

    /// True when the bytes were simply not there (paged out, unmapped,
    /// beyond the capture). Callers usually treat the field as unavailable.
    pub fn is_unavailable(&self) -> bool {
        match self {
            ObjectError::Memory(e) => e.is_unmapped(),
            ObjectError::NullPointer { .. } => true,
            _ => false,
        }
    }

    /// True for catalog mismatches, which are fatal to a whole invocation.
    pub fn is_lookup(&self) -> bool {
        match self {
            ObjectError::Lookup(e) => e.is_lookup(),
            ObjectError::MissingField { .. } => true,
            _ => false,
        }
    }
}

pub type ObjectResult<T> = Result<T, ObjectError>;
