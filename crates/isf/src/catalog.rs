//! The symbol/type catalog: indexed, immutable, shareable.

use crate::descriptor::{
    Endian, EnumDescriptor, FieldDescriptor, FieldType, SymbolDescriptor, TypeDescriptor,
};
use crate::error::{IsfError, IsfResult};
use crate::types::Metadata;
use std::collections::HashMap;
use std::sync::Arc;

/// Structure layouts and symbol addresses for one OS build.
///
/// Built once by [`crate::parser`] and never mutated afterwards; wrap it in an
/// `Arc` to share it between walkers and worker threads.
#[derive(Debug)]
pub struct Catalog {
    pub(crate) metadata: Metadata,
    pub(crate) types: HashMap<String, Arc<TypeDescriptor>>,
    pub(crate) base_types: HashMap<String, FieldType>,
    pub(crate) symbols: HashMap<String, SymbolDescriptor>,
    pub(crate) enums: HashMap<String, EnumDescriptor>,
    pub(crate) pointer_size: usize,
    pub(crate) endian: Endian,
}

impl Catalog {
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Pointer width in bytes (4 or 8).
    pub fn pointer_size(&self) -> usize {
        self.pointer_size
    }

    /// Byte order of the `pointer` base type.
    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// Look up an aggregate layout.
    pub fn get_type(&self, name: &str) -> IsfResult<Arc<TypeDescriptor>> {
        self.types
            .get(name)
            .cloned()
            .ok_or_else(|| IsfError::TypeNotFound(name.to_string()))
    }

    pub fn has_type(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Look up a primitive by its ISF name (e.g. `"unsigned long"`).
    pub fn base_type(&self, name: &str) -> IsfResult<&FieldType> {
        self.base_types
            .get(name)
            .ok_or_else(|| IsfError::TypeNotFound(name.to_string()))
    }

    /// Module-relative address of a symbol.
    pub fn get_symbol(&self, name: &str) -> IsfResult<u64> {
        self.symbol(name).map(|s| s.address)
    }

    pub fn symbol(&self, name: &str) -> IsfResult<&SymbolDescriptor> {
        self.symbols
            .get(name)
            .ok_or_else(|| IsfError::SymbolNotFound(name.to_string()))
    }

    pub fn has_symbol(&self, name: &str) -> bool {
        self.symbols.contains_key(name)
    }

    /// Look up a field of an aggregate.
    pub fn field(&self, type_name: &str, field: &str) -> IsfResult<&FieldDescriptor> {
        let desc = self
            .types
            .get(type_name)
            .ok_or_else(|| IsfError::TypeNotFound(type_name.to_string()))?;
        desc.field(field).ok_or_else(|| IsfError::FieldNotFound {
            type_name: type_name.to_string(),
            field: field.to_string(),
        })
    }

    /// Byte offset of `field` within `type_name`.
    ///
    /// The offset is checked against the declared size of the type: a field
    /// that starts at or beyond the end of its container means the catalog
    /// does not match the layout it claims to describe.
    pub fn relative_child_offset(&self, type_name: &str, field: &str) -> IsfResult<usize> {
        let desc = self.get_type(type_name)?;
        child_offset(&desc, field)
    }

    /// Size of an aggregate or primitive.
    pub fn type_size(&self, name: &str) -> IsfResult<usize> {
        if let Some(desc) = self.types.get(name) {
            Ok(desc.size())
        } else if let Some(base) = self.base_types.get(name) {
            Ok(base.size())
        } else {
            Err(IsfError::TypeNotFound(name.to_string()))
        }
    }

    pub fn get_enum(&self, name: &str) -> IsfResult<&EnumDescriptor> {
        self.enums
            .get(name)
            .ok_or_else(|| IsfError::TypeNotFound(name.to_string()))
    }

    /// Look up an enum value by constant name.
    pub fn enum_value(&self, enum_name: &str, constant: &str) -> Option<i64> {
        self.enums.get(enum_name).and_then(|e| e.value(constant))
    }

    /// Reverse-lookup an enum constant name by value.
    pub fn enum_name(&self, enum_name: &str, value: i64) -> Option<&str> {
        self.enums.get(enum_name).and_then(|e| e.name_of(value))
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    pub fn symbols(&self) -> impl Iterator<Item = &SymbolDescriptor> {
        self.symbols.values()
    }

    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    pub fn symbol_count(&self) -> usize {
        self.symbols.len()
    }
}

/// Validated field offset within an already resolved descriptor.
pub fn child_offset(desc: &TypeDescriptor, field: &str) -> IsfResult<usize> {
    let fd = desc.field(field).ok_or_else(|| IsfError::FieldNotFound {
        type_name: desc.name().to_string(),
        field: field.to_string(),
    })?;
    if fd.offset >= desc.size() {
        return Err(IsfError::OffsetOutOfBounds {
            type_name: desc.name().to_string(),
            field: field.to_string(),
            offset: fd.offset,
            size: desc.size(),
        });
    }
    Ok(fd.offset)
}
