//! Typed views over layer bytes.

use crate::memory::error::LayerError;
use crate::memory::traits::MemoryLayer;
use crate::objects::error::{ObjectError, ObjectResult};
use crate::objects::path::{FieldPath, Step};
use crate::objects::strings::{decode_text, Encoding, OnDecodeError};
use crate::objects::value::{decode, decode_uint, Value};
use isf::{child_offset, Catalog, FieldDescriptor, FieldType, TypeDescriptor};
use std::fmt;
use std::sync::Arc;

/// A `(layer, offset, descriptor)` view.
///
/// Owns no bytes: every field access re-reads the layer. Casting swaps the
/// descriptor and keeps the address. Pointer fields are returned as plain
/// addresses; following one is always an explicit [`TypedObject::deref`].
#[derive(Clone)]
pub struct TypedObject {
    layer: Arc<dyn MemoryLayer>,
    catalog: Arc<Catalog>,
    offset: u64,
    descriptor: Arc<TypeDescriptor>,
}

impl fmt::Debug for TypedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedObject")
            .field("type", &self.descriptor.name())
            .field("layer", &self.layer.name())
            .field("offset", &format_args!("{:#x}", self.offset))
            .finish()
    }
}

impl TypedObject {
    /// Overlay the catalog type `type_name` at `offset` in `layer`.
    pub fn new(
        catalog: Arc<Catalog>,
        layer: Arc<dyn MemoryLayer>,
        type_name: &str,
        offset: u64,
    ) -> ObjectResult<Self> {
        let descriptor = catalog.get_type(type_name)?;
        Ok(Self::with_descriptor(catalog, layer, descriptor, offset))
    }

    pub fn with_descriptor(
        catalog: Arc<Catalog>,
        layer: Arc<dyn MemoryLayer>,
        descriptor: Arc<TypeDescriptor>,
        offset: u64,
    ) -> Self {
        TypedObject {
            layer,
            catalog,
            offset,
            descriptor,
        }
    }

    /// Recover a container from the address of one of its embedded fields.
    pub fn container_of(
        catalog: Arc<Catalog>,
        layer: Arc<dyn MemoryLayer>,
        type_name: &str,
        field: &str,
        field_address: u64,
    ) -> ObjectResult<Self> {
        let descriptor = catalog.get_type(type_name)?;
        let rel = child_offset(&descriptor, field).map_err(ObjectError::from_isf)?;
        let base = field_address.checked_sub(rel as u64).ok_or_else(|| {
            LayerError::invalid_address(
                layer.name(),
                field_address,
                format!("{}.{} cannot sit below offset {:#x}", type_name, field, rel),
            )
        })?;
        Ok(Self::with_descriptor(catalog, layer, descriptor, base))
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn type_name(&self) -> &str {
        self.descriptor.name()
    }

    pub fn size(&self) -> usize {
        self.descriptor.size()
    }

    pub fn descriptor(&self) -> &Arc<TypeDescriptor> {
        &self.descriptor
    }

    pub fn layer(&self) -> &Arc<dyn MemoryLayer> {
        &self.layer
    }

    pub fn layer_name(&self) -> &str {
        self.layer.name()
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Reinterpret the same address as another type.
    pub fn cast(&self, type_name: &str) -> ObjectResult<Self> {
        let descriptor = self.catalog.get_type(type_name)?;
        Ok(Self::with_descriptor(
            self.catalog.clone(),
            self.layer.clone(),
            descriptor,
            self.offset,
        ))
    }

    /// The same type at another address.
    pub fn at(&self, offset: u64) -> Self {
        TypedObject {
            offset,
            ..self.clone()
        }
    }

    /// The same type and address on another layer.
    pub fn on_layer(&self, layer: Arc<dyn MemoryLayer>) -> Self {
        TypedObject {
            layer,
            ..self.clone()
        }
    }

    /// True when every byte of the object is readable.
    pub fn is_valid(&self) -> bool {
        self.layer.is_valid(self.offset, self.size().max(1) as u64)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.descriptor.has_field(name)
    }

    fn field_descriptor(&self, name: &str) -> ObjectResult<&FieldDescriptor> {
        self.descriptor
            .field(name)
            .ok_or_else(|| ObjectError::MissingField {
                type_name: self.type_name().to_string(),
                field: name.to_string(),
            })
    }

    /// Validated offset of `name` relative to the start of this object.
    pub fn child_offset(&self, name: &str) -> ObjectResult<usize> {
        child_offset(&self.descriptor, name).map_err(ObjectError::from_isf)
    }

    pub fn field_address(&self, name: &str) -> ObjectResult<u64> {
        Ok(self.offset.wrapping_add(self.child_offset(name)? as u64))
    }

    pub fn read_field_bytes(&self, name: &str) -> ObjectResult<Vec<u8>> {
        let address = self.field_address(name)?;
        let size = self.field_descriptor(name)?.size();
        Ok(self.layer.read(address, size, false)?)
    }

    /// Read and decode a field.
    ///
    /// Embedded aggregates are not read; they come back as
    /// [`Value::Struct`] with their address.
    pub fn field(&self, name: &str) -> ObjectResult<Value> {
        let address = self.field_address(name)?;
        let fd = self.field_descriptor(name)?;
        match &fd.field_type {
            FieldType::Struct { name, .. } => Ok(Value::Struct {
                type_name: name.clone(),
                offset: address,
            }),
            FieldType::Function => Ok(Value::Void),
            field_type => {
                let bytes = self.layer.read(address, field_type.size(), false)?;
                Ok(decode(&self.catalog, field_type, address, &bytes))
            }
        }
    }

    /// An embedded aggregate field as its own object.
    pub fn member(&self, name: &str) -> ObjectResult<TypedObject> {
        let address = self.field_address(name)?;
        let fd = self.field_descriptor(name)?;
        let type_name = fd.field_type.struct_name().ok_or_else(|| ObjectError::InvalidFieldType {
            type_name: self.type_name().to_string(),
            field: name.to_string(),
            expected: "an embedded structure",
        })?;
        Ok(self.cast(type_name)?.at(address))
    }

    /// Read a pointer field as a raw address.
    pub fn pointer(&self, name: &str) -> ObjectResult<u64> {
        let fd = self.field_descriptor(name)?;
        match &fd.field_type {
            FieldType::Pointer { .. } => self.unsigned(name),
            _ => Err(ObjectError::InvalidFieldType {
                type_name: self.type_name().to_string(),
                field: name.to_string(),
                expected: "a pointer",
            }),
        }
    }

    /// Integer view of a numeric, pointer, enum or bitfield field.
    pub fn unsigned(&self, name: &str) -> ObjectResult<u64> {
        self.field(name)?.as_u64().ok_or_else(|| ObjectError::InvalidFieldType {
            type_name: self.type_name().to_string(),
            field: name.to_string(),
            expected: "an integer",
        })
    }

    pub fn signed(&self, name: &str) -> ObjectResult<i64> {
        self.field(name)?.as_i64().ok_or_else(|| ObjectError::InvalidFieldType {
            type_name: self.type_name().to_string(),
            field: name.to_string(),
            expected: "an integer",
        })
    }

    /// Follow pointer field `name`.
    ///
    /// The target is typed as `cast` when given, otherwise as the pointer's
    /// declared target aggregate. A null pointer fails with `NullPointer`.
    pub fn deref(&self, name: &str, cast: Option<&str>) -> ObjectResult<TypedObject> {
        let fd = self.field_descriptor(name)?;
        let declared = fd.field_type.pointee().and_then(FieldType::struct_name);
        if !fd.field_type.is_pointer() {
            return Err(ObjectError::InvalidFieldType {
                type_name: self.type_name().to_string(),
                field: name.to_string(),
                expected: "a pointer",
            });
        }
        let target = cast.or(declared).ok_or_else(|| ObjectError::InvalidFieldType {
            type_name: self.type_name().to_string(),
            field: name.to_string(),
            expected: "a pointer to a structure",
        })?;
        let target = target.to_string();
        let address = self.pointer(name)?;
        if address == 0 {
            return Err(ObjectError::NullPointer {
                type_name: self.type_name().to_string(),
                field: name.to_string(),
            });
        }
        Ok(self.cast(&target)?.at(address))
    }

    /// Decode a fixed-width byte-array field as text.
    pub fn array_to_string(
        &self,
        name: &str,
        max_length: usize,
        encoding: Encoding,
        on_error: OnDecodeError,
    ) -> ObjectResult<String> {
        let fd = self.field_descriptor(name)?;
        if !matches!(fd.field_type, FieldType::Array { .. }) {
            return Err(ObjectError::InvalidFieldType {
                type_name: self.type_name().to_string(),
                field: name.to_string(),
                expected: "an array",
            });
        }
        let bytes = self.read_field_bytes(name)?;
        decode_text(
            &bytes,
            max_length,
            encoding,
            on_error,
            &format!("{}.{}", self.type_name(), name),
        )
    }

    /// Read a NUL-terminated string that pointer field `name` points at.
    pub fn pointed_string(
        &self,
        name: &str,
        max_length: usize,
        encoding: Encoding,
        on_error: OnDecodeError,
    ) -> ObjectResult<String> {
        let address = self.pointer(name)?;
        if address == 0 {
            return Err(ObjectError::NullPointer {
                type_name: self.type_name().to_string(),
                field: name.to_string(),
            });
        }
        let bytes = self.layer.read(address, max_length, true)?;
        decode_text(
            &bytes,
            max_length,
            encoding,
            on_error,
            &format!("{}.{}", self.type_name(), name),
        )
    }

    /// Resolve all but the last step of `path`, returning the object that
    /// holds the final field and that field's name.
    pub fn path_target<'p>(&self, path: &'p FieldPath) -> ObjectResult<(TypedObject, &'p str)> {
        let steps = path.steps();
        let mut current = self.clone();
        for pair in steps.windows(2) {
            current = match &pair[1] {
                Step::Member(_) => current.member(pair[0].field())?,
                Step::Deref { cast, .. } => current.deref(pair[0].field(), cast.as_deref())?,
            };
        }
        let last = steps.last().map(Step::field).ok_or_else(|| ObjectError::InvalidPath {
            path: path.to_string(),
            msg: "empty path".to_string(),
        })?;
        Ok((current, last))
    }

    pub fn path_value(&self, path: &FieldPath) -> ObjectResult<Value> {
        let (target, field) = self.path_target(path)?;
        target.field(field)
    }

    pub fn path_unsigned(&self, path: &FieldPath) -> ObjectResult<u64> {
        let (target, field) = self.path_target(path)?;
        target.unsigned(field)
    }

    pub fn path_address(&self, path: &FieldPath) -> ObjectResult<u64> {
        let (target, field) = self.path_target(path)?;
        target.field_address(field)
    }

    /// The object a path ends on: the embedded member or the pointed-to
    /// aggregate named by the last step.
    pub fn path_object(&self, path: &FieldPath, cast: Option<&str>) -> ObjectResult<TypedObject> {
        let (target, field) = self.path_target(path)?;
        let fd = target.field_descriptor(field)?;
        if fd.field_type.is_pointer() {
            target.deref(field, cast)
        } else {
            let member = target.member(field)?;
            match cast {
                Some(t) => member.cast(t),
                None => Ok(member),
            }
        }
    }
}

/// Read a pointer-sized value at `address` using the catalog's pointer
/// width and byte order.
pub fn read_pointer(layer: &dyn MemoryLayer, catalog: &Catalog, address: u64) -> ObjectResult<u64> {
    let bytes = layer.read(address, catalog.pointer_size(), false)?;
    Ok(decode_uint(&bytes, catalog.endian()))
}
