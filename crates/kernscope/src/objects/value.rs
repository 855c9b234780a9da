//! Decoded field values.

use isf::{BaseKind, Catalog, Endian, FieldType};
use serde::Serialize;

/// A field read out of memory and interpreted per its declared type.
///
/// Pointers stay plain addresses; embedded aggregates are reported by
/// address and type name and are read only when the caller asks for them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    Unsigned(u64),
    Signed(i64),
    Float(f64),
    Bool(bool),
    Pointer(u64),
    Enum { value: i64, name: Option<String> },
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Struct { type_name: String, offset: u64 },
    Void,
}

impl Value {
    /// Integer view of numeric, pointer, bool and enum values.
    ///
    /// Signed values are reinterpreted bit-for-bit. Arrays report their
    /// first element.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Unsigned(v) | Value::Pointer(v) => Some(*v),
            Value::Signed(v) => Some(*v as u64),
            Value::Bool(b) => Some(*b as u64),
            Value::Enum { value, .. } => Some(*value as u64),
            Value::Array(items) => items.first().and_then(Value::as_u64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Signed(v) => Some(*v),
            Value::Enum { value, .. } => Some(*value),
            other => other.as_u64().map(|v| v as i64),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            other => other.as_u64().map(|v| v != 0),
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

/// Read an unsigned integer of up to 8 bytes.
pub(crate) fn decode_uint(bytes: &[u8], endian: Endian) -> u64 {
    let width = bytes.len().min(8);
    let mut buf = [0u8; 8];
    match endian {
        Endian::Little => {
            buf[..width].copy_from_slice(&bytes[..width]);
            u64::from_le_bytes(buf)
        }
        Endian::Big => {
            buf[8 - width..].copy_from_slice(&bytes[..width]);
            u64::from_be_bytes(buf)
        }
    }
}

/// Sign-extend the low `bits` of `value`.
pub(crate) fn sign_extend(value: u64, bits: u32) -> i64 {
    if bits == 0 || bits >= 64 {
        return value as i64;
    }
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

/// Interpret `bytes` read at `address` as `field_type`.
///
/// `bytes` must hold at least `field_type.size()` bytes.
pub(crate) fn decode(catalog: &Catalog, field_type: &FieldType, address: u64, bytes: &[u8]) -> Value {
    match field_type {
        FieldType::Base {
            size,
            signed,
            kind,
            endian,
            ..
        } => {
            let raw = &bytes[..(*size).min(bytes.len())];
            match kind {
                BaseKind::Void => Value::Void,
                BaseKind::Bool => Value::Bool(decode_uint(raw, *endian) != 0),
                BaseKind::Float => {
                    let bits = decode_uint(raw, *endian);
                    match size {
                        4 => Value::Float(f32::from_bits(bits as u32) as f64),
                        _ => Value::Float(f64::from_bits(bits)),
                    }
                }
                BaseKind::Int | BaseKind::Char => {
                    let v = decode_uint(raw, *endian);
                    if *signed {
                        Value::Signed(sign_extend(v, (*size as u32) * 8))
                    } else {
                        Value::Unsigned(v)
                    }
                }
            }
        }
        FieldType::Pointer { size, endian, .. } => {
            Value::Pointer(decode_uint(&bytes[..(*size).min(bytes.len())], *endian))
        }
        FieldType::Enum {
            name,
            size,
            signed,
            endian,
        } => {
            let v = decode_uint(&bytes[..(*size).min(bytes.len())], *endian);
            let value = if *signed {
                sign_extend(v, (*size as u32) * 8)
            } else {
                v as i64
            };
            Value::Enum {
                value,
                name: catalog.enum_name(name, value).map(str::to_string),
            }
        }
        FieldType::Bitfield {
            position,
            length,
            storage,
        } => {
            let raw = decode(catalog, storage, address, bytes);
            let storage_value = raw.as_u64().unwrap_or(0);
            let field_mask = if *length >= 64 {
                u64::MAX
            } else {
                (1u64 << length) - 1
            };
            let extracted = (storage_value >> position) & field_mask;
            match raw {
                Value::Signed(_) => Value::Signed(sign_extend(extracted, *length)),
                Value::Bool(_) => Value::Bool(extracted != 0),
                Value::Enum { .. } => {
                    let enum_name = match storage.as_ref() {
                        FieldType::Enum { name, .. } => catalog
                            .enum_name(name, extracted as i64)
                            .map(str::to_string),
                        _ => None,
                    };
                    Value::Enum {
                        value: extracted as i64,
                        name: enum_name,
                    }
                }
                _ => Value::Unsigned(extracted),
            }
        }
        FieldType::Array { count, element } => {
            if field_type.is_byte_array() {
                return Value::Bytes(bytes[..(*count).min(bytes.len())].to_vec());
            }
            let stride = element.size();
            let items = (0..*count)
                .filter_map(|i| {
                    let start = i * stride;
                    let chunk = bytes.get(start..start + stride)?;
                    Some(decode(catalog, element, address + start as u64, chunk))
                })
                .collect();
            Value::Array(items)
        }
        FieldType::Struct { name, .. } => Value::Struct {
            type_name: name.clone(),
            offset: address,
        },
        FieldType::Function => Value::Void,
    }
}
