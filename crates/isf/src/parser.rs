//! ISF loader: reads plain or XZ-compressed JSON and resolves it into a
//! [`Catalog`].

use crate::catalog::Catalog;
use crate::descriptor::{
    AggregateKind, BaseKind, Endian, EnumDescriptor, FieldDescriptor, FieldType,
    SymbolDescriptor, TypeDescriptor,
};
use crate::error::{IsfError, IsfResult};
use crate::types::{RawBaseType, RawIsf, RawTypeRef};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::Arc;
use xz2::read::XzDecoder;

const XZ_MAGIC: [u8; 6] = [0xFD, b'7', b'z', b'X', b'Z', 0x00];

/// Load a catalog from a filesystem path.
///
/// XZ compression is recognised by the `.xz` extension or by the stream
/// magic, so renamed files still load.
pub fn parse_isf_file(path: impl AsRef<Path>) -> IsfResult<Catalog> {
    let path = path.as_ref();

    if !path.exists() {
        return Err(IsfError::FileNotFound(path.display().to_string()));
    }

    let file = File::open(path)
        .map_err(|e| IsfError::Io(format!("opening {}: {}", path.display(), e)))?;
    let mut raw = Vec::new();
    BufReader::new(file)
        .read_to_end(&mut raw)
        .map_err(|e| IsfError::Io(format!("reading {}: {}", path.display(), e)))?;

    let compressed = path
        .to_string_lossy()
        .to_lowercase()
        .ends_with(".xz")
        || raw.starts_with(&XZ_MAGIC);

    let json_bytes = if compressed {
        let mut decoder = XzDecoder::new(raw.as_slice());
        let mut buf = Vec::new();
        decoder
            .read_to_end(&mut buf)
            .map_err(|e| IsfError::Decompression(format!("{}: {}", path.display(), e)))?;
        buf
    } else {
        raw
    };

    parse_isf_bytes(&json_bytes)
}

/// Load a catalog from raw (already decompressed) JSON bytes.
pub fn parse_isf_bytes(json_bytes: &[u8]) -> IsfResult<Catalog> {
    let raw: RawIsf =
        serde_json::from_slice(json_bytes).map_err(|e| IsfError::JsonParse(e.to_string()))?;
    resolve(raw)
}

/// Load a catalog from a JSON string.
pub fn parse_isf_str(json_str: &str) -> IsfResult<Catalog> {
    let raw: RawIsf =
        serde_json::from_str(json_str).map_err(|e| IsfError::JsonParse(e.to_string()))?;
    resolve(raw)
}

fn void_type() -> FieldType {
    FieldType::Base {
        name: "void".to_string(),
        size: 0,
        signed: false,
        kind: BaseKind::Void,
        endian: Endian::Little,
    }
}

fn base_from_raw(name: &str, raw: &RawBaseType) -> IsfResult<FieldType> {
    let kind = BaseKind::parse(&raw.kind).ok_or_else(|| IsfError::InvalidType {
        context: format!("base type '{}'", name),
        msg: format!("unknown kind '{}'", raw.kind),
    })?;
    let endian = Endian::parse(&raw.endian).ok_or_else(|| IsfError::InvalidType {
        context: format!("base type '{}'", name),
        msg: format!("unknown endian '{}'", raw.endian),
    })?;
    Ok(FieldType::Base {
        name: name.to_string(),
        size: raw.size,
        signed: raw.signed,
        kind,
        endian,
    })
}

struct Resolver<'a> {
    raw: &'a RawIsf,
    base_types: &'a HashMap<String, FieldType>,
    pointer_size: usize,
    endian: Endian,
}

impl Resolver<'_> {
    fn invalid(context: &str, msg: impl Into<String>) -> IsfError {
        IsfError::InvalidType {
            context: context.to_string(),
            msg: msg.into(),
        }
    }

    fn resolve(&self, r: &RawTypeRef, context: &str) -> IsfResult<FieldType> {
        match r.kind.as_str() {
            "base" => {
                let name = r
                    .name
                    .as_deref()
                    .ok_or_else(|| Self::invalid(context, "base type without a name"))?;
                match self.base_types.get(name) {
                    Some(t) => Ok(t.clone()),
                    None if name == "void" => Ok(void_type()),
                    None => Err(Self::invalid(context, format!("unknown base type '{}'", name))),
                }
            }
            "pointer" => {
                let target = match r.subtype.as_deref() {
                    Some(sub) => self.resolve(sub, context)?,
                    None => void_type(),
                };
                Ok(FieldType::Pointer {
                    size: self.pointer_size,
                    endian: self.endian,
                    target: Box::new(target),
                })
            }
            "array" => {
                let element = r
                    .subtype
                    .as_deref()
                    .or(r.inner.as_deref())
                    .ok_or_else(|| Self::invalid(context, "array without an element type"))?;
                Ok(FieldType::Array {
                    count: r.count.unwrap_or(0),
                    element: Box::new(self.resolve(element, context)?),
                })
            }
            "struct" | "union" | "class" => {
                let name = r
                    .name
                    .as_deref()
                    .ok_or_else(|| Self::invalid(context, "aggregate reference without a name"))?;
                // Opaque aggregates are legal targets; they simply have no size.
                let size = self.raw.user_types.get(name).map(|u| u.size).unwrap_or(0);
                Ok(FieldType::Struct {
                    name: name.to_string(),
                    size,
                })
            }
            "enum" => {
                let name = r
                    .name
                    .as_deref()
                    .ok_or_else(|| Self::invalid(context, "enum reference without a name"))?;
                let e = self
                    .raw
                    .enums
                    .get(name)
                    .ok_or_else(|| Self::invalid(context, format!("unknown enum '{}'", name)))?;
                let (signed, endian) = match self.base_types.get(&e.base) {
                    Some(FieldType::Base { signed, endian, .. }) => (*signed, *endian),
                    _ => (false, self.endian),
                };
                Ok(FieldType::Enum {
                    name: name.to_string(),
                    size: e.size,
                    signed,
                    endian,
                })
            }
            "bitfield" => {
                let storage = r
                    .inner
                    .as_deref()
                    .ok_or_else(|| Self::invalid(context, "bitfield without a storage type"))?;
                let position = r
                    .bit_position
                    .ok_or_else(|| Self::invalid(context, "bitfield without bit_position"))?;
                let length = r
                    .bit_length
                    .ok_or_else(|| Self::invalid(context, "bitfield without bit_length"))?;
                if length == 0 || position + length > 64 {
                    return Err(Self::invalid(
                        context,
                        format!("bitfield {}:{} does not fit 64 bits", position, length),
                    ));
                }
                Ok(FieldType::Bitfield {
                    position,
                    length,
                    storage: Box::new(self.resolve(storage, context)?),
                })
            }
            "function" => Ok(FieldType::Function),
            other => Err(Self::invalid(context, format!("unknown kind '{}'", other))),
        }
    }
}

/// Resolve a parsed document into an indexed catalog.
fn resolve(raw: RawIsf) -> IsfResult<Catalog> {
    let mut base_types = HashMap::with_capacity(raw.base_types.len());
    for (name, bt) in &raw.base_types {
        base_types.insert(name.clone(), base_from_raw(name, bt)?);
    }

    let (pointer_size, endian) = match base_types.get("pointer") {
        Some(FieldType::Base { size, endian, .. }) => (*size, *endian),
        _ => (8, Endian::Little),
    };

    let resolver = Resolver {
        raw: &raw,
        base_types: &base_types,
        pointer_size,
        endian,
    };

    let mut types = HashMap::with_capacity(raw.user_types.len());
    for (type_name, ut) in &raw.user_types {
        let mut fields = Vec::with_capacity(ut.fields.len());
        for (field_name, fd) in &ut.fields {
            let context = format!("{}.{}", type_name, field_name);
            fields.push(FieldDescriptor {
                name: field_name.clone(),
                offset: fd.offset,
                field_type: resolver.resolve(&fd.type_ref, &context)?,
            });
        }
        let desc = TypeDescriptor::new(
            type_name.clone(),
            ut.size,
            AggregateKind::parse(ut.kind.as_deref()),
            fields,
        );
        types.insert(type_name.clone(), Arc::new(desc));
    }

    let symbols = raw
        .symbols
        .iter()
        .map(|(name, s)| {
            let type_name = s
                .type_ref
                .as_ref()
                .filter(|t| matches!(t.kind.as_str(), "struct" | "union" | "class"))
                .and_then(|t| t.name.clone());
            (
                name.clone(),
                SymbolDescriptor {
                    name: name.clone(),
                    address: s.address,
                    type_name,
                    constant_data: s.constant_data.clone(),
                },
            )
        })
        .collect();

    let enums = raw
        .enums
        .iter()
        .map(|(name, e)| {
            (
                name.clone(),
                EnumDescriptor::new(name.clone(), e.size, e.base.clone(), e.constants.clone()),
            )
        })
        .collect();

    Ok(Catalog {
        metadata: raw.metadata,
        types,
        base_types,
        symbols,
        enums,
        pointer_size,
        endian,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL_ISF: &str = r#"{
        "metadata": { "format": "6.2.0", "windows": { "major": 10, "build": 19041 } },
        "base_types": {
            "pointer": { "size": 8, "signed": false, "kind": "int", "endian": "little" },
            "unsigned long": { "size": 4, "signed": false, "kind": "int", "endian": "little" },
            "unsigned long long": { "size": 8, "signed": false, "kind": "int", "endian": "little" },
            "long": { "size": 4, "signed": true, "kind": "int", "endian": "little" },
            "unsigned char": { "size": 1, "signed": false, "kind": "char", "endian": "little" },
            "void": { "size": 0, "signed": false, "kind": "void", "endian": "little" }
        },
        "user_types": {
            "_LIST_ENTRY": {
                "size": 16,
                "fields": {
                    "Flink": { "offset": 0, "type": { "kind": "pointer", "subtype": { "kind": "struct", "name": "_LIST_ENTRY" } } },
                    "Blink": { "offset": 8, "type": { "kind": "pointer", "subtype": { "kind": "struct", "name": "_LIST_ENTRY" } } }
                }
            },
            "_EPROCESS": {
                "size": 2096,
                "fields": {
                    "UniqueProcessId": { "offset": 440, "type": { "kind": "pointer", "subtype": { "kind": "base", "name": "void" } } },
                    "ActiveProcessLinks": { "offset": 448, "type": { "kind": "struct", "name": "_LIST_ENTRY" } },
                    "ImageFileName": { "offset": 736, "type": { "kind": "array", "count": 15, "subtype": { "kind": "base", "name": "unsigned char" } } },
                    "Flags": { "offset": 1120, "type": { "kind": "bitfield", "bit_position": 3, "bit_length": 5, "type": { "kind": "base", "name": "unsigned long" } } },
                    "State": { "offset": 1124, "type": { "kind": "enum", "name": "_PS_STATE" } },
                    "Opaque": { "offset": 1128, "type": { "kind": "pointer", "subtype": { "kind": "struct", "name": "_NOT_DECLARED" } } }
                }
            }
        },
        "symbols": {
            "PsActiveProcessHead": { "address": 11501904 },
            "KiInitialProcess": { "address": 11530400, "type": { "kind": "struct", "name": "_EPROCESS" } }
        },
        "enums": {
            "_PS_STATE": { "size": 4, "base": "long", "constants": { "Running": 0, "Exiting": 1 } }
        }
    }"#;

    #[test]
    fn test_parse_minimal_isf() {
        let catalog = parse_isf_str(MINIMAL_ISF).unwrap();

        assert_eq!(catalog.pointer_size(), 8);
        assert_eq!(catalog.metadata().format, "6.2.0");
        assert_eq!(
            catalog.metadata().windows.as_ref().and_then(|w| w.build),
            Some(19041)
        );

        let eprocess = catalog.get_type("_EPROCESS").unwrap();
        assert_eq!(eprocess.size(), 2096);

        let links = eprocess.field("ActiveProcessLinks").unwrap();
        assert_eq!(links.offset, 448);
        assert_eq!(links.field_type.struct_name(), Some("_LIST_ENTRY"));
        assert_eq!(links.size(), 16);

        let name = eprocess.field("ImageFileName").unwrap();
        assert!(name.field_type.is_byte_array());
        assert_eq!(name.size(), 15);

        assert_eq!(catalog.get_symbol("PsActiveProcessHead").unwrap(), 11501904);
        assert_eq!(
            catalog.symbol("KiInitialProcess").unwrap().type_name.as_deref(),
            Some("_EPROCESS")
        );
    }

    #[test]
    fn test_resolves_bitfields_enums_and_opaque_targets() {
        let catalog = parse_isf_str(MINIMAL_ISF).unwrap();
        let flags = catalog.field("_EPROCESS", "Flags").unwrap();
        match &flags.field_type {
            FieldType::Bitfield { position, length, storage } => {
                assert_eq!((*position, *length), (3, 5));
                assert_eq!(storage.size(), 4);
            }
            other => panic!("expected bitfield, got {:?}", other),
        }

        let state = catalog.field("_EPROCESS", "State").unwrap();
        assert!(matches!(state.field_type, FieldType::Enum { size: 4, signed: true, .. }));
        assert_eq!(catalog.enum_name("_PS_STATE", 1), Some("Exiting"));
        assert_eq!(catalog.enum_value("_PS_STATE", "Running"), Some(0));

        let opaque = catalog.field("_EPROCESS", "Opaque").unwrap();
        assert_eq!(
            opaque.field_type.pointee(),
            Some(&FieldType::Struct { name: "_NOT_DECLARED".into(), size: 0 })
        );
    }

    #[test]
    fn test_parse_32bit_pointer_size() {
        let json = r#"{
            "metadata": { "format": "6.2.0" },
            "base_types": { "pointer": { "size": 4, "signed": false, "kind": "int" } }
        }"#;
        let catalog = parse_isf_str(json).unwrap();
        assert_eq!(catalog.pointer_size(), 4);
        assert_eq!(catalog.endian(), Endian::Little);
    }

    #[test]
    fn test_unknown_base_type_is_rejected() {
        let json = r#"{
            "metadata": { "format": "6.2.0" },
            "base_types": {},
            "user_types": {
                "_T": { "size": 4, "fields": { "x": { "offset": 0, "type": { "kind": "base", "name": "mystery" } } } }
            }
        }"#;
        match parse_isf_str(json) {
            Err(IsfError::InvalidType { context, .. }) => assert_eq!(context, "_T.x"),
            other => panic!("expected InvalidType, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_plain_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(MINIMAL_ISF.as_bytes()).unwrap();
        tmp.flush().unwrap();

        let catalog = parse_isf_file(tmp.path()).unwrap();
        assert!(catalog.has_type("_EPROCESS"));
    }

    #[test]
    fn test_parse_xz_file_by_magic() {
        let mut encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
        encoder.write_all(MINIMAL_ISF.as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();

        // No .xz extension: detection falls back to the stream magic.
        let mut tmp = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        tmp.write_all(&compressed).unwrap();
        tmp.flush().unwrap();

        let catalog = parse_isf_file(tmp.path()).unwrap();
        assert_eq!(catalog.get_symbol("PsActiveProcessHead").unwrap(), 11501904);
    }

    #[test]
    fn test_parse_file_not_found() {
        match parse_isf_file("/nonexistent/path.json") {
            Err(IsfError::FileNotFound(path)) => assert!(path.contains("nonexistent")),
            other => panic!("Expected FileNotFound, got: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(parse_isf_str("{ not json"), Err(IsfError::JsonParse(_))));
    }
}
