//! Resolved, immutable type descriptors.
//!
//! Every field carries a fully resolved [`FieldType`] (widths, signedness and
//! byte order already looked up), so reading a field never has to consult the
//! catalog tables again.

use std::collections::{BTreeMap, HashMap};

/// Byte order of a primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    pub(crate) fn parse(value: &str) -> Option<Self> {
        match value {
            "little" => Some(Endian::Little),
            "big" => Some(Endian::Big),
            _ => None,
        }
    }
}

/// Interpretation class of a primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseKind {
    Int,
    Float,
    Bool,
    Char,
    Void,
}

impl BaseKind {
    pub(crate) fn parse(value: &str) -> Option<Self> {
        match value {
            "int" => Some(BaseKind::Int),
            "float" => Some(BaseKind::Float),
            "bool" => Some(BaseKind::Bool),
            "char" => Some(BaseKind::Char),
            "void" => Some(BaseKind::Void),
            _ => None,
        }
    }
}

/// The resolved type of a field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    Base {
        name: String,
        size: usize,
        signed: bool,
        kind: BaseKind,
        endian: Endian,
    },
    /// A virtual address. The target is informational; nothing follows it
    /// implicitly.
    Pointer {
        size: usize,
        endian: Endian,
        target: Box<FieldType>,
    },
    Array {
        count: usize,
        element: Box<FieldType>,
    },
    /// An embedded aggregate, referenced by name. `size` is 0 for opaque
    /// (forward-declared) aggregates.
    Struct { name: String, size: usize },
    Enum {
        name: String,
        size: usize,
        signed: bool,
        endian: Endian,
    },
    Bitfield {
        position: u32,
        length: u32,
        storage: Box<FieldType>,
    },
    Function,
}

impl FieldType {
    /// Size in bytes occupied by a value of this type.
    pub fn size(&self) -> usize {
        match self {
            FieldType::Base { size, .. }
            | FieldType::Pointer { size, .. }
            | FieldType::Struct { size, .. }
            | FieldType::Enum { size, .. } => *size,
            FieldType::Array { count, element } => count.saturating_mul(element.size()),
            FieldType::Bitfield { storage, .. } => storage.size(),
            FieldType::Function => 0,
        }
    }

    /// Name of the aggregate for embedded structs.
    pub fn struct_name(&self) -> Option<&str> {
        match self {
            FieldType::Struct { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Target type for pointers.
    pub fn pointee(&self) -> Option<&FieldType> {
        match self {
            FieldType::Pointer { target, .. } => Some(target),
            _ => None,
        }
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, FieldType::Pointer { .. })
    }

    /// True for arrays of single-byte elements (fixed-width text buffers).
    pub fn is_byte_array(&self) -> bool {
        match self {
            FieldType::Array { element, .. } => element.size() == 1,
            _ => false,
        }
    }

    /// Element count for arrays.
    pub fn count(&self) -> Option<usize> {
        match self {
            FieldType::Array { count, .. } => Some(*count),
            _ => None,
        }
    }
}

/// One field of an aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    /// Byte offset relative to the start of the containing aggregate.
    pub offset: usize,
    pub field_type: FieldType,
}

impl FieldDescriptor {
    pub fn size(&self) -> usize {
        self.field_type.size()
    }
}

/// Aggregate flavour as declared by the ISF `kind` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    Struct,
    Union,
    Class,
}

impl AggregateKind {
    pub(crate) fn parse(value: Option<&str>) -> Self {
        match value {
            Some("union") => AggregateKind::Union,
            Some("class") => AggregateKind::Class,
            _ => AggregateKind::Struct,
        }
    }
}

/// A named aggregate layout. Shared behind `Arc` by every object of the type.
#[derive(Debug, PartialEq)]
pub struct TypeDescriptor {
    name: String,
    size: usize,
    kind: AggregateKind,
    /// Ordered by offset, then name.
    fields: Vec<FieldDescriptor>,
    index: HashMap<String, usize>,
}

impl TypeDescriptor {
    pub fn new(
        name: impl Into<String>,
        size: usize,
        kind: AggregateKind,
        mut fields: Vec<FieldDescriptor>,
    ) -> Self {
        fields.sort_by(|a, b| a.offset.cmp(&b.offset).then_with(|| a.name.cmp(&b.name)));
        let index = fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();
        TypeDescriptor {
            name: name.into(),
            size,
            kind,
            fields,
            index,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared total size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn kind(&self) -> AggregateKind {
        self.kind
    }

    /// Fields in offset order.
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.index.get(name).map(|&i| &self.fields[i])
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }
}

/// A named address.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolDescriptor {
    pub name: String,
    /// Address relative to the module base the catalog describes.
    pub address: u64,
    /// Aggregate name when the symbol is typed as a struct.
    pub type_name: Option<String>,
    /// Base64-encoded constant data (rare).
    pub constant_data: Option<String>,
}

/// An enumeration with both lookup directions.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumDescriptor {
    pub name: String,
    pub size: usize,
    pub base: String,
    constants: HashMap<String, i64>,
    /// Value → constant name; the lexicographically first name wins when
    /// several constants share a value.
    names: BTreeMap<i64, String>,
}

impl EnumDescriptor {
    pub fn new(
        name: impl Into<String>,
        size: usize,
        base: impl Into<String>,
        constants: HashMap<String, i64>,
    ) -> Self {
        let mut names: BTreeMap<i64, String> = BTreeMap::new();
        for (constant, &value) in &constants {
            match names.get(&value) {
                Some(existing) if existing <= constant => {}
                _ => {
                    names.insert(value, constant.clone());
                }
            }
        }
        EnumDescriptor {
            name: name.into(),
            size,
            base: base.into(),
            constants,
            names,
        }
    }

    pub fn value(&self, constant: &str) -> Option<i64> {
        self.constants.get(constant).copied()
    }

    pub fn name_of(&self, value: i64) -> Option<&str> {
        self.names.get(&value).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u32_type() -> FieldType {
        FieldType::Base {
            name: "unsigned long".into(),
            size: 4,
            signed: false,
            kind: BaseKind::Int,
            endian: Endian::Little,
        }
    }

    #[test]
    fn test_fields_are_ordered_by_offset() {
        let desc = TypeDescriptor::new(
            "_THING",
            16,
            AggregateKind::Struct,
            vec![
                FieldDescriptor { name: "b".into(), offset: 8, field_type: u32_type() },
                FieldDescriptor { name: "a".into(), offset: 0, field_type: u32_type() },
                FieldDescriptor { name: "c".into(), offset: 4, field_type: u32_type() },
            ],
        );
        let names: Vec<_> = desc.fields().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["a", "c", "b"]);
        assert_eq!(desc.field("b").map(|f| f.offset), Some(8));
        assert!(desc.field("zz").is_none());
    }

    #[test]
    fn test_array_size() {
        let array = FieldType::Array {
            count: 15,
            element: Box::new(FieldType::Base {
                name: "unsigned char".into(),
                size: 1,
                signed: false,
                kind: BaseKind::Char,
                endian: Endian::Little,
            }),
        };
        assert_eq!(array.size(), 15);
        assert!(array.is_byte_array());
        assert_eq!(array.count(), Some(15));
    }

    #[test]
    fn test_enum_reverse_lookup_is_deterministic() {
        let mut constants = HashMap::new();
        constants.insert("Zeta".to_string(), 1);
        constants.insert("Alpha".to_string(), 1);
        constants.insert("Other".to_string(), 2);
        let e = EnumDescriptor::new("_E", 4, "int", constants);
        assert_eq!(e.name_of(1), Some("Alpha"));
        assert_eq!(e.value("Other"), Some(2));
        assert_eq!(e.name_of(7), None);
    }
}
