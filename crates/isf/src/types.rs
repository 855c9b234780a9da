//! Serde model of an ISF document, exactly as it appears on disk.
//!
//! These types are only the wire shape; [`crate::parser`] resolves them into
//! the immutable descriptors of [`crate::descriptor`] once at load time.

use serde::Deserialize;
use std::collections::HashMap;

/// Top-level ISF document.
#[derive(Debug, Deserialize)]
pub(crate) struct RawIsf {
    pub metadata: Metadata,
    #[serde(default)]
    pub base_types: HashMap<String, RawBaseType>,
    #[serde(default)]
    pub user_types: HashMap<String, RawUserType>,
    #[serde(default)]
    pub symbols: HashMap<String, RawSymbol>,
    #[serde(default)]
    pub enums: HashMap<String, RawEnum>,
}

/// ISF metadata block.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Metadata {
    pub format: String,
    #[serde(default)]
    pub producer: Option<Producer>,
    #[serde(default)]
    pub windows: Option<WindowsMetadata>,
    #[serde(default)]
    pub linux: Option<BannerMetadata>,
    #[serde(default)]
    pub mac: Option<BannerMetadata>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Producer {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub datetime: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WindowsMetadata {
    #[serde(default)]
    pub major: Option<u32>,
    #[serde(default)]
    pub minor: Option<u32>,
    #[serde(default)]
    pub build: Option<u32>,
    #[serde(default)]
    pub pdb_file: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BannerMetadata {
    #[serde(default)]
    pub banner: Option<String>,
}

/// A primitive type definition (`base_types` table).
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawBaseType {
    pub size: usize,
    #[serde(default)]
    pub signed: bool,
    pub kind: String,
    #[serde(default = "default_endian")]
    pub endian: String,
}

fn default_endian() -> String {
    "little".to_string()
}

/// An aggregate definition (`user_types` table).
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawUserType {
    pub size: usize,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub fields: HashMap<String, RawField>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawField {
    pub offset: usize,
    #[serde(rename = "type")]
    pub type_ref: RawTypeRef,
}

/// A (possibly nested) reference to a type, as used by fields and symbols.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawTypeRef {
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Pointer target or array element.
    #[serde(default)]
    pub subtype: Option<Box<RawTypeRef>>,
    #[serde(default)]
    pub count: Option<usize>,
    #[serde(default)]
    pub bit_position: Option<u32>,
    #[serde(default)]
    pub bit_length: Option<u32>,
    /// Storage type of a bitfield.
    #[serde(default, rename = "type")]
    pub inner: Option<Box<RawTypeRef>>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawSymbol {
    pub address: u64,
    #[serde(default, rename = "type")]
    pub type_ref: Option<RawTypeRef>,
    #[serde(default)]
    pub constant_data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawEnum {
    pub size: usize,
    pub base: String,
    pub constants: HashMap<String, i64>,
}
