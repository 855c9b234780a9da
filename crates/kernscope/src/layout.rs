//! OS structure layouts supplied as data.
//!
//! Nothing in the traversal code knows Windows or Linux field names; the
//! names live here, in presets or in a user-supplied JSON config.

use crate::objects::error::ObjectResult;
use crate::objects::path::FieldPath;
use crate::objects::strings::{Encoding, OnDecodeError};
use crate::objects::typed::TypedObject;
use serde::{Deserialize, Serialize};

/// Encoding of process timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeFormat {
    /// 100ns intervals since 1601-01-01.
    #[default]
    Filetime,
    UnixSeconds,
}

/// Where a string lives and how to decode it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringSpec {
    pub path: FieldPath,
    pub max_length: usize,
    #[serde(default)]
    pub encoding: Encoding,
    /// The last step is a pointer to the text rather than an inline array.
    #[serde(default)]
    pub pointed: bool,
}

impl StringSpec {
    pub fn inline(path: FieldPath, max_length: usize) -> Self {
        StringSpec {
            path,
            max_length,
            encoding: Encoding::Ascii,
            pointed: false,
        }
    }

    pub fn pointed(path: FieldPath, max_length: usize) -> Self {
        StringSpec {
            path,
            max_length,
            encoding: Encoding::Utf8,
            pointed: true,
        }
    }

    /// Read the string from `object`, replacing undecodable bytes.
    pub fn read(&self, object: &TypedObject) -> ObjectResult<String> {
        let (target, field) = object.path_target(&self.path)?;
        if self.pointed {
            target.pointed_string(field, self.max_length, self.encoding, OnDecodeError::Replace)
        } else {
            target.array_to_string(field, self.max_length, self.encoding, OnDecodeError::Replace)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessLayout {
    /// Process structure type.
    pub type_name: String,
    /// Symbol anchoring the process list.
    pub list_head: String,
    /// When the anchor symbol is itself a process structure, the link field
    /// inside it that serves as the list head.
    #[serde(default)]
    pub head_field: Option<String>,
    /// Embedded list link inside each process structure.
    pub link_field: String,
    pub pid: FieldPath,
    pub ppid: FieldPath,
    pub name: StringSpec,
    #[serde(default)]
    pub threads: Option<FieldPath>,
    #[serde(default)]
    pub handles: Option<FieldPath>,
    #[serde(default)]
    pub session_id: Option<FieldPath>,
    #[serde(default)]
    pub wow64: Option<FieldPath>,
    #[serde(default)]
    pub create_time: Option<FieldPath>,
    #[serde(default)]
    pub exit_time: Option<FieldPath>,
    #[serde(default)]
    pub time_format: TimeFormat,
    /// Page-table root of the process address space.
    pub dtb: FieldPath,
    /// The root is a kernel virtual address and must be translated first.
    #[serde(default)]
    pub dtb_is_virtual: bool,
    /// Pointer to the per-process environment block. The block lives in the
    /// process address space.
    #[serde(default)]
    pub environment: Option<FieldPath>,
    /// Image base of the main executable, relative to the environment block.
    #[serde(default)]
    pub image_base: Option<FieldPath>,
}

impl ProcessLayout {
    pub fn windows() -> Self {
        ProcessLayout {
            type_name: "_EPROCESS".to_string(),
            list_head: "PsActiveProcessHead".to_string(),
            head_field: None,
            link_field: "ActiveProcessLinks".to_string(),
            pid: FieldPath::member("UniqueProcessId"),
            ppid: FieldPath::member("InheritedFromUniqueProcessId"),
            name: StringSpec::inline(FieldPath::member("ImageFileName"), 15),
            threads: Some(FieldPath::member("ActiveThreads")),
            handles: Some(FieldPath::member("ObjectTable").then_deref(None, "HandleCount")),
            session_id: Some(
                FieldPath::member("Session").then_deref(Some("_MM_SESSION_SPACE"), "SessionId"),
            ),
            wow64: Some(FieldPath::member("Wow64Process")),
            create_time: Some(FieldPath::member("CreateTime").then("QuadPart")),
            exit_time: Some(FieldPath::member("ExitTime").then("QuadPart")),
            time_format: TimeFormat::Filetime,
            dtb: FieldPath::member("Pcb").then("DirectoryTableBase"),
            dtb_is_virtual: false,
            environment: Some(FieldPath::member("Peb")),
            image_base: Some(FieldPath::member("ImageBaseAddress")),
        }
    }

    pub fn linux() -> Self {
        ProcessLayout {
            type_name: "task_struct".to_string(),
            list_head: "init_task".to_string(),
            head_field: Some("tasks".to_string()),
            link_field: "tasks".to_string(),
            pid: FieldPath::member("tgid"),
            ppid: FieldPath::member("real_parent").then_deref(None, "tgid"),
            name: StringSpec::inline(FieldPath::member("comm"), 16),
            threads: Some(FieldPath::member("signal").then_deref(None, "nr_threads")),
            handles: None,
            session_id: None,
            wow64: None,
            create_time: None,
            exit_time: None,
            time_format: TimeFormat::UnixSeconds,
            dtb: FieldPath::member("mm").then_deref(None, "pgd"),
            dtb_is_virtual: true,
            environment: None,
            image_base: None,
        }
    }
}

/// How a process's mapped regions are chained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegionContainer {
    /// A binary tree; `root` reads the address of the first node link.
    Tree {
        root: FieldPath,
        node_type: String,
        #[serde(default)]
        node_field: Option<String>,
        left: String,
        right: String,
    },
    /// A null-terminated chain; `first` names the pointer to the first node.
    List {
        first: FieldPath,
        node_type: String,
        next: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionLayout {
    pub container: RegionContainer,
    pub start: FieldPath,
    pub end: FieldPath,
    /// Upper bits of the start, stored separately.
    #[serde(default)]
    pub start_high: Option<FieldPath>,
    #[serde(default)]
    pub end_high: Option<FieldPath>,
    /// Start and end are page numbers shifted by this amount.
    #[serde(default)]
    pub page_shift: Option<u32>,
    /// The end names the last page (or byte) inside the region.
    #[serde(default)]
    pub end_inclusive: bool,
    #[serde(default)]
    pub protection: Option<FieldPath>,
    #[serde(default)]
    pub path: Option<StringSpec>,
}

impl RegionLayout {
    pub fn windows() -> Self {
        RegionLayout {
            container: RegionContainer::Tree {
                root: FieldPath::member("VadRoot").then("Root"),
                node_type: "_MMVAD_SHORT".to_string(),
                node_field: Some("VadNode".to_string()),
                left: "Left".to_string(),
                right: "Right".to_string(),
            },
            start: FieldPath::member("StartingVpn"),
            end: FieldPath::member("EndingVpn"),
            start_high: Some(FieldPath::member("StartingVpnHigh")),
            end_high: Some(FieldPath::member("EndingVpnHigh")),
            page_shift: Some(12),
            end_inclusive: true,
            protection: Some(FieldPath::member("u").then("VadFlags").then("Protection")),
            path: None,
        }
    }

    pub fn linux() -> Self {
        RegionLayout {
            container: RegionContainer::List {
                first: FieldPath::member("mm").then_deref(None, "mmap"),
                node_type: "vm_area_struct".to_string(),
                next: "vm_next".to_string(),
            },
            start: FieldPath::member("vm_start"),
            end: FieldPath::member("vm_end"),
            start_high: None,
            end_high: None,
            page_shift: None,
            end_inclusive: false,
            protection: None,
            path: Some(StringSpec::pointed(
                FieldPath::member("vm_file")
                    .then_deref(None, "f_path")
                    .then("dentry")
                    .then_deref(None, "d_name")
                    .then("name"),
                255,
            )),
        }
    }
}

/// Executable image header types used for process dumps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageLayout {
    pub dos_header: String,
    pub nt_headers: String,
    pub section_header: String,
}

impl ImageLayout {
    pub fn pe64() -> Self {
        ImageLayout {
            dos_header: "_IMAGE_DOS_HEADER".to_string(),
            nt_headers: "_IMAGE_NT_HEADERS64".to_string(),
            section_header: "_IMAGE_SECTION_HEADER".to_string(),
        }
    }
}
