//! Synthetic captures for tests: a small ISF catalog, a page-table builder
//! and a kernel image builder that lays out processes the way the catalog
//! describes them.

use crate::config::Config;
use crate::kernel::KernelSpace;
use crate::memory::layers::BufferLayer;
use crate::memory::traits::MemoryLayer;
use crate::memory::translators::ArchProfile;
use isf::{parse_isf_str, Catalog};
use std::collections::HashMap;
use std::sync::Arc;

pub const KERNEL_BASE: u64 = 0xFFFF_F800_0000_0000;
/// Physical address backing `KERNEL_BASE`.
const KERNEL_PHYS: u64 = 0x1_0000;
const KERNEL_SPAN: u64 = 0x8_0000;
/// Physical pages handed out for user mappings.
const USER_PHYS: u64 = 0x9_0000;
/// Page tables are allocated from here up.
const TABLE_AREA: u64 = 0x10_0000;

pub const PS_ACTIVE_PROCESS_HEAD: u64 = 0x1000;
pub const MM_PROTECT_TO_VALUE: u64 = 0x2000;
pub const INIT_TASK: u64 = 0x3000;

pub const TEST_ISF: &str = r#"{
    "metadata": {
        "format": "6.2.0",
        "producer": { "name": "synthetic", "version": "1" },
        "windows": { "major": 10, "minor": 0, "build": 19041, "pdb_file": "ntkrnlmp.pdb" }
    },
    "base_types": {
        "pointer": { "size": 8, "signed": false, "kind": "int", "endian": "little" },
        "char": { "size": 1, "signed": true, "kind": "char", "endian": "little" },
        "unsigned char": { "size": 1, "signed": false, "kind": "char", "endian": "little" },
        "unsigned short": { "size": 2, "signed": false, "kind": "int", "endian": "little" },
        "int": { "size": 4, "signed": true, "kind": "int", "endian": "little" },
        "unsigned int": { "size": 4, "signed": false, "kind": "int", "endian": "little" },
        "long": { "size": 4, "signed": true, "kind": "int", "endian": "little" },
        "unsigned long": { "size": 4, "signed": false, "kind": "int", "endian": "little" },
        "long long": { "size": 8, "signed": true, "kind": "int", "endian": "little" },
        "unsigned long long": { "size": 8, "signed": false, "kind": "int", "endian": "little" },
        "void": { "size": 0, "signed": false, "kind": "void", "endian": "little" }
    },
    "user_types": {
        "_LIST_ENTRY": { "kind": "struct", "size": 16, "fields": {
            "Flink": { "offset": 0, "type": { "kind": "pointer", "subtype": { "kind": "struct", "name": "_LIST_ENTRY" } } },
            "Blink": { "offset": 8, "type": { "kind": "pointer", "subtype": { "kind": "struct", "name": "_LIST_ENTRY" } } }
        } },
        "_LARGE_INTEGER": { "kind": "union", "size": 8, "fields": {
            "QuadPart": { "offset": 0, "type": { "kind": "base", "name": "long long" } },
            "LowPart": { "offset": 0, "type": { "kind": "base", "name": "unsigned long" } }
        } },
        "_KPROCESS": { "kind": "struct", "size": 64, "fields": {
            "DirectoryTableBase": { "offset": 40, "type": { "kind": "base", "name": "unsigned long long" } }
        } },
        "_EPROCESS": { "kind": "struct", "size": 176, "fields": {
            "Pcb": { "offset": 0, "type": { "kind": "struct", "name": "_KPROCESS" } },
            "UniqueProcessId": { "offset": 64, "type": { "kind": "pointer", "subtype": { "kind": "base", "name": "void" } } },
            "ActiveProcessLinks": { "offset": 72, "type": { "kind": "struct", "name": "_LIST_ENTRY" } },
            "CreateTime": { "offset": 88, "type": { "kind": "union", "name": "_LARGE_INTEGER" } },
            "ExitTime": { "offset": 96, "type": { "kind": "union", "name": "_LARGE_INTEGER" } },
            "InheritedFromUniqueProcessId": { "offset": 104, "type": { "kind": "pointer", "subtype": { "kind": "base", "name": "void" } } },
            "ObjectTable": { "offset": 112, "type": { "kind": "pointer", "subtype": { "kind": "struct", "name": "_HANDLE_TABLE" } } },
            "Session": { "offset": 120, "type": { "kind": "pointer", "subtype": { "kind": "base", "name": "void" } } },
            "Peb": { "offset": 128, "type": { "kind": "pointer", "subtype": { "kind": "struct", "name": "_PEB" } } },
            "Wow64Process": { "offset": 136, "type": { "kind": "pointer", "subtype": { "kind": "base", "name": "void" } } },
            "ImageFileName": { "offset": 144, "type": { "kind": "array", "count": 15, "subtype": { "kind": "base", "name": "unsigned char" } } },
            "VadRoot": { "offset": 160, "type": { "kind": "struct", "name": "_RTL_AVL_TREE" } },
            "ActiveThreads": { "offset": 168, "type": { "kind": "base", "name": "unsigned long" } }
        } },
        "_HANDLE_TABLE": { "kind": "struct", "size": 48, "fields": {
            "HandleCount": { "offset": 32, "type": { "kind": "base", "name": "long" } }
        } },
        "_MM_SESSION_SPACE": { "kind": "struct", "size": 16, "fields": {
            "SessionId": { "offset": 8, "type": { "kind": "base", "name": "unsigned long" } }
        } },
        "_RTL_AVL_TREE": { "kind": "struct", "size": 8, "fields": {
            "Root": { "offset": 0, "type": { "kind": "pointer", "subtype": { "kind": "struct", "name": "_RTL_BALANCED_NODE" } } }
        } },
        "_RTL_BALANCED_NODE": { "kind": "struct", "size": 24, "fields": {
            "Left": { "offset": 0, "type": { "kind": "pointer", "subtype": { "kind": "struct", "name": "_RTL_BALANCED_NODE" } } },
            "Right": { "offset": 8, "type": { "kind": "pointer", "subtype": { "kind": "struct", "name": "_RTL_BALANCED_NODE" } } },
            "ParentValue": { "offset": 16, "type": { "kind": "base", "name": "unsigned long long" } }
        } },
        "_MMVAD_SHORT": { "kind": "struct", "size": 64, "fields": {
            "VadNode": { "offset": 0, "type": { "kind": "struct", "name": "_RTL_BALANCED_NODE" } },
            "StartingVpn": { "offset": 24, "type": { "kind": "base", "name": "unsigned long" } },
            "EndingVpn": { "offset": 28, "type": { "kind": "base", "name": "unsigned long" } },
            "StartingVpnHigh": { "offset": 32, "type": { "kind": "base", "name": "unsigned char" } },
            "EndingVpnHigh": { "offset": 33, "type": { "kind": "base", "name": "unsigned char" } },
            "u": { "offset": 48, "type": { "kind": "union", "name": "_MMVAD_SHORT_U" } }
        } },
        "_MMVAD_SHORT_U": { "kind": "union", "size": 4, "fields": {
            "LongFlags": { "offset": 0, "type": { "kind": "base", "name": "unsigned long" } },
            "VadFlags": { "offset": 0, "type": { "kind": "struct", "name": "_MMVAD_FLAGS" } }
        } },
        "_MMVAD_FLAGS": { "kind": "struct", "size": 4, "fields": {
            "VadType": { "offset": 0, "type": { "kind": "bitfield", "bit_position": 4, "bit_length": 3, "type": { "kind": "base", "name": "unsigned long" } } },
            "Protection": { "offset": 0, "type": { "kind": "bitfield", "bit_position": 7, "bit_length": 5, "type": { "kind": "base", "name": "unsigned long" } } },
            "PrivateMemory": { "offset": 0, "type": { "kind": "bitfield", "bit_position": 15, "bit_length": 1, "type": { "kind": "base", "name": "unsigned long" } } }
        } },
        "_PEB": { "kind": "struct", "size": 32, "fields": {
            "ImageBaseAddress": { "offset": 16, "type": { "kind": "pointer", "subtype": { "kind": "base", "name": "void" } } }
        } },
        "_IMAGE_DOS_HEADER": { "kind": "struct", "size": 64, "fields": {
            "e_magic": { "offset": 0, "type": { "kind": "base", "name": "unsigned short" } },
            "e_lfanew": { "offset": 60, "type": { "kind": "base", "name": "long" } }
        } },
        "_IMAGE_NT_HEADERS64": { "kind": "struct", "size": 264, "fields": {
            "Signature": { "offset": 0, "type": { "kind": "base", "name": "unsigned long" } },
            "FileHeader": { "offset": 4, "type": { "kind": "struct", "name": "_IMAGE_FILE_HEADER" } },
            "OptionalHeader": { "offset": 24, "type": { "kind": "struct", "name": "_IMAGE_OPTIONAL_HEADER64" } }
        } },
        "_IMAGE_FILE_HEADER": { "kind": "struct", "size": 20, "fields": {
            "Machine": { "offset": 0, "type": { "kind": "base", "name": "unsigned short" } },
            "NumberOfSections": { "offset": 2, "type": { "kind": "base", "name": "unsigned short" } },
            "SizeOfOptionalHeader": { "offset": 16, "type": { "kind": "base", "name": "unsigned short" } }
        } },
        "_IMAGE_OPTIONAL_HEADER64": { "kind": "struct", "size": 240, "fields": {
            "Magic": { "offset": 0, "type": { "kind": "base", "name": "unsigned short" } },
            "ImageBase": { "offset": 24, "type": { "kind": "base", "name": "unsigned long long" } },
            "SectionAlignment": { "offset": 32, "type": { "kind": "base", "name": "unsigned long" } },
            "FileAlignment": { "offset": 36, "type": { "kind": "base", "name": "unsigned long" } },
            "SizeOfImage": { "offset": 56, "type": { "kind": "base", "name": "unsigned long" } },
            "SizeOfHeaders": { "offset": 60, "type": { "kind": "base", "name": "unsigned long" } }
        } },
        "_IMAGE_SECTION_HEADER": { "kind": "struct", "size": 40, "fields": {
            "Name": { "offset": 0, "type": { "kind": "array", "count": 8, "subtype": { "kind": "base", "name": "unsigned char" } } },
            "VirtualSize": { "offset": 8, "type": { "kind": "base", "name": "unsigned long" } },
            "VirtualAddress": { "offset": 12, "type": { "kind": "base", "name": "unsigned long" } },
            "SizeOfRawData": { "offset": 16, "type": { "kind": "base", "name": "unsigned long" } },
            "PointerToRawData": { "offset": 20, "type": { "kind": "base", "name": "unsigned long" } },
            "Characteristics": { "offset": 36, "type": { "kind": "base", "name": "unsigned long" } }
        } },
        "list_head": { "kind": "struct", "size": 16, "fields": {
            "next": { "offset": 0, "type": { "kind": "pointer", "subtype": { "kind": "struct", "name": "list_head" } } },
            "prev": { "offset": 8, "type": { "kind": "pointer", "subtype": { "kind": "struct", "name": "list_head" } } }
        } },
        "task_struct": { "kind": "struct", "size": 128, "fields": {
            "tasks": { "offset": 16, "type": { "kind": "struct", "name": "list_head" } },
            "mm": { "offset": 32, "type": { "kind": "pointer", "subtype": { "kind": "struct", "name": "mm_struct" } } },
            "tgid": { "offset": 40, "type": { "kind": "base", "name": "int" } },
            "pid": { "offset": 44, "type": { "kind": "base", "name": "int" } },
            "real_parent": { "offset": 48, "type": { "kind": "pointer", "subtype": { "kind": "struct", "name": "task_struct" } } },
            "comm": { "offset": 56, "type": { "kind": "array", "count": 16, "subtype": { "kind": "base", "name": "char" } } },
            "signal": { "offset": 72, "type": { "kind": "pointer", "subtype": { "kind": "struct", "name": "signal_struct" } } }
        } },
        "signal_struct": { "kind": "struct", "size": 16, "fields": {
            "nr_threads": { "offset": 4, "type": { "kind": "base", "name": "int" } }
        } },
        "mm_struct": { "kind": "struct", "size": 64, "fields": {
            "mmap": { "offset": 0, "type": { "kind": "pointer", "subtype": { "kind": "struct", "name": "vm_area_struct" } } },
            "pgd": { "offset": 8, "type": { "kind": "pointer", "subtype": { "kind": "base", "name": "void" } } }
        } },
        "vm_area_struct": { "kind": "struct", "size": 64, "fields": {
            "vm_start": { "offset": 0, "type": { "kind": "base", "name": "unsigned long long" } },
            "vm_end": { "offset": 8, "type": { "kind": "base", "name": "unsigned long long" } },
            "vm_next": { "offset": 16, "type": { "kind": "pointer", "subtype": { "kind": "struct", "name": "vm_area_struct" } } },
            "vm_file": { "offset": 24, "type": { "kind": "pointer", "subtype": { "kind": "struct", "name": "file" } } },
            "vm_flags": { "offset": 32, "type": { "kind": "base", "name": "unsigned long long" } }
        } },
        "file": { "kind": "struct", "size": 32, "fields": {
            "f_path": { "offset": 0, "type": { "kind": "struct", "name": "path" } }
        } },
        "path": { "kind": "struct", "size": 16, "fields": {
            "mnt": { "offset": 0, "type": { "kind": "pointer", "subtype": { "kind": "base", "name": "void" } } },
            "dentry": { "offset": 8, "type": { "kind": "pointer", "subtype": { "kind": "struct", "name": "dentry" } } }
        } },
        "dentry": { "kind": "struct", "size": 64, "fields": {
            "d_name": { "offset": 32, "type": { "kind": "struct", "name": "qstr" } }
        } },
        "qstr": { "kind": "struct", "size": 16, "fields": {
            "hash": { "offset": 0, "type": { "kind": "base", "name": "unsigned int" } },
            "len": { "offset": 4, "type": { "kind": "base", "name": "unsigned int" } },
            "name": { "offset": 8, "type": { "kind": "pointer", "subtype": { "kind": "base", "name": "unsigned char" } } }
        } }
    },
    "symbols": {
        "PsActiveProcessHead": { "address": 4096, "type": { "kind": "struct", "name": "_LIST_ENTRY" } },
        "MmProtectToValue": { "address": 8192 },
        "init_task": { "address": 12288, "type": { "kind": "struct", "name": "task_struct" } }
    },
    "enums": {}
}"#;

pub fn catalog() -> Arc<Catalog> {
    Arc::new(parse_isf_str(TEST_ISF).unwrap())
}

/// Builds page tables for any [`ArchProfile`] inside a growing physical
/// buffer. Present entries are written with the present and writable bits.
pub struct PageTableBuilder {
    profile: ArchProfile,
    phys: BufferLayer,
    root: u64,
    next_table: u64,
    children: HashMap<(u64, usize), u64>,
}

impl PageTableBuilder {
    pub fn new(profile: ArchProfile) -> Self {
        let mut builder = PageTableBuilder {
            profile,
            phys: BufferLayer::zeroed("physical", 0),
            root: 0,
            next_table: TABLE_AREA,
            children: HashMap::new(),
        };
        builder.root = builder.add_root();
        builder
    }

    /// Allocate an empty root table for another address space.
    pub fn add_root(&mut self) -> u64 {
        let table = self.next_table;
        self.next_table += 0x1000;
        self.phys.write(table as usize, &[0u8; 0x1000]);
        table
    }

    fn write_entry(&mut self, table: u64, index: usize, value: u64) {
        let at = table as usize + index * self.profile.entry_size;
        if self.profile.entry_size == 4 {
            self.phys.write_u32(at, value as u32);
        } else {
            self.phys.write_u64(at, value);
        }
    }

    fn index(&self, vaddr: u64, level: usize) -> usize {
        let lower: u32 = self.profile.levels[level + 1..].iter().map(|l| l.bits).sum();
        let shift = self.profile.page_shift + lower;
        let bits = self.profile.levels[level].bits;
        ((vaddr >> shift) & ((1u64 << bits) - 1)) as usize
    }

    /// The table at `depth` covering `vaddr`, creating intermediate tables.
    fn table_for(&mut self, root: u64, vaddr: u64, depth: usize) -> u64 {
        let mut table = root;
        for level in 0..depth {
            let idx = self.index(vaddr, level);
            table = match self.children.get(&(table, idx)) {
                Some(&child) => child,
                None => {
                    let child = self.add_root();
                    self.write_entry(table, idx, child | 0x3);
                    self.children.insert((table, idx), child);
                    child
                }
            };
        }
        table
    }

    pub fn map_in(&mut self, root: u64, vaddr: u64, paddr: u64) {
        let last = self.profile.levels.len() - 1;
        let table = self.table_for(root, vaddr, last);
        let idx = self.index(vaddr, last);
        self.write_entry(table, idx, (paddr & !0xFFF) | 0x3);
    }

    pub fn map(&mut self, vaddr: u64, paddr: u64) {
        self.map_in(self.root, vaddr, paddr);
    }

    /// Map a large page terminating the walk at `level`.
    pub fn map_large(&mut self, vaddr: u64, paddr: u64, level: usize) {
        let table = self.table_for(self.root, vaddr, level);
        let idx = self.index(vaddr, level);
        self.write_entry(table, idx, paddr | 0x83);
    }

    /// Write a not-present entry for `vaddr`.
    pub fn unmap(&mut self, vaddr: u64) {
        let last = self.profile.levels.len() - 1;
        let table = self.table_for(self.root, vaddr, last);
        let idx = self.index(vaddr, last);
        self.write_entry(table, idx, 0);
    }

    pub fn write(&mut self, paddr: u64, bytes: &[u8]) {
        self.phys.write(paddr as usize, bytes);
    }

    pub fn finish(self) -> (Arc<dyn MemoryLayer>, u64) {
        (Arc::new(self.phys), self.root)
    }
}

/// A fake process record for [`SyntheticKernel::add_eprocess`].
#[derive(Debug, Clone, Default)]
pub struct FakeProcess {
    pub pid: u64,
    pub ppid: u64,
    pub name: &'static str,
    pub dtb: u64,
    pub threads: u32,
    pub create_time: i64,
    pub exit_time: i64,
    pub handle_count: Option<i32>,
    pub session_id: Option<u32>,
    pub wow64: bool,
    pub peb: u64,
    pub vad_root: u64,
}

/// An x86-64 kernel address space over a synthetic capture.
///
/// Kernel virtual addresses from `KERNEL_BASE` are mapped linearly; user
/// pages get fresh physical frames per mapping.
pub struct SyntheticKernel {
    pub pages: PageTableBuilder,
    next_kernel: u64,
    next_user_phys: u64,
}

impl SyntheticKernel {
    pub fn new() -> Self {
        let mut pages = PageTableBuilder::new(ArchProfile::intel64());
        for off in (0..KERNEL_SPAN).step_by(0x1000) {
            pages.map(KERNEL_BASE + off, KERNEL_PHYS + off);
        }
        SyntheticKernel {
            pages,
            next_kernel: KERNEL_BASE + 0x4000,
            next_user_phys: USER_PHYS,
        }
    }

    pub fn symbol(&self, relative: u64) -> u64 {
        KERNEL_BASE + relative
    }

    pub fn phys_of(&self, va: u64) -> u64 {
        va - KERNEL_BASE + KERNEL_PHYS
    }

    /// Bump-allocate kernel memory, 16-byte aligned.
    pub fn alloc(&mut self, size: u64) -> u64 {
        let va = self.next_kernel;
        self.next_kernel += (size + 15) & !15;
        assert!(self.next_kernel < KERNEL_BASE + KERNEL_SPAN, "kernel arena exhausted");
        va
    }

    pub fn write(&mut self, va: u64, bytes: &[u8]) {
        let pa = self.phys_of(va);
        self.pages.write(pa, bytes);
    }

    pub fn write_u64(&mut self, va: u64, value: u64) {
        self.write(va, &value.to_le_bytes());
    }

    pub fn write_u32(&mut self, va: u64, value: u32) {
        self.write(va, &value.to_le_bytes());
    }

    /// A new, empty user address space; returns its root.
    pub fn new_address_space(&mut self) -> u64 {
        self.pages.add_root()
    }

    /// Map `bytes` at user address `va` (page-aligned) in `root`.
    pub fn map_user(&mut self, root: u64, va: u64, bytes: &[u8]) {
        let pages = (bytes.len() as u64 + 0xFFF) / 0x1000;
        for i in 0..pages.max(1) {
            let pa = self.next_user_phys;
            self.next_user_phys += 0x1000;
            assert!(self.next_user_phys <= TABLE_AREA, "user arena exhausted");
            self.pages.map_in(root, va + i * 0x1000, pa);
            let start = (i * 0x1000) as usize;
            let end = (start + 0x1000).min(bytes.len());
            if start < end {
                self.pages.write(pa, &bytes[start..end]);
            } else {
                self.pages.write(pa, &[0u8; 0x1000]);
            }
        }
    }

    /// Link `nodes` (addresses of link entries) behind `head` as a circular
    /// doubly-linked list.
    pub fn link_list(&mut self, head: u64, nodes: &[u64]) {
        let mut ring = vec![head];
        ring.extend_from_slice(nodes);
        for (i, &node) in ring.iter().enumerate() {
            let next = ring[(i + 1) % ring.len()];
            let prev = ring[(i + ring.len() - 1) % ring.len()];
            self.write_u64(node, next);
            self.write_u64(node + 8, prev);
        }
    }

    /// Write an `_EPROCESS`; returns its address.
    pub fn add_eprocess(&mut self, p: &FakeProcess) -> u64 {
        let ep = self.alloc(176);
        self.write_u64(ep + 40, p.dtb);
        self.write_u64(ep + 64, p.pid);
        self.write_u64(ep + 88, p.create_time as u64);
        self.write_u64(ep + 96, p.exit_time as u64);
        self.write_u64(ep + 104, p.ppid);
        if let Some(count) = p.handle_count {
            let table = self.alloc(48);
            self.write_u32(table + 32, count as u32);
            self.write_u64(ep + 112, table);
        }
        if let Some(id) = p.session_id {
            let session = self.alloc(16);
            self.write_u32(session + 8, id);
            self.write_u64(ep + 120, session);
        }
        self.write_u64(ep + 128, p.peb);
        self.write_u64(ep + 136, if p.wow64 { 0x7FFE_0000 } else { 0 });
        let mut name = [0u8; 15];
        let len = p.name.len().min(15);
        name[..len].copy_from_slice(&p.name.as_bytes()[..len]);
        self.write(ep + 144, &name);
        self.write_u64(ep + 160, p.vad_root);
        self.write_u32(ep + 168, p.threads);
        ep
    }

    /// Write an `_MMVAD_SHORT` covering `[start, end]` (inclusive end).
    pub fn add_vad(&mut self, start: u64, end: u64, protection: u32, left: u64, right: u64) -> u64 {
        let vad = self.alloc(64);
        self.write_u64(vad, left);
        self.write_u64(vad + 8, right);
        let start_vpn = start >> 12;
        let end_vpn = end >> 12;
        self.write_u32(vad + 24, start_vpn as u32);
        self.write_u32(vad + 28, end_vpn as u32);
        self.write(vad + 32, &[(start_vpn >> 32) as u8, (end_vpn >> 32) as u8]);
        self.write_u32(vad + 48, (protection & 0x1F) << 7);
        vad
    }

    pub fn finish(self) -> (Arc<dyn MemoryLayer>, u64) {
        self.pages.finish()
    }

    pub fn into_kernel(self, config: Config) -> KernelSpace {
        let (physical, root) = self.finish();
        KernelSpace::new(physical, catalog(), root, KERNEL_BASE, ArchProfile::intel64(), config).unwrap()
    }
}
