//! Mapped-region enumeration (VAD tree on Windows, VMA chain on Linux).

use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::kernel::KernelSpace;
use crate::layout::{RegionContainer, RegionLayout};
use crate::objects::error::{ObjectError, ObjectResult};
use crate::objects::list::ListWalker;
use crate::objects::path::FieldPath;
use crate::objects::tree::TreeWalker;
use crate::objects::typed::TypedObject;
use crate::plugins::dump::{dump_region, RegionDump};
use crate::plugins::pslist::{walk_processes, ProcessFilter};
use crate::process::{derive_process_layer, ProcessLayer};
use serde::Serialize;
use std::io;
use tracing::{debug, warn};

/// Symbol holding the kernel's protection index → protection value table.
pub const PROTECT_TABLE_SYMBOL: &str = "MmProtectToValue";
const PROTECT_TABLE_LEN: usize = 32;

/// WinNT.h memory protection constants.
const WINNT_PROTECTIONS: &[(&str, u32)] = &[
    ("PAGE_NOACCESS", 0x01),
    ("PAGE_READONLY", 0x02),
    ("PAGE_READWRITE", 0x04),
    ("PAGE_WRITECOPY", 0x08),
    ("PAGE_EXECUTE", 0x10),
    ("PAGE_EXECUTE_READ", 0x20),
    ("PAGE_EXECUTE_READWRITE", 0x40),
    ("PAGE_EXECUTE_WRITECOPY", 0x80),
    ("PAGE_GUARD", 0x100),
    ("PAGE_NOCACHE", 0x200),
    ("PAGE_WRITECOMBINE", 0x400),
    ("PAGE_TARGETS_INVALID", 0x4000_0000),
];

/// A mapped range of a process address space. `end` is exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappedRegion {
    pub start: u64,
    pub end: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Address of the node describing the region.
    pub node_offset: u64,
    /// Raw protection bitfield, when the layout names one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protection: Option<u64>,
}

impl MappedRegion {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Last address inside the region.
    pub fn last(&self) -> u64 {
        self.end.saturating_sub(1).max(self.start)
    }
}

enum Nodes {
    Tree(TreeWalker),
    List(ListWalker),
    Empty,
}

/// Lazy region walk for one process, in container traversal order.
pub struct RegionWalk {
    nodes: Nodes,
    layout: RegionLayout,
    diagnostics: Diagnostics,
}

impl RegionWalk {
    pub fn truncated(&self) -> bool {
        match &self.nodes {
            Nodes::Tree(t) => t.truncated(),
            Nodes::List(l) => l.truncated(),
            Nodes::Empty => false,
        }
    }

    fn next_node(&mut self) -> Option<ObjectResult<TypedObject>> {
        match &mut self.nodes {
            Nodes::Tree(t) => t.next(),
            Nodes::List(l) => l.next(),
            Nodes::Empty => None,
        }
    }
}

impl Iterator for RegionWalk {
    type Item = ObjectResult<MappedRegion>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let node = match self.next_node()? {
                Ok(node) => node,
                Err(e) => return Some(Err(e)),
            };
            match read_region(&self.layout, &node) {
                Ok(region) => return Some(Ok(region)),
                Err(e) => self.diagnostics.record(
                    DiagnosticKind::RegionSkipped,
                    Some(node.offset()),
                    format!("cannot read region bounds: {}", e),
                ),
            }
        }
    }
}

fn read_vpn(node: &TypedObject, low: &FieldPath, high: Option<&FieldPath>) -> ObjectResult<u64> {
    let mut value = node.path_unsigned(low)?;
    if let Some(high) = high {
        value |= node.path_unsigned(high)? << 32;
    }
    Ok(value)
}

fn read_region(layout: &RegionLayout, node: &TypedObject) -> ObjectResult<MappedRegion> {
    let shift = layout.page_shift.unwrap_or(0);
    let start = read_vpn(node, &layout.start, layout.start_high.as_ref())? << shift;
    let mut end = read_vpn(node, &layout.end, layout.end_high.as_ref())?;
    if layout.end_inclusive {
        end = end.wrapping_add(1);
    }
    let end = end << shift;

    let protection = match &layout.protection {
        Some(path) => node.path_unsigned(path).ok(),
        None => None,
    };
    let path = match &layout.path {
        Some(text) => match text.read(node) {
            Ok(p) => Some(p),
            Err(ObjectError::NullPointer { .. }) => None,
            Err(e) => {
                debug!(node = %format_args!("{:#x}", node.offset()), error = %e, "region path unreadable");
                None
            }
        },
        None => None,
    };

    Ok(MappedRegion {
        start,
        end,
        path,
        node_offset: node.offset(),
        protection,
    })
}

/// Enumerate the mapped regions of `process`.
///
/// Region nodes are kernel structures and are read through the process
/// object's own layer. A process without a region container (a kernel
/// thread with no memory descriptor, an empty tree) yields nothing.
pub fn enumerate_mapped_regions(
    kernel: &KernelSpace,
    process: &TypedObject,
    diagnostics: &Diagnostics,
) -> ObjectResult<RegionWalk> {
    let layout = kernel.config().regions.clone();
    let catalog = kernel.catalog().clone();
    let layer = process.layer().clone();

    let nodes = match &layout.container {
        RegionContainer::Tree {
            root,
            node_type,
            node_field,
            left,
            right,
        } => match process.path_unsigned(root) {
            Ok(0) => Nodes::Empty,
            Ok(root) => Nodes::Tree(
                TreeWalker::new(catalog, layer, node_type, node_field.as_deref(), left, right, root)?
                    .max_nodes(kernel.config().max_tree_nodes)
                    .with_diagnostics(diagnostics.clone()),
            ),
            Err(e) if e.is_unavailable() => Nodes::Empty,
            Err(e) => return Err(e),
        },
        RegionContainer::List {
            first,
            node_type,
            next,
        } => match process.path_address(first) {
            Ok(slot) => Nodes::List(
                ListWalker::pointer_chain(catalog, layer, node_type, next, slot)?
                    .max_nodes(kernel.config().max_list_nodes)
                    .with_diagnostics(diagnostics.clone()),
            ),
            Err(e) if e.is_unavailable() => Nodes::Empty,
            Err(e) => return Err(e),
        },
    };

    Ok(RegionWalk {
        nodes,
        layout,
        diagnostics: diagnostics.clone(),
    })
}

/// Decodes raw protection indices through the kernel's protection table.
#[derive(Debug, Clone, Default)]
pub struct ProtectionTable {
    values: Vec<i32>,
}

impl ProtectionTable {
    /// Load the table from the kernel; empty when the symbol is absent or
    /// unreadable.
    pub fn load(kernel: &KernelSpace) -> Self {
        match kernel.symbol_ints(PROTECT_TABLE_SYMBOL, PROTECT_TABLE_LEN) {
            Ok(values) => ProtectionTable { values },
            Err(e) => {
                debug!(error = %e, "protection table unavailable");
                Self::default()
            }
        }
    }

    pub fn from_values(values: Vec<i32>) -> Self {
        ProtectionTable { values }
    }

    /// `PAGE_*` names joined with `|`, or `None` without a table entry.
    pub fn describe(&self, index: u64) -> Option<String> {
        let value = *self.values.get(usize::try_from(index).ok()?)? as u32;
        let names: Vec<&str> = WINNT_PROTECTIONS
            .iter()
            .filter(|(_, bit)| value & bit != 0)
            .map(|(name, _)| *name)
            .collect();
        Some(names.join("|"))
    }
}

/// One row of region listing output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionRow {
    pub pid: u64,
    pub process: String,
    #[serde(flatten)]
    pub region: MappedRegion,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protection_name: Option<String>,
    /// Dump file name when the region was extracted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dumped: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RegionOptions {
    pub filter: ProcessFilter,
    /// Keep only the region starting exactly at this address.
    pub address: Option<u64>,
}

/// Receives each region dump as it is produced.
pub type RegionSink<'s> = dyn FnMut(RegionDump<'_>) -> io::Result<()> + 's;

/// Hand one region to `sink`, returning the dump name on success.
fn dump_into(
    kernel: &KernelSpace,
    layer: &ProcessLayer,
    region: &MappedRegion,
    sink: &mut RegionSink<'_>,
    diagnostics: &Diagnostics,
) -> Option<String> {
    let limit = kernel.config().max_dump_region_size;
    if region.len() > limit {
        diagnostics.record(
            DiagnosticKind::RegionSkipped,
            Some(region.node_offset),
            format!(
                "region {:#x}-{:#x} spans {:#x} bytes, over the dump limit {:#x}",
                region.start,
                region.last(),
                region.len(),
                limit
            ),
        );
        return None;
    }
    let dump = dump_region(layer.layer().as_ref(), layer.pid(), region, kernel.config().dump_chunk_size);
    let name = dump.name().to_string();
    match sink(dump) {
        Ok(()) => Some(name),
        Err(e) => {
            warn!(pid = layer.pid(), start = %format_args!("{:#x}", region.start), error = %e, "region dump failed");
            None
        }
    }
}

/// List the regions of every selected process.
///
/// With a `sink`, each listed region is also dumped through it, one region
/// at a time. A process whose regions cannot be enumerated is recorded and
/// skipped.
pub fn vadinfo(
    kernel: &KernelSpace,
    options: &RegionOptions,
    diagnostics: &Diagnostics,
    mut sink: Option<&mut RegionSink<'_>>,
) -> ObjectResult<Vec<RegionRow>> {
    let table = ProtectionTable::load(kernel);
    let layout = &kernel.config().process;
    let mut rows = Vec::new();

    for process in walk_processes(kernel, options.filter.clone(), diagnostics)? {
        let Ok(process) = process else { break };
        let Ok(pid) = process.path_unsigned(&layout.pid) else { continue };
        let name = layout.name.read(&process).unwrap_or_default();
        let scope = diagnostics.scoped(format_args!("pid {}", pid));

        let regions = match enumerate_mapped_regions(kernel, &process, &scope) {
            Ok(regions) => regions,
            Err(e) => {
                scope.record(
                    DiagnosticKind::ProcessSkipped,
                    Some(process.offset()),
                    format!("cannot enumerate regions: {}", e),
                );
                continue;
            }
        };
        let process_layer = if sink.is_some() {
            derive_process_layer(kernel, &process, &scope).ok()
        } else {
            None
        };

        for region in regions {
            let Ok(region) = region else { break };
            if options.address.is_some_and(|a| a != region.start) {
                continue;
            }
            let dumped = match (&process_layer, sink.as_mut()) {
                (Some(layer), Some(sink)) => dump_into(kernel, layer, &region, &mut **sink, &scope),
                _ => None,
            };
            rows.push(RegionRow {
                pid,
                process: name.clone(),
                protection_name: region.protection.and_then(|p| table.describe(p)),
                region,
                dumped,
            });
        }
    }
    Ok(rows)
}
