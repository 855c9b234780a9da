//! Find mapped regions that start with an ELF header.

use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::kernel::KernelSpace;
use crate::memory::traits::MemoryLayer;
use crate::objects::error::ObjectResult;
use crate::plugins::pslist::{walk_processes, ProcessFilter};
use crate::plugins::regions::enumerate_mapped_regions;
use crate::process::derive_process_layer;
use serde::Serialize;
use tracing::debug;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Signature {
    Elf,
}

impl Signature {
    pub fn magic(self) -> &'static [u8] {
        match self {
            Signature::Elf => &ELF_MAGIC,
        }
    }
}

/// Match the leading bytes of a region. A short buffer never matches.
pub fn classify(bytes: &[u8]) -> Option<Signature> {
    [Signature::Elf]
        .into_iter()
        .find(|sig| bytes.starts_with(sig.magic()))
}

/// Classify the region starting at `start`. Unreadable bytes read as zero.
pub fn classify_region(layer: &dyn MemoryLayer, start: u64) -> ObjectResult<Option<Signature>> {
    let head = layer.read(start, ELF_MAGIC.len(), true)?;
    Ok(classify(&head))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ElfRow {
    pub pid: u64,
    pub process: String,
    pub start: u64,
    pub end: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Every mapped region of the selected processes that begins with an ELF
/// header. A process whose layer or regions cannot be read is skipped.
pub fn mapped_elfs(
    kernel: &KernelSpace,
    filter: ProcessFilter,
    diagnostics: &Diagnostics,
) -> ObjectResult<Vec<ElfRow>> {
    let layout = &kernel.config().process;
    let mut rows = Vec::new();

    for process in walk_processes(kernel, filter, diagnostics)? {
        let Ok(process) = process else { break };
        let Ok(pid) = process.path_unsigned(&layout.pid) else { continue };
        let name = layout.name.read(&process).unwrap_or_default();
        let scope = diagnostics.scoped(format_args!("pid {}", pid));

        let layer = match derive_process_layer(kernel, &process, &scope) {
            Ok(layer) => layer,
            Err(e) => {
                debug!(pid, error = %e, "no address space, skipping");
                continue;
            }
        };
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

        for region in regions {
            let Ok(region) = region else { break };
            match classify_region(layer.layer().as_ref(), region.start) {
                Ok(Some(Signature::Elf)) => rows.push(ElfRow {
                    pid,
                    process: name.clone(),
                    start: region.start,
                    end: region.end,
                    path: region.path,
                }),
                Ok(None) => {}
                Err(e) => debug!(pid, start = %format_args!("{:#x}", region.start), error = %e, "region head unreadable"),
            }
        }
    }
    Ok(rows)
}
