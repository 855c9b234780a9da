//! Dump artifacts: executable image reconstruction and raw region dumps.
//!
//! Nothing here opens files. An image dump is a [`DumpArtifact`], a name plus
//! ordered `(offset, bytes)` writes that the caller places into a file. A
//! region dump is a [`RegionDump`] that reads its writes as they are pulled.

use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::kernel::KernelSpace;
use crate::layout::ImageLayout;
use crate::memory::traits::MemoryLayer;
use crate::objects::error::{ObjectError, ObjectResult};
use crate::objects::strings::{Encoding, OnDecodeError};
use crate::objects::typed::TypedObject;
use crate::plugins::regions::MappedRegion;
use crate::process::derive_process_layer;
use isf::Catalog;
use rayon::prelude::*;
use serde::Serialize;
use std::io::{self, Seek, SeekFrom, Write};
use std::sync::Arc;
use tracing::{debug, warn};

const DOS_SIGNATURE: u64 = 0x5A4D;
const NT_SIGNATURE: u64 = 0x4550;
/// The PE loader refuses images with more sections than this.
const MAX_SECTIONS: u64 = 96;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpWrite {
    pub offset: u64,
    pub data: Vec<u8>,
}

/// A named blob assembled from sparse writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpArtifact {
    pub name: String,
    pub writes: Vec<DumpWrite>,
    /// Parts that could not be read and were left out.
    pub omitted: Vec<String>,
}

impl DumpArtifact {
    pub fn new(name: impl Into<String>) -> Self {
        DumpArtifact {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn push(&mut self, offset: u64, data: Vec<u8>) {
        self.writes.push(DumpWrite { offset, data });
    }

    pub fn omit(&mut self, what: impl Into<String>) {
        self.omitted.push(what.into());
    }

    pub fn is_complete(&self) -> bool {
        self.omitted.is_empty()
    }

    /// Size of the assembled blob: the end of the furthest write.
    pub fn len(&self) -> u64 {
        self.writes
            .iter()
            .map(|w| w.offset + w.data.len() as u64)
            .max()
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replay the writes in order. Gaps are left to the sink.
    pub fn write_to<W: Write + Seek>(&self, sink: &mut W) -> io::Result<()> {
        for write in &self.writes {
            sink.seek(SeekFrom::Start(write.offset))?;
            sink.write_all(&write.data)?;
        }
        sink.flush()
    }

    /// Assemble in memory with gaps zero-filled.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len() as usize];
        for write in &self.writes {
            let start = write.offset as usize;
            out[start..start + write.data.len()].copy_from_slice(&write.data);
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectionEntry {
    pub name: String,
    pub virtual_address: u64,
    pub virtual_size: u64,
    pub raw_size: u64,
    pub raw_offset: u64,
}

/// The parts of a PE header needed to lay an image back out as a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeHeader {
    pub base: u64,
    pub size_of_headers: u64,
    pub size_of_image: u64,
    pub sections: Vec<SectionEntry>,
}

impl PeHeader {
    /// Parse the header of the image mapped at `base` in `layer`.
    pub fn read(
        catalog: &Arc<Catalog>,
        layer: &Arc<dyn MemoryLayer>,
        image: &ImageLayout,
        base: u64,
    ) -> ObjectResult<Self> {
        let dos = TypedObject::new(catalog.clone(), layer.clone(), &image.dos_header, base)?;
        if dos.unsigned("e_magic")? != DOS_SIGNATURE {
            return Err(ObjectError::InvalidSignature {
                type_name: image.dos_header.clone(),
                address: base,
            });
        }
        let nt_offset = base.wrapping_add(dos.signed("e_lfanew")? as u64);
        let nt = dos.cast(&image.nt_headers)?.at(nt_offset);
        if nt.unsigned("Signature")? != NT_SIGNATURE {
            return Err(ObjectError::InvalidSignature {
                type_name: image.nt_headers.clone(),
                address: nt_offset,
            });
        }

        let file_header = nt.member("FileHeader")?;
        let optional = nt.member("OptionalHeader")?;
        let count = file_header.unsigned("NumberOfSections")?.min(MAX_SECTIONS);
        let table = optional
            .offset()
            .wrapping_add(file_header.unsigned("SizeOfOptionalHeader")?);

        let mut sections = Vec::with_capacity(count as usize);
        let entry = nt.cast(&image.section_header)?;
        for i in 0..count {
            let section = entry.at(table + i * entry.size() as u64);
            sections.push(SectionEntry {
                name: section.array_to_string("Name", 8, Encoding::Latin1, OnDecodeError::Replace)?,
                virtual_address: section.unsigned("VirtualAddress")?,
                virtual_size: section.unsigned("VirtualSize")?,
                raw_size: section.unsigned("SizeOfRawData")?,
                raw_offset: section.unsigned("PointerToRawData")?,
            });
        }

        let size_of_headers = optional.unsigned("SizeOfHeaders")?;
        let size_of_image = optional.unsigned("SizeOfImage")?;
        if size_of_headers == 0 || size_of_headers > size_of_image {
            return Err(ObjectError::MalformedHeader {
                type_name: image.nt_headers.clone(),
                address: nt_offset,
                reason: format!(
                    "SizeOfHeaders {:#x} does not fit SizeOfImage {:#x}",
                    size_of_headers, size_of_image
                ),
            });
        }

        Ok(PeHeader {
            base,
            size_of_headers,
            size_of_image,
            sections,
        })
    }
}

impl SectionEntry {
    /// The section's raw data lies inside the declared image, both at its
    /// virtual address and at its file offset.
    fn fits(&self, size_of_image: u64) -> bool {
        let within = |at: u64| at.checked_add(self.raw_size).is_some_and(|end| end <= size_of_image);
        within(self.virtual_address) && within(self.raw_offset)
    }
}

/// Rebuild the file layout of the image at `base`.
///
/// The headers are written first, then one write per section at its file
/// offset. A section that cannot be read, or that claims more bytes than the
/// image holds, is recorded and omitted, which marks the artifact incomplete;
/// the other sections are still written. Failing to read the header itself
/// fails the whole reconstruction.
pub fn reconstruct(
    name: impl Into<String>,
    catalog: &Arc<Catalog>,
    layer: &Arc<dyn MemoryLayer>,
    image: &ImageLayout,
    base: u64,
    diagnostics: &Diagnostics,
) -> ObjectResult<DumpArtifact> {
    let header = PeHeader::read(catalog, layer, image, base)?;
    let mut artifact = DumpArtifact::new(name);
    artifact.push(0, layer.read(base, header.size_of_headers as usize, false)?);

    for section in &header.sections {
        if section.raw_size == 0 {
            continue;
        }
        let address = base.wrapping_add(section.virtual_address);
        if !section.fits(header.size_of_image) {
            diagnostics.record(
                DiagnosticKind::SectionOmitted,
                Some(address),
                format!(
                    "section {} omitted from {}: {:#x} bytes at {:#x} exceed image size {:#x}",
                    section.name, artifact.name, section.raw_size, section.raw_offset, header.size_of_image
                ),
            );
            artifact.omit(section.name.clone());
            continue;
        }
        match layer.read(address, section.raw_size as usize, false) {
            Ok(data) => artifact.push(section.raw_offset, data),
            Err(e) => {
                diagnostics.record(
                    DiagnosticKind::SectionOmitted,
                    Some(address),
                    format!("section {} omitted from {}: {}", section.name, artifact.name, e),
                );
                artifact.omit(section.name.clone());
            }
        }
    }
    debug!(
        name = %artifact.name,
        sections = header.sections.len(),
        omitted = artifact.omitted.len(),
        "image reconstructed"
    );
    Ok(artifact)
}

/// Reconstruct the main executable of `process`, named
/// `pid.<pid>.<base>.dmp`.
pub fn process_dump(
    kernel: &KernelSpace,
    process: &TypedObject,
    diagnostics: &Diagnostics,
) -> ObjectResult<DumpArtifact> {
    let config = kernel.config();
    let image = config.image.as_ref().ok_or(ObjectError::NotConfigured("image"))?;
    let environment = config
        .process
        .environment
        .as_ref()
        .ok_or(ObjectError::NotConfigured("process environment"))?;
    let image_base = config
        .process
        .image_base
        .as_ref()
        .ok_or(ObjectError::NotConfigured("image base"))?;

    let pid = process.path_unsigned(&config.process.pid)?;
    let scope = diagnostics.scoped(format_args!("pid {}", pid));
    let layer = derive_process_layer(kernel, process, &scope)?;
    let peb = process
        .path_object(environment, None)?
        .on_layer(layer.layer().clone());
    let base = peb.path_unsigned(image_base)?;

    reconstruct(
        format!("pid.{}.{:#x}.dmp", pid, base),
        kernel.catalog(),
        layer.layer(),
        image,
        base,
        &scope,
    )
}

/// Lazy chunked read of one region.
///
/// Each chunk is read only when pulled, with unreadable pages padded with
/// zeros, so at most one chunk is held at a time. Offsets in the yielded
/// writes are relative to the region start. A read error ends the dump.
pub struct RegionDump<'a> {
    layer: &'a dyn MemoryLayer,
    name: String,
    start: u64,
    end: u64,
    next: u64,
    chunk_size: u64,
}

impl RegionDump<'_> {
    /// `pid.<pid>.vad.<start>-<last>.dmp`
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain the dump into `sink`, returning the number of bytes written.
    pub fn write_to<W: Write + Seek>(self, sink: &mut W) -> io::Result<u64> {
        let mut written = 0;
        for write in self {
            let write = write.map_err(io::Error::other)?;
            sink.seek(SeekFrom::Start(write.offset))?;
            sink.write_all(&write.data)?;
            written += write.data.len() as u64;
        }
        sink.flush()?;
        Ok(written)
    }
}

impl Iterator for RegionDump<'_> {
    type Item = ObjectResult<DumpWrite>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let offset = self.next;
        let to_read = self.chunk_size.min(self.end - offset);
        match self.layer.read(offset, to_read as usize, true) {
            Ok(data) => {
                self.next += to_read;
                Some(Ok(DumpWrite {
                    offset: offset - self.start,
                    data,
                }))
            }
            Err(e) => {
                self.next = self.end;
                Some(Err(e.into()))
            }
        }
    }
}

impl std::iter::FusedIterator for RegionDump<'_> {}

/// Dump `region` from `layer` in `chunk_size` pieces.
pub fn dump_region<'a>(
    layer: &'a dyn MemoryLayer,
    pid: u64,
    region: &MappedRegion,
    chunk_size: usize,
) -> RegionDump<'a> {
    RegionDump {
        layer,
        name: format!("pid.{}.vad.{:#x}-{:#x}.dmp", pid, region.start, region.last()),
        start: region.start,
        end: region.end.max(region.start),
        next: region.start,
        chunk_size: chunk_size.max(1) as u64,
    }
}

/// Dump every process image on the rayon pool.
///
/// Each process derives and releases its own layer. A failure is recorded
/// and returned in that process's slot without affecting the others.
/// Results come back in input order.
pub fn dump_processes(
    kernel: &KernelSpace,
    processes: &[TypedObject],
    diagnostics: &Diagnostics,
) -> Vec<ObjectResult<DumpArtifact>> {
    processes
        .par_iter()
        .map(|process| {
            let result = process_dump(kernel, process, diagnostics);
            if let Err(e) = &result {
                warn!(offset = %format_args!("{:#x}", process.offset()), error = %e, "process dump failed");
                diagnostics.record(
                    DiagnosticKind::ProcessSkipped,
                    Some(process.offset()),
                    format!("process dump failed: {}", e),
                );
            }
            result
        })
        .collect()
}
