//! Memory-mapped capture file layer.
//!
//! The bottom of every layer stack: a raw physical capture mapped read-only
//! into the address space so random reads cost no syscalls.

use crate::memory::error::{LayerError, LayerResult};
use crate::memory::traits::MemoryLayer;
use memmap2::{Mmap, MmapOptions};
use parking_lot::RwLock;
use std::fs::File;
use std::path::{Path, PathBuf};

/// A read-only, memory-mapped physical capture.
///
/// # Example
///
/// ```rust,ignore
/// use kernscope::memory::layers::MmapFileLayer;
/// use kernscope::memory::traits::MemoryLayer;
///
/// let layer = MmapFileLayer::open("physical", "/cases/host.raw")?;
/// let page = layer.read(0x1000, 4096, false)?;
/// ```
pub struct MmapFileLayer {
    name: String,
    location: String,
    path: PathBuf,
    /// `None` once destroyed. A zero-length file maps to `Some(None)`.
    state: RwLock<Option<Option<Mmap>>>,
}

impl MmapFileLayer {
    /// Parse a `file://` URL or a plain path.
    fn parse_location(location: &str) -> PathBuf {
        let path_str = match location.strip_prefix("file://") {
            // file:///C:/path -> C:/path
            Some(url_path)
                if url_path.starts_with('/')
                    && url_path.len() > 2
                    && url_path.chars().nth(2) == Some(':') =>
            {
                &url_path[1..]
            }
            Some(url_path) => url_path,
            None => location,
        };
        PathBuf::from(percent_decode(path_str))
    }

    fn map(path: &Path) -> LayerResult<Option<Mmap>> {
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Ok(None);
        }
        // SAFETY: the capture is opened read-only and never modified while mapped.
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        Ok(Some(mmap))
    }

    /// Map the capture at `location` (a `file://` URL or a filesystem path).
    pub fn open(name: impl Into<String>, location: impl Into<String>) -> LayerResult<Self> {
        let location = location.into();
        let path = Self::parse_location(&location);
        let mmap = Self::map(&path)?;
        Ok(MmapFileLayer {
            name: name.into(),
            location,
            path,
            state: RwLock::new(Some(mmap)),
        })
    }

    /// Unmap the capture. Every later read fails with `LayerDestroyed`.
    pub fn destroy(&self) {
        *self.state.write() = None;
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn size(&self) -> Option<u64> {
        self.state
            .read()
            .as_ref()
            .map(|m| m.as_ref().map_or(0, |m| m.len() as u64))
    }
}

impl MemoryLayer for MmapFileLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self, offset: u64, length: usize, pad: bool) -> LayerResult<Vec<u8>> {
        let guard = self.state.read();
        let mapped = guard
            .as_ref()
            .ok_or_else(|| LayerError::layer_destroyed(&self.name))?;
        let data: &[u8] = mapped.as_ref().map_or(&[], |m| m.as_ref());
        let size = data.len() as u64;

        if offset > size || (offset == size && length > 0) {
            if pad {
                return Ok(vec![0u8; length]);
            }
            return Err(LayerError::invalid_address(
                &self.name,
                offset,
                "Offset outside of the capture boundaries",
            ));
        }

        let start = offset as usize;
        let available = data.len() - start;
        if length <= available {
            Ok(data[start..start + length].to_vec())
        } else if pad {
            let mut result = Vec::with_capacity(length);
            result.extend_from_slice(&data[start..]);
            result.resize(length, 0);
            Ok(result)
        } else {
            Err(LayerError::invalid_address(
                &self.name,
                size,
                "Could not read sufficient bytes from the capture",
            ))
        }
    }

    fn is_valid(&self, offset: u64, length: u64) -> bool {
        match self.size() {
            Some(size) if length > 0 => offset
                .checked_add(length)
                .map_or(false, |end| end <= size),
            _ => false,
        }
    }

    fn maximum_address(&self) -> u64 {
        self.size().unwrap_or(0).saturating_sub(1)
    }
}

/// Decode `%XX` escapes in a file URL.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("");
            if let Ok(byte) = u8::from_str_radix(hex, 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
