//! Process listing by walking the kernel's active process list.
//!
//! The list anchor, link field and every reported field come from the
//! configured [`ProcessLayout`], so the same walk serves any OS whose
//! process structures are chained through an embedded doubly-linked list.

use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::kernel::KernelSpace;
use crate::layout::{ProcessLayout, TimeFormat};
use crate::objects::error::{ObjectError, ObjectResult};
use crate::objects::list::ListWalker;
use crate::objects::path::FieldPath;
use crate::objects::typed::TypedObject;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Caller-supplied test over a process structure.
pub type ProcessPredicate = Arc<dyn Fn(&TypedObject) -> bool + Send + Sync>;

/// Include filter over process ids, decoded names and caller predicates.
///
/// An empty set places no constraint; a process must satisfy every
/// non-empty set and every predicate to be kept.
#[derive(Clone, Default)]
pub struct ProcessFilter {
    pids: BTreeSet<u64>,
    names: BTreeSet<String>,
    predicates: Vec<ProcessPredicate>,
}

impl fmt::Debug for ProcessFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessFilter")
            .field("pids", &self.pids)
            .field("names", &self.names)
            .field("predicates", &self.predicates.len())
            .finish()
    }
}

impl ProcessFilter {
    /// A filter that keeps everything.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_pids(mut self, pids: impl IntoIterator<Item = u64>) -> Self {
        self.pids.extend(pids);
        self
    }

    pub fn with_names<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.names.extend(names.into_iter().map(Into::into));
        self
    }

    /// Also require `predicate` to hold for each kept process.
    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&TypedObject) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicates.push(Arc::new(predicate));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty() && self.names.is_empty() && self.predicates.is_empty()
    }

    fn constrains_identity(&self) -> bool {
        !self.pids.is_empty() || !self.names.is_empty()
    }

    pub fn accepts(&self, pid: u64, name: &str) -> bool {
        (self.pids.is_empty() || self.pids.contains(&pid))
            && (self.names.is_empty() || self.names.contains(name))
    }

    /// True when every predicate holds for `process`.
    pub fn test(&self, process: &TypedObject) -> bool {
        self.predicates.iter().all(|predicate| predicate(process))
    }
}

/// Keep only processes whose pid is in `pids`.
pub fn pid_filter(pids: impl IntoIterator<Item = u64>) -> ProcessFilter {
    ProcessFilter::all().with_pids(pids)
}

/// Keep only processes whose decoded name is in `names`.
pub fn name_filter<S: Into<String>>(names: impl IntoIterator<Item = S>) -> ProcessFilter {
    ProcessFilter::all().with_names(names)
}

/// Keep only processes for which `predicate` holds.
pub fn predicate_filter(
    predicate: impl Fn(&TypedObject) -> bool + Send + Sync + 'static,
) -> ProcessFilter {
    ProcessFilter::all().with_predicate(predicate)
}

/// Lazy walk over the kernel process list.
pub struct ProcessWalk {
    walker: ListWalker,
    layout: ProcessLayout,
    filter: ProcessFilter,
    diagnostics: Diagnostics,
}

impl ProcessWalk {
    /// True once the underlying list walk stopped on corruption.
    pub fn truncated(&self) -> bool {
        self.walker.truncated()
    }
}

impl Iterator for ProcessWalk {
    type Item = ObjectResult<TypedObject>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let process = match self.walker.next()? {
                Ok(process) => process,
                Err(e) => return Some(Err(e)),
            };
            if self.filter.is_empty() {
                return Some(Ok(process));
            }
            if self.filter.constrains_identity() {
                let identity = process
                    .path_unsigned(&self.layout.pid)
                    .and_then(|pid| Ok((pid, self.layout.name.read(&process)?)));
                match identity {
                    Ok((pid, name)) if self.filter.accepts(pid, &name) => {}
                    Ok(_) => continue,
                    Err(e) => {
                        self.diagnostics.record(
                            DiagnosticKind::ProcessSkipped,
                            Some(process.offset()),
                            format!("cannot read process identity for filtering: {}", e),
                        );
                        continue;
                    }
                }
            }
            if self.filter.test(&process) {
                return Some(Ok(process));
            }
        }
    }
}

/// Walk the process list of `kernel`, keeping processes `filter` accepts.
///
/// Fails up front when the layout's anchor symbol or types are missing
/// from the catalog. Corruption met during the walk ends it with one
/// `CorruptList` item; processes yielded before it stay valid.
pub fn walk_processes(
    kernel: &KernelSpace,
    filter: ProcessFilter,
    diagnostics: &Diagnostics,
) -> ObjectResult<ProcessWalk> {
    let layout = kernel.config().process.clone();
    let mut head = kernel.symbol_address(&layout.list_head)?;
    if let Some(field) = &layout.head_field {
        let rel = kernel
            .catalog()
            .relative_child_offset(&layout.type_name, field)
            .map_err(ObjectError::from_isf)?;
        head = head.wrapping_add(rel as u64);
    }
    debug!(
        symbol = %layout.list_head,
        head = %format_args!("{:#x}", head),
        "walking process list"
    );

    let walker = ListWalker::new(
        kernel.catalog().clone(),
        kernel.layer(),
        &layout.type_name,
        &layout.link_field,
        head,
    )?
    .max_nodes(kernel.config().max_list_nodes)
    .with_diagnostics(diagnostics.scoped("process list"));

    Ok(ProcessWalk {
        walker,
        layout,
        filter,
        diagnostics: diagnostics.clone(),
    })
}

/// Convert a Windows FILETIME (100ns since 1601-01-01) to UTC.
pub fn filetime_to_datetime(filetime: u64) -> Option<DateTime<Utc>> {
    if filetime == 0 {
        return None;
    }
    const WINDOWS_EPOCH_OFFSET: u64 = 11_644_473_600;
    let seconds = filetime / 10_000_000;
    if seconds < WINDOWS_EPOCH_OFFSET {
        return None;
    }
    let nanos = ((filetime % 10_000_000) * 100) as u32;
    DateTime::from_timestamp((seconds - WINDOWS_EPOCH_OFFSET) as i64, nanos)
}

fn decode_time(raw: u64, format: TimeFormat) -> Option<DateTime<Utc>> {
    match format {
        TimeFormat::Filetime => filetime_to_datetime(raw),
        TimeFormat::UnixSeconds if raw != 0 => DateTime::from_timestamp(raw as i64, 0),
        TimeFormat::UnixSeconds => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineKind {
    Created,
    Modified,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineEvent {
    pub description: String,
    pub kind: TimelineKind,
    pub timestamp: DateTime<Utc>,
}

/// One row of process listing output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessRecord {
    pub pid: u64,
    pub ppid: u64,
    pub name: String,
    /// Raw fixed-width name bytes.
    #[serde(skip)]
    pub name_bytes: Vec<u8>,
    /// Kernel virtual address of the process structure.
    pub offset: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub physical_offset: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threads: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handles: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wow64: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_time: Option<DateTime<Utc>>,
    /// Absent while the process is running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_time: Option<DateTime<Utc>>,
}

impl ProcessRecord {
    /// Read a process row. Only the pid is required; any other field that
    /// cannot be read is reported as absent.
    pub fn read(
        kernel: &KernelSpace,
        process: &TypedObject,
        diagnostics: &Diagnostics,
    ) -> ObjectResult<Self> {
        let layout = &kernel.config().process;
        let pid = process.path_unsigned(&layout.pid)?;
        let scope = diagnostics.scoped(format_args!("pid {}", pid));
        let optional = |path: Option<&FieldPath>| -> Option<u64> {
            let path = path?;
            unavailable_as_none(&scope, process, path, process.path_unsigned(path))
        };

        let name_bytes = process
            .path_target(&layout.name.path)
            .and_then(|(target, field)| target.read_field_bytes(field))
            .unwrap_or_default();
        let name = unavailable_as_none(&scope, process, &layout.name.path, layout.name.read(process))
            .unwrap_or_default();

        Ok(ProcessRecord {
            pid,
            ppid: optional(Some(&layout.ppid)).unwrap_or(0),
            name,
            name_bytes,
            offset: process.offset(),
            physical_offset: None,
            threads: optional(layout.threads.as_ref()),
            handles: optional(layout.handles.as_ref()),
            session_id: optional(layout.session_id.as_ref()),
            wow64: optional(layout.wow64.as_ref()).map(|v| v != 0),
            create_time: optional(layout.create_time.as_ref())
                .and_then(|t| decode_time(t, layout.time_format)),
            exit_time: optional(layout.exit_time.as_ref())
                .and_then(|t| decode_time(t, layout.time_format)),
        })
    }

    /// Created and exited events for a timeline.
    pub fn timeline(&self) -> Vec<TimelineEvent> {
        let description = format!("Process: {} {} ({:#x})", self.pid, self.name, self.offset);
        let mut events = Vec::new();
        if let Some(created) = self.create_time {
            events.push(TimelineEvent {
                description: description.clone(),
                kind: TimelineKind::Created,
                timestamp: created,
            });
        }
        if let Some(exited) = self.exit_time {
            events.push(TimelineEvent {
                description,
                kind: TimelineKind::Modified,
                timestamp: exited,
            });
        }
        events
    }
}

/// Map a failed optional read to `None`, recording unreadable memory.
/// Null pointers and fields absent from this catalog are not worth an event.
fn unavailable_as_none<T>(
    diagnostics: &Diagnostics,
    process: &TypedObject,
    path: &FieldPath,
    result: ObjectResult<T>,
) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(ObjectError::NullPointer { .. }) => None,
        Err(e) if e.is_unavailable() => {
            diagnostics.record(
                DiagnosticKind::FieldUnavailable,
                Some(process.offset()),
                format!("{}: {}", path, e),
            );
            None
        }
        Err(e) => {
            debug!(field = %path, error = %e, "optional process field skipped");
            None
        }
    }
}

/// List processes as rows.
///
/// A process whose pid cannot be read is skipped and recorded; a corrupt
/// list ends the listing with the rows read so far.
pub fn pslist(
    kernel: &KernelSpace,
    filter: ProcessFilter,
    physical: bool,
    diagnostics: &Diagnostics,
) -> ObjectResult<Vec<ProcessRecord>> {
    let mut rows = Vec::new();
    for process in walk_processes(kernel, filter, diagnostics)? {
        let process = match process {
            Ok(p) => p,
            Err(_) => break,
        };
        match ProcessRecord::read(kernel, &process, diagnostics) {
            Ok(mut row) => {
                if physical {
                    row.physical_offset = kernel.physical_offset(row.offset).ok();
                }
                rows.push(row);
            }
            Err(e) => diagnostics.record(
                DiagnosticKind::ProcessSkipped,
                Some(process.offset()),
                format!("cannot read process: {}", e),
            ),
        }
    }
    debug!(count = rows.len(), "pslist complete");
    Ok(rows)
}
