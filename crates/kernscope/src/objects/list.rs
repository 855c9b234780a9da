//! Intrusive linked-list traversal.
//!
//! Kernel lists keep their link nodes inside the objects they chain, so the
//! walker follows link-node addresses and recovers each container as
//! `link_address - offset_of(link_field)`. Captured memory cannot be trusted
//! to terminate a walk: every link node is remembered, and a revisit or a
//! node budget overrun ends the walk with `CorruptList`.

use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::memory::traits::MemoryLayer;
use crate::objects::error::{ObjectError, ObjectResult};
use crate::objects::typed::{read_pointer, TypedObject};
use isf::{Catalog, FieldType, TypeDescriptor};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Default maximum number of nodes a single walk may yield.
pub const DEFAULT_MAX_NODES: usize = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Links {
    /// A link structure embedded at `rel`; its forward pointer sits at
    /// `forward` within that structure and addresses the next link node.
    Embedded { rel: u64, forward: u64 },
    /// A plain pointer field at `rel` addressing the next container.
    Pointer { rel: u64 },
}

/// Lazy walk over an intrusive list.
///
/// Yields `Ok` containers in list order. A walk that cannot continue yields a
/// single `Err` (`CorruptList`, or `Memory` for an unreadable forward
/// pointer) and then ends; everything yielded before it stays valid.
pub struct ListWalker {
    catalog: Arc<Catalog>,
    layer: Arc<dyn MemoryLayer>,
    descriptor: Arc<TypeDescriptor>,
    links: Links,
    head: u64,
    stop_on_null: bool,
    max_nodes: usize,
    visited: HashSet<u64>,
    cursor: Option<u64>,
    yielded: usize,
    done: bool,
    truncated: bool,
    diagnostics: Option<Diagnostics>,
}

impl ListWalker {
    /// Walk a circular list of `type_name` chained through the embedded link
    /// structure `link_field`, starting at the anchor link node `head`.
    ///
    /// The walk ends when a forward pointer returns to `head`. The anchor
    /// itself is never yielded.
    pub fn new(
        catalog: Arc<Catalog>,
        layer: Arc<dyn MemoryLayer>,
        type_name: &str,
        link_field: &str,
        head: u64,
    ) -> ObjectResult<Self> {
        let descriptor = catalog.get_type(type_name)?;
        let rel = isf::child_offset(&descriptor, link_field).map_err(ObjectError::from_isf)? as u64;
        let link_type = descriptor
            .field(link_field)
            .and_then(|fd| fd.field_type.struct_name())
            .ok_or_else(|| ObjectError::InvalidFieldType {
                type_name: type_name.to_string(),
                field: link_field.to_string(),
                expected: "an embedded link structure",
            })?
            .to_string();
        let link_desc = catalog.get_type(&link_type)?;
        let forward = forward_pointer_offset(&link_desc).ok_or_else(|| {
            ObjectError::InvalidFieldType {
                type_name: link_type.clone(),
                field: "<forward link>".to_string(),
                expected: "a pointer",
            }
        })?;

        Ok(Self::build(
            catalog,
            layer,
            descriptor,
            Links::Embedded { rel, forward },
            head,
            false,
        ))
    }

    /// Walk a null-terminated chain where pointer field `next_field` of each
    /// container addresses the next container. `first_slot` is the address
    /// of the pointer holding the first element.
    pub fn pointer_chain(
        catalog: Arc<Catalog>,
        layer: Arc<dyn MemoryLayer>,
        type_name: &str,
        next_field: &str,
        first_slot: u64,
    ) -> ObjectResult<Self> {
        let descriptor = catalog.get_type(type_name)?;
        let rel = isf::child_offset(&descriptor, next_field).map_err(ObjectError::from_isf)? as u64;
        if !descriptor
            .field(next_field)
            .map_or(false, |fd| fd.field_type.is_pointer())
        {
            return Err(ObjectError::InvalidFieldType {
                type_name: type_name.to_string(),
                field: next_field.to_string(),
                expected: "a pointer",
            });
        }
        Ok(Self::build(
            catalog,
            layer,
            descriptor,
            Links::Pointer { rel },
            first_slot,
            true,
        ))
    }

    fn build(
        catalog: Arc<Catalog>,
        layer: Arc<dyn MemoryLayer>,
        descriptor: Arc<TypeDescriptor>,
        links: Links,
        head: u64,
        stop_on_null: bool,
    ) -> Self {
        ListWalker {
            catalog,
            layer,
            descriptor,
            links,
            head,
            stop_on_null,
            max_nodes: DEFAULT_MAX_NODES,
            visited: HashSet::new(),
            cursor: None,
            yielded: 0,
            done: false,
            truncated: false,
            diagnostics: None,
        }
    }

    /// Maximum number of containers to yield before declaring the list
    /// corrupt.
    pub fn max_nodes(mut self, max_nodes: usize) -> Self {
        self.max_nodes = max_nodes;
        self
    }

    /// Treat a null forward pointer as the end of the list rather than as
    /// corruption.
    pub fn stop_on_null(mut self, stop: bool) -> Self {
        self.stop_on_null = stop;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    pub fn anchor(&self) -> u64 {
        self.head
    }

    /// Number of containers yielded so far.
    pub fn yielded(&self) -> usize {
        self.yielded
    }

    /// True once the walk ended on an error instead of its terminator.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    fn forward_slot(&self, node: u64) -> u64 {
        match self.links {
            Links::Embedded { forward, .. } => node.wrapping_add(forward),
            Links::Pointer { rel } => node.wrapping_add(rel),
        }
    }

    fn fail(&mut self, err: ObjectError) -> Option<ObjectResult<TypedObject>> {
        self.done = true;
        self.truncated = true;
        if let Some(diag) = &self.diagnostics {
            let address = match &err {
                ObjectError::CorruptList { at, .. } => Some(*at),
                _ => self.cursor,
            };
            diag.record(DiagnosticKind::CorruptList, address, err.to_string());
        }
        Some(Err(err))
    }

    fn corrupt(&mut self, at: u64, reason: impl Into<String>) -> Option<ObjectResult<TypedObject>> {
        let err = ObjectError::CorruptList {
            anchor: self.head,
            at,
            yielded: self.yielded,
            reason: reason.into(),
        };
        self.fail(err)
    }
}

impl Iterator for ListWalker {
    type Item = ObjectResult<TypedObject>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let slot = match (self.cursor, self.links) {
            (Some(node), _) => self.forward_slot(node),
            (None, Links::Embedded { .. }) => self.forward_slot(self.head),
            (None, Links::Pointer { .. }) => self.head,
        };
        let link = match read_pointer(self.layer.as_ref(), &self.catalog, slot) {
            Ok(link) => link,
            Err(e) => return self.fail(e),
        };

        let at_sentinel = matches!(self.links, Links::Embedded { .. }) && link == self.head;
        if at_sentinel || (link == 0 && self.stop_on_null) {
            debug!(anchor = %format_args!("{:#x}", self.head), nodes = self.yielded, "list walk complete");
            self.done = true;
            return None;
        }
        if link == 0 {
            return self.corrupt(slot, "null forward pointer");
        }
        if !self.visited.insert(link) {
            return self.corrupt(link, "revisited link node");
        }
        if self.yielded >= self.max_nodes {
            let budget = self.max_nodes;
            return self.corrupt(link, format!("node budget of {} exceeded", budget));
        }

        let container = match self.links {
            Links::Embedded { rel, .. } => match link.checked_sub(rel) {
                Some(c) => c,
                None => return self.corrupt(link, "link node below its container offset"),
            },
            Links::Pointer { .. } => link,
        };

        self.cursor = Some(link);
        self.yielded += 1;
        Some(Ok(TypedObject::with_descriptor(
            self.catalog.clone(),
            self.layer.clone(),
            self.descriptor.clone(),
            container,
        )))
    }
}

impl std::iter::FusedIterator for ListWalker {}

/// Offset of the forward pointer in a link structure: the pointer field at
/// offset 0 (`Flink`, `next`), falling back to the first pointer field.
fn forward_pointer_offset(link: &TypeDescriptor) -> Option<u64> {
    let pointers = || {
        link.fields()
            .iter()
            .filter(|f| matches!(f.field_type, FieldType::Pointer { .. }))
    };
    pointers()
        .find(|f| f.offset == 0)
        .or_else(|| pointers().next())
        .map(|f| f.offset as u64)
}
