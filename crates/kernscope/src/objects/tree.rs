//! Binary tree traversal for intrusive trees such as the VAD tree.

use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::memory::traits::MemoryLayer;
use crate::objects::error::{ObjectError, ObjectResult};
use crate::objects::typed::{read_pointer, TypedObject};
use isf::{child_offset, Catalog, TypeDescriptor};
use std::collections::HashSet;
use std::sync::Arc;

/// Default maximum number of nodes per tree.
pub const DEFAULT_MAX_TREE_NODES: usize = 4096;

/// Lazy pre-order walk (node, left subtree, right subtree).
///
/// Child pointers address the embedded node structure (`node_field`) of the
/// next container. A node whose children cannot be read is still yielded;
/// its subtrees are skipped and the walk is marked truncated. A cycle or a
/// budget overrun yields `CorruptList` and ends the walk.
pub struct TreeWalker {
    catalog: Arc<Catalog>,
    layer: Arc<dyn MemoryLayer>,
    descriptor: Arc<TypeDescriptor>,
    node_rel: u64,
    left_rel: u64,
    right_rel: u64,
    root: u64,
    stack: Vec<u64>,
    visited: HashSet<u64>,
    max_nodes: usize,
    yielded: usize,
    done: bool,
    truncated: bool,
    diagnostics: Option<Diagnostics>,
}

impl TreeWalker {
    /// Walk a tree of `type_name` whose node links live in the embedded
    /// structure `node_field` (or directly in `type_name` when `None`).
    /// `root` is the address of the first node structure; 0 is an empty tree.
    pub fn new(
        catalog: Arc<Catalog>,
        layer: Arc<dyn MemoryLayer>,
        type_name: &str,
        node_field: Option<&str>,
        left: &str,
        right: &str,
        root: u64,
    ) -> ObjectResult<Self> {
        let descriptor = catalog.get_type(type_name)?;
        let (node_rel, node_desc) = match node_field {
            Some(field) => {
                let rel = child_offset(&descriptor, field).map_err(ObjectError::from_isf)?;
                let node_type = descriptor
                    .field(field)
                    .and_then(|fd| fd.field_type.struct_name())
                    .ok_or_else(|| ObjectError::InvalidFieldType {
                        type_name: type_name.to_string(),
                        field: field.to_string(),
                        expected: "an embedded node structure",
                    })?;
                (rel as u64, catalog.get_type(node_type)?)
            }
            None => (0, descriptor.clone()),
        };
        let left_rel = child_offset(&node_desc, left).map_err(ObjectError::from_isf)? as u64;
        let right_rel = child_offset(&node_desc, right).map_err(ObjectError::from_isf)? as u64;

        let stack = if root == 0 { Vec::new() } else { vec![root] };
        Ok(TreeWalker {
            catalog,
            layer,
            descriptor,
            node_rel,
            left_rel,
            right_rel,
            root,
            stack,
            visited: HashSet::new(),
            max_nodes: DEFAULT_MAX_TREE_NODES,
            yielded: 0,
            done: false,
            truncated: false,
            diagnostics: None,
        })
    }

    pub fn max_nodes(mut self, max_nodes: usize) -> Self {
        self.max_nodes = max_nodes;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    pub fn yielded(&self) -> usize {
        self.yielded
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    fn record(&self, kind: DiagnosticKind, address: u64, message: String) {
        if let Some(diag) = &self.diagnostics {
            diag.record(kind, Some(address), message);
        }
    }

    fn corrupt(&mut self, at: u64, reason: String) -> Option<ObjectResult<TypedObject>> {
        self.done = true;
        self.truncated = true;
        let err = ObjectError::CorruptList {
            anchor: self.root,
            at,
            yielded: self.yielded,
            reason,
        };
        self.record(DiagnosticKind::CorruptList, at, err.to_string());
        Some(Err(err))
    }

    fn child(&mut self, node: u64, rel: u64) -> Option<u64> {
        match read_pointer(self.layer.as_ref(), &self.catalog, node.wrapping_add(rel)) {
            Ok(0) => None,
            Ok(ptr) => Some(ptr),
            Err(e) => {
                self.truncated = true;
                self.record(
                    DiagnosticKind::FieldUnavailable,
                    node,
                    format!("tree child pointer unreadable: {}", e),
                );
                None
            }
        }
    }
}

impl Iterator for TreeWalker {
    type Item = ObjectResult<TypedObject>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let node = match self.stack.pop() {
            Some(node) => node,
            None => {
                self.done = true;
                return None;
            }
        };

        if !self.visited.insert(node) {
            return self.corrupt(node, "revisited tree node".to_string());
        }
        if self.yielded >= self.max_nodes {
            let budget = self.max_nodes;
            return self.corrupt(node, format!("node budget of {} exceeded", budget));
        }
        let container = match node.checked_sub(self.node_rel) {
            Some(c) => c,
            None => return self.corrupt(node, "tree node below its container offset".to_string()),
        };

        if let Some(right) = self.child(node, self.right_rel) {
            self.stack.push(right);
        }
        if let Some(left) = self.child(node, self.left_rel) {
            self.stack.push(left);
        }

        self.yielded += 1;
        Some(Ok(TypedObject::with_descriptor(
            self.catalog.clone(),
            self.layer.clone(),
            self.descriptor.clone(),
            container,
        )))
    }
}

impl std::iter::FusedIterator for TreeWalker {}
