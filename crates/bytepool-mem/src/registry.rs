//! Allocation registry: a parent/children forest over live pointers.
//!
//! The allocator never interprets what it hands out. Higher layers that nest
//! allocations (a string field inside a struct view, an array of arrays) record
//! ownership here so that freeing a parent can re-parent or transitively free
//! its children. Nothing in this module touches pool bytes.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use bytepool_core::{OwnerId, Pointer};
use serde::{Deserialize, Serialize};

/// Ownership record for one registered pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationNode {
    pub owner: OwnerId,
    /// `None` for roots.
    pub parent: Option<Pointer>,
    pub children: BTreeSet<Pointer>,
}

impl AllocationNode {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct AllocationRegistry {
    nodes: HashMap<Pointer, AllocationNode>,
    roots: BTreeSet<Pointer>,
}

impl AllocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `ptr` as owned by `owner`.
    ///
    /// If `parent` is tracked the node becomes its child, otherwise a root (an
    /// unknown parent is not an error). A pointer that is already tracked is
    /// unregistered first.
    pub fn register(&mut self, ptr: Pointer, owner: OwnerId, parent: Option<Pointer>) {
        if self.nodes.contains_key(&ptr) {
            self.unregister(ptr);
        }

        let parent = parent.filter(|p| *p != ptr && self.nodes.contains_key(p));
        match parent {
            Some(p) => {
                if let Some(parent_node) = self.nodes.get_mut(&p) {
                    parent_node.children.insert(ptr);
                }
            }
            None => {
                self.roots.insert(ptr);
            }
        }

        self.nodes.insert(
            ptr,
            AllocationNode {
                owner,
                parent,
                children: BTreeSet::new(),
            },
        );
    }

    /// Drop `ptr`, handing its children to its parent (or promoting them to
    /// roots). Returns the removed node.
    pub fn unregister(&mut self, ptr: Pointer) -> Option<AllocationNode> {
        let node = self.nodes.remove(&ptr)?;

        for child in &node.children {
            if let Some(child_node) = self.nodes.get_mut(child) {
                child_node.parent = node.parent;
            }
        }

        match node.parent.and_then(|p| self.nodes.get_mut(&p)) {
            Some(parent_node) => {
                parent_node.children.remove(&ptr);
                parent_node.children.extend(node.children.iter().copied());
            }
            None => {
                self.roots.remove(&ptr);
                self.roots.extend(node.children.iter().copied());
            }
        }

        Some(node)
    }

    /// Move the node tracked at `old` to `new`, keeping its owner, parent and
    /// children. Returns false if `old` was not tracked.
    pub fn repoint(&mut self, old: Pointer, new: Pointer) -> bool {
        if old == new {
            return self.nodes.contains_key(&old);
        }
        if self.nodes.contains_key(&new) {
            self.unregister(new);
        }
        let Some(node) = self.nodes.remove(&old) else {
            return false;
        };

        for child in &node.children {
            if let Some(child_node) = self.nodes.get_mut(child) {
                child_node.parent = Some(new);
            }
        }

        match node.parent.and_then(|p| self.nodes.get_mut(&p)) {
            Some(parent_node) => {
                parent_node.children.remove(&old);
                parent_node.children.insert(new);
            }
            None => {
                self.roots.remove(&old);
                self.roots.insert(new);
            }
        }

        self.nodes.insert(new, node);
        true
    }

    pub fn get_owner(&self, ptr: Pointer) -> Option<OwnerId> {
        self.nodes.get(&ptr).map(|n| n.owner)
    }

    pub fn get_node(&self, ptr: Pointer) -> Option<&AllocationNode> {
        self.nodes.get(&ptr)
    }

    /// Flat pointer -> owner view, ordered by pointer.
    pub fn get_all_allocations(&self) -> BTreeMap<Pointer, OwnerId> {
        self.nodes.iter().map(|(p, n)| (*p, n.owner)).collect()
    }

    /// Root pointers in ascending order.
    pub fn get_root_pointers(&self) -> Vec<Pointer> {
        self.roots.iter().copied().collect()
    }

    /// All descendants of `ptr`, children before their parents. `ptr` itself
    /// is not included.
    pub fn descendants(&self, ptr: Pointer) -> Vec<Pointer> {
        let mut out = Vec::new();
        let Some(node) = self.nodes.get(&ptr) else {
            return out;
        };

        // Iterative post-order: (pointer, children already expanded).
        let mut stack: Vec<(Pointer, bool)> =
            node.children.iter().rev().map(|c| (*c, false)).collect();
        while let Some((p, expanded)) = stack.pop() {
            if expanded {
                out.push(p);
                continue;
            }
            stack.push((p, true));
            if let Some(n) = self.nodes.get(&p) {
                stack.extend(n.children.iter().rev().map(|c| (*c, false)));
            }
        }
        out
    }

    pub fn contains(&self, ptr: Pointer) -> bool {
        self.nodes.contains_key(&ptr)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.roots.clear();
    }
}
