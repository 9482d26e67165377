//! Core data structures for status trees.
//!
//! A status tree is a tree whose nodes carry a mutable status tag (`S`)
//! alongside their payload (`T`). The tree caches its current leaf set and
//! node count so that repeated leaf queries stay cheap while the tree is
//! grown and cut back.
//!
//! The core components are:
//! *   [`Tree<S, T>`]: arena-backed storage (slot vector plus free list) with
//!     a cached leaf sequence and node count, and the full mutation surface:
//!     child replacement, pruning, node skipping, leaf expansion, and branch
//!     surgery.
//! *   [`NodeId`]: a typed index into a tree's slot vector.
//! *   [`Node<S, T>`]: one occupied slot: status, payload, parent back-link,
//!     and ordered children.
//! *   [`Branch<S, T>`]: an owned ancestor-to-descendant spine that can be
//!     extracted from one tree and grafted into another.
//! *   [`TreeError`]: structural precondition failures and validation
//!     findings.
//!
//! Sibling order is strictly left to right (first child first) in every
//! traversal, leaf cache, and rendered drawing.
//!
//! All traversals are iterative, driven by an explicit stack or queue, so
//! deep trees cannot exhaust the call stack.

use std::collections::VecDeque;
use std::fmt::Write;
use std::ops::{Index, IndexMut};

use ahash::AHashSet;
use bitvec::vec::BitVec;
use itertools::Itertools;
use thiserror::Error;

pub mod branch;
pub mod iterato;
pub mod node;

pub use branch::Branch;
pub use node::{Node, NodeId};

use iterato::{AncestorsIter, BfsIter, PreorderIter};

/// Errors raised by tree operations and by [`Tree::validate`].
///
/// Structural preconditions are distinct variants and are always returned,
/// never swallowed. Not-found outcomes (a search without a match, a filter
/// matching nothing) are expressed as `Option`/`bool` returns instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TreeError {
    #[error("tree has no root")]
    MissingRoot,
    #[error("node {0} is not part of this tree")]
    NodeNotInTree(NodeId),
    #[error("invalid node id: {0}")]
    InvalidNode(NodeId),
    #[error("node {0} is still attached")]
    StillAttached(NodeId),
    #[error("attaching {0} would create a cycle")]
    WouldCycle(NodeId),
    #[error("no captured state to restore")]
    NothingCaptured,
    #[error("parent link of {0} does not match its parent's child list")]
    BrokenParentLink(NodeId),
    #[error("cycle detected through {0}")]
    CyclicLink(NodeId),
    #[error("node {0} is not reachable from the root")]
    OrphanNode(NodeId),
    #[error("leaf cache out of step with the arena")]
    LeafCacheDrift,
    #[error("cached size {cached} does not match reachable node count {counted}")]
    SizeDrift { cached: usize, counted: usize },
    #[error("leaf processing aborted: {0}")]
    LeafProcessing(String),
}

/// A status tree.
///
/// Nodes live in a slot vector; vacated slots are reused through a free
/// list. The tree caches `leaves` (the childless nodes in depth-first order)
/// and `size` (the number of nodes reachable from the root). Operations
/// either maintain the caches incrementally (append-style edits) or
/// regenerate them (arbitrary structural surgery); each method documents
/// which.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Tree<S, T> {
    slots: Vec<Option<Node<S, T>>>,
    free: Vec<usize>,
    root: Option<NodeId>,
    leaves: Vec<NodeId>,
    size: usize,
}

impl<S, T> Default for Tree<S, T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<S, T> Index<NodeId> for Tree<S, T> {
    type Output = T;
    fn index(&self, index: NodeId) -> &Self::Output {
        &self.node(index).data
    }
}

impl<S, T> IndexMut<NodeId> for Tree<S, T> {
    fn index_mut(&mut self, index: NodeId) -> &mut Self::Output {
        &mut self.node_mut(index).data
    }
}

impl<S, T> Index<&NodeId> for Tree<S, T> {
    type Output = Option<NodeId>;
    fn index(&self, index: &NodeId) -> &Self::Output {
        &self.node(*index).parent
    }
}

// --- Construction and arena plumbing ---

impl<S, T> Tree<S, T> {
    /// A tree with a single node acting as both root and sole leaf.
    pub fn new(status: S, data: T) -> Self {
        let mut tree = Self::empty();
        let root = tree.alloc(Node::detached(status, data));
        tree.root = Some(root);
        tree.leaves.push(root);
        tree.size = 1;
        tree
    }

    /// A tree with no nodes at all.
    pub fn empty() -> Self {
        Tree {
            slots: Vec::new(),
            free: Vec::new(),
            root: None,
            leaves: Vec::new(),
            size: 0,
        }
    }

    fn alloc(&mut self, node: Node<S, T>) -> NodeId {
        if let Some(index) = self.free.pop() {
            self.slots[index] = Some(node);
            NodeId(index)
        } else {
            self.slots.push(Some(node));
            NodeId(self.slots.len() - 1)
        }
    }

    fn release(&mut self, id: NodeId) -> Option<Node<S, T>> {
        let node = self.slots.get_mut(id.0)?.take();
        if node.is_some() {
            self.free.push(id.0);
        }
        node
    }

    fn occupied(&self, id: NodeId) -> bool {
        self.slots.get(id.0).map_or(false, Option::is_some)
    }

    pub(crate) fn node(&self, id: NodeId) -> &Node<S, T> {
        self.slots[id.0].as_ref().expect("node id points at a vacated slot")
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node<S, T> {
        self.slots[id.0].as_mut().expect("node id points at a vacated slot")
    }

    /// Links a fresh node under `parent` without touching the caches.
    fn spawn_child(&mut self, parent: NodeId, status: S, data: T) -> NodeId {
        let id = self.alloc(Node::detached(status, data));
        self.node_mut(id).parent = Some(parent);
        self.node_mut(parent).children.push(id);
        id
    }

    /// Frees `top` and every node below it, returning the number freed.
    fn free_below(&mut self, top: NodeId) -> usize {
        let mut freed = 0;
        let mut stack = vec![top];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.release(id) {
                freed += 1;
                stack.extend(node.children);
            }
        }
        freed
    }
}

// --- Accessors ---

impl<S, T> Tree<S, T> {
    /// The cached number of nodes reachable from the root.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    /// The cached leaf sequence, in depth-first order.
    pub fn get_leaves(&self) -> &[NodeId] {
        &self.leaves
    }

    pub fn get(&self, id: NodeId) -> Option<&Node<S, T>> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    pub fn status(&self, id: NodeId) -> Option<&S> {
        self.get(id).map(Node::status)
    }

    pub fn data(&self, id: NodeId) -> Option<&T> {
        self.get(id).map(Node::data)
    }

    /// Swaps in a new status tag, returning the previous one.
    pub fn set_status(&mut self, id: NodeId, status: S) -> Result<S, TreeError> {
        let node = self
            .slots
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(TreeError::InvalidNode(id))?;
        Ok(std::mem::replace(&mut node.status, status))
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.get(id).and_then(|n| n.parent)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.get(id).map_or(&[], |n| n.children())
    }

    fn is_in_tree(&self, node: NodeId) -> bool {
        match self.root {
            Some(root) => self.iter_ancestors(node).last() == Some(root),
            None => false,
        }
    }

    fn is_beneath(&self, node: NodeId, top: NodeId) -> bool {
        if !self.occupied(node) {
            return false;
        }
        let mut current = node;
        while let Some(parent) = self.node(current).parent {
            if parent == top {
                return true;
            }
            current = parent;
        }
        false
    }
}

// --- Iteration ---

impl<S, T> Tree<S, T> {
    /// Walks upwards from `start` to the root, `start` first.
    pub fn iter_ancestors(&self, start: NodeId) -> AncestorsIter<'_, S, T> {
        AncestorsIter::new(self, start)
    }

    /// Pre-order DFS from `start`, siblings left to right.
    pub fn iter_preorder(&self, start: NodeId) -> PreorderIter<'_, S, T> {
        PreorderIter::new(self, start)
    }

    /// Breadth-first traversal from `start`.
    pub fn iter_bfs(&self, start: NodeId) -> BfsIter<'_, S, T> {
        BfsIter::new(self, start)
    }

    pub fn iter_children(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.children(id).iter().copied()
    }

    pub fn iter_nodes(&self) -> impl Iterator<Item = (NodeId, &Node<S, T>)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|n| (NodeId(i), n)))
    }
}

// --- Node-level operations (addressed by id) ---

impl<S, T> Tree<S, T> {
    /// Appends a fresh child under `parent` and maintains the caches: a
    /// parent that was a leaf gives up its cache slot to the child, any other
    /// parent gets the child appended after the last leaf of its subtree.
    pub fn add_child(&mut self, parent: NodeId, status: S, data: T) -> Result<NodeId, TreeError> {
        if !self.occupied(parent) {
            return Err(TreeError::InvalidNode(parent));
        }
        if !self.is_in_tree(parent) {
            // growing a detached fragment leaves the tree caches alone
            return Ok(self.spawn_child(parent, status, data));
        }
        let was_leaf = self.node(parent).children.is_empty();
        let slot = if was_leaf {
            self.leaves.iter().position(|&l| l == parent)
        } else {
            self.leaves
                .iter()
                .rposition(|&l| self.is_beneath(l, parent))
                .map(|p| p + 1)
        };
        let id = self.spawn_child(parent, status, data);
        self.size += 1;
        match slot {
            Some(pos) if was_leaf => self.leaves[pos] = id,
            Some(pos) => self.leaves.insert(pos, id),
            None => self.leaves.push(id),
        }
        Ok(id)
    }

    /// Appends a batch of fresh children in order.
    pub fn add_children(
        &mut self,
        parent: NodeId,
        batch: Vec<(S, T)>,
    ) -> Result<Vec<NodeId>, TreeError> {
        batch
            .into_iter()
            .map(|(status, data)| self.add_child(parent, status, data))
            .collect()
    }

    /// Re-links an already allocated, detached node (and its subtree) as the
    /// last child of `parent`. The node must be detached: attach operations
    /// assert this rather than silently re-homing an owned child.
    pub fn attach_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), TreeError> {
        if !self.occupied(parent) {
            return Err(TreeError::InvalidNode(parent));
        }
        if !self.occupied(child) {
            return Err(TreeError::InvalidNode(child));
        }
        if self.node(child).parent.is_some() || Some(child) == self.root {
            return Err(TreeError::StillAttached(child));
        }
        if parent == child || self.is_beneath(parent, child) {
            return Err(TreeError::WouldCycle(child));
        }
        let in_tree = self.is_in_tree(parent);
        let was_leaf = self.node(parent).children.is_empty();
        let slot = if !in_tree {
            None
        } else if was_leaf {
            self.leaves.iter().position(|&l| l == parent)
        } else {
            self.leaves
                .iter()
                .rposition(|&l| self.is_beneath(l, parent))
                .map(|p| p + 1)
        };
        self.node_mut(child).parent = Some(parent);
        self.node_mut(parent).children.push(child);
        if in_tree {
            self.size += self.size_below(child);
            let sub_leaves = self.leaves_below(child);
            match slot {
                Some(pos) if was_leaf => {
                    self.leaves.splice(pos..=pos, sub_leaves);
                }
                Some(pos) => {
                    self.leaves.splice(pos..pos, sub_leaves);
                }
                None => self.leaves.extend(sub_leaves),
            }
        }
        Ok(())
    }

    /// Unlinks `target` from `parent`'s child list (identity match on the
    /// id) and frees its slot. Returns `target`'s own children, now detached
    /// with cleared parent links, so the caller can decide whether to
    /// re-attach them ([`attach_child`](Self::attach_child)), or discard them
    /// ([`discard_subtree`](Self::discard_subtree)). Returns an empty vector
    /// if `target` is not a child of `parent`.
    pub fn delete_child(
        &mut self,
        parent: NodeId,
        target: NodeId,
    ) -> Result<Vec<NodeId>, TreeError> {
        if !self.occupied(parent) {
            return Err(TreeError::InvalidNode(parent));
        }
        let Some(pos) = self.node(parent).children.iter().position(|&c| c == target) else {
            return Ok(Vec::new());
        };
        if self.is_in_tree(parent) {
            self.size -= self.size_below(target);
            let doomed: AHashSet<NodeId> = self.leaves_below(target).into_iter().collect();
            if let Some(first) = self.leaves.iter().position(|l| doomed.contains(l)) {
                self.leaves.retain(|l| !doomed.contains(l));
                if self.node(parent).children.len() == 1 {
                    // parent is losing its only child and becomes a leaf
                    self.leaves.insert(first.min(self.leaves.len()), parent);
                }
            }
        }
        self.node_mut(parent).children.remove(pos);
        let mut orphans = Vec::new();
        if let Some(mut node) = self.release(target) {
            node.parent = None;
            orphans = std::mem::take(&mut node.children);
            for &orphan in &orphans {
                self.node_mut(orphan).parent = None;
            }
        }
        Ok(orphans)
    }

    /// Frees `node` and everything below it, unlinking it from its parent.
    /// Returns the number of nodes freed. Detached fragments can be
    /// discarded the same way; they leave the caches untouched.
    pub fn discard_subtree(&mut self, node: NodeId) -> usize {
        if !self.occupied(node) {
            return 0;
        }
        if Some(node) == self.root {
            let count = self.size;
            self.cleanup();
            return count;
        }
        if self.is_in_tree(node) {
            self.size -= self.size_below(node);
            let doomed: AHashSet<NodeId> = self.leaves_below(node).into_iter().collect();
            let first = self.leaves.iter().position(|l| doomed.contains(l));
            self.leaves.retain(|l| !doomed.contains(l));
            if let (Some(first), Some(parent)) = (first, self.node(node).parent) {
                if self.node(parent).children.len() == 1 {
                    self.leaves.insert(first.min(self.leaves.len()), parent);
                }
            }
        }
        if let Some(parent) = self.node(node).parent {
            let pos = self
                .node(parent)
                .children
                .iter()
                .position(|&c| c == node)
                .expect("child listed under its parent");
            self.node_mut(parent).children.remove(pos);
        }
        self.free_below(node)
    }

    /// The ancestor chain of `node`, root first, excluding `node` itself.
    pub fn ancestors(&self, node: NodeId) -> Vec<NodeId> {
        let mut chain: Vec<NodeId> = self.iter_ancestors(node).skip(1).collect();
        chain.reverse();
        chain
    }

    /// The path from the root down to `node`, both ends included.
    pub fn path_from_root(&self, node: NodeId) -> Vec<NodeId> {
        let mut path: Vec<NodeId> = self.iter_ancestors(node).collect();
        path.reverse();
        path
    }

    /// Every childless node in the subtree of `node`, depth-first.
    /// Uncached: walks the subtree each call.
    pub fn leaves_below(&self, node: NodeId) -> Vec<NodeId> {
        self.iter_preorder(node)
            .filter(|&id| self.node(id).children.is_empty())
            .collect()
    }

    /// The node count of the subtree of `node`. Uncached.
    pub fn size_below(&self, node: NodeId) -> usize {
        self.iter_preorder(node).count()
    }

    /// Walks upward from `node` to the nearest ancestor with more than one
    /// child. Returns `(below, ancestor, found)` where `below` is the child
    /// of `ancestor` on `node`'s path. When no ancestor branches, `ancestor`
    /// is the top of the chain and `found` is false. `None` if `node` has no
    /// parent at all.
    pub fn find_branching_point(&self, node: NodeId) -> Option<(NodeId, NodeId, bool)> {
        let mut below = node;
        let mut current = self.get(node)?.parent?;
        loop {
            if self.node(current).children.len() > 1 {
                return Some((below, current, true));
            }
            match self.node(current).parent {
                Some(parent) => {
                    below = current;
                    current = parent;
                }
                None => return Some((below, current, false)),
            }
        }
    }

    /// Deep-copies the subtree of `node` into a fresh tree. The copy's root
    /// is always detached, whatever `node`'s parent was.
    pub fn copy_subtree(&self, node: NodeId) -> Option<Tree<S, T>>
    where
        S: Clone,
        T: Clone,
    {
        self.get(node)?;
        let order: Vec<NodeId> = self.iter_preorder(node).collect();
        let mut out = Tree::empty();
        let mut map: Vec<Option<NodeId>> = vec![None; self.slots.len()];
        for &old in &order {
            let n = self.node(old);
            let new_id = out.alloc(Node::detached(n.status.clone(), n.data.clone()));
            map[old.0] = Some(new_id);
        }
        for &old in &order {
            let new_id = map[old.0].expect("subtree node was copied");
            let children: Vec<NodeId> = self
                .node(old)
                .children
                .iter()
                .map(|c| map[c.0].expect("children follow parents in preorder"))
                .collect();
            for &c in &children {
                out.node_mut(c).parent = Some(new_id);
            }
            out.node_mut(new_id).children = children;
        }
        out.root = map[node.0];
        out.regenerate_leaves();
        Some(out)
    }
}

// --- Tree-level mutation ---

impl<S, T> Tree<S, T> {
    /// Replaces the root's entire child list with the given subtrees, in
    /// order. Existing children are freed. Empty subtrees are filtered out;
    /// an entirely empty batch is a no-op. The leaf cache becomes the
    /// concatenation of the subtrees' leaf caches and `size` is recomputed
    /// as one plus the subtree sizes.
    pub fn set_children(&mut self, subtrees: Vec<Tree<S, T>>) -> Result<(), TreeError> {
        let root = self.root.ok_or(TreeError::MissingRoot)?;
        let subtrees: Vec<Tree<S, T>> = subtrees.into_iter().filter(|t| !t.is_empty()).collect();
        if subtrees.is_empty() {
            return Ok(());
        }
        for child in self.node(root).children.clone() {
            self.free_below(child);
        }
        self.node_mut(root).children.clear();
        let mut leaves = Vec::new();
        let mut size = 1;
        for sub in subtrees {
            size += sub.size;
            let (_, sub_leaves) = self.graft(sub, root);
            leaves.extend(sub_leaves);
        }
        self.leaves = leaves;
        self.size = size;
        Ok(())
    }

    /// Moves every node of `other` into this arena, re-parented under
    /// `under`. Returns the grafted root and the mapped leaf cache.
    fn graft(&mut self, mut other: Tree<S, T>, under: NodeId) -> (NodeId, Vec<NodeId>) {
        let other_root = other.root.expect("grafted subtree has a root");
        let order: Vec<NodeId> = other.iter_preorder(other_root).collect();
        let mut map: Vec<Option<NodeId>> = vec![None; other.slots.len()];
        let mut moved: Vec<(NodeId, Vec<NodeId>)> = Vec::new();
        for old in order {
            let node = other.release(old).expect("subtree nodes are occupied");
            let new_id = self.alloc(Node::detached(node.status, node.data));
            map[old.0] = Some(new_id);
            moved.push((new_id, node.children));
        }
        for (new_id, old_children) in moved {
            let children: Vec<NodeId> = old_children
                .iter()
                .map(|c| map[c.0].expect("children follow parents in preorder"))
                .collect();
            for &c in &children {
                self.node_mut(c).parent = Some(new_id);
            }
            self.node_mut(new_id).children = children;
        }
        let new_root = map[other_root.0].expect("root was grafted");
        self.node_mut(new_root).parent = Some(under);
        self.node_mut(under).children.push(new_root);
        let leaves = other.leaves.iter().filter_map(|l| map[l.0]).collect();
        (new_root, leaves)
    }

    /// Deletes the whole subtree of every node matching `filter`. A matching
    /// root empties the tree and returns `Ok(true)`; otherwise the leaf
    /// cache is repaired from the highest common ancestor of the pruned
    /// sites and the result is `Ok(false)`.
    pub fn prune_branches<F>(&mut self, filter: F) -> Result<bool, TreeError>
    where
        F: Fn(&S, &T) -> bool,
    {
        let root = self.root.ok_or(TreeError::MissingRoot)?;
        {
            let n = self.node(root);
            if filter(&n.status, &n.data) {
                self.cleanup();
                return Ok(true);
            }
        }
        let mut sites: Vec<NodeId> = Vec::new();
        let mut removed = 0usize;
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            for child in self.node(id).children.clone() {
                let hit = {
                    let n = self.node(child);
                    filter(&n.status, &n.data)
                };
                if hit {
                    let pos = self
                        .node(id)
                        .children
                        .iter()
                        .position(|&c| c == child)
                        .expect("child listed under its parent");
                    self.node_mut(id).children.remove(pos);
                    removed += self.free_below(child);
                    sites.push(id);
                } else {
                    stack.push(child);
                }
            }
        }
        if sites.is_empty() {
            return Ok(false);
        }
        self.size -= removed;
        let mut unique = AHashSet::new();
        sites.retain(|site| unique.insert(*site));
        let top = self.common_ancestor(&sites);
        self.patch_leaves_below(top);
        Ok(false)
    }

    fn common_ancestor(&self, nodes: &[NodeId]) -> NodeId {
        let mut prefix = self.path_from_root(nodes[0]);
        for &node in &nodes[1..] {
            let path = self.path_from_root(node);
            let shared = prefix
                .iter()
                .zip(path.iter())
                .take_while(|(a, b)| a == b)
                .count();
            prefix.truncate(shared);
        }
        *prefix.last().expect("sites share the tree's root")
    }

    /// Replaces the cache entries that sat under `top` with a fresh walk of
    /// `top`'s subtree. Assumes the cache was clean before the mutation, so
    /// the stale entries (freed ids included) form one contiguous block.
    fn patch_leaves_below(&mut self, top: NodeId) {
        let fresh = self.leaves_below(top);
        let in_block =
            |tree: &Self, l: NodeId| !tree.occupied(l) || l == top || tree.is_beneath(l, top);
        let Some(start) = self.leaves.iter().position(|&l| in_block(self, l)) else {
            // cache was already stale, fall back to the full walk
            self.regenerate_leaves();
            return;
        };
        let end = self
            .leaves
            .iter()
            .rposition(|&l| in_block(self, l))
            .expect("a first position implies a last")
            + 1;
        self.leaves.splice(start..end, fresh);
    }

    /// Excises every node matching `filter` while keeping its subtree: the
    /// children are spliced into the former parent's child list at the same
    /// position. The walk runs leaf-upward from the current leaf cache,
    /// marking nodes seen so none is tested twice. Excising the root splits
    /// the tree into a forest, one tree per surviving top-level fragment;
    /// if the root survives, the returned vector holds just the mutated
    /// original.
    pub fn skip_filter<F>(mut self, filter: F) -> Vec<Tree<S, T>>
    where
        F: Fn(&S, &T) -> bool,
    {
        let Some(root) = self.root else {
            return vec![self];
        };
        let mut queue: VecDeque<NodeId> = self.leaves.iter().copied().collect();
        let mut seen: BitVec = BitVec::repeat(false, self.slots.len());
        let mut matched: Vec<NodeId> = Vec::new();
        while let Some(id) = queue.pop_front() {
            if seen[id.0] {
                continue;
            }
            seen.set(id.0, true);
            let n = self.node(id);
            if filter(&n.status, &n.data) {
                matched.push(id);
            }
            if let Some(parent) = n.parent {
                if !seen[parent.0] {
                    queue.push_back(parent);
                }
            }
        }
        if matched.is_empty() {
            return vec![self];
        }
        let mut tops = vec![root];
        for id in matched {
            let children = self.node(id).children.clone();
            match self.node(id).parent {
                Some(parent) => {
                    let pos = self
                        .node(parent)
                        .children
                        .iter()
                        .position(|&c| c == id)
                        .expect("child listed under its parent");
                    for &c in &children {
                        self.node_mut(c).parent = Some(parent);
                    }
                    self.node_mut(parent).children.splice(pos..=pos, children);
                }
                None => {
                    let pos = tops
                        .iter()
                        .position(|&t| t == id)
                        .expect("detached skip target is a top fragment");
                    for &c in &children {
                        self.node_mut(c).parent = None;
                    }
                    tops.splice(pos..=pos, children);
                }
            }
            self.release(id);
            self.size -= 1;
        }
        if tops.len() == 1 && tops[0] == root && self.occupied(root) {
            self.regenerate_leaves();
            return vec![self];
        }
        tops.into_iter().map(|top| self.carve(top)).collect()
    }

    /// Moves the subtree of `top` out into its own tree. The caller is
    /// responsible for whatever `top`'s links meant in this arena.
    fn carve(&mut self, top: NodeId) -> Tree<S, T> {
        let order: Vec<NodeId> = self.iter_preorder(top).collect();
        let mut out = Tree::empty();
        let mut map: Vec<Option<NodeId>> = vec![None; self.slots.len()];
        let mut moved: Vec<(NodeId, Vec<NodeId>)> = Vec::new();
        for old in order {
            let node = self.release(old).expect("carved nodes are occupied");
            let new_id = out.alloc(Node::detached(node.status, node.data));
            map[old.0] = Some(new_id);
            moved.push((new_id, node.children));
        }
        for (new_id, old_children) in moved {
            let children: Vec<NodeId> = old_children
                .iter()
                .map(|c| map[c.0].expect("children follow parents in preorder"))
                .collect();
            for &c in &children {
                out.node_mut(c).parent = Some(new_id);
            }
            out.node_mut(new_id).children = children;
        }
        out.root = map[top.0];
        out.regenerate_leaves();
        out
    }

    /// Applies `f` to every current leaf in leaf order. A non-empty batch of
    /// `(status, data)` descriptors expands the leaf in place: the new
    /// children take over the leaf's cache slot and `size` grows by the
    /// batch length. An error aborts the walk immediately; leaves already
    /// expanded stay expanded (no rollback; callers wanting atomicity wrap
    /// the call in a command and undo on failure).
    pub fn process_leaves<F>(&mut self, mut f: F) -> Result<(), TreeError>
    where
        F: FnMut(&S, &T) -> Result<Vec<(S, T)>, TreeError>,
    {
        if self.root.is_none() {
            return Err(TreeError::MissingRoot);
        }
        let old = std::mem::take(&mut self.leaves);
        let mut done: Vec<NodeId> = Vec::new();
        for (i, &leaf) in old.iter().enumerate() {
            let spawned = {
                let n = self.node(leaf);
                match f(&n.status, &n.data) {
                    Ok(batch) => batch,
                    Err(e) => {
                        done.extend_from_slice(&old[i..]);
                        self.leaves = done;
                        return Err(e);
                    }
                }
            };
            if spawned.is_empty() {
                done.push(leaf);
                continue;
            }
            self.size += spawned.len();
            for (status, data) in spawned {
                let id = self.spawn_child(leaf, status, data);
                done.push(id);
            }
        }
        self.leaves = done;
        Ok(())
    }

    /// Deletes the exclusive branch containing `node`: the chain from the
    /// nearest branching ancestor (or the root) down through `node`'s
    /// subtree. Fails with [`TreeError::NodeNotInTree`] when `node` does not
    /// hang off this tree's root. Deleting the branch of the root itself
    /// empties the tree. Regenerates the caches in full.
    pub fn delete_branch_containing(&mut self, node: NodeId) -> Result<(), TreeError> {
        let root = self.root.ok_or(TreeError::MissingRoot)?;
        if !self.occupied(node) {
            return Err(TreeError::NodeNotInTree(node));
        }
        if node == root {
            self.cleanup();
            return Ok(());
        }
        let top = self
            .iter_ancestors(node)
            .last()
            .expect("occupied node has an ancestor chain");
        if top != root {
            return Err(TreeError::NodeNotInTree(node));
        }
        let (below, ancestor, _) = self
            .find_branching_point(node)
            .expect("attached non-root node has a parent");
        let pos = self
            .node(ancestor)
            .children
            .iter()
            .position(|&c| c == below)
            .expect("branch child listed under its ancestor");
        self.node_mut(ancestor).children.remove(pos);
        self.free_below(below);
        self.regenerate_leaves();
        Ok(())
    }

    /// Repeatedly searches (BFS) for a node matching `filter` and deletes
    /// its containing branch, until no match remains or the tree is empty.
    /// Returns `Ok(true)` when nothing ever matched.
    pub fn prune<F>(&mut self, filter: F) -> Result<bool, TreeError>
    where
        F: Fn(&S, &T) -> bool,
    {
        let mut untouched = true;
        while self.root.is_some() {
            let Some(hit) = self.search_nodes(&filter) else {
                break;
            };
            untouched = false;
            self.delete_branch_containing(hit)?;
        }
        Ok(untouched)
    }

    /// Detaches every node. The tree returns to the empty state and all
    /// outstanding ids become invalid.
    pub fn cleanup(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.root = None;
        self.leaves.clear();
        self.size = 0;
    }
}

// --- Branch surgery ---

impl<S, T> Tree<S, T> {
    /// Builds the root-to-`leaf` spine as an owned [`Branch`]. Returns
    /// `None` (no mutation) unless `leaf` is a current cached leaf. With
    /// `delete`, the branch's exclusive material is removed from the tree
    /// and the caches are regenerated.
    pub fn extract_branch(&mut self, leaf: NodeId, delete: bool) -> Option<Branch<S, T>>
    where
        S: Clone,
        T: Clone,
    {
        if !self.leaves.contains(&leaf) {
            return None;
        }
        let spine: Vec<(S, T)> = self
            .path_from_root(leaf)
            .into_iter()
            .map(|id| {
                let n = self.node(id);
                (n.status.clone(), n.data.clone())
            })
            .collect();
        if delete {
            self.delete_branch_containing(leaf).ok()?;
        }
        Some(Branch::from_pairs(spine))
    }

    /// Grafts a branch back in. An empty tree adopts the branch outright.
    /// Otherwise the longest prefix of the spine already present (compared
    /// by status and payload, walking matching children) is skipped and only
    /// the non-overlapping suffix is attached; a spine whose start does not
    /// match the root fails without mutating. Returns whether the tree's
    /// size changed.
    pub fn insert_branch(&mut self, branch: Branch<S, T>) -> bool
    where
        S: PartialEq,
        T: PartialEq,
    {
        let spine = branch.into_spine();
        if spine.is_empty() {
            return false;
        }
        let Some(root) = self.root else {
            let mut pairs = spine.into_iter();
            let (status, data) = pairs.next().expect("non-empty spine");
            *self = Tree::new(status, data);
            let mut current = self.root.expect("fresh tree has a root");
            for (status, data) in pairs {
                current = self.spawn_child(current, status, data);
            }
            self.regenerate_leaves();
            return true;
        };
        {
            let n = self.node(root);
            if n.status != spine[0].0 || n.data != spine[0].1 {
                return false;
            }
        }
        let mut current = root;
        let mut idx = 1;
        'walk: while idx < spine.len() {
            let (status, data) = &spine[idx];
            for &child in self.node(current).children.iter() {
                let n = self.node(child);
                if n.status == *status && n.data == *data {
                    current = child;
                    idx += 1;
                    continue 'walk;
                }
            }
            break;
        }
        if idx == spine.len() {
            return false;
        }
        for (status, data) in spine.into_iter().skip(idx) {
            current = self.spawn_child(current, status, data);
        }
        self.regenerate_leaves();
        true
    }
}

// --- Leaf cache maintenance and queries ---

impl<S, T> Tree<S, T> {
    /// Rebuilds `leaves` and `size` with a full depth-first walk from the
    /// root. Safe after arbitrary structural changes.
    pub fn regenerate_leaves(&mut self) {
        let Some(root) = self.root else {
            self.leaves.clear();
            self.size = 0;
            return;
        };
        let mut leaves = Vec::new();
        let mut count = 0;
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            count += 1;
            let node = self.node(id);
            if node.children.is_empty() {
                leaves.push(id);
            } else {
                for &child in node.children.iter().rev() {
                    stack.push(child);
                }
            }
        }
        self.leaves = leaves;
        self.size = count;
    }

    /// Walks outward from the previous leaf set only, replacing each cached
    /// leaf that has since grown children with its current leaves. Cheaper
    /// than [`regenerate_leaves`](Self::regenerate_leaves), but gives wrong
    /// results if nodes were deleted out from under the cache.
    pub fn update_leaves(&mut self) {
        if self.root.is_none() {
            self.leaves.clear();
            self.size = 0;
            return;
        }
        let old = std::mem::take(&mut self.leaves);
        let mut fresh = Vec::new();
        let mut grown = 0;
        for leaf in old {
            if !self.occupied(leaf) {
                continue;
            }
            let mut stack = vec![leaf];
            while let Some(id) = stack.pop() {
                if id != leaf {
                    grown += 1;
                }
                let node = self.node(id);
                if node.children.is_empty() {
                    fresh.push(id);
                } else {
                    for &child in node.children.iter().rev() {
                        stack.push(child);
                    }
                }
            }
        }
        self.leaves = fresh;
        self.size += grown;
    }

    /// Every root-to-leaf path as `(status, data)` pairs, one path per leaf,
    /// in leaf order.
    pub fn snake_traversal(&self) -> Vec<Vec<(S, T)>>
    where
        S: Clone,
        T: Clone,
    {
        self.leaves
            .iter()
            .map(|&leaf| {
                self.path_from_root(leaf)
                    .into_iter()
                    .map(|id| {
                        let n = self.node(id);
                        (n.status.clone(), n.data.clone())
                    })
                    .collect()
            })
            .collect()
    }

    /// BFS from the root, first node matching `filter`. `None` is the
    /// ordinary no-match outcome, not an error.
    pub fn search_nodes<F>(&self, filter: F) -> Option<NodeId>
    where
        F: Fn(&S, &T) -> bool,
    {
        let root = self.root?;
        self.iter_bfs(root).find(|&id| {
            let n = self.node(id);
            filter(&n.status, &n.data)
        })
    }

    /// BFS from the root, every node matching `filter`.
    pub fn filter_children<F>(&self, filter: F) -> Vec<NodeId>
    where
        F: Fn(&S, &T) -> bool,
    {
        let Some(root) = self.root else {
            return Vec::new();
        };
        self.iter_bfs(root)
            .filter(|&id| {
                let n = self.node(id);
                filter(&n.status, &n.data)
            })
            .collect()
    }

    pub(crate) fn restore_cache(&mut self, leaves: Vec<NodeId>, size: usize) {
        self.leaves = leaves;
        self.size = size;
    }
}

// --- Payload mapping ---

impl<S, T> Tree<S, T> {
    /// Consumes the tree, transforming every payload while keeping the
    /// structure, statuses, ids, and caches intact.
    pub fn map<U, F>(self, mut transform: F) -> Tree<S, U>
    where
        F: FnMut(T) -> U,
    {
        Tree {
            slots: self
                .slots
                .into_iter()
                .map(|slot| {
                    slot.map(|n| Node {
                        status: n.status,
                        data: transform(n.data),
                        parent: n.parent,
                        children: n.children,
                    })
                })
                .collect(),
            free: self.free,
            root: self.root,
            leaves: self.leaves,
            size: self.size,
        }
    }

    /// As [`map`](Self::map), borrowing the tree.
    pub fn map_ref<U, F>(&self, mut transform: F) -> Tree<S, U>
    where
        F: FnMut(&T) -> U,
        S: Clone,
    {
        Tree {
            slots: self
                .slots
                .iter()
                .map(|slot| {
                    slot.as_ref().map(|n| Node {
                        status: n.status.clone(),
                        data: transform(&n.data),
                        parent: n.parent,
                        children: n.children.clone(),
                    })
                })
                .collect(),
            free: self.free.clone(),
            root: self.root,
            leaves: self.leaves.clone(),
            size: self.size,
        }
    }
}

// --- Diagnostics ---

impl<S, T> Tree<S, T> {
    /// Structural self-check for the clean state: parent/child symmetry,
    /// acyclicity, no unreachable occupied slots, and caches that match a
    /// fresh walk. Intended for tests and debugging assertions.
    pub fn validate(&self) -> Result<(), TreeError> {
        let Some(root) = self.root else {
            if self.size != 0 {
                return Err(TreeError::SizeDrift {
                    cached: self.size,
                    counted: 0,
                });
            }
            if !self.leaves.is_empty() {
                return Err(TreeError::LeafCacheDrift);
            }
            return Ok(());
        };
        if !self.occupied(root) {
            return Err(TreeError::InvalidNode(root));
        }
        if self.node(root).parent.is_some() {
            return Err(TreeError::BrokenParentLink(root));
        }
        let mut seen: BitVec = BitVec::repeat(false, self.slots.len());
        let mut count = 0;
        let mut leaves = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if seen[id.0] {
                return Err(TreeError::CyclicLink(id));
            }
            seen.set(id.0, true);
            count += 1;
            let children = self.node(id).children.clone();
            if children.iter().duplicates().next().is_some() {
                return Err(TreeError::BrokenParentLink(id));
            }
            for &child in &children {
                if !self.occupied(child) {
                    return Err(TreeError::InvalidNode(child));
                }
                if self.node(child).parent != Some(id) {
                    return Err(TreeError::BrokenParentLink(child));
                }
            }
            if children.is_empty() {
                leaves.push(id);
            } else {
                for &child in children.iter().rev() {
                    stack.push(child);
                }
            }
        }
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.is_some() && !seen[i] {
                return Err(TreeError::OrphanNode(NodeId(i)));
            }
        }
        if count != self.size {
            return Err(TreeError::SizeDrift {
                cached: self.size,
                counted: count,
            });
        }
        if leaves != self.leaves {
            return Err(TreeError::LeafCacheDrift);
        }
        Ok(())
    }

    /// Renders the tree with box-drawing connectors, one node per line,
    /// formatted by `node_display`.
    pub fn debug_draw(&self, mut node_display: impl FnMut(&S, &T) -> String) -> String {
        let mut output = String::new();
        writeln!(output, "Number of nodes:{}", self.size).unwrap();
        let Some(root) = self.root else {
            return output;
        };
        {
            let n = self.node(root);
            writeln!(output, "  {root}:{}", node_display(&n.status, &n.data)).unwrap();
        }
        let mut stack: Vec<(NodeId, String, bool)> = Vec::new();
        let children = self.node(root).children.clone();
        let num = children.len();
        for (i, child) in children.into_iter().enumerate().rev() {
            stack.push((child, "  ".to_string(), i == num - 1));
        }
        while let Some((id, prefix, is_last)) = stack.pop() {
            let connector = if is_last { "└── " } else { "├── " };
            {
                let n = self.node(id);
                writeln!(
                    output,
                    "{prefix}{connector}{id}:{}",
                    node_display(&n.status, &n.data)
                )
                .unwrap();
            }
            let child_prefix = format!("{}{}", prefix, if is_last { "    " } else { "│   " });
            let children = self.node(id).children.clone();
            let num = children.len();
            for (i, child) in children.into_iter().enumerate().rev() {
                stack.push((child, child_prefix.clone(), i == num - 1));
            }
        }
        output
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq as sim_assert_eq;

    use super::{Tree, TreeError};

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Eval {
        Todo,
        Done,
    }

    fn singleton(data: &'static str) -> Tree<Eval, &'static str> {
        Tree::new(Eval::Todo, data)
    }

    /// R with children A, B, C attached via `set_children`.
    fn scenario_a() -> Tree<Eval, &'static str> {
        let mut tree = singleton("R");
        tree.set_children(vec![singleton("A"), singleton("B"), singleton("C")])
            .unwrap();
        tree
    }

    fn leaf_data(tree: &Tree<Eval, &'static str>) -> Vec<&'static str> {
        tree.get_leaves()
            .iter()
            .map(|&l| *tree.data(l).unwrap())
            .collect()
    }

    #[test]
    fn set_children_builds_flat_tree() {
        let tree = scenario_a();
        assert_eq!(tree.size(), 4);
        sim_assert_eq!(leaf_data(&tree), vec!["A", "B", "C"]);
        tree.validate().unwrap();
    }

    #[test]
    fn set_children_requires_root() {
        let mut tree: Tree<Eval, &'static str> = Tree::empty();
        assert_eq!(
            tree.set_children(vec![singleton("A")]),
            Err(TreeError::MissingRoot)
        );
    }

    #[test]
    fn set_children_ignores_empty_input() {
        let mut tree = scenario_a();
        tree.set_children(vec![]).unwrap();
        tree.set_children(vec![Tree::empty()]).unwrap();
        assert_eq!(tree.size(), 4);
        sim_assert_eq!(leaf_data(&tree), vec!["A", "B", "C"]);
    }

    #[test]
    fn set_children_replaces_existing_children() {
        let mut tree = scenario_a();
        tree.set_children(vec![singleton("X")]).unwrap();
        assert_eq!(tree.size(), 2);
        sim_assert_eq!(leaf_data(&tree), vec!["X"]);
        tree.validate().unwrap();
    }

    #[test]
    fn prune_branches_deletes_matching_subtrees() {
        let mut tree = scenario_a();
        let wiped = tree.prune_branches(|_, d| *d == "B").unwrap();
        assert!(!wiped);
        assert_eq!(tree.size(), 3);
        sim_assert_eq!(leaf_data(&tree), vec!["A", "C"]);
        tree.validate().unwrap();
    }

    #[test]
    fn prune_branches_takes_descendants_along() {
        let mut tree = scenario_a();
        let b = tree.search_nodes(|_, d| *d == "B").unwrap();
        tree.add_child(b, Eval::Todo, "B1").unwrap();
        tree.add_child(b, Eval::Todo, "B2").unwrap();
        let wiped = tree.prune_branches(|_, d| *d == "B").unwrap();
        assert!(!wiped);
        assert_eq!(tree.size(), 3);
        sim_assert_eq!(leaf_data(&tree), vec!["A", "C"]);
        tree.validate().unwrap();
    }

    #[test]
    fn prune_branches_matching_root_empties_tree() {
        let mut tree = scenario_a();
        let wiped = tree.prune_branches(|_, d| *d == "R").unwrap();
        assert!(wiped);
        assert!(tree.is_empty());
        assert_eq!(tree.size(), 0);
        tree.validate().unwrap();
    }

    #[test]
    fn skip_filter_excises_leaf() {
        let tree = scenario_a();
        let forest = tree.skip_filter(|_, d| *d == "A");
        assert_eq!(forest.len(), 1);
        let tree = &forest[0];
        assert_eq!(tree.size(), 3);
        sim_assert_eq!(leaf_data(tree), vec!["B", "C"]);
        tree.validate().unwrap();
    }

    #[test]
    fn skip_filter_splices_children_in_place() {
        let mut tree = scenario_a();
        let b = tree.search_nodes(|_, d| *d == "B").unwrap();
        tree.add_child(b, Eval::Todo, "B1").unwrap();
        tree.add_child(b, Eval::Todo, "B2").unwrap();
        let forest = tree.skip_filter(|_, d| *d == "B");
        assert_eq!(forest.len(), 1);
        let tree = &forest[0];
        assert_eq!(tree.size(), 5);
        sim_assert_eq!(leaf_data(tree), vec!["A", "B1", "B2", "C"]);
        tree.validate().unwrap();
    }

    #[test]
    fn skip_filter_on_root_returns_forest() {
        let tree = scenario_a();
        let forest = tree.skip_filter(|_, d| *d == "R");
        assert_eq!(forest.len(), 3);
        let data: Vec<&'static str> = forest
            .iter()
            .map(|t| *t.data(t.root().unwrap()).unwrap())
            .collect();
        sim_assert_eq!(data, vec!["A", "B", "C"]);
        for tree in &forest {
            assert_eq!(tree.size(), 1);
            tree.validate().unwrap();
        }
    }

    #[test]
    fn skip_filter_without_match_returns_tree_unchanged() {
        let tree = scenario_a();
        let forest = tree.skip_filter(|_, _| false);
        assert_eq!(forest.len(), 1);
        assert_eq!(forest[0].size(), 4);
    }

    #[test]
    fn process_leaves_expands_in_place() {
        let mut tree = scenario_a();
        tree.process_leaves(|_, d| {
            if *d == "B" {
                Ok(vec![(Eval::Todo, "B1"), (Eval::Todo, "B2")])
            } else {
                Ok(vec![])
            }
        })
        .unwrap();
        assert_eq!(tree.size(), 6);
        sim_assert_eq!(leaf_data(&tree), vec!["A", "B1", "B2", "C"]);
        tree.validate().unwrap();
    }

    #[test]
    fn process_leaves_error_keeps_partial_expansion() {
        let mut tree = scenario_a();
        let err = tree
            .process_leaves(|_, d| match *d {
                "A" => Ok(vec![(Eval::Todo, "A1")]),
                "B" => Err(TreeError::LeafProcessing("boom".into())),
                _ => Ok(vec![]),
            })
            .unwrap_err();
        assert_eq!(err, TreeError::LeafProcessing("boom".into()));
        // A stayed expanded, the rest of the walk never ran
        assert_eq!(tree.size(), 5);
        sim_assert_eq!(leaf_data(&tree), vec!["A1", "B", "C"]);
        tree.validate().unwrap();
    }

    #[test]
    fn delete_branch_containing_child() {
        let mut tree = scenario_a();
        let b = tree.search_nodes(|_, d| *d == "B").unwrap();
        tree.delete_branch_containing(b).unwrap();
        assert_eq!(tree.size(), 3);
        sim_assert_eq!(leaf_data(&tree), vec!["A", "C"]);
        assert_eq!(tree.parent(b), None);
        tree.validate().unwrap();
    }

    #[test]
    fn delete_branch_stops_at_branching_point() {
        // R -> A -> [C, D], R -> B; the branch containing C is just C
        let mut tree = singleton("R");
        let r = tree.root().unwrap();
        let a = tree.add_child(r, Eval::Todo, "A").unwrap();
        tree.add_child(r, Eval::Todo, "B").unwrap();
        let c = tree.add_child(a, Eval::Todo, "C").unwrap();
        tree.add_child(a, Eval::Todo, "D").unwrap();
        tree.delete_branch_containing(c).unwrap();
        assert_eq!(tree.size(), 4);
        sim_assert_eq!(leaf_data(&tree), vec!["D", "B"]);
        tree.validate().unwrap();
    }

    #[test]
    fn delete_branch_of_root_empties_tree() {
        let mut tree = scenario_a();
        let r = tree.root().unwrap();
        tree.delete_branch_containing(r).unwrap();
        assert!(tree.is_empty());
        tree.validate().unwrap();
    }

    #[test]
    fn delete_branch_rejects_stale_node() {
        let mut tree = scenario_a();
        let b = tree.search_nodes(|_, d| *d == "B").unwrap();
        tree.delete_branch_containing(b).unwrap();
        // b's slot is vacated now
        assert_eq!(
            tree.delete_branch_containing(b),
            Err(TreeError::NodeNotInTree(b))
        );
        let out_of_range = crate::tree::NodeId(17);
        assert_eq!(
            tree.delete_branch_containing(out_of_range),
            Err(TreeError::NodeNotInTree(out_of_range))
        );
    }

    #[test]
    fn prune_with_no_match_is_a_no_op() {
        let mut tree = scenario_a();
        let untouched = tree.prune(|_, _| false).unwrap();
        assert!(untouched);
        assert_eq!(tree.size(), 4);
        sim_assert_eq!(leaf_data(&tree), vec!["A", "B", "C"]);
    }

    #[test]
    fn prune_deletes_containing_branches_until_clean() {
        // R -> A -> [C, D], R -> B
        let mut tree = singleton("R");
        let r = tree.root().unwrap();
        let a = tree.add_child(r, Eval::Todo, "A").unwrap();
        tree.add_child(r, Eval::Todo, "B").unwrap();
        tree.add_child(a, Eval::Todo, "C").unwrap();
        tree.add_child(a, Eval::Todo, "D").unwrap();
        let untouched = tree.prune(|_, d| *d == "C").unwrap();
        assert!(!untouched);
        assert_eq!(tree.size(), 4);
        sim_assert_eq!(leaf_data(&tree), vec!["D", "B"]);
        tree.validate().unwrap();
    }

    #[test]
    fn prune_matching_root_empties_tree() {
        let mut tree = scenario_a();
        let untouched = tree.prune(|_, d| *d == "R").unwrap();
        assert!(!untouched);
        assert!(tree.is_empty());
    }

    #[test]
    fn extract_then_insert_restores_size_and_leaf_set() {
        let mut tree = scenario_a();
        let b = tree.search_nodes(|_, d| *d == "B").unwrap();
        let branch = tree.extract_branch(b, true).unwrap();
        assert_eq!(branch.len(), 2);
        assert_eq!(tree.size(), 3);
        assert!(tree.insert_branch(branch));
        assert_eq!(tree.size(), 4);
        let mut data = leaf_data(&tree);
        data.sort_unstable();
        sim_assert_eq!(data, vec!["A", "B", "C"]);
        tree.validate().unwrap();
    }

    #[test]
    fn extract_branch_requires_current_leaf() {
        let mut tree = scenario_a();
        let r = tree.root().unwrap();
        assert!(tree.extract_branch(r, false).is_none());
        assert_eq!(tree.size(), 4);
    }

    #[test]
    fn extract_without_delete_leaves_tree_alone() {
        let mut tree = scenario_a();
        let b = tree.search_nodes(|_, d| *d == "B").unwrap();
        let branch = tree.extract_branch(b, false).unwrap();
        assert_eq!(branch.to(), Some(&(Eval::Todo, "B")));
        assert_eq!(tree.size(), 4);
        tree.validate().unwrap();
    }

    #[test]
    fn insert_branch_into_empty_tree_adopts_it() {
        let mut tree: Tree<Eval, &'static str> = Tree::empty();
        let branch = crate::tree::Branch::from_pairs(vec![
            (Eval::Todo, "R"),
            (Eval::Todo, "A"),
            (Eval::Done, "L"),
        ]);
        assert!(tree.insert_branch(branch));
        assert_eq!(tree.size(), 3);
        sim_assert_eq!(leaf_data(&tree), vec!["L"]);
        tree.validate().unwrap();
    }

    #[test]
    fn insert_branch_without_overlap_fails() {
        let mut tree = scenario_a();
        let branch = crate::tree::Branch::from_pairs(vec![(Eval::Todo, "X"), (Eval::Todo, "Y")]);
        assert!(!tree.insert_branch(branch));
        assert_eq!(tree.size(), 4);
    }

    #[test]
    fn insert_branch_fully_overlapping_changes_nothing() {
        let mut tree = scenario_a();
        let branch = crate::tree::Branch::from_pairs(vec![(Eval::Todo, "R"), (Eval::Todo, "B")]);
        assert!(!tree.insert_branch(branch));
        assert_eq!(tree.size(), 4);
    }

    #[test]
    fn insert_branch_attaches_suffix_past_overlap() {
        let mut tree = scenario_a();
        let branch = crate::tree::Branch::from_pairs(vec![
            (Eval::Todo, "R"),
            (Eval::Todo, "B"),
            (Eval::Done, "B1"),
        ]);
        assert!(tree.insert_branch(branch));
        assert_eq!(tree.size(), 5);
        sim_assert_eq!(leaf_data(&tree), vec!["A", "B1", "C"]);
        tree.validate().unwrap();
    }

    #[test]
    fn add_child_keeps_leaf_cache_in_dfs_order() {
        let mut tree = singleton("R");
        let r = tree.root().unwrap();
        let a = tree.add_child(r, Eval::Todo, "A").unwrap();
        tree.add_child(r, Eval::Todo, "B").unwrap();
        tree.add_child(a, Eval::Todo, "C").unwrap();
        assert_eq!(tree.size(), 4);
        sim_assert_eq!(leaf_data(&tree), vec!["C", "B"]);
        tree.validate().unwrap();
    }

    #[test]
    fn delete_child_returns_orphans() {
        let mut tree = singleton("R");
        let r = tree.root().unwrap();
        let a = tree.add_child(r, Eval::Todo, "A").unwrap();
        let c = tree.add_child(a, Eval::Todo, "C").unwrap();
        let d = tree.add_child(a, Eval::Todo, "D").unwrap();
        let orphans = tree.delete_child(r, a).unwrap();
        assert_eq!(orphans, vec![c, d]);
        assert_eq!(tree.size(), 1);
        assert_eq!(tree.parent(c), None);
        // the orphan fragments still occupy slots until discarded
        assert_eq!(tree.discard_subtree(c), 1);
        assert_eq!(tree.discard_subtree(d), 1);
        tree.validate().unwrap();
        sim_assert_eq!(leaf_data(&tree), vec!["R"]);
    }

    #[test]
    fn delete_child_ignores_non_child_target() {
        let mut tree = scenario_a();
        let b = tree.search_nodes(|_, d| *d == "B").unwrap();
        let c = tree.search_nodes(|_, d| *d == "C").unwrap();
        assert_eq!(tree.delete_child(b, c).unwrap(), vec![]);
        assert_eq!(tree.size(), 4);
    }

    #[test]
    fn attach_child_relinks_detached_fragment() {
        let mut tree = singleton("R");
        let r = tree.root().unwrap();
        let a = tree.add_child(r, Eval::Todo, "A").unwrap();
        let c = tree.add_child(a, Eval::Todo, "C").unwrap();
        let orphans = tree.delete_child(r, a).unwrap();
        assert_eq!(orphans, vec![c]);
        tree.attach_child(r, c).unwrap();
        assert_eq!(tree.size(), 2);
        sim_assert_eq!(leaf_data(&tree), vec!["C"]);
        tree.validate().unwrap();
        // a second attach must fail: c now has an owner
        assert_eq!(tree.attach_child(r, c), Err(TreeError::StillAttached(c)));
    }

    #[test]
    fn ancestors_are_root_first() {
        let mut tree = singleton("R");
        let r = tree.root().unwrap();
        let a = tree.add_child(r, Eval::Todo, "A").unwrap();
        let c = tree.add_child(a, Eval::Todo, "C").unwrap();
        assert_eq!(tree.ancestors(c), vec![r, a]);
        assert_eq!(tree.ancestors(r), vec![]);
    }

    #[test]
    fn branching_point_walks_past_single_child_chain() {
        // R -> [A -> X -> Y, B]
        let mut tree = singleton("R");
        let r = tree.root().unwrap();
        let a = tree.add_child(r, Eval::Todo, "A").unwrap();
        tree.add_child(r, Eval::Todo, "B").unwrap();
        let x = tree.add_child(a, Eval::Todo, "X").unwrap();
        let y = tree.add_child(x, Eval::Todo, "Y").unwrap();
        assert_eq!(tree.find_branching_point(y), Some((a, r, true)));
        assert_eq!(tree.find_branching_point(r), None);
    }

    #[test]
    fn branching_point_without_branching_reports_root() {
        let mut tree = singleton("R");
        let r = tree.root().unwrap();
        let a = tree.add_child(r, Eval::Todo, "A").unwrap();
        let b = tree.add_child(a, Eval::Todo, "B").unwrap();
        assert_eq!(tree.find_branching_point(b), Some((a, r, false)));
    }

    #[test]
    fn copy_subtree_is_independent() {
        let tree = scenario_a();
        let copy = tree.copy_subtree(tree.root().unwrap()).unwrap();
        assert_eq!(copy.size(), 4);
        sim_assert_eq!(leaf_data(&copy), vec!["A", "B", "C"]);
        copy.validate().unwrap();
        assert_eq!(copy.parent(copy.root().unwrap()), None);
    }

    #[test]
    fn snake_traversal_lists_one_path_per_leaf() {
        let mut tree = singleton("R");
        let r = tree.root().unwrap();
        let a = tree.add_child(r, Eval::Todo, "A").unwrap();
        tree.add_child(r, Eval::Todo, "B").unwrap();
        tree.add_child(a, Eval::Todo, "C").unwrap();
        tree.add_child(a, Eval::Todo, "D").unwrap();
        let paths: Vec<Vec<&'static str>> = tree
            .snake_traversal()
            .into_iter()
            .map(|path| path.into_iter().map(|(_, d)| d).collect())
            .collect();
        sim_assert_eq!(
            paths,
            vec![vec!["R", "A", "C"], vec!["R", "A", "D"], vec!["R", "B"]]
        );
    }

    #[test]
    fn regenerate_leaves_is_idempotent() {
        let mut tree = scenario_a();
        tree.regenerate_leaves();
        let first = tree.get_leaves().to_vec();
        let size = tree.size();
        tree.regenerate_leaves();
        assert_eq!(tree.get_leaves(), first.as_slice());
        assert_eq!(tree.size(), size);
    }

    #[test]
    fn update_leaves_expands_grown_cache_entries() {
        let mut tree = singleton("R");
        let r = tree.root().unwrap();
        // grow behind the cache's back
        let a = tree.spawn_child(r, Eval::Todo, "A");
        tree.spawn_child(a, Eval::Todo, "C");
        assert_eq!(tree.size(), 1);
        tree.update_leaves();
        assert_eq!(tree.size(), 3);
        sim_assert_eq!(leaf_data(&tree), vec!["C"]);
        tree.validate().unwrap();
    }

    #[test]
    fn search_and_filter_use_breadth_first_order() {
        let mut tree = singleton("R");
        let r = tree.root().unwrap();
        let a = tree.add_child(r, Eval::Todo, "A").unwrap();
        let b = tree.add_child(r, Eval::Done, "B").unwrap();
        let c = tree.add_child(a, Eval::Done, "C").unwrap();
        // BFS must see B before the deeper C
        assert_eq!(tree.search_nodes(|s, _| *s == Eval::Done), Some(b));
        assert_eq!(tree.filter_children(|s, _| *s == Eval::Done), vec![b, c]);
        assert_eq!(tree.search_nodes(|_, d| *d == "nope"), None);
    }

    #[test]
    fn cleanup_empties_everything() {
        let mut tree = scenario_a();
        tree.cleanup();
        assert!(tree.is_empty());
        assert_eq!(tree.size(), 0);
        assert!(tree.get_leaves().is_empty());
        tree.validate().unwrap();
    }

    #[test]
    fn set_status_swaps_tag() {
        let mut tree = scenario_a();
        let b = tree.search_nodes(|_, d| *d == "B").unwrap();
        assert_eq!(tree.set_status(b, Eval::Done).unwrap(), Eval::Todo);
        assert_eq!(tree.status(b), Some(&Eval::Done));
    }

    #[test]
    fn map_preserves_structure() {
        let tree = scenario_a();
        let mapped = tree.map_ref(|d| d.len());
        assert_eq!(mapped.size(), 4);
        assert_eq!(mapped[mapped.root().unwrap()], 1);
        mapped.validate().unwrap();
    }

    #[test]
    fn validate_reports_broken_parent_link() {
        let mut tree = scenario_a();
        let a = tree.search_nodes(|_, d| *d == "A").unwrap();
        tree.node_mut(a).parent = None;
        assert!(matches!(
            tree.validate(),
            Err(TreeError::BrokenParentLink(_))
        ));
    }

    #[test]
    fn debug_draw_renders_connectors() {
        let mut tree = singleton("R");
        let r = tree.root().unwrap();
        let a = tree.add_child(r, Eval::Todo, "A").unwrap();
        tree.add_child(r, Eval::Todo, "B").unwrap();
        tree.add_child(a, Eval::Todo, "C").unwrap();
        insta::assert_snapshot!(tree.debug_draw(|_, d| d.to_string()), @r"
        Number of nodes:4
          0:R
          ├── 1:A
          │   └── 3:C
          └── 2:B
        ");
    }

    mod properties {
        use proptest::prelude::*;

        use super::super::Tree;

        fn grown_tree(choices: &[(usize, u8)]) -> Tree<u8, u8> {
            let mut tree = Tree::new(0u8, 0u8);
            let mut ids = vec![tree.root().unwrap()];
            for &(pick, val) in choices {
                let parent = ids[pick % ids.len()];
                let id = tree.add_child(parent, 0, val).unwrap();
                ids.push(id);
            }
            tree
        }

        proptest! {
            #[test]
            fn incremental_leaf_cache_matches_full_walk(
                choices in proptest::collection::vec((0usize..64, 0u8..8), 0..40)
            ) {
                let mut tree = grown_tree(&choices);
                prop_assert!(tree.validate().is_ok());
                prop_assert_eq!(tree.size(), choices.len() + 1);
                let cached = tree.get_leaves().to_vec();
                tree.regenerate_leaves();
                prop_assert_eq!(cached, tree.get_leaves().to_vec());
            }

            #[test]
            fn prune_branches_leaves_no_matches_behind(
                choices in proptest::collection::vec((0usize..64, 0u8..8), 0..40)
            ) {
                let mut tree = grown_tree(&choices);
                let wiped = tree.prune_branches(|_, d| *d >= 4).unwrap();
                prop_assert!(!wiped);
                prop_assert!(tree.validate().is_ok());
                let root = tree.root().unwrap();
                prop_assert!(tree.iter_preorder(root).all(|id| *tree.data(id).unwrap() < 4));
            }

            #[test]
            fn update_leaves_is_stable_on_clean_cache(
                choices in proptest::collection::vec((0usize..64, 0u8..8), 0..40)
            ) {
                let mut tree = grown_tree(&choices);
                let cached = tree.get_leaves().to_vec();
                let size = tree.size();
                tree.update_leaves();
                prop_assert_eq!(tree.get_leaves().to_vec(), cached);
                prop_assert_eq!(tree.size(), size);
            }
        }
    }
}
