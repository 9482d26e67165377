//! One command type per mutating tree operation.
//!
//! Destructive commands deep-copy the tree before touching it; the two
//! cache-only commands save just the previous leaf cache and size. Either
//! way `undo` puts back exactly what `execute` saw, and a command can be
//! re-executed afterwards (each `execute` captures afresh).

use crate::tree::{Branch, NodeId, Tree, TreeError};

use super::Command;

fn restore<S, T>(saved: &mut Option<Tree<S, T>>, tree: &mut Tree<S, T>) -> Result<(), TreeError> {
    let captured = saved.take().ok_or(TreeError::NothingCaptured)?;
    *tree = captured;
    Ok(())
}

/// Wraps [`Tree::set_children`]. The replacement subtrees are kept by the
/// command and cloned into the tree on every execute, so the command can be
/// replayed.
#[derive(Clone)]
pub struct SetChildrenCmd<S, T> {
    children: Vec<Tree<S, T>>,
    saved: Option<Tree<S, T>>,
}

impl<S, T> SetChildrenCmd<S, T> {
    pub fn new(children: Vec<Tree<S, T>>) -> Self {
        SetChildrenCmd {
            children,
            saved: None,
        }
    }
}

impl<S, T> Command<S, T> for SetChildrenCmd<S, T>
where
    S: Clone + 'static,
    T: Clone + 'static,
{
    fn execute(&mut self, tree: &mut Tree<S, T>) -> Result<(), TreeError> {
        self.saved = Some(tree.clone());
        tree.set_children(self.children.clone())
    }

    fn undo(&mut self, tree: &mut Tree<S, T>) -> Result<(), TreeError> {
        restore(&mut self.saved, tree)
    }

    fn boxed_copy(&self) -> Box<dyn Command<S, T>> {
        Box::new(self.clone())
    }
}

/// Wraps [`Tree::cleanup`].
#[derive(Clone, Default)]
pub struct CleanupCmd<S, T> {
    saved: Option<Tree<S, T>>,
}

impl<S, T> CleanupCmd<S, T> {
    pub fn new() -> Self {
        CleanupCmd { saved: None }
    }
}

impl<S, T> Command<S, T> for CleanupCmd<S, T>
where
    S: Clone + 'static,
    T: Clone + 'static,
{
    fn execute(&mut self, tree: &mut Tree<S, T>) -> Result<(), TreeError> {
        self.saved = Some(tree.clone());
        tree.cleanup();
        Ok(())
    }

    fn undo(&mut self, tree: &mut Tree<S, T>) -> Result<(), TreeError> {
        restore(&mut self.saved, tree)
    }

    fn boxed_copy(&self) -> Box<dyn Command<S, T>> {
        Box::new(self.clone())
    }
}

/// Wraps [`Tree::regenerate_leaves`]. Captures only the previous leaf cache
/// and size; the arena is untouched by the operation.
#[derive(Clone, Default)]
pub struct RegenerateLeavesCmd {
    saved: Option<(Vec<NodeId>, usize)>,
}

impl RegenerateLeavesCmd {
    pub fn new() -> Self {
        RegenerateLeavesCmd { saved: None }
    }
}

impl<S, T> Command<S, T> for RegenerateLeavesCmd
where
    S: 'static,
    T: 'static,
{
    fn execute(&mut self, tree: &mut Tree<S, T>) -> Result<(), TreeError> {
        self.saved = Some((tree.get_leaves().to_vec(), tree.size()));
        tree.regenerate_leaves();
        Ok(())
    }

    fn undo(&mut self, tree: &mut Tree<S, T>) -> Result<(), TreeError> {
        let (leaves, size) = self.saved.take().ok_or(TreeError::NothingCaptured)?;
        tree.restore_cache(leaves, size);
        Ok(())
    }

    fn boxed_copy(&self) -> Box<dyn Command<S, T>> {
        Box::new(self.clone())
    }
}

/// Wraps [`Tree::update_leaves`]. Cache-only, like
/// [`RegenerateLeavesCmd`].
#[derive(Clone, Default)]
pub struct UpdateLeavesCmd {
    saved: Option<(Vec<NodeId>, usize)>,
}

impl UpdateLeavesCmd {
    pub fn new() -> Self {
        UpdateLeavesCmd { saved: None }
    }
}

impl<S, T> Command<S, T> for UpdateLeavesCmd
where
    S: 'static,
    T: 'static,
{
    fn execute(&mut self, tree: &mut Tree<S, T>) -> Result<(), TreeError> {
        self.saved = Some((tree.get_leaves().to_vec(), tree.size()));
        tree.update_leaves();
        Ok(())
    }

    fn undo(&mut self, tree: &mut Tree<S, T>) -> Result<(), TreeError> {
        let (leaves, size) = self.saved.take().ok_or(TreeError::NothingCaptured)?;
        tree.restore_cache(leaves, size);
        Ok(())
    }

    fn boxed_copy(&self) -> Box<dyn Command<S, T>> {
        Box::new(self.clone())
    }
}

/// Wraps [`Tree::prune_branches`].
#[derive(Clone)]
pub struct PruneBranchesCmd<S, T, F> {
    filter: F,
    saved: Option<Tree<S, T>>,
    wiped: bool,
}

impl<S, T, F> PruneBranchesCmd<S, T, F>
where
    F: Fn(&S, &T) -> bool,
{
    pub fn new(filter: F) -> Self {
        PruneBranchesCmd {
            filter,
            saved: None,
            wiped: false,
        }
    }

    /// Whether the last execute wiped the whole tree.
    pub fn wiped(&self) -> bool {
        self.wiped
    }
}

impl<S, T, F> Command<S, T> for PruneBranchesCmd<S, T, F>
where
    S: Clone + 'static,
    T: Clone + 'static,
    F: Fn(&S, &T) -> bool + Clone + 'static,
{
    fn execute(&mut self, tree: &mut Tree<S, T>) -> Result<(), TreeError> {
        self.saved = Some(tree.clone());
        self.wiped = tree.prune_branches(&self.filter)?;
        Ok(())
    }

    fn undo(&mut self, tree: &mut Tree<S, T>) -> Result<(), TreeError> {
        restore(&mut self.saved, tree)
    }

    fn boxed_copy(&self) -> Box<dyn Command<S, T>> {
        Box::new(self.clone())
    }
}

/// Wraps [`Tree::skip_filter`]. The tree keeps the first surviving
/// fragment; any further fragments of a root excision are parked in the
/// command, retrievable through [`spill`](SkipFilterCmd::spill).
#[derive(Clone)]
pub struct SkipFilterCmd<S, T, F> {
    filter: F,
    saved: Option<Tree<S, T>>,
    spill: Vec<Tree<S, T>>,
}

impl<S, T, F> SkipFilterCmd<S, T, F>
where
    F: Fn(&S, &T) -> bool,
{
    pub fn new(filter: F) -> Self {
        SkipFilterCmd {
            filter,
            saved: None,
            spill: Vec::new(),
        }
    }

    /// Fragments beyond the first from the last execute.
    pub fn spill(&self) -> &[Tree<S, T>] {
        &self.spill
    }

    pub fn take_spill(&mut self) -> Vec<Tree<S, T>> {
        std::mem::take(&mut self.spill)
    }
}

impl<S, T, F> Command<S, T> for SkipFilterCmd<S, T, F>
where
    S: Clone + 'static,
    T: Clone + 'static,
    F: Fn(&S, &T) -> bool + Clone + 'static,
{
    fn execute(&mut self, tree: &mut Tree<S, T>) -> Result<(), TreeError> {
        self.saved = Some(tree.clone());
        let taken = std::mem::take(tree);
        let mut forest = taken.skip_filter(&self.filter).into_iter();
        if let Some(first) = forest.next() {
            *tree = first;
        }
        self.spill = forest.collect();
        Ok(())
    }

    fn undo(&mut self, tree: &mut Tree<S, T>) -> Result<(), TreeError> {
        self.spill.clear();
        restore(&mut self.saved, tree)
    }

    fn boxed_copy(&self) -> Box<dyn Command<S, T>> {
        Box::new(self.clone())
    }
}

/// Wraps [`Tree::process_leaves`]. On a mid-walk error the partial
/// expansion stays in the tree, exactly as the bare method leaves it;
/// undoing afterwards rolls the whole thing back, which is the atomicity
/// escape hatch callers are pointed at.
#[derive(Clone)]
pub struct ProcessLeavesCmd<S, T, F> {
    f: F,
    saved: Option<Tree<S, T>>,
}

impl<S, T, F> ProcessLeavesCmd<S, T, F>
where
    F: FnMut(&S, &T) -> Result<Vec<(S, T)>, TreeError>,
{
    pub fn new(f: F) -> Self {
        ProcessLeavesCmd { f, saved: None }
    }
}

impl<S, T, F> Command<S, T> for ProcessLeavesCmd<S, T, F>
where
    S: Clone + 'static,
    T: Clone + 'static,
    F: FnMut(&S, &T) -> Result<Vec<(S, T)>, TreeError> + Clone + 'static,
{
    fn execute(&mut self, tree: &mut Tree<S, T>) -> Result<(), TreeError> {
        self.saved = Some(tree.clone());
        tree.process_leaves(&mut self.f)
    }

    fn undo(&mut self, tree: &mut Tree<S, T>) -> Result<(), TreeError> {
        restore(&mut self.saved, tree)
    }

    fn boxed_copy(&self) -> Box<dyn Command<S, T>> {
        Box::new(self.clone())
    }
}

/// Wraps [`Tree::delete_branch_containing`].
#[derive(Clone)]
pub struct DeleteBranchCmd<S, T> {
    node: NodeId,
    saved: Option<Tree<S, T>>,
}

impl<S, T> DeleteBranchCmd<S, T> {
    pub fn new(node: NodeId) -> Self {
        DeleteBranchCmd { node, saved: None }
    }
}

impl<S, T> Command<S, T> for DeleteBranchCmd<S, T>
where
    S: Clone + 'static,
    T: Clone + 'static,
{
    fn execute(&mut self, tree: &mut Tree<S, T>) -> Result<(), TreeError> {
        self.saved = Some(tree.clone());
        tree.delete_branch_containing(self.node)
    }

    fn undo(&mut self, tree: &mut Tree<S, T>) -> Result<(), TreeError> {
        restore(&mut self.saved, tree)
    }

    fn boxed_copy(&self) -> Box<dyn Command<S, T>> {
        Box::new(self.clone())
    }
}

/// Wraps [`Tree::prune`].
#[derive(Clone)]
pub struct PruneTreeCmd<S, T, F> {
    filter: F,
    saved: Option<Tree<S, T>>,
    untouched: Option<bool>,
}

impl<S, T, F> PruneTreeCmd<S, T, F>
where
    F: Fn(&S, &T) -> bool,
{
    pub fn new(filter: F) -> Self {
        PruneTreeCmd {
            filter,
            saved: None,
            untouched: None,
        }
    }

    /// `Some(true)` when the last execute matched nothing.
    pub fn untouched(&self) -> Option<bool> {
        self.untouched
    }
}

impl<S, T, F> Command<S, T> for PruneTreeCmd<S, T, F>
where
    S: Clone + 'static,
    T: Clone + 'static,
    F: Fn(&S, &T) -> bool + Clone + 'static,
{
    fn execute(&mut self, tree: &mut Tree<S, T>) -> Result<(), TreeError> {
        self.saved = Some(tree.clone());
        self.untouched = Some(tree.prune(&self.filter)?);
        Ok(())
    }

    fn undo(&mut self, tree: &mut Tree<S, T>) -> Result<(), TreeError> {
        restore(&mut self.saved, tree)
    }

    fn boxed_copy(&self) -> Box<dyn Command<S, T>> {
        Box::new(self.clone())
    }
}

/// Wraps [`Tree::extract_branch`]. The extracted branch is parked in the
/// command; an extraction that found no current leaf leaves `branch` empty
/// and the tree untouched.
#[derive(Clone)]
pub struct ExtractBranchCmd<S, T> {
    leaf: NodeId,
    delete: bool,
    saved: Option<Tree<S, T>>,
    branch: Option<Branch<S, T>>,
}

impl<S, T> ExtractBranchCmd<S, T> {
    pub fn new(leaf: NodeId, delete: bool) -> Self {
        ExtractBranchCmd {
            leaf,
            delete,
            saved: None,
            branch: None,
        }
    }

    pub fn branch(&self) -> Option<&Branch<S, T>> {
        self.branch.as_ref()
    }

    pub fn take_branch(&mut self) -> Option<Branch<S, T>> {
        self.branch.take()
    }
}

impl<S, T> Command<S, T> for ExtractBranchCmd<S, T>
where
    S: Clone + 'static,
    T: Clone + 'static,
{
    fn execute(&mut self, tree: &mut Tree<S, T>) -> Result<(), TreeError> {
        self.saved = Some(tree.clone());
        self.branch = tree.extract_branch(self.leaf, self.delete);
        Ok(())
    }

    fn undo(&mut self, tree: &mut Tree<S, T>) -> Result<(), TreeError> {
        self.branch = None;
        restore(&mut self.saved, tree)
    }

    fn boxed_copy(&self) -> Box<dyn Command<S, T>> {
        Box::new(self.clone())
    }
}

/// Wraps [`Tree::insert_branch`].
#[derive(Clone)]
pub struct InsertBranchCmd<S, T> {
    branch: Branch<S, T>,
    saved: Option<Tree<S, T>>,
    inserted: bool,
}

impl<S, T> InsertBranchCmd<S, T> {
    pub fn new(branch: Branch<S, T>) -> Self {
        InsertBranchCmd {
            branch,
            saved: None,
            inserted: false,
        }
    }

    /// Whether the last execute changed the tree's size.
    pub fn inserted(&self) -> bool {
        self.inserted
    }
}

impl<S, T> Command<S, T> for InsertBranchCmd<S, T>
where
    S: Clone + PartialEq + 'static,
    T: Clone + PartialEq + 'static,
{
    fn execute(&mut self, tree: &mut Tree<S, T>) -> Result<(), TreeError> {
        self.saved = Some(tree.clone());
        self.inserted = tree.insert_branch(self.branch.clone());
        Ok(())
    }

    fn undo(&mut self, tree: &mut Tree<S, T>) -> Result<(), TreeError> {
        restore(&mut self.saved, tree)
    }

    fn boxed_copy(&self) -> Box<dyn Command<S, T>> {
        Box::new(self.clone())
    }
}
