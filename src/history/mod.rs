//! Reversible commands over a [`Tree`] and the undo/redo stack that drives
//! them.
//!
//! Every mutating tree operation has a command wrapper implementing
//! [`Command`]: `execute` captures whatever pre-state is needed to reverse
//! the mutation and then performs it, `undo` restores that pre-state, and
//! `boxed_copy` deep-copies the command, captured tree fragments included,
//! so a [`History`] log can be snapshotted without aliasing.
//!
//! Cache-only commands ([`RegenerateLeavesCmd`](commands::RegenerateLeavesCmd),
//! [`UpdateLeavesCmd`](commands::UpdateLeavesCmd)) capture just the previous
//! leaf cache and size. Destructive commands capture a deep copy of the tree
//! before mutating, since the nodes they remove cannot be recovered any
//! other way.

use crate::tree::{Tree, TreeError};

pub mod commands;

/// One reversible tree mutation.
///
/// `execute` followed immediately by `undo` restores the tree's root, leaf
/// cache, and size to their pre-`execute` values (structural equality, not
/// id identity). Calling `undo` before any `execute` fails with
/// [`TreeError::NothingCaptured`].
pub trait Command<S, T> {
    fn execute(&mut self, tree: &mut Tree<S, T>) -> Result<(), TreeError>;

    fn undo(&mut self, tree: &mut Tree<S, T>) -> Result<(), TreeError>;

    /// A deep copy, including any captured tree state.
    fn boxed_copy(&self) -> Box<dyn Command<S, T>>;
}

/// An undo/redo stack of boxed commands, treated opaquely.
pub struct History<S, T> {
    done: Vec<Box<dyn Command<S, T>>>,
    undone: Vec<Box<dyn Command<S, T>>>,
}

impl<S, T> Default for History<S, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, T> History<S, T> {
    pub fn new() -> Self {
        History {
            done: Vec::new(),
            undone: Vec::new(),
        }
    }

    /// Executes the command against `tree` and records it. A failed command
    /// does not enter the log. Applying anything clears the redo stack.
    pub fn apply(
        &mut self,
        tree: &mut Tree<S, T>,
        mut command: Box<dyn Command<S, T>>,
    ) -> Result<(), TreeError> {
        command.execute(tree)?;
        self.done.push(command);
        self.undone.clear();
        Ok(())
    }

    /// Undoes the most recent command. `Ok(false)` when there is nothing to
    /// undo. A command whose undo fails stays on the stack.
    pub fn undo(&mut self, tree: &mut Tree<S, T>) -> Result<bool, TreeError> {
        let Some(mut command) = self.done.pop() else {
            return Ok(false);
        };
        match command.undo(tree) {
            Ok(()) => {
                self.undone.push(command);
                Ok(true)
            }
            Err(e) => {
                self.done.push(command);
                Err(e)
            }
        }
    }

    /// Re-executes the most recently undone command. `Ok(false)` when there
    /// is nothing to redo.
    pub fn redo(&mut self, tree: &mut Tree<S, T>) -> Result<bool, TreeError> {
        let Some(mut command) = self.undone.pop() else {
            return Ok(false);
        };
        match command.execute(tree) {
            Ok(()) => {
                self.done.push(command);
                Ok(true)
            }
            Err(e) => {
                self.undone.push(command);
                Err(e)
            }
        }
    }

    /// Deep-copies the whole log, captured state included, so the copy can
    /// diverge from this one.
    pub fn snapshot(&self) -> History<S, T> {
        History {
            done: self.done.iter().map(|c| c.boxed_copy()).collect(),
            undone: self.undone.iter().map(|c| c.boxed_copy()).collect(),
        }
    }

    /// The number of commands available to undo.
    pub fn depth(&self) -> usize {
        self.done.len()
    }

    pub fn is_empty(&self) -> bool {
        self.done.is_empty() && self.undone.is_empty()
    }

    pub fn clear(&mut self) {
        self.done.clear();
        self.undone.clear();
    }
}
