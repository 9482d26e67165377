use std::fmt;

use derive_more::{From, Into};

/// A type-safe identifier for a node within a [`Tree`](super::Tree).
/// Wraps a `usize` index into the underlying slot vector.
///
/// Ids are only meaningful against the tree that issued them. A node id
/// outlives its node when the node is deleted; looking such an id up again
/// yields `None` (accessors) or [`TreeError::InvalidNode`](super::TreeError)
/// (fallible operations).
#[derive(Clone, Debug, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, From, Into)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeId(pub(crate) usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single occupied slot in the tree's arena.
///
/// Holds the node's payload, its mutable status tag, a non-owning back-link
/// to its parent (`None` exactly for the root and for detached subtree
/// roots), and its children in insertion order. Insertion order is traversal
/// order throughout the crate.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Node<S, T> {
    pub(crate) status: S,
    pub(crate) data: T,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
}

impl<S, T> Node<S, T> {
    /// A fresh node with no parent and no children.
    pub(crate) fn detached(status: S, data: T) -> Self {
        Node {
            status,
            data,
            parent: None,
            children: Vec::new(),
        }
    }

    pub fn status(&self) -> &S {
        &self.status
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}
