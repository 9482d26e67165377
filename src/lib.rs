//! # Coppice
//!
//! Coppice is a Rust library for status trees: trees whose nodes carry a
//! mutable status tag alongside their payload. Its primary focus is keeping
//! a cached view of the current leaf set and node count consistent while the
//! tree is grown, pruned, and cut apart, and making every mutation
//! reversible through a command history.
//!
//! This library is useful for scenarios where a tree tracks partial
//! evaluation state (each node tagged with how far its subtree has been
//! worked) and where branches of work need to be extracted, discarded, or
//! rolled back without rebuilding the whole structure.

pub mod history;
pub mod tree;
