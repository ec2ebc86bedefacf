//! Dependency Graph
//!
//! This module implements the storage for the reactive dependency graph.
//!
//! # Overview
//!
//! The graph has two overlapping structures:
//!
//! - Subscription edges: if computation A read node B during its last run,
//!   B lists A as an observer and A lists B as a source.
//! - Ownership edges: every node is owned by the owner that was active when
//!   it was created. Ownership is a tree and drives disposal.
//!
//! # Design Decisions
//!
//! 1. Nodes live in a centralized arena indexed by [`NodeId`]. User-facing
//!    handles are plain IDs, so they are `Copy` and never keep nodes alive.
//!
//! 2. Both edge directions are stored on the nodes themselves as
//!    insertion-ordered sets, which gives O(1) add and remove without the
//!    parallel slot-index lists a linked representation would need.
//!
//! 3. Node kinds are a closed enum; the update engine selects queues with an
//!    exhaustive match on [`NodeKind::phase`].

mod arena;
mod node;

pub(crate) use arena::NodeArena;
pub(crate) use node::{
    erase_comparator, Cleanup, Comparator, ComputeFn, ErrorHandler, Node, OwnedList, Value,
};
pub use node::{NodeId, NodeKind, NodeState, Phase};
