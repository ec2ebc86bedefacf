//! Node Arena
//!
//! The arena owns every node in the graph and maintains both directions of
//! each subscription edge: a computation's `sources` and the matching entry in
//! each source's `observers`. Edge sets are insertion-ordered and removal uses
//! swap-with-last, so subscribing and unsubscribing are O(1).

use std::collections::HashMap;

use super::node::{Node, NodeId};

/// Storage for all nodes of one runtime.
#[derive(Debug, Default)]
pub(crate) struct NodeArena {
    /// All nodes in the graph, indexed by ID.
    nodes: HashMap<NodeId, Node>,
}

impl NodeArena {
    pub(crate) fn new() -> Self {
        Self {
            nodes: HashMap::new(),
        }
    }

    /// Add a node to the graph.
    pub(crate) fn insert(&mut self, node: Node) -> NodeId {
        let id = node.id;
        self.nodes.insert(id, node);
        id
    }

    /// Remove a node from the graph along with every edge that touches it.
    pub(crate) fn remove(&mut self, node_id: NodeId) -> Option<Node> {
        let node = self.nodes.remove(&node_id)?;

        for source_id in &node.sources {
            if let Some(source) = self.nodes.get_mut(source_id) {
                source.observers.swap_remove(&node_id);
            }
        }

        for observer_id in &node.observers {
            if let Some(observer) = self.nodes.get_mut(observer_id) {
                observer.sources.swap_remove(&node_id);
            }
        }

        Some(node)
    }

    pub(crate) fn get(&self, node_id: NodeId) -> Option<&Node> {
        self.nodes.get(&node_id)
    }

    pub(crate) fn get_mut(&mut self, node_id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&node_id)
    }

    pub(crate) fn contains(&self, node_id: NodeId) -> bool {
        self.nodes.contains_key(&node_id)
    }

    /// Subscribe `observer` to `source`.
    ///
    /// Reading the same source twice in one run records a single edge.
    pub(crate) fn subscribe(&mut self, source: NodeId, observer: NodeId) {
        if !self.nodes.contains_key(&observer) {
            return;
        }
        let Some(source_node) = self.nodes.get_mut(&source) else {
            return;
        };
        source_node.observers.insert(observer);
        if let Some(observer_node) = self.nodes.get_mut(&observer) {
            observer_node.sources.insert(source);
        }
    }

    /// Drop every subscription held by `observer`.
    pub(crate) fn unsubscribe_all(&mut self, observer: NodeId) {
        let sources = match self.nodes.get_mut(&observer) {
            Some(node) => std::mem::take(&mut node.sources),
            None => return,
        };
        for source_id in sources {
            if let Some(source) = self.nodes.get_mut(&source_id) {
                source.observers.swap_remove(&observer);
            }
        }
    }

    /// Get the total number of nodes in the graph.
    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }
}
