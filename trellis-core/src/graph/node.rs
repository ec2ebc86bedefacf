//! Graph Nodes
//!
//! This module defines the node types that live in the dependency graph.
//! Every reactive primitive (signal, memo, effect, owner) is a [`Node`]; the
//! typed handles handed to user code only carry its [`NodeId`].

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexSet;
use smallvec::SmallVec;

use crate::error::ReactiveError;
use crate::reactive::SuspenseContext;

/// Unique identifier for a node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// The kind of node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// A writable cell. Has observers, never sources.
    Signal,

    /// A cached derived value. Both a computation and an observable cell.
    Memo,

    /// A pure computation whose value nobody reads.
    Computed,

    /// An effect that runs before user effects in the same flush.
    RenderEffect,

    /// A user-authored side effect.
    Effect,

    /// An owner created by `catch_error` to hold its error handler.
    Boundary,

    /// The top of an ownership tree.
    Root,
}

/// Which queue a stale computation is placed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Re-evaluated before any effect runs.
    Pure,
    /// Run after the pure queue has drained.
    Effect,
}

impl NodeKind {
    /// The queue this kind of node is scheduled on, if any.
    pub fn phase(self) -> Option<Phase> {
        match self {
            NodeKind::Memo | NodeKind::Computed | NodeKind::Boundary => Some(Phase::Pure),
            NodeKind::RenderEffect | NodeKind::Effect => Some(Phase::Effect),
            NodeKind::Signal | NodeKind::Root => None,
        }
    }

    /// Whether the node has a body that tracks its reads.
    pub fn is_computation(self) -> bool {
        matches!(
            self,
            NodeKind::Memo | NodeKind::Computed | NodeKind::RenderEffect | NodeKind::Effect
        )
    }

    /// Whether other computations can subscribe to this node.
    pub fn is_observable(self) -> bool {
        matches!(self, NodeKind::Signal | NodeKind::Memo)
    }

    pub fn is_pure(self) -> bool {
        self.phase() == Some(Phase::Pure)
    }

    /// User effects are deferred behind render effects.
    pub fn is_user(self) -> bool {
        self == NodeKind::Effect
    }
}

/// Freshness of a computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum NodeState {
    /// The node's value is up-to-date.
    #[default]
    Clean = 0,

    /// The node definitely needs to recompute.
    Stale = 1,

    /// Some upstream computation may change; resolve upstream before deciding.
    Pending = 2,
}

pub(crate) type Value = Rc<dyn Any>;
pub(crate) type Comparator = Rc<dyn Fn(&dyn Any, &dyn Any) -> bool>;
pub(crate) type ComputeFn = Rc<RefCell<dyn FnMut(Option<&dyn Any>) -> Value>>;
pub(crate) type Cleanup = Box<dyn FnOnce()>;
pub(crate) type ErrorHandler = Rc<dyn Fn(&ReactiveError)>;
pub(crate) type OwnedList = SmallVec<[NodeId; 4]>;

/// Build a type-erased comparator from a typed one.
pub(crate) fn erase_comparator<T: 'static>(
    equals: impl Fn(&T, &T) -> bool + 'static,
) -> Comparator {
    Rc::new(move |a: &dyn Any, b: &dyn Any| {
        match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
            (Some(a), Some(b)) => equals(a, b),
            _ => false,
        }
    })
}

/// A node in the dependency graph.
pub(crate) struct Node {
    pub(crate) id: NodeId,
    pub(crate) kind: NodeKind,

    /// Committed freshness.
    pub(crate) state: NodeState,
    /// Freshness as seen by a running transition; `None` until a transition
    /// touches the node.
    pub(crate) t_state: Option<NodeState>,

    pub(crate) value: Option<Value>,
    /// Tentative value, present only while a transition holds this node.
    pub(crate) t_value: Option<Value>,
    pub(crate) comparator: Option<Comparator>,
    pub(crate) compute: Option<ComputeFn>,

    /// Nodes read during the last run, in read order.
    pub(crate) sources: IndexSet<NodeId>,
    /// Computations subscribed to this node, in subscription order.
    pub(crate) observers: IndexSet<NodeId>,

    pub(crate) owner: Option<NodeId>,
    pub(crate) owned: OwnedList,
    /// Children created while a transition re-ran this node.
    pub(crate) t_owned: Option<OwnedList>,
    pub(crate) cleanups: Vec<Cleanup>,
    pub(crate) error_handlers: Vec<ErrorHandler>,
    pub(crate) contexts: HashMap<TypeId, Rc<dyn Any>>,
    pub(crate) suspense: Option<SuspenseContext>,

    /// Batch counter value of the last successful run.
    pub(crate) updated_at: Option<u64>,
    pub(crate) run_count: u64,
}

impl Node {
    /// Create a new node with the given kind.
    pub(crate) fn new(kind: NodeKind) -> Self {
        Self {
            id: NodeId::new(),
            kind,
            state: NodeState::Clean,
            t_state: None,
            value: None,
            t_value: None,
            comparator: None,
            compute: None,
            sources: IndexSet::new(),
            observers: IndexSet::new(),
            owner: None,
            owned: OwnedList::new(),
            t_owned: None,
            cleanups: Vec::new(),
            error_handlers: Vec::new(),
            contexts: HashMap::new(),
            suspense: None,
            updated_at: None,
            run_count: 0,
        }
    }

    /// Create a new signal node holding `value`.
    pub(crate) fn signal(value: Value, comparator: Option<Comparator>) -> Self {
        let mut node = Self::new(NodeKind::Signal);
        node.value = Some(value);
        node.comparator = comparator;
        node
    }

    /// Create a new computation node.
    pub(crate) fn computation(
        kind: NodeKind,
        compute: Option<ComputeFn>,
        initial: Option<Value>,
    ) -> Self {
        let mut node = Self::new(kind);
        node.compute = compute;
        node.value = initial;
        node
    }

    /// Freshness as seen by the committed world or by a running transition.
    pub(crate) fn state_in(&self, transition: bool) -> NodeState {
        if transition {
            self.t_state.unwrap_or_default()
        } else {
            self.state
        }
    }

    pub(crate) fn set_state_in(&mut self, transition: bool, state: NodeState) {
        if transition {
            self.t_state = Some(state);
        } else {
            self.state = state;
        }
    }

    pub(crate) fn is_clean_in(&self, transition: bool) -> bool {
        self.state_in(transition) == NodeState::Clean
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("t_state", &self.t_state)
            .field("sources", &self.sources)
            .field("observers", &self.observers)
            .field("owner", &self.owner)
            .field("owned", &self.owned)
            .field("updated_at", &self.updated_at)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_are_unique() {
        let id1 = NodeId::new();
        let id2 = NodeId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn phase_is_total_over_kinds() {
        assert_eq!(NodeKind::Memo.phase(), Some(Phase::Pure));
        assert_eq!(NodeKind::Computed.phase(), Some(Phase::Pure));
        assert_eq!(NodeKind::RenderEffect.phase(), Some(Phase::Effect));
        assert_eq!(NodeKind::Effect.phase(), Some(Phase::Effect));
        assert_eq!(NodeKind::Signal.phase(), None);
        assert_eq!(NodeKind::Root.phase(), None);

        assert!(NodeKind::Effect.is_user());
        assert!(!NodeKind::RenderEffect.is_user());
        assert!(NodeKind::Memo.is_observable());
        assert!(!NodeKind::Computed.is_observable());
    }

    #[test]
    fn tentative_state_is_separate() {
        let mut node = Node::new(NodeKind::Memo);
        assert!(node.is_clean_in(false));

        assert_eq!(node.t_state, None);
        node.set_state_in(true, NodeState::Stale);
        assert_eq!(node.state_in(true), NodeState::Stale);
        assert_eq!(node.state_in(false), NodeState::Clean);

        node.set_state_in(false, NodeState::Pending);
        assert_eq!(node.state, NodeState::Pending);
        assert_eq!(NodeState::Pending as u8, 2);
    }

    #[test]
    fn comparator_downcasts() {
        let eq = erase_comparator(|a: &i32, b: &i32| a == b);
        assert!(eq(&1i32, &1i32));
        assert!(!eq(&1i32, &2i32));
        // Mismatched types never compare equal.
        assert!(!eq(&1i32, &"one"));
    }
}
