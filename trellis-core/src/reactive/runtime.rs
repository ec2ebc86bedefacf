//! Reactive Runtime
//!
//! The runtime owns the node arena and the two update queues, and drives
//! every change through the graph.
//!
//! # How It Works
//!
//! 1. Reading a cell subscribes the current listener and, if the cell is a
//!    memo that is not clean, brings it up to date first.
//!
//! 2. Writing a cell opens a batch (unless one is open) and marks every
//!    observer stale. Memos among them mark their own observers pending.
//!    Pure computations go to the update queue, effects to the effect queue.
//!
//! 3. When the outermost batch closes, the update queue drains first. Each
//!    entry is brought up to date top-down through its owner chain so that a
//!    parent that is about to dispose it runs first. Then, if no transition
//!    is suspended, the effect queue drains: render effects and queued
//!    errors first, user effects after.
//!
//! 4. A pending node looks upstream before deciding to run. If none of its
//!    sources actually changed it becomes clean without running, which is
//!    what makes diamonds glitch-free.
//!
//! # Panics
//!
//! Computation bodies fail by unwinding. [`Runtime::run_computation`] catches
//! the unwind, converts it into a [`ReactiveError`] and routes it to the
//! nearest error handler on the owner chain. With no handler the error
//! resumes unwinding out of the outermost batch, whose queues are reset
//! first so the runtime stays usable.
//!
//! No `RefCell` borrow is held across a call into user code.

use std::any::{Any, TypeId};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use super::context::ReactiveContext;
use super::suspense::SuspenseContext;
use super::transition::Transition;
use crate::config::RuntimeConfig;
use crate::error::{ReactiveError, Result};
use crate::graph::{
    Cleanup, Comparator, ComputeFn, ErrorHandler, Node, NodeArena, NodeId, NodeKind, NodeState,
    OwnedList, Phase, Value,
};
use crate::scheduler::Scheduler;

thread_local! {
    static RUNTIME: Runtime = Runtime::new();
}

/// Run `f` against this thread's runtime.
pub(crate) fn with_runtime<R>(f: impl FnOnce(&Runtime) -> R) -> R {
    RUNTIME.with(f)
}

/// Like [`with_runtime`], but `None` once the runtime has been torn down.
pub(crate) fn try_with_runtime<R>(f: impl FnOnce(&Runtime) -> R) -> Option<R> {
    RUNTIME.try_with(f).ok()
}

type NodeList = SmallVec<[NodeId; 8]>;

/// An entry in the effect queue.
pub(crate) enum QueuedEffect {
    Node(NodeId),
    /// An error raised during the pure phase, delivered with the effects.
    Error {
        error: Rc<ReactiveError>,
        handlers: Vec<ErrorHandler>,
        holder: NodeId,
    },
}

impl QueuedEffect {
    fn node(&self) -> Option<NodeId> {
        match self {
            Self::Node(id) => Some(*id),
            Self::Error { .. } => None,
        }
    }
}

/// The per-thread reactive runtime.
pub(crate) struct Runtime {
    pub(crate) arena: RefCell<NodeArena>,
    /// Pure computations to bring up to date. `Some` while a batch is open.
    updates: RefCell<Option<Vec<NodeId>>>,
    /// Effects to run once the pure queue drains. `Some` while a batch is open.
    effects: RefCell<Option<Vec<QueuedEffect>>>,
    /// Number of batches opened so far.
    exec_count: Cell<u64>,
    pub(crate) transition: RefCell<Option<Transition>>,
    pub(crate) scheduler: RefCell<Option<Scheduler>>,
    /// Computations re-run under their transition once the batch closes.
    reruns: RefCell<Vec<(NodeId, u64)>>,
    draining_reruns: Cell<bool>,
    pub(crate) pending_signal: Cell<Option<NodeId>>,
    pub(crate) config: Cell<RuntimeConfig>,
}

impl Runtime {
    fn new() -> Self {
        Self {
            arena: RefCell::new(NodeArena::new()),
            updates: RefCell::new(None),
            effects: RefCell::new(None),
            exec_count: Cell::new(0),
            transition: RefCell::new(None),
            scheduler: RefCell::new(None),
            reruns: RefCell::new(Vec::new()),
            draining_reruns: Cell::new(false),
            pending_signal: Cell::new(None),
            config: Cell::new(RuntimeConfig::default()),
        }
    }

    // ------------------------------------------------------------------
    // Node bookkeeping
    // ------------------------------------------------------------------

    pub(crate) fn insert_node(&self, node: Node) -> NodeId {
        self.arena.borrow_mut().insert(node)
    }

    pub(crate) fn contains(&self, id: NodeId) -> bool {
        self.arena.borrow().contains(id)
    }

    pub(crate) fn kind_of(&self, id: NodeId) -> Option<NodeKind> {
        self.arena.borrow().get(id).map(|node| node.kind)
    }

    pub(crate) fn owner_of(&self, id: NodeId) -> Option<NodeId> {
        self.arena.borrow().get(id).and_then(|node| node.owner)
    }

    /// Freshness as seen by the committed world or the running transition.
    /// Missing nodes count as clean.
    pub(crate) fn state_of(&self, id: NodeId, running: bool) -> NodeState {
        self.arena
            .borrow()
            .get(id)
            .map_or(NodeState::Clean, |node| node.state_in(running))
    }

    fn set_state(&self, id: NodeId, running: bool, state: NodeState) {
        if let Some(node) = self.arena.borrow_mut().get_mut(id) {
            node.set_state_in(running, state);
        }
    }

    pub(crate) fn run_count(&self, id: NodeId) -> u64 {
        self.arena.borrow().get(id).map_or(0, |node| node.run_count)
    }

    pub(crate) fn observer_count(&self, id: NodeId) -> usize {
        self.arena.borrow().get(id).map_or(0, |node| node.observers.len())
    }

    pub(crate) fn source_count(&self, id: NodeId) -> usize {
        self.arena.borrow().get(id).map_or(0, |node| node.sources.len())
    }

    pub(crate) fn node_count(&self) -> usize {
        self.arena.borrow().len()
    }

    pub(crate) fn set_comparator(&self, id: NodeId, comparator: Option<Comparator>) {
        if let Some(node) = self.arena.borrow_mut().get_mut(id) {
            node.comparator = comparator;
        }
    }

    pub(crate) fn attach_suspense(&self, id: NodeId, suspense: Option<SuspenseContext>) {
        if let Some(node) = self.arena.borrow_mut().get_mut(id) {
            node.suspense = suspense;
        }
    }

    pub(crate) fn add_cleanup(&self, owner: NodeId, cleanup: Cleanup) {
        if let Some(node) = self.arena.borrow_mut().get_mut(owner) {
            node.cleanups.push(cleanup);
        }
    }

    pub(crate) fn add_error_handler(&self, owner: NodeId, handler: ErrorHandler) {
        if let Some(node) = self.arena.borrow_mut().get_mut(owner) {
            node.error_handlers.push(handler);
        }
    }

    pub(crate) fn provide_context(&self, owner: NodeId, key: TypeId, value: Rc<dyn Any>) {
        if let Some(node) = self.arena.borrow_mut().get_mut(owner) {
            node.contexts.insert(key, value);
        }
    }

    /// Find the nearest value provided under `key`, walking up from `owner`.
    pub(crate) fn find_context(&self, owner: Option<NodeId>, key: TypeId) -> Option<Rc<dyn Any>> {
        let arena = self.arena.borrow();
        let mut current = owner;
        while let Some(id) = current {
            let node = arena.get(id)?;
            if let Some(value) = node.contexts.get(&key) {
                return Some(value.clone());
            }
            current = node.owner;
        }
        None
    }

    fn adopt(&self, owner: NodeId, child: NodeId) {
        let running = self.transition_running();
        let mut arena = self.arena.borrow_mut();
        if let Some(owner_node) = arena.get_mut(owner) {
            if running && owner_node.kind.is_pure() {
                owner_node.t_owned.get_or_insert_with(OwnedList::new).push(child);
            } else {
                owner_node.owned.push(child);
            }
        }
    }

    /// Create a signal node. Owned signals are removed with their owner.
    pub(crate) fn create_signal_node(
        &self,
        value: Value,
        comparator: Option<Comparator>,
        owned: bool,
    ) -> NodeId {
        let owner = if owned { ReactiveContext::current_owner() } else { None };
        let mut node = Node::signal(value, comparator);
        node.owner = owner;
        let id = self.insert_node(node);
        if let Some(owner) = owner {
            self.adopt(owner, id);
        }
        id
    }

    /// Create a computation node under the current owner.
    ///
    /// The body is not run; callers decide whether to run it now or queue it.
    pub(crate) fn create_computation(
        &self,
        kind: NodeKind,
        compute: Option<ComputeFn>,
        initial: Option<Value>,
        state: NodeState,
    ) -> NodeId {
        let owner = ReactiveContext::current_owner();
        let mut node = Node::computation(kind, compute, initial);
        node.owner = owner;
        if self.transition_running() {
            node.t_state = Some(state);
        } else {
            node.state = state;
        }
        let id = self.insert_node(node);

        match owner {
            Some(owner) => self.adopt(owner, id),
            None => {
                if self.config.get().warn_unowned {
                    warn!(
                        node = ?id,
                        ?kind,
                        "computations created outside a `create_root` will never be disposed"
                    );
                }
            }
        }
        id
    }

    // ------------------------------------------------------------------
    // Reads and writes
    // ------------------------------------------------------------------

    /// Read a cell, bringing it up to date and subscribing the listener.
    pub(crate) fn read(&self, id: NodeId) -> Result<Value> {
        let running = self.transition_running();
        let (kind, state) = {
            let arena = self.arena.borrow();
            let node = arena.get(id).ok_or(ReactiveError::Disposed(id))?;
            (node.kind, node.state_in(running))
        };

        if kind.is_computation() {
            match state {
                NodeState::Stale => self.update_computation(id),
                NodeState::Pending => {
                    let updates = self.updates.borrow_mut().take();
                    self.run_updates(|| self.look_upstream(id, None), false);
                    *self.updates.borrow_mut() = updates;
                }
                NodeState::Clean => {}
            }
        }

        if let Some(listener) = ReactiveContext::current_listener() {
            self.arena.borrow_mut().subscribe(id, listener);
        }

        let tentative = running && self.transition_has_source(id);
        let arena = self.arena.borrow();
        let node = arena.get(id).ok_or(ReactiveError::Disposed(id))?;
        let value = if tentative {
            node.t_value.as_ref().or(node.value.as_ref())
        } else {
            node.value.as_ref()
        };
        value.cloned().ok_or(ReactiveError::Uninitialized(id))
    }

    /// The current value of a node without tracking or refreshing it.
    ///
    /// Sees tentative values while a transition is running.
    pub(crate) fn peek(&self, id: NodeId) -> Result<Value> {
        let tentative = self.transition_running() && self.transition_has_source(id);
        let arena = self.arena.borrow();
        let node = arena.get(id).ok_or(ReactiveError::Disposed(id))?;
        let value = if tentative {
            node.t_value.as_ref().or(node.value.as_ref())
        } else {
            node.value.as_ref()
        };
        value.cloned().ok_or(ReactiveError::Uninitialized(id))
    }

    /// Write a cell and propagate the change.
    ///
    /// `is_comp` is set when a memo stores the result of its own run.
    pub(crate) fn write(&self, id: NodeId, value: Value, is_comp: bool) -> Result<()> {
        let (comparator, current) = {
            let tentative = self.transition_running() && self.transition_has_source(id);
            let arena = self.arena.borrow();
            let node = arena.get(id).ok_or(ReactiveError::Disposed(id))?;
            let current = if tentative {
                node.t_value.clone().or_else(|| node.value.clone())
            } else {
                node.value.clone()
            };
            (node.comparator.clone(), current)
        };
        if let (Some(equals), Some(current)) = (comparator, current) {
            if equals(&*current, &*value) {
                return Ok(());
            }
        }

        let has_observers = {
            let mut transition = self.transition.borrow_mut();
            let mut arena = self.arena.borrow_mut();
            let node = arena.get_mut(id).ok_or(ReactiveError::Disposed(id))?;
            match transition.as_mut() {
                Some(transition) => {
                    if transition.running || (!is_comp && transition.sources.contains(&id)) {
                        transition.sources.insert(id);
                        node.t_value = Some(value.clone());
                    }
                    if !transition.running {
                        node.value = Some(value);
                    }
                }
                None => node.value = Some(value),
            }
            !node.observers.is_empty()
        };

        if has_observers {
            self.run_updates(|| self.mark_observers(id), false);
        }
        Ok(())
    }

    fn mark_observers(&self, id: NodeId) {
        let observers = self.snapshot_observers(id);
        for observer in observers {
            let running = self.transition_running();
            if running && self.transition_disposed(observer) {
                continue;
            }
            let (kind, clean) = match self.arena.borrow().get(observer) {
                Some(node) => (node.kind, node.is_clean_in(running)),
                None => continue,
            };
            if clean {
                self.enqueue(observer, kind);
                if kind.is_observable() {
                    self.mark_downstream(observer);
                }
            }
            self.set_state(observer, running, NodeState::Stale);
        }

        let pending = self.updates.borrow().as_ref().map_or(0, Vec::len);
        if pending > self.config.get().max_pending_updates {
            let dropped = self.updates.borrow_mut().replace(Vec::new());
            self.settle(dropped.into_iter().flatten());
            panic::panic_any(ReactiveError::InfiniteLoop { pending });
        }
    }

    /// Mark everything downstream of a changed memo as pending.
    fn mark_downstream(&self, id: NodeId) {
        let running = self.transition_running();
        for observer in self.snapshot_observers(id) {
            let (kind, clean) = match self.arena.borrow().get(observer) {
                Some(node) => (node.kind, node.is_clean_in(running)),
                None => continue,
            };
            if clean {
                self.set_state(observer, running, NodeState::Pending);
                self.enqueue(observer, kind);
                if kind.is_observable() {
                    self.mark_downstream(observer);
                }
            }
        }
    }

    /// Force computations stale and queue them, regardless of their sources.
    pub(crate) fn mark_stale(&self, ids: impl IntoIterator<Item = NodeId>) {
        for id in ids {
            let Some(kind) = self.kind_of(id) else { continue };
            self.set_state(id, false, NodeState::Stale);
            self.enqueue(id, kind);
        }
    }

    fn snapshot_observers(&self, id: NodeId) -> NodeList {
        self.arena
            .borrow()
            .get(id)
            .map(|node| node.observers.iter().copied().collect())
            .unwrap_or_default()
    }

    fn snapshot_sources(&self, id: NodeId) -> NodeList {
        self.arena
            .borrow()
            .get(id)
            .map(|node| node.sources.iter().copied().collect())
            .unwrap_or_default()
    }

    fn enqueue(&self, id: NodeId, kind: NodeKind) {
        match kind.phase() {
            Some(Phase::Pure) => self.push_update(id),
            Some(Phase::Effect) => {
                self.push_effect(id);
            }
            None => {}
        }
    }

    pub(crate) fn push_update(&self, id: NodeId) {
        match self.updates.borrow_mut().as_mut() {
            Some(updates) => updates.push(id),
            None => trace!(node = ?id, "no open batch, update dropped"),
        }
    }

    /// Queue an effect. Returns `false` when no batch is open.
    pub(crate) fn push_effect(&self, id: NodeId) -> bool {
        match self.effects.borrow_mut().as_mut() {
            Some(effects) => {
                effects.push(QueuedEffect::Node(id));
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Running computations
    // ------------------------------------------------------------------

    /// Dispose the node's children and cleanups, then run its body.
    pub(crate) fn update_computation(&self, id: NodeId) {
        let has_body = self.arena.borrow().get(id).is_some_and(|node| node.compute.is_some());
        if !has_body {
            return;
        }
        self.clean_node(id);

        let time = self.exec_count.get();
        let prev = {
            let tentative = self.transition_running() && self.transition_has_source(id);
            let arena = self.arena.borrow();
            arena.get(id).and_then(|node| {
                if tentative {
                    node.t_value.clone().or_else(|| node.value.clone())
                } else {
                    node.value.clone()
                }
            })
        };
        self.run_computation(id, prev, time);

        let rerun = self
            .transition
            .borrow()
            .as_ref()
            .is_some_and(|transition| !transition.running && transition.sources.contains(&id));
        if rerun {
            self.reruns.borrow_mut().push((id, time));
            if self.updates.borrow().is_none() && self.effects.borrow().is_none() {
                self.drain_reruns();
            }
        }
    }

    /// Run a computation's body once and store its result.
    pub(crate) fn run_computation(&self, id: NodeId, prev: Option<Value>, time: u64) {
        let Some(compute) = self.arena.borrow().get(id).and_then(|node| node.compute.clone()) else {
            return;
        };

        let outcome = {
            let _ctx = ReactiveContext::tracking(id);
            panic::catch_unwind(AssertUnwindSafe(|| -> Result<Value> {
                let mut body = compute.try_borrow_mut().map_err(|_| ReactiveError::Reentrant(id))?;
                Ok((&mut *body)(prev.as_deref()))
            }))
        };
        if let Some(node) = self.arena.borrow_mut().get_mut(id) {
            node.run_count += 1;
        }

        let result = match outcome {
            Ok(result) => result,
            Err(payload) => match ReactiveError::from_panic(payload) {
                Ok(err) => Err(err),
                Err(fatal) => panic::resume_unwind(fatal),
            },
        };

        match result {
            Ok(next) => self.store_result(id, next, time),
            Err(err) => {
                let running = self.transition_running();
                let orphans = {
                    let mut arena = self.arena.borrow_mut();
                    let mut orphans = OwnedList::new();
                    if let Some(node) = arena.get_mut(id) {
                        if node.kind.is_pure() {
                            if running {
                                node.t_state = Some(NodeState::Stale);
                                orphans = node.t_owned.take().unwrap_or_default();
                            } else {
                                node.state = NodeState::Stale;
                                orphans = std::mem::take(&mut node.owned);
                            }
                        }
                        node.updated_at = Some(time + 1);
                    }
                    orphans
                };
                for child in orphans {
                    self.dispose_node(child);
                }
                debug!(node = ?id, error = %err, "computation failed");
                self.handle_error(err, Some(id));
            }
        }
    }

    fn store_result(&self, id: NodeId, next: Value, time: u64) {
        let (updated_at, kind) = match self.arena.borrow().get(id) {
            Some(node) => (node.updated_at, node.kind),
            None => return,
        };
        if updated_at.is_some_and(|at| at > time) {
            return;
        }

        if updated_at.is_some() && kind.is_observable() {
            if let Err(err) = self.write(id, next, true) {
                trace!(node = ?id, error = %err, "memo vanished while storing its value");
            }
        } else {
            let running = self.transition_running();
            let mut transition = self.transition.borrow_mut();
            let mut arena = self.arena.borrow_mut();
            if let Some(node) = arena.get_mut(id) {
                match transition.as_mut() {
                    Some(transition) if running && kind.is_pure() => {
                        transition.sources.insert(id);
                        node.t_value = Some(next);
                    }
                    _ => node.value = Some(next),
                }
            }
        }

        if let Some(node) = self.arena.borrow_mut().get_mut(id) {
            node.updated_at = Some(time);
        }
    }

    /// Bring a queued node up to date, running stale ancestors first.
    pub(crate) fn run_top(&self, id: NodeId) {
        let running = self.transition_running();
        let (state, suspense) = match self.arena.borrow().get(id) {
            Some(node) => (node.state_in(running), node.suspense.clone()),
            None => return,
        };
        match state {
            NodeState::Clean => return,
            NodeState::Pending => return self.look_upstream(id, None),
            NodeState::Stale => {}
        }
        if let Some(suspense) = suspense {
            if suspense.in_fallback_untracked() {
                suspense.park(id);
                return;
            }
        }

        let exec_count = self.exec_count.get();
        let mut ancestors: NodeList = SmallVec::new();
        ancestors.push(id);
        let mut current = id;
        while let Some(owner) = self.owner_of(current) {
            let (updated_at, state) = match self.arena.borrow().get(owner) {
                Some(node) => (node.updated_at, node.state_in(running)),
                None => break,
            };
            if updated_at.is_some_and(|at| at >= exec_count) {
                break;
            }
            if running && self.transition_disposed(owner) {
                return;
            }
            if state != NodeState::Clean {
                ancestors.push(owner);
            }
            current = owner;
        }

        for i in (0..ancestors.len()).rev() {
            let node = ancestors[i];
            if running {
                let stop = ancestors.get(i + 1).copied();
                let mut top = self.owner_of(node);
                while let Some(ancestor) = top {
                    if Some(ancestor) == stop {
                        break;
                    }
                    if self.transition_disposed(ancestor) {
                        return;
                    }
                    top = self.owner_of(ancestor);
                }
            }
            match self.state_of(node, running) {
                NodeState::Stale => self.update_computation(node),
                NodeState::Pending => {
                    let updates = self.updates.borrow_mut().take();
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                        self.run_updates(|| self.look_upstream(node, Some(ancestors[0])), false)
                    }));
                    *self.updates.borrow_mut() = updates;
                    if let Err(payload) = outcome {
                        panic::resume_unwind(payload);
                    }
                }
                NodeState::Clean => {}
            }
        }
    }

    /// Resolve a pending node: run stale sources, recurse into pending ones.
    fn look_upstream(&self, id: NodeId, ignore: Option<NodeId>) {
        let running = self.transition_running();
        self.set_state(id, running, NodeState::Clean);

        for source in self.snapshot_sources(id) {
            let (kind, state, updated_at) = match self.arena.borrow().get(source) {
                Some(node) => (node.kind, node.state_in(running), node.updated_at),
                None => continue,
            };
            if !kind.is_computation() {
                continue;
            }
            match state {
                NodeState::Stale => {
                    let fresh = updated_at.is_some_and(|at| at >= self.exec_count.get());
                    if Some(source) != ignore && !fresh {
                        self.run_top(source);
                    }
                }
                NodeState::Pending => self.look_upstream(source, ignore),
                NodeState::Clean => {}
            }
        }
    }

    // ------------------------------------------------------------------
    // Batches
    // ------------------------------------------------------------------

    /// Run `f` inside a batch. Nested calls join the open batch.
    ///
    /// `init` skips opening the update queue, used when creating roots.
    pub(crate) fn run_updates<R>(&self, f: impl FnOnce() -> R, init: bool) -> R {
        if self.updates.borrow().is_some() {
            return f();
        }
        if !init {
            *self.updates.borrow_mut() = Some(Vec::new());
        }
        let wait = self.effects.borrow().is_some();
        if !wait {
            *self.effects.borrow_mut() = Some(Vec::new());
        }
        self.exec_count.set(self.exec_count.get() + 1);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let result = f();
            self.complete_updates(wait);
            result
        }));
        match outcome {
            Ok(result) => {
                if !wait {
                    self.drain_reruns();
                }
                result
            }
            Err(payload) => {
                let updates = self.updates.borrow_mut().take();
                let effects = if wait { None } else { self.effects.borrow_mut().take() };
                let effects = effects.into_iter().flatten().filter_map(|entry| entry.node());
                self.settle(updates.into_iter().flatten().chain(effects));
                panic::resume_unwind(payload)
            }
        }
    }

    /// Return nodes stranded in a dropped queue to clean, so the next write
    /// to their sources queues them again.
    fn settle(&self, ids: impl IntoIterator<Item = NodeId>) {
        let mut arena = self.arena.borrow_mut();
        for id in ids {
            if let Some(node) = arena.get_mut(id) {
                node.state = NodeState::Clean;
                node.t_state = None;
            }
        }
    }

    fn complete_updates(&self, wait: bool) {
        if self.updates.borrow().is_some() {
            let scheduled = self.scheduler.borrow().is_some() && self.transition_running();
            if scheduled {
                let queue = self.updates.borrow_mut().take().unwrap_or_default();
                self.schedule_queue(queue);
            } else {
                self.run_update_queue();
            }
            *self.updates.borrow_mut() = None;
        }
        if wait {
            return;
        }

        let mut committed = None;
        let settled = self
            .transition
            .borrow()
            .as_ref()
            .map(|transition| {
                let settled = transition.promises.is_empty() && transition.queue.is_empty();
                (settled, transition.running)
            });
        match settled {
            Some((true, _)) => {
                let finished = self.transition.borrow_mut().take();
                if let Some(transition) = finished {
                    let Transition {
                        sources,
                        effects,
                        disposed,
                        done,
                        ..
                    } = transition;
                    {
                        let mut queue = self.effects.borrow_mut();
                        let queue = queue.get_or_insert_with(Vec::new);
                        queue.extend(effects);
                        let mut arena = self.arena.borrow_mut();
                        for entry in queue.iter() {
                            if let QueuedEffect::Node(id) = entry {
                                if let Some(node) = arena.get_mut(*id) {
                                    if let Some(state) = node.t_state.take() {
                                        node.state = state;
                                    }
                                }
                            }
                        }
                    }
                    debug!(
                        sources = sources.len(),
                        disposed = disposed.len(),
                        "transition committed"
                    );
                    self.run_updates(|| self.commit_transition(sources, disposed), false);
                    committed = Some(done);
                }
            }
            Some((false, true)) => {
                let parked = self.effects.borrow_mut().take().unwrap_or_default();
                if let Some(transition) = self.transition.borrow_mut().as_mut() {
                    transition.running = false;
                    transition.effects.extend(parked);
                }
                debug!("transition suspended");
                self.set_transition_pending(true);
                return;
            }
            _ => {}
        }

        let effects = self.effects.borrow_mut().take().unwrap_or_default();
        if !effects.is_empty() {
            self.run_updates(|| self.run_effects(effects), false);
        }
        if let Some(done) = committed {
            done.send_replace(true);
        }
    }

    fn run_update_queue(&self) {
        let mut i = 0;
        loop {
            let next = self.updates.borrow().as_ref().and_then(|updates| updates.get(i).copied());
            let Some(id) = next else { break };
            self.run_top(id);
            i += 1;
        }
    }

    fn run_effects(&self, queue: Vec<QueuedEffect>) {
        let (user, first): (Vec<_>, Vec<_>) = queue.into_iter().partition(|entry| {
            entry
                .node()
                .and_then(|id| self.kind_of(id))
                .is_some_and(NodeKind::is_user)
        });
        let mut pending: VecDeque<QueuedEffect> = first.into_iter().chain(user).collect();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            while let Some(entry) = pending.pop_front() {
                match entry {
                    QueuedEffect::Node(id) => self.run_top(id),
                    QueuedEffect::Error { error, handlers, holder } => {
                        self.run_errors(&error, &handlers, holder)
                    }
                }
            }
        }));
        if let Err(payload) = outcome {
            self.settle(pending.iter().filter_map(QueuedEffect::node));
            panic::resume_unwind(payload);
        }
    }

    /// Hand pure work queued under a transition to the scheduler.
    fn schedule_queue(&self, queue: Vec<NodeId>) {
        let Some(scheduler) = self.scheduler.borrow().clone() else {
            return;
        };
        for id in queue {
            let fresh = self
                .transition
                .borrow_mut()
                .as_mut()
                .is_some_and(|transition| transition.queue.insert(id));
            if !fresh {
                continue;
            }
            trace!(node = ?id, "scheduling transition work");
            scheduler.schedule(move |_| with_runtime(|rt| rt.run_scheduled(id)));
        }
    }

    fn run_scheduled(&self, id: NodeId) {
        if let Some(transition) = self.transition.borrow_mut().as_mut() {
            transition.queue.swap_remove(&id);
        }
        self.run_updates(
            || {
                self.set_transition_running(true);
                self.run_top(id);
            },
            false,
        );
        self.set_transition_running(false);
    }

    /// Re-run computations that were updated outside their transition so
    /// their tentative values catch up.
    fn drain_reruns(&self) {
        if self.draining_reruns.replace(true) {
            return;
        }
        loop {
            let next = {
                let mut reruns = self.reruns.borrow_mut();
                if reruns.is_empty() {
                    None
                } else {
                    Some(reruns.remove(0))
                }
            };
            let Some((id, time)) = next else { break };
            if !self.has_transition() || !self.contains(id) {
                continue;
            }
            self.run_updates(
                || {
                    self.set_transition_running(true);
                    let prev = self
                        .arena
                        .borrow()
                        .get(id)
                        .and_then(|node| node.t_value.clone().or_else(|| node.value.clone()));
                    self.run_computation(id, prev, time);
                },
                false,
            );
        }
        self.draining_reruns.set(false);
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    pub(crate) fn has_transition(&self) -> bool {
        self.transition.borrow().is_some()
    }

    pub(crate) fn transition_running(&self) -> bool {
        self.transition.borrow().as_ref().is_some_and(|transition| transition.running)
    }

    pub(crate) fn set_transition_running(&self, running: bool) {
        if let Some(transition) = self.transition.borrow_mut().as_mut() {
            transition.running = running;
        }
    }

    fn transition_has_source(&self, id: NodeId) -> bool {
        self.transition
            .borrow()
            .as_ref()
            .is_some_and(|transition| transition.sources.contains(&id))
    }

    fn transition_disposed(&self, id: NodeId) -> bool {
        self.transition
            .borrow()
            .as_ref()
            .is_some_and(|transition| transition.disposed.contains(&id))
    }

    pub(crate) fn add_transition_source(&self, id: NodeId) {
        if let Some(transition) = self.transition.borrow_mut().as_mut() {
            transition.sources.insert(id);
        }
    }

    pub(crate) fn add_transition_promise(&self, load: u64) {
        if let Some(transition) = self.transition.borrow_mut().as_mut() {
            transition.promises.insert(load);
        }
    }

    pub(crate) fn remove_transition_promise(&self, load: u64) {
        if let Some(transition) = self.transition.borrow_mut().as_mut() {
            transition.promises.swap_remove(&load);
        }
    }

    fn set_transition_pending(&self, pending: bool) {
        if let Some(id) = self.pending_signal.get() {
            if let Err(err) = self.write(id, Rc::new(pending), false) {
                trace!(error = %err, "transition indicator is gone");
            }
        }
    }

    /// Promote tentative values, swap in tentative children and dispose
    /// everything the transition dropped.
    fn commit_transition(
        &self,
        sources: impl IntoIterator<Item = NodeId>,
        disposed: impl IntoIterator<Item = NodeId>,
    ) {
        for id in disposed {
            self.dispose_node(id);
        }
        for id in sources {
            let previous = {
                let mut arena = self.arena.borrow_mut();
                let Some(node) = arena.get_mut(id) else { continue };
                if let Some(value) = node.t_value.take() {
                    node.value = Some(value);
                }
                node.t_state = None;
                match node.t_owned.take() {
                    Some(owned) => std::mem::replace(&mut node.owned, owned),
                    None => OwnedList::new(),
                }
            };
            // Usually already gone through the disposed set.
            for child in previous {
                self.dispose_node(child);
            }
        }
        self.set_transition_pending(false);
    }

    /// Mark a subtree as disposed from the transition's point of view.
    fn reset(&self, id: NodeId, top: bool) {
        if !top {
            self.set_state(id, true, NodeState::Clean);
            if let Some(transition) = self.transition.borrow_mut().as_mut() {
                transition.disposed.insert(id);
            }
        }
        let owned = self
            .arena
            .borrow()
            .get(id)
            .map(|node| node.owned.clone())
            .unwrap_or_default();
        for child in owned {
            self.reset(child, false);
        }
    }

    // ------------------------------------------------------------------
    // Disposal
    // ------------------------------------------------------------------

    /// Dispose a node's children, run its cleanups and sever its sources.
    ///
    /// The node itself stays in the arena so it can run again.
    pub(crate) fn clean_node(&self, id: NodeId) {
        let running = self.transition_running();
        let (pure, owned) = {
            let mut arena = self.arena.borrow_mut();
            let Some(node) = arena.get_mut(id) else { return };
            let pure = node.kind.is_pure();
            let owned = if running && pure {
                node.t_owned.take().unwrap_or_default()
            } else {
                std::mem::take(&mut node.owned)
            };
            (pure, owned)
        };

        for child in owned.iter().rev() {
            self.dispose_node(*child);
        }
        if running && pure {
            self.reset(id, true);
        }

        let cleanups = self
            .arena
            .borrow_mut()
            .get_mut(id)
            .map(|node| std::mem::take(&mut node.cleanups))
            .unwrap_or_default();
        if !cleanups.is_empty() {
            let _ctx = ReactiveContext::untracked();
            for cleanup in cleanups.into_iter().rev() {
                cleanup();
            }
        }

        self.arena.borrow_mut().unsubscribe_all(id);
        self.set_state(id, running, NodeState::Clean);
    }

    /// Clean a node and remove it from the graph.
    pub(crate) fn dispose_node(&self, id: NodeId) {
        if !self.contains(id) {
            return;
        }
        self.clean_node(id);
        if let Some(owner) = self.owner_of(id) {
            if let Some(owner) = self.arena.borrow_mut().get_mut(owner) {
                if let Some(pos) = owner.owned.iter().position(|child| *child == id) {
                    owner.owned.remove(pos);
                }
                if let Some(t_owned) = owner.t_owned.as_mut() {
                    if let Some(pos) = t_owned.iter().position(|child| *child == id) {
                        t_owned.remove(pos);
                    }
                }
            }
        }
        // Node contents drop outside the borrow.
        let removed = self.arena.borrow_mut().remove(id);
        drop(removed);
        trace!(node = ?id, "disposed");
    }

    // ------------------------------------------------------------------
    // Errors
    // ------------------------------------------------------------------

    /// Nearest owner, starting at `owner`, that registered error handlers.
    fn find_error_handlers(&self, owner: Option<NodeId>) -> Option<(NodeId, Vec<ErrorHandler>)> {
        let arena = self.arena.borrow();
        let mut current = owner;
        while let Some(id) = current {
            let node = arena.get(id)?;
            if !node.error_handlers.is_empty() {
                return Some((id, node.error_handlers.clone()));
            }
            current = node.owner;
        }
        None
    }

    /// Route an error to the nearest handler, or resume unwinding with it.
    ///
    /// Inside a batch delivery is deferred to the effect phase.
    pub(crate) fn handle_error(&self, err: ReactiveError, owner: Option<NodeId>) {
        let Some((holder, handlers)) = self.find_error_handlers(owner) else {
            panic::resume_unwind(Box::new(err));
        };
        let error = Rc::new(err);
        let queued = match self.effects.borrow_mut().as_mut() {
            Some(effects) => {
                effects.push(QueuedEffect::Error {
                    error: error.clone(),
                    handlers: handlers.clone(),
                    holder,
                });
                true
            }
            None => false,
        };
        if !queued {
            self.run_errors(&error, &handlers, holder);
        }
    }

    /// Call each handler in order. A failing handler escalates to the owner
    /// above the one that registered it.
    fn run_errors(&self, err: &ReactiveError, handlers: &[ErrorHandler], holder: NodeId) {
        let escalate_to = self.owner_of(holder);
        let _ctx = ReactiveContext::untracked();
        for handler in handlers {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(err))) {
                match ReactiveError::from_panic(payload) {
                    Ok(next) => self.handle_error(next, escalate_to),
                    Err(fatal) => panic::resume_unwind(fatal),
                }
                return;
            }
        }
    }
}

/// Run `f` without tracking reads. The owner is unchanged.
pub fn untrack<R>(f: impl FnOnce() -> R) -> R {
    let _ctx = ReactiveContext::untracked();
    f()
}

/// Group writes so that downstream work runs once, when `f` returns.
pub fn batch<R>(f: impl FnOnce() -> R) -> R {
    with_runtime(|rt| rt.run_updates(f, false))
}

/// Replace this thread's runtime settings.
pub fn configure(config: RuntimeConfig) {
    with_runtime(|rt| rt.config.set(config));
}

/// Number of live nodes on this thread.
pub fn node_count() -> usize {
    with_runtime(Runtime::node_count)
}
