//! Effect Implementation
//!
//! An Effect is a side-effecting computation that runs whenever its
//! dependencies change.
//!
//! # How Effects Work
//!
//! 1. A user effect created inside a batch (including a root) is queued and
//!    first runs when the batch closes, after render effects and pure work.
//!    Created outside any batch it runs immediately.
//!
//! 2. When any dependency changes, the effect is queued on the effect queue
//!    and re-runs after the pure queue drains.
//!
//! 3. Before re-running, the effect disposes what it owns, runs its
//!    cleanups and drops its old dependencies, then tracks new ones.
//!
//! # Kinds
//!
//! - [`Effect::new`]: a user effect, deferred behind render effects.
//! - [`Effect::new_render`]: runs immediately on creation and before user
//!   effects in every flush.
//! - [`Effect::new_computed`]: a pure computation whose result nobody reads,
//!   scheduled with memos.
//!
//! # Cleanup
//!
//! Register cleanups with [`on_cleanup`](super::on_cleanup) inside the
//! body. They run before the next run and when the effect is disposed.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use super::memo::erase_compute;
use super::runtime::{untrack, with_runtime};
use super::suspense::SuspenseContext;
use crate::graph::{NodeId, NodeKind, NodeState};

/// A side-effecting computation that runs when dependencies change.
///
/// # Example
///
/// ```rust,ignore
/// let count = Signal::new(0);
///
/// Effect::new(move || {
///     println!("Count is: {}", count.get());
/// });
///
/// count.set(1); // Prints "Count is: 1"
/// ```
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Effect {
    id: NodeId,
}

impl Effect {
    /// Create a user effect.
    pub fn new(f: impl FnMut() + 'static) -> Self {
        let mut f = f;
        Self::new_with_prev(move |_: Option<&()>| f())
    }

    /// Create a user effect that threads a value from one run to the next.
    pub fn new_with_prev<T: 'static>(f: impl FnMut(Option<&T>) -> T + 'static) -> Self {
        let suspense = SuspenseContext::current();
        let id = with_runtime(|rt| {
            let compute = Some(erase_compute(f));
            let id = rt.create_computation(NodeKind::Effect, compute, None, NodeState::Stale);
            rt.attach_suspense(id, suspense);
            if !rt.push_effect(id) {
                rt.update_computation(id);
            }
            id
        });
        Self { id }
    }

    /// Create a render effect. It runs once immediately.
    pub fn new_render(f: impl FnMut() + 'static) -> Self {
        let mut f = f;
        Self::new_render_with_prev(move |_: Option<&()>| f())
    }

    /// Render effect that threads a value from one run to the next.
    pub fn new_render_with_prev<T: 'static>(f: impl FnMut(Option<&T>) -> T + 'static) -> Self {
        Self::build_immediate(NodeKind::RenderEffect, f)
    }

    /// Create a pure computation whose result is not observed.
    pub fn new_computed(f: impl FnMut() + 'static) -> Self {
        let mut f = f;
        Self::build_immediate(NodeKind::Computed, move |_: Option<&()>| f())
    }

    fn build_immediate<T: 'static>(
        kind: NodeKind,
        f: impl FnMut(Option<&T>) -> T + 'static,
    ) -> Self {
        let id = with_runtime(|rt| {
            let id = rt.create_computation(kind, Some(erase_compute(f)), None, NodeState::Stale);
            if rt.scheduler.borrow().is_some() && rt.transition_running() {
                rt.push_update(id);
            } else {
                rt.update_computation(id);
            }
            id
        });
        Self { id }
    }

    /// Get the effect's node ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Dispose the effect, running its cleanups.
    pub fn dispose(&self) {
        with_runtime(|rt| rt.dispose_node(self.id));
    }

    pub fn is_disposed(&self) -> bool {
        !with_runtime(|rt| rt.contains(self.id))
    }

    /// Number of times the body has run.
    pub fn run_count(&self) -> u64 {
        with_runtime(|rt| rt.run_count(self.id))
    }

    /// Get the number of nodes read during the last run.
    pub fn dependency_count(&self) -> usize {
        with_runtime(|rt| rt.source_count(self.id))
    }
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.id)
            .field("run_count", &self.run_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

type Tracked = Rc<RefCell<Option<Box<dyn FnOnce()>>>>;

/// A computation that separates what it tracks from what it does.
///
/// [`Reaction::track`] runs a function and records its reads. The first time
/// any of them changes afterwards, `on_invalidate` runs once, untracked.
/// Tracking has to be renewed by calling `track` again.
#[derive(Clone)]
pub struct Reaction {
    id: NodeId,
    tracked: Tracked,
}

impl Reaction {
    pub fn new(on_invalidate: impl FnMut() + 'static) -> Self {
        let mut on_invalidate = on_invalidate;
        let tracked: Tracked = Rc::new(RefCell::new(None));
        let body = tracked.clone();
        let compute = erase_compute(move |_: Option<&()>| {
            let pending = body.borrow_mut().take();
            match pending {
                Some(track) => track(),
                None => untrack(&mut on_invalidate),
            }
        });

        let suspense = SuspenseContext::current();
        let id = with_runtime(|rt| {
            let id = rt.create_computation(NodeKind::Effect, Some(compute), None, NodeState::Clean);
            rt.attach_suspense(id, suspense);
            id
        });
        Self { id, tracked }
    }

    /// Run `f` now and react to the next change of anything it read.
    pub fn track(&self, f: impl FnOnce() + 'static) {
        *self.tracked.borrow_mut() = Some(Box::new(f));
        with_runtime(|rt| rt.update_computation(self.id));
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn dispose(&self) {
        with_runtime(|rt| rt.dispose_node(self.id));
    }
}

impl fmt::Debug for Reaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reaction").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Build a computation body with explicit dependencies.
///
/// Only the reads made by `deps` are tracked. `f` runs untracked and gets
/// the current input, the input of its previous run and its previous result.
/// With `defer` set, the first run only subscribes and yields `None`.
///
/// # Example
///
/// ```rust,ignore
/// Effect::new_with_prev(on(move || count.get(), move |count, prev, _| {
///     println!("{:?} -> {}", prev, count);
/// }, false));
/// ```
pub fn on<D, T>(
    deps: impl FnMut() -> D + 'static,
    f: impl FnMut(&D, Option<&D>, Option<&T>) -> T + 'static,
    defer: bool,
) -> impl FnMut(Option<&Option<T>>) -> Option<T>
where
    D: 'static,
    T: 'static,
{
    let mut deps = deps;
    let mut f = f;
    let mut defer = defer;
    let mut prev_input: Option<D> = None;
    move |prev: Option<&Option<T>>| {
        let input = deps();
        if std::mem::replace(&mut defer, false) {
            return None;
        }
        let prev_value = prev.and_then(Option::as_ref);
        let result = untrack(|| f(&input, prev_input.as_ref(), prev_value));
        prev_input = Some(input);
        Some(result)
    }
}

/// Run `f` once, untracked, after the current batch settles.
pub fn on_mount(f: impl FnOnce() + 'static) {
    let mut f = Some(f);
    Effect::new(move || {
        if let Some(f) = f.take() {
            untrack(f);
        }
    });
}
