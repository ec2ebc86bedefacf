//! Suspense Counting
//!
//! A [`SuspenseContext`] counts outstanding asynchronous reads below a
//! boundary. While the count is non-zero the boundary is "in fallback":
//! effects created under it are parked instead of run, and replayed once the
//! count returns to zero.
//!
//! The context is found through the owner chain like any other context
//! value, so it has to be [provided](SuspenseContext::provide) above the
//! resources that should count against it.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use tracing::{debug, trace};

use super::owner::{provide_context, use_context};
use super::runtime::{try_with_runtime, untrack, with_runtime};
use super::signal::Signal;
use crate::graph::{erase_comparator, NodeId};

struct SuspenseInner {
    count: Cell<usize>,
    in_fallback: Signal<bool>,
    parked: RefCell<Vec<NodeId>>,
    resolved: Cell<bool>,
}

impl SuspenseInner {
    fn set_fallback(&self, in_fallback: bool) {
        if let Err(err) = self.in_fallback.try_set(in_fallback) {
            trace!(error = %err, "fallback flag is gone");
        }
    }
}

impl Drop for SuspenseInner {
    fn drop(&mut self) {
        let id = self.in_fallback.id();
        try_with_runtime(|rt| {
            if rt.arena.try_borrow_mut().is_ok() {
                rt.dispose_node(id);
            }
        });
    }
}

/// Shared counter for one suspense boundary. Clones refer to the same counter.
#[derive(Clone)]
pub struct SuspenseContext {
    inner: Rc<SuspenseInner>,
}

impl SuspenseContext {
    /// Create a counter. The fallback flag lives as long as the context,
    /// not as long as the current owner.
    pub fn new() -> Self {
        let comparator = erase_comparator(|a: &bool, b: &bool| a == b);
        let flag =
            with_runtime(|rt| rt.create_signal_node(Rc::new(false), Some(comparator), false));
        Self {
            inner: Rc::new(SuspenseInner {
                count: Cell::new(0),
                in_fallback: Signal::from_id(flag),
                parked: RefCell::new(Vec::new()),
                resolved: Cell::new(false),
            }),
        }
    }

    /// Record one more outstanding read.
    pub fn increment(&self) {
        let count = self.inner.count.get() + 1;
        self.inner.count.set(count);
        if count == 1 {
            debug!("suspense entered fallback");
            self.inner.set_fallback(true);
        }
    }

    /// Record one completed read. Reaching zero leaves fallback and replays
    /// parked effects.
    pub fn decrement(&self) {
        let previous = self.inner.count.get();
        let count = previous.saturating_sub(1);
        self.inner.count.set(count);
        if previous > 0 && count == 0 {
            debug!("suspense resolved");
            self.inner.set_fallback(false);
            self.resume();
        }
    }

    /// Whether the boundary is showing its fallback. Tracked.
    pub fn in_fallback(&self) -> bool {
        self.inner.in_fallback.try_get().unwrap_or(false)
    }

    pub(crate) fn in_fallback_untracked(&self) -> bool {
        untrack(|| self.in_fallback())
    }

    /// The fallback flag as a signal, for effects that render it.
    pub fn fallback_signal(&self) -> Signal<bool> {
        self.inner.in_fallback
    }

    pub fn count(&self) -> usize {
        self.inner.count.get()
    }

    /// Whether the boundary has resolved at least once.
    pub fn is_resolved(&self) -> bool {
        self.inner.resolved.get()
    }

    /// Make this context the nearest one for everything created under the
    /// current owner.
    pub fn provide(&self) {
        provide_context(self.clone());
    }

    /// The nearest context on the owner chain.
    pub fn current() -> Option<Self> {
        use_context::<Self>()
    }

    /// Mark the boundary resolved and run the effects parked while it was in
    /// fallback.
    pub fn resume(&self) {
        self.inner.resolved.set(true);
        let parked = std::mem::take(&mut *self.inner.parked.borrow_mut());
        if parked.is_empty() {
            return;
        }
        debug!(effects = parked.len(), "replaying parked effects");
        with_runtime(|rt| {
            rt.run_updates(
                || {
                    for id in parked {
                        rt.push_effect(id);
                    }
                },
                false,
            )
        });
    }

    /// Number of effects waiting for the boundary to resolve.
    pub fn parked(&self) -> usize {
        self.inner.parked.borrow().len()
    }

    pub(crate) fn park(&self, id: NodeId) {
        self.inner.parked.borrow_mut().push(id);
    }
}

impl Default for SuspenseContext {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for SuspenseContext {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for SuspenseContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuspenseContext")
            .field("count", &self.count())
            .field("resolved", &self.is_resolved())
            .field("parked", &self.parked())
            .finish()
    }
}
