//! Memo Implementation
//!
//! A Memo is a cached derived value that re-evaluates only when its
//! dependencies change.
//!
//! # How Memos Work
//!
//! 1. On creation, the memo runs its computation and caches the result.
//!
//! 2. When a source signal changes, the memo is marked stale and queued on
//!    the pure queue. Memos downstream of it are marked pending.
//!
//! 3. A pending memo looks upstream before running: if none of its sources
//!    produced a different value, it becomes clean without recomputing.
//!
//! 4. A memo only notifies its own observers when its comparator reports the
//!    new result different from the cached one.
//!
//! Reading a memo that is not clean brings it up to date first, so reads
//! inside a batch never see a stale value.

use std::any::Any;
use std::cell::RefCell;
use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::rc::Rc;

use super::runtime::{untrack, with_runtime};
use super::signal::downcast;
use crate::error::{ReactiveError, Result};
use crate::graph::{erase_comparator, Comparator, ComputeFn, NodeId, NodeKind, NodeState, Value};

/// Build a type-erased computation body from a typed one.
pub(crate) fn erase_compute<T: 'static>(mut f: impl FnMut(Option<&T>) -> T + 'static) -> ComputeFn {
    Rc::new(RefCell::new(move |prev: Option<&dyn Any>| -> Value {
        Rc::new(f(prev.and_then(|prev| prev.downcast_ref::<T>())))
    }))
}

/// A cached derived value that recomputes only when dependencies change.
///
/// # Type Parameters
///
/// - `T`: The type of the computed value. The comparator (equality by
///   default) decides whether a recomputation is a change.
pub struct Memo<T> {
    id: NodeId,
    ty: PhantomData<T>,
}

impl<T> Memo<T>
where
    T: Clone + 'static,
{
    /// Create a new memo with the given computation function.
    ///
    /// The computation runs immediately, tracked.
    pub fn new(f: impl FnMut() -> T + 'static) -> Self
    where
        T: PartialEq,
    {
        let mut f = f;
        Self::new_with_prev(move |_| f())
    }

    /// Create a memo whose computation receives the previous value.
    pub fn new_with_prev(f: impl FnMut(Option<&T>) -> T + 'static) -> Self
    where
        T: PartialEq,
    {
        Self::build(f, Some(erase_comparator(T::eq)))
    }

    /// Create a memo with a custom equality test.
    pub fn new_with_equals(
        f: impl FnMut(Option<&T>) -> T + 'static,
        equals: impl Fn(&T, &T) -> bool + 'static,
    ) -> Self {
        Self::build(f, Some(erase_comparator(equals)))
    }

    /// Create a memo that notifies its observers after every run.
    pub fn always_notify(f: impl FnMut(Option<&T>) -> T + 'static) -> Self {
        Self::build(f, None)
    }

    fn build(f: impl FnMut(Option<&T>) -> T + 'static, comparator: Option<Comparator>) -> Self {
        let id = with_runtime(|rt| {
            let compute = Some(erase_compute(f));
            let id = rt.create_computation(NodeKind::Memo, compute, None, NodeState::Clean);
            rt.set_comparator(id, comparator);
            let deferred = rt.scheduler.borrow().is_some() && rt.transition_running();
            if deferred {
                if let Some(node) = rt.arena.borrow_mut().get_mut(id) {
                    node.t_state = Some(NodeState::Stale);
                }
                rt.push_update(id);
            } else {
                rt.update_computation(id);
            }
            id
        });
        Self { id, ty: PhantomData }
    }

    /// Get the current value, recomputing first if needed.
    ///
    /// # Panics
    ///
    /// Panics if the memo has been disposed or has never produced a value.
    pub fn get(&self) -> T {
        self.try_get().unwrap_or_else(|err| err.raise())
    }

    /// Fallible form of [`Memo::get`].
    pub fn try_get(&self) -> Result<T> {
        let value = with_runtime(|rt| rt.read(self.id))?;
        downcast(self.id, &value)
    }

    /// Get the current value without tracking dependencies.
    pub fn get_untracked(&self) -> T {
        untrack(|| self.get())
    }

    /// Borrow the current value without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let value = with_runtime(|rt| rt.read(self.id)).unwrap_or_else(|err| err.raise());
        match (&*value as &dyn Any).downcast_ref::<T>() {
            Some(value) => f(value),
            None => ReactiveError::TypeMismatch(self.id).raise(),
        }
    }
}

impl<T> Memo<T> {
    /// Get the memo's node ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Get the current committed freshness.
    pub fn state(&self) -> NodeState {
        with_runtime(|rt| rt.state_of(self.id, false))
    }

    /// Number of times the computation has run.
    pub fn run_count(&self) -> u64 {
        with_runtime(|rt| rt.run_count(self.id))
    }

    /// Get the number of computations currently subscribed.
    pub fn observer_count(&self) -> usize {
        with_runtime(|rt| rt.observer_count(self.id))
    }

    /// Get the number of nodes read during the last run.
    pub fn source_count(&self) -> usize {
        with_runtime(|rt| rt.source_count(self.id))
    }

    /// Dispose the memo and everything it owns.
    pub fn dispose(&self) {
        with_runtime(|rt| rt.dispose_node(self.id));
    }

    pub fn is_disposed(&self) -> bool {
        !with_runtime(|rt| rt.contains(self.id))
    }
}

impl<T> Clone for Memo<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Memo<T> {}

impl<T> PartialEq for Memo<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Memo<T> {}

impl<T> Debug for Memo<T>
where
    T: Clone + Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memo")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("run_count", &self.run_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{batch, create_root, Signal};
    use std::cell::Cell;

    #[test]
    fn memo_computes_eagerly() {
        create_root(|root| {
            let runs = Rc::new(Cell::new(0));
            let counter = runs.clone();
            let memo = Memo::new(move || {
                counter.set(counter.get() + 1);
                42
            });

            assert_eq!(runs.get(), 1);
            assert_eq!(memo.get(), 42);
            assert_eq!(memo.get(), 42);
            assert_eq!(runs.get(), 1);
            root.dispose();
        });
    }

    #[test]
    fn memo_tracks_signal_dependency() {
        let (signal, memo, root) = create_root(|root| {
            let signal = Signal::new(10);
            let memo = Memo::new(move || signal.get() * 2);
            (signal, memo, root)
        });
        assert_eq!(memo.get(), 20);
        assert_eq!(memo.source_count(), 1);

        signal.set(5);
        assert_eq!(memo.get(), 10);
        assert_eq!(memo.state(), NodeState::Clean);
        root.dispose();
    }

    #[test]
    fn memo_receives_previous_value() {
        let (signal, total, root) = create_root(|root| {
            let signal = Signal::new(1);
            let total = Memo::new_with_prev(move |prev: Option<&i32>| {
                prev.copied().unwrap_or(0) + signal.get()
            });
            (signal, total, root)
        });
        assert_eq!(total.get(), 1);
        signal.set(2);
        assert_eq!(total.get(), 3);
        signal.set(4);
        assert_eq!(total.get(), 7);
        root.dispose();
    }

    #[test]
    fn batched_writes_recompute_once() {
        let (a, b, sum, root) = create_root(|root| {
            let a = Signal::new(1);
            let b = Signal::new(2);
            let sum = Memo::new(move || a.get() + b.get());
            (a, b, sum, root)
        });
        assert_eq!(sum.run_count(), 1);

        batch(|| {
            a.set(10);
            b.set(20);
        });
        assert_eq!(sum.get(), 30);
        assert_eq!(sum.run_count(), 2);
        root.dispose();
    }

    #[test]
    fn read_inside_batch_sees_fresh_value() {
        let (signal, memo, root) = create_root(|root| {
            let signal = Signal::new(1);
            let memo = Memo::new(move || signal.get() + 1);
            (signal, memo, root)
        });
        batch(|| {
            signal.set(5);
            assert_eq!(memo.get(), 6);
        });
        root.dispose();
    }

    #[test]
    fn equal_result_stops_propagation() {
        let (signal, downstream_runs, root) = create_root(|root| {
            let signal = Signal::new(1);
            let parity = Memo::new(move || signal.get() % 2);
            let runs = Rc::new(Cell::new(0));
            let counter = runs.clone();
            let _downstream = Memo::new(move || {
                counter.set(counter.get() + 1);
                parity.get()
            });
            (signal, runs, root)
        });
        assert_eq!(downstream_runs.get(), 1);

        signal.set(3);
        assert_eq!(downstream_runs.get(), 1);

        signal.set(4);
        assert_eq!(downstream_runs.get(), 2);
        root.dispose();
    }

    #[test]
    fn disposed_memo_reports_error() {
        let memo = create_root(|root| {
            let memo = Memo::new(|| 1);
            root.dispose();
            memo
        });
        assert!(memo.is_disposed());
        assert_eq!(memo.try_get(), Err(ReactiveError::Disposed(memo.id())));
    }
}
