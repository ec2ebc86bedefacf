//! Signal Implementation
//!
//! A Signal is the fundamental reactive primitive. It holds a value and
//! tracks which computations depend on it.
//!
//! # How Signals Work
//!
//! 1. When a signal is read within a tracking context (memo/effect), the
//!    runtime subscribes that computation to the signal.
//!
//! 2. When a signal is written with a value its comparator considers
//!    different, every subscriber is marked stale and scheduled.
//!
//! 3. Writes inside a batch are coalesced: downstream work runs once, when
//!    the outermost batch closes.
//!
//! # Memory Layout
//!
//! A `Signal<T>` is just a [`NodeId`]. The value lives in the runtime's node
//! arena, type-erased behind an `Rc<dyn Any>`, so handles are `Copy` and can
//! be captured by any number of closures.

use std::any::Any;
use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::rc::Rc;

use super::runtime::{untrack, with_runtime};
use crate::error::{ReactiveError, Result};
use crate::graph::{erase_comparator, NodeId, Value};

/// A reactive cell holding a value of type `T`.
///
/// # Type Parameters
///
/// - `T`: The type of value stored in the signal. Reads hand out clones.
///
/// # Example
///
/// ```rust,ignore
/// let count = Signal::new(0);
///
/// // Read the value
/// let value = count.get();
///
/// // Update the value (notifies subscribers)
/// count.set(5);
/// ```
pub struct Signal<T> {
    id: NodeId,
    ty: PhantomData<T>,
}

impl<T> Signal<T>
where
    T: Clone + 'static,
{
    /// Create a new signal that skips writes of an equal value.
    pub fn new(value: T) -> Self
    where
        T: PartialEq,
    {
        Self::new_with_equals(value, T::eq)
    }

    /// Create a new signal with a custom equality test.
    pub fn new_with_equals(value: T, equals: impl Fn(&T, &T) -> bool + 'static) -> Self {
        Self::build(value, Some(erase_comparator(equals)))
    }

    /// Create a new signal that notifies on every write.
    pub fn always_notify(value: T) -> Self {
        Self::build(value, None)
    }

    fn build(value: T, comparator: Option<crate::graph::Comparator>) -> Self {
        let id = with_runtime(|rt| rt.create_signal_node(Rc::new(value), comparator, true));
        Self::from_id(id)
    }

    /// Get the current value.
    ///
    /// If called within a tracking context, this also subscribes the current
    /// computation.
    ///
    /// # Panics
    ///
    /// Panics if the signal has been disposed. Inside a computation the panic
    /// is routed to the nearest error handler like any other failure.
    pub fn get(&self) -> T {
        self.try_get().unwrap_or_else(|err| err.raise())
    }

    /// Fallible form of [`Signal::get`].
    pub fn try_get(&self) -> Result<T> {
        let value = with_runtime(|rt| rt.read(self.id))?;
        downcast(self.id, &value)
    }

    /// Get the current value without tracking dependencies.
    pub fn get_untracked(&self) -> T {
        untrack(|| self.get())
    }

    /// Borrow the current value without cloning it. Tracks like [`Signal::get`].
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let value = with_runtime(|rt| rt.read(self.id)).unwrap_or_else(|err| err.raise());
        match (&*value as &dyn Any).downcast_ref::<T>() {
            Some(value) => f(value),
            None => ReactiveError::TypeMismatch(self.id).raise(),
        }
    }

    /// Set a new value and notify subscribers.
    ///
    /// This will trigger re-execution of all dependent computations unless
    /// the comparator reports the new value equal to the current one.
    pub fn set(&self, value: T) {
        if let Err(err) = self.try_set(value) {
            err.raise();
        }
    }

    /// Fallible form of [`Signal::set`].
    pub fn try_set(&self, value: T) -> Result<()> {
        with_runtime(|rt| rt.write(self.id, Rc::new(value), false))
    }

    /// Update the value using a function of the current value.
    ///
    /// The current value is read without tracking. Inside a running
    /// transition it is the tentative value.
    pub fn update(&self, f: impl FnOnce(&T) -> T) {
        let current = with_runtime(|rt| rt.peek(self.id)).unwrap_or_else(|err| err.raise());
        let next = match (&*current as &dyn Any).downcast_ref::<T>() {
            Some(current) => f(current),
            None => ReactiveError::TypeMismatch(self.id).raise(),
        };
        self.set(next);
    }

}

impl<T> Signal<T> {
    pub(crate) fn from_id(id: NodeId) -> Self {
        Self { id, ty: PhantomData }
    }

    /// Get the signal's node ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Get the number of computations currently subscribed.
    pub fn observer_count(&self) -> usize {
        with_runtime(|rt| rt.observer_count(self.id))
    }

    /// Whether the owner of this signal has been disposed.
    pub fn is_disposed(&self) -> bool {
        !with_runtime(|rt| rt.contains(self.id))
    }
}

/// Clone a typed value out of a type-erased one.
pub(crate) fn downcast<T: Clone + 'static>(id: NodeId, value: &Value) -> Result<T> {
    (&**value as &dyn Any)
        .downcast_ref::<T>()
        .cloned()
        .ok_or(ReactiveError::TypeMismatch(id))
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Signal<T> {}

impl<T> PartialEq for Signal<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Signal<T> {}

impl<T> Debug for Signal<T>
where
    T: Clone + Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = untrack(|| self.try_get());
        f.debug_struct("Signal")
            .field("id", &self.id)
            .field("value", &value.ok())
            .field("observer_count", &self.observer_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{create_root, Effect};
    use std::cell::Cell;

    #[test]
    fn signal_get_set() {
        let signal = Signal::always_notify(42);
        assert_eq!(signal.get(), 42);

        signal.set(100);
        assert_eq!(signal.get(), 100);
    }

    #[test]
    fn signal_update() {
        let signal = Signal::new(10);
        signal.update(|x| x + 5);
        assert_eq!(signal.get(), 15);
    }

    #[test]
    fn signal_with_borrows() {
        let signal = Signal::new(String::from("hello"));
        assert_eq!(signal.with(|s| s.len()), 5);
    }

    fn counting_effect<T: Clone + 'static>(signal: Signal<T>) -> Rc<Cell<u32>> {
        let runs = Rc::new(Cell::new(0));
        let counter = runs.clone();
        Effect::new_render(move || {
            signal.get();
            counter.set(counter.get() + 1);
        });
        runs
    }

    #[test]
    fn equal_write_is_skipped() {
        let (signal, runs, root) = create_root(|root| {
            let signal = Signal::new(1);
            (signal, counting_effect(signal), root)
        });
        assert_eq!(runs.get(), 1);

        signal.set(1);
        assert_eq!(runs.get(), 1);

        signal.set(2);
        assert_eq!(runs.get(), 2);
        root.dispose();
    }

    #[test]
    fn always_notify_reruns_on_equal_write() {
        let (signal, runs, root) = create_root(|root| {
            let signal = Signal::always_notify(1);
            (signal, counting_effect(signal), root)
        });
        signal.set(1);
        assert_eq!(runs.get(), 2);
        root.dispose();
    }

    #[test]
    fn custom_equality() {
        let (signal, runs, root) = create_root(|root| {
            // Equal when the lengths match.
            let signal = Signal::new_with_equals(String::from("abc"), |a, b| a.len() == b.len());
            (signal, counting_effect(signal), root)
        });
        signal.set(String::from("xyz"));
        assert_eq!(runs.get(), 1);
        assert_eq!(signal.get(), "abc");

        signal.set(String::from("abcd"));
        assert_eq!(runs.get(), 2);
        root.dispose();
    }

    #[test]
    fn disposed_signal_reports_error() {
        let signal = create_root(|root| {
            let signal = Signal::new(1);
            root.dispose();
            signal
        });
        assert!(signal.is_disposed());
        assert_eq!(signal.try_get(), Err(ReactiveError::Disposed(signal.id())));
        assert_eq!(signal.try_set(2), Err(ReactiveError::Disposed(signal.id())));
    }

    #[test]
    fn untracked_read_does_not_subscribe() {
        create_root(|root| {
            let signal = Signal::new(1);
            Effect::new_render(move || {
                signal.get_untracked();
            });
            assert_eq!(signal.observer_count(), 0);
            root.dispose();
        });
    }
}
