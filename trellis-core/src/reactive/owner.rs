//! Ownership
//!
//! Every node is owned by the owner that was active when it was created:
//! a root, a computation, or an error boundary. Disposing an owner disposes
//! everything it owns, children first, then runs its own cleanups in reverse
//! registration order.
//!
//! Owners also carry context values and error handlers. Both are looked up by
//! walking the owner chain towards the root.

use std::any::{Any, TypeId};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use tracing::warn;

use super::context::ReactiveContext;
use super::runtime::with_runtime;
use crate::error::ReactiveError;
use crate::graph::{Node, NodeId, NodeKind, NodeState};

/// A handle to a node that owns other nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    id: NodeId,
}

impl Owner {
    /// The owner active on this thread, if any.
    pub fn current() -> Option<Self> {
        ReactiveContext::current_owner().map(|id| Self { id })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Run `f` under this owner, untracked, inside a batch.
    ///
    /// A panic raised by `f` is routed to this owner's error handlers and
    /// `None` is returned. Without a handler the panic resumes.
    pub fn run_with<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        with_runtime(|rt| {
            let _ctx = ReactiveContext::enter(Some(self.id), None);
            match panic::catch_unwind(AssertUnwindSafe(|| rt.run_updates(f, true))) {
                Ok(result) => Some(result),
                Err(payload) => match ReactiveError::from_panic(payload) {
                    Ok(err) => {
                        rt.handle_error(err, Some(self.id));
                        None
                    }
                    Err(fatal) => panic::resume_unwind(fatal),
                },
            }
        })
    }

    pub fn is_disposed(&self) -> bool {
        !with_runtime(|rt| rt.contains(self.id))
    }
}

/// Disposes a root created by [`create_root`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootDisposer {
    root: NodeId,
}

impl RootDisposer {
    /// Dispose the root and everything it owns.
    pub fn dispose(self) {
        with_runtime(|rt| {
            let _ctx = ReactiveContext::untracked();
            rt.dispose_node(self.root);
        });
    }

    pub fn owner(&self) -> Owner {
        Owner { id: self.root }
    }
}

/// Create a new ownership root and run `f` inside it, untracked.
///
/// Nothing created inside is disposed until the [`RootDisposer`] handed to
/// `f` is used. User effects created inside run when `f` returns.
///
/// # Example
///
/// ```rust,ignore
/// let (count, dispose) = create_root(|root| {
///     let count = Signal::new(0);
///     Effect::new(move || println!("{}", count.get()));
///     (count, root)
/// });
/// count.set(1);
/// dispose.dispose();
/// ```
pub fn create_root<R>(f: impl FnOnce(RootDisposer) -> R) -> R {
    with_runtime(|rt| {
        let mut node = Node::new(NodeKind::Root);
        node.owner = ReactiveContext::current_owner();
        let root = rt.insert_node(node);
        let _ctx = ReactiveContext::enter(Some(root), None);
        rt.run_updates(|| f(RootDisposer { root }), true)
    })
}

/// Register `f` to run when the current owner is disposed or re-runs.
pub fn on_cleanup(f: impl FnOnce() + 'static) {
    match ReactiveContext::current_owner() {
        Some(owner) => with_runtime(|rt| rt.add_cleanup(owner, Box::new(f))),
        None => warn!("cleanups created outside a `create_root` will never be run"),
    }
}

/// Register an error handler on the current owner.
///
/// Errors raised by any computation below the owner are delivered to the
/// nearest owner with handlers.
pub fn on_error(handler: impl Fn(&ReactiveError) + 'static) {
    match ReactiveContext::current_owner() {
        Some(owner) => with_runtime(|rt| rt.add_error_handler(owner, Rc::new(handler))),
        None => warn!("error handlers created outside a `create_root` will never be run"),
    }
}

/// Run `f` under a new error boundary.
///
/// Errors raised by `f` itself or by computations it creates go to
/// `handler`. Returns `None` if `f` itself failed.
pub fn catch_error<R>(
    f: impl FnOnce() -> R,
    handler: impl Fn(&ReactiveError) + 'static,
) -> Option<R> {
    with_runtime(|rt| {
        let boundary = rt.create_computation(NodeKind::Boundary, None, None, NodeState::Clean);
        rt.add_error_handler(boundary, Rc::new(handler));
        if rt.transition_running() {
            rt.add_transition_source(boundary);
        }

        let _ctx = ReactiveContext::enter(Some(boundary), ReactiveContext::current_listener());
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(result) => Some(result),
            Err(payload) => match ReactiveError::from_panic(payload) {
                Ok(err) => {
                    rt.handle_error(err, Some(boundary));
                    None
                }
                Err(fatal) => panic::resume_unwind(fatal),
            },
        }
    })
}

/// Make `value` visible to everything created under the current owner.
pub fn provide_context<T: Clone + 'static>(value: T) {
    match ReactiveContext::current_owner() {
        Some(owner) => {
            with_runtime(|rt| rt.provide_context(owner, TypeId::of::<T>(), Rc::new(value)))
        }
        None => warn!("context provided outside a `create_root` is not visible anywhere"),
    }
}

/// Find the nearest value of type `T` provided on the owner chain.
pub fn use_context<T: Clone + 'static>() -> Option<T> {
    let owner = ReactiveContext::current_owner();
    let value = with_runtime(|rt| rt.find_context(owner, TypeId::of::<T>()))?;
    (&*value as &dyn Any).downcast_ref::<T>().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{Effect, Memo, Signal};
    use std::cell::{Cell, RefCell};

    #[test]
    fn root_disposal_runs_cleanups_children_first() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let root = create_root({
            let log = log.clone();
            move |root| {
                let outer = log.clone();
                on_cleanup(move || outer.borrow_mut().push("root 1"));
                let inner = log.clone();
                Effect::new_render(move || {
                    let inner = inner.clone();
                    on_cleanup(move || inner.borrow_mut().push("child"));
                });
                let last = log.clone();
                on_cleanup(move || last.borrow_mut().push("root 2"));
                root
            }
        });

        root.dispose();
        assert_eq!(*log.borrow(), vec!["child", "root 2", "root 1"]);
    }

    #[test]
    fn rerun_disposes_owned_computations() {
        let inner_runs = Rc::new(Cell::new(0));
        let (signal, root) = create_root({
            let inner_runs = inner_runs.clone();
            move |root| {
                let signal = Signal::new(0);
                Effect::new_render(move || {
                    signal.get();
                    let inner_runs = inner_runs.clone();
                    let constant = Signal::new(1);
                    Effect::new_render(move || {
                        constant.get();
                        inner_runs.set(inner_runs.get() + 1);
                    });
                });
                (signal, root)
            }
        });
        let before = with_runtime(|rt| rt.node_count());
        signal.set(1);
        signal.set(2);
        assert_eq!(inner_runs.get(), 3);
        assert_eq!(with_runtime(|rt| rt.node_count()), before);
        root.dispose();
    }

    #[test]
    fn context_is_inherited_by_children() {
        create_root(|root| {
            provide_context(String::from("theme"));
            let seen = Memo::new(|| use_context::<String>());
            assert_eq!(seen.get(), Some(String::from("theme")));
            assert_eq!(use_context::<u32>(), None);
            root.dispose();
        });
    }

    #[test]
    fn inner_context_shadows_outer() {
        create_root(|root| {
            provide_context(1u32);
            create_root(|inner| {
                provide_context(2u32);
                assert_eq!(use_context::<u32>(), Some(2));
                inner.dispose();
            });
            assert_eq!(use_context::<u32>(), Some(1));
            root.dispose();
        });
    }

    #[test]
    fn catch_error_handles_direct_panic() {
        let caught = Rc::new(RefCell::new(None));
        let sink = caught.clone();
        let result = create_root(move |root| {
            let result: Option<i32> =
                catch_error(|| panic!("broken"), move |err| *sink.borrow_mut() = Some(err.clone()));
            root.dispose();
            result
        });
        assert_eq!(result, None);
        assert_eq!(*caught.borrow(), Some(ReactiveError::Panicked("broken".into())));
    }

    #[test]
    fn on_error_receives_computation_failure() {
        let caught = Rc::new(RefCell::new(Vec::new()));
        let (signal, root) = create_root({
            let caught = caught.clone();
            move |root| {
                on_error(move |err| caught.borrow_mut().push(err.clone()));
                let signal = Signal::new(0);
                Effect::new(move || {
                    if signal.get() == 1 {
                        ReactiveError::failed("one is not allowed").raise();
                    }
                });
                (signal, root)
            }
        });
        signal.set(1);
        assert_eq!(*caught.borrow(), vec![ReactiveError::failed("one is not allowed")]);

        // The effect keeps its subscription and runs again.
        signal.set(2);
        assert_eq!(caught.borrow().len(), 1);
        root.dispose();
    }

    #[test]
    fn failing_handler_escalates_to_outer_owner() {
        let outer = Rc::new(RefCell::new(Vec::new()));
        let sink = outer.clone();
        create_root(move |root| {
            on_error(move |err| sink.borrow_mut().push(err.to_string()));
            catch_error(
                || {
                    Memo::new(|| -> i32 { panic!("inner") });
                },
                |_| panic!("handler"),
            );
            root
        })
        .dispose();
        assert_eq!(*outer.borrow(), vec![String::from("computation panicked: handler")]);
    }

    #[test]
    fn unhandled_error_propagates() {
        let outcome = panic::catch_unwind(|| {
            create_root(|_| {
                Memo::new(|| -> i32 { ReactiveError::failed("nobody listens").raise() });
            })
        });
        let payload = outcome.unwrap_err();
        assert_eq!(
            payload.downcast_ref::<ReactiveError>(),
            Some(&ReactiveError::failed("nobody listens"))
        );
    }

    #[test]
    fn run_with_restores_owner() {
        create_root(|root| {
            let owner = Owner::current().unwrap();
            let seen = Rc::new(Cell::new(None));
            let sink = seen.clone();
            Effect::new_render(move || {
                let inner = Owner::current().map(|o| o.id());
                sink.set(owner.run_with(|| Owner::current().map(|o| o.id())).flatten());
                assert_ne!(inner, Some(owner.id()));
            });
            assert_eq!(seen.get(), Some(owner.id()));
            root.dispose();
        });
    }
}
