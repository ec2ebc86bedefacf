//! Reactive Primitives
//!
//! This module implements the core reactive system: signals, memos, effects
//! and the owners that dispose them. These primitives form the foundation of
//! Trellis's fine-grained reactivity.
//!
//! # Concepts
//!
//! ## Signals
//!
//! A Signal is a container for mutable state. When a signal's value is read
//! within a tracking context (such as a memo or effect), the signal
//! automatically registers that context as a dependent. When the signal's
//! value changes, all dependents are notified.
//!
//! ## Memos
//!
//! A Memo is a derived value that caches its result. It re-evaluates only
//! when one of its dependencies changes, and only notifies its own
//! dependents when the result is different.
//!
//! ## Effects
//!
//! An Effect is a side-effecting computation that runs whenever its
//! dependencies change. Effects run after every memo affected by the same
//! change has settled, so they never observe a half-updated graph.
//!
//! ## Owners
//!
//! Everything is created under an owner. Re-running or disposing an owner
//! disposes what it created. Roots are owners with no parent computation.
//!
//! ## Lists
//!
//! [`map_array`] and [`index_array`] map a reactive list while keeping one
//! owner per entry, so entries are created and disposed individually.
//!
//! ## Transitions
//!
//! A transition applies writes tentatively and commits them together once
//! the asynchronous work they started has finished.
//!
//! # Implementation Notes
//!
//! The reactive system uses a thread-local tracking context to automatically
//! detect dependencies. When a signal is read, we check if there is an active
//! listener and, if so, record the edge in the runtime's graph.

mod context;
mod deferred;
mod effect;
mod list;
mod memo;
mod owner;
mod resource;
mod runtime;
mod selector;
mod signal;
mod suspense;
mod transition;

pub use context::ReactiveContext;
pub use deferred::create_deferred;
pub use effect::{on, on_mount, Effect, Reaction};
pub use list::{index_array, map_array};
pub use memo::Memo;
pub use owner::{
    catch_error, create_root, on_cleanup, on_error, provide_context, use_context, Owner,
    RootDisposer,
};
pub use resource::{PendingLoad, Resource, ResourceState};
pub use runtime::{batch, configure, node_count, untrack};
pub use selector::Selector;
pub use signal::Signal;
pub use suspense::SuspenseContext;
pub use transition::{
    disable_scheduling, enable_scheduling, is_transition_pending, start_transition,
    transition_pending, TransitionHandle,
};
