//! Resources
//!
//! A [`Resource`] is a cell filled by an asynchronous load. Reads are
//! reactive like any signal; in addition, a read from a pure computation or
//! render effect below a [`SuspenseContext`] counts the outstanding load
//! against that boundary until it finishes.
//!
//! Loads started inside a running transition hold the transition open: it
//! cannot commit until every such load has resolved or failed. A newer load
//! supersedes an older one, whose result is then ignored.
//!
//! The resource does not fetch anything itself. [`Resource::begin_load`]
//! hands back a [`PendingLoad`] to complete from anywhere on the same
//! thread, and [`Resource::spawn_local`] drives a future on the current
//! tokio `LocalSet`.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, trace};

use super::context::ReactiveContext;
use super::effect::Effect;
use super::runtime::{batch, with_runtime};
use super::signal::Signal;
use super::suspense::SuspenseContext;
use crate::error::ReactiveError;

/// Counter for generating unique load IDs.
static LOAD_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_load_id() -> u64 {
    LOAD_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Lifecycle of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    /// Never loaded and no initial value.
    Unresolved,
    /// First load in flight.
    Pending,
    /// Holds a value.
    Ready,
    /// Holds a value and a newer load is in flight.
    Refreshing,
    /// The last load failed.
    Errored,
}

struct ResourceInner {
    /// The load whose result will be accepted.
    pending: Cell<Option<u64>>,
    resolved: Cell<bool>,
    loaded_under_transition: Cell<bool>,
    /// Suspense boundaries currently counting the pending load.
    contexts: RefCell<Vec<SuspenseContext>>,
}

/// A reactive cell filled by asynchronous loads.
pub struct Resource<T: 'static> {
    value: Signal<Option<T>>,
    error: Signal<Option<ReactiveError>>,
    state: Signal<ResourceState>,
    /// Written whenever a load starts, so suspense trackers re-run.
    track: Signal<()>,
    inner: Rc<ResourceInner>,
}

impl<T> Resource<T>
where
    T: Clone + 'static,
{
    /// Create an empty resource.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a resource that already holds a value.
    pub fn with_initial(value: T) -> Self {
        Self::build(Some(value))
    }

    fn build(initial: Option<T>) -> Self {
        let resolved = initial.is_some();
        let state = if resolved {
            ResourceState::Ready
        } else {
            ResourceState::Unresolved
        };
        Self {
            value: Signal::always_notify(initial),
            error: Signal::always_notify(None),
            state: Signal::new(state),
            track: Signal::always_notify(()),
            inner: Rc::new(ResourceInner {
                pending: Cell::new(None),
                resolved: Cell::new(resolved),
                loaded_under_transition: Cell::new(false),
                contexts: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Read the value, counting a pending load against the nearest suspense
    /// boundary when read from a pure computation or render effect.
    ///
    /// # Panics
    ///
    /// Raises the load error if the last load failed and no newer load is in
    /// flight.
    pub fn read(&self) -> Option<T> {
        let suspense = SuspenseContext::current();
        let value = self.value.get();
        if let Some(err) = self.error.get() {
            if self.inner.pending.get().is_none() {
                err.raise();
            }
        }

        let listener_is_user = ReactiveContext::current_listener()
            .and_then(|listener| with_runtime(|rt| rt.kind_of(listener)))
            .map(|kind| kind.is_user());
        if let (Some(false), Some(suspense)) = (listener_is_user, suspense) {
            let resource = self.clone();
            Effect::new_computed(move || {
                resource.track.get();
                let Some(load) = resource.inner.pending.get() else {
                    return;
                };
                if suspense.is_resolved() && resource.inner.loaded_under_transition.get() {
                    with_runtime(|rt| rt.add_transition_promise(load));
                } else if !resource.inner.contexts.borrow().contains(&suspense) {
                    suspense.increment();
                    resource.inner.contexts.borrow_mut().push(suspense.clone());
                }
            });
        }
        value
    }

    /// The most recent value. Unlike [`Resource::read`], never suspends once
    /// a value has been loaded.
    pub fn latest(&self) -> Option<T> {
        if !self.inner.resolved.get() {
            return self.read();
        }
        if let Some(err) = self.error.get() {
            if self.inner.pending.get().is_none() {
                err.raise();
            }
        }
        self.value.get()
    }

    pub fn state(&self) -> ResourceState {
        self.state.get()
    }

    /// Whether a load is in flight. Tracked.
    pub fn loading(&self) -> bool {
        matches!(self.state.get(), ResourceState::Pending | ResourceState::Refreshing)
    }

    /// The error of the last load, if it failed. Tracked.
    pub fn error(&self) -> Option<ReactiveError> {
        self.error.get()
    }

    /// Overwrite the value without a load.
    pub fn mutate(&self, value: Option<T>) {
        self.value.set(value);
    }

    /// Start a load. Any earlier load that has not finished is superseded.
    pub fn begin_load(&self) -> PendingLoad<T> {
        let load = next_load_id();
        with_runtime(|rt| {
            let running = rt.transition_running();
            self.inner.loaded_under_transition.set(running);
            if let Some(previous) = self.inner.pending.replace(Some(load)) {
                trace!(load = previous, "load superseded");
                rt.remove_transition_promise(previous);
            }
            if running {
                rt.add_transition_promise(load);
            }
        });
        debug!(load, "resource load started");

        let next_state = if self.inner.resolved.get() {
            ResourceState::Refreshing
        } else {
            ResourceState::Pending
        };
        batch(|| {
            self.state.set(next_state);
            self.track.set(());
        });
        PendingLoad {
            resource: self.clone(),
            load,
        }
    }

    /// Start a load driven by `fetch` on the current tokio `LocalSet`.
    pub fn spawn_local<F>(&self, fetch: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = Result<T, ReactiveError>> + 'static,
    {
        let load = self.begin_load();
        tokio::task::spawn_local(async move {
            match fetch.await {
                Ok(value) => load.resolve(value),
                Err(err) => load.reject(err),
            }
        })
    }

    fn load_end(&self, load: u64, outcome: Result<T, ReactiveError>) {
        if self.inner.pending.get() != Some(load) {
            trace!(load, "stale load result ignored");
            return;
        }
        self.inner.pending.set(None);
        self.inner.resolved.set(true);
        debug!(load, ok = outcome.is_ok(), "resource load finished");

        let under_transition = self.inner.loaded_under_transition.replace(false);
        with_runtime(|rt| {
            if under_transition && rt.has_transition() {
                rt.remove_transition_promise(load);
                rt.run_updates(
                    || {
                        rt.set_transition_running(true);
                        self.complete_load(outcome);
                    },
                    false,
                );
            } else {
                self.complete_load(outcome);
            }
        });
    }

    fn complete_load(&self, outcome: Result<T, ReactiveError>) {
        batch(|| {
            let state = match outcome {
                Ok(value) => {
                    self.value.set(Some(value));
                    self.error.set(None);
                    ResourceState::Ready
                }
                Err(err) => {
                    self.error.set(Some(err));
                    ResourceState::Errored
                }
            };
            self.state.set(state);
            let contexts = std::mem::take(&mut *self.inner.contexts.borrow_mut());
            for suspense in contexts {
                suspense.decrement();
            }
        });
    }
}

impl<T: Clone + 'static> Default for Resource<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Resource<T> {
    fn clone(&self) -> Self {
        Self {
            value: self.value,
            error: self.error,
            state: self.state,
            track: self.track,
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Resource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("value", &self.value.id())
            .field("pending", &self.inner.pending.get())
            .field("resolved", &self.inner.resolved.get())
            .finish_non_exhaustive()
    }
}

/// Completion side of one load started by [`Resource::begin_load`].
///
/// Dropping it without completing leaves the resource loading.
#[must_use = "the resource stays loading until the load is resolved or rejected"]
pub struct PendingLoad<T: 'static> {
    resource: Resource<T>,
    load: u64,
}

impl<T> PendingLoad<T>
where
    T: Clone + 'static,
{
    pub fn id(&self) -> u64 {
        self.load
    }

    /// Whether a newer load has replaced this one.
    pub fn is_superseded(&self) -> bool {
        self.resource.inner.pending.get() != Some(self.load)
    }

    pub fn resolve(self, value: T) {
        self.resource.load_end(self.load, Ok(value));
    }

    pub fn reject(self, err: ReactiveError) {
        self.resource.load_end(self.load, Err(err));
    }
}

impl<T> fmt::Debug for PendingLoad<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingLoad").field("load", &self.load).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{create_root, Memo};

    #[test]
    fn load_lifecycle() {
        let resource = Resource::<String>::new();
        assert_eq!(resource.state(), ResourceState::Unresolved);
        assert_eq!(resource.read(), None);

        let load = resource.begin_load();
        assert_eq!(resource.state(), ResourceState::Pending);
        assert!(resource.loading());

        load.resolve(String::from("done"));
        assert_eq!(resource.state(), ResourceState::Ready);
        assert_eq!(resource.read(), Some(String::from("done")));

        let refresh = resource.begin_load();
        assert_eq!(resource.state(), ResourceState::Refreshing);
        assert_eq!(resource.latest(), Some(String::from("done")));
        refresh.resolve(String::from("again"));
        assert_eq!(resource.latest(), Some(String::from("again")));
    }

    #[test]
    fn superseded_load_is_ignored() {
        let resource = Resource::<u32>::new();
        let first = resource.begin_load();
        let second = resource.begin_load();
        assert!(first.is_superseded());

        second.resolve(2);
        first.resolve(1);
        assert_eq!(resource.read(), Some(2));
    }

    #[test]
    fn rejected_load_raises_on_read() {
        let resource = Resource::<u32>::with_initial(1);
        resource.begin_load().reject(ReactiveError::failed("offline"));
        assert_eq!(resource.state(), ResourceState::Errored);
        assert_eq!(resource.error(), Some(ReactiveError::failed("offline")));

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| resource.read()));
        let payload = outcome.unwrap_err();
        assert_eq!(
            payload.downcast_ref::<ReactiveError>(),
            Some(&ReactiveError::failed("offline"))
        );
    }

    #[test]
    fn pending_load_counts_against_suspense() {
        let (suspense, resource, view, root) = create_root(|root| {
            let suspense = SuspenseContext::new();
            suspense.provide();
            let resource = Resource::<u32>::new();
            let reader = resource.clone();
            let view = Memo::new(move || reader.read());
            (suspense, resource, view, root)
        });
        assert_eq!(suspense.count(), 0);

        let load = resource.begin_load();
        assert_eq!(suspense.count(), 1);
        assert!(suspense.in_fallback());

        load.resolve(3);
        assert_eq!(suspense.count(), 0);
        assert!(!suspense.in_fallback());
        assert_eq!(view.get(), Some(3));
        root.dispose();
    }

    #[test]
    fn debug_output_shows_load_state() {
        let resource = Resource::<String>::new();
        let load = resource.begin_load();
        let text = format!("{resource:?}");
        assert!(text.starts_with("Resource"));
        assert!(text.contains("pending: Some"));
        assert!(text.contains("resolved: false"));

        load.resolve(String::from("done"));
        assert!(format!("{resource:?}").contains("resolved: true"));
    }

    #[tokio::test]
    async fn spawn_local_resolves_on_local_set() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let resource = Resource::<u32>::new();
                let task = resource.spawn_local(async { Ok(9) });
                assert!(resource.loading());
                task.await.unwrap();
                assert_eq!(resource.read(), Some(9));
            })
            .await;
    }
}
