//! Transitions
//!
//! A transition applies a group of writes tentatively. While it is open,
//! every write made inside it and every computation it re-runs store their
//! results as tentative values; the committed world keeps seeing the old
//! ones. When the transition has no outstanding asynchronous loads and no
//! scheduled work left, it commits: tentative values are promoted, children
//! created during the transition replace the old ones, and the effects it
//! held back run.
//!
//! # Implementation
//!
//! At most one transition exists per thread. It is "running" only while
//! work is being done on its behalf; between those moments the runtime
//! behaves as if it did not exist, apart from reads of its sources outside
//! it still seeing committed values.
//!
//! With a [`Scheduler`] enabled, pure work queued inside a running
//! transition is handed to the scheduler instead of being run in the same
//! batch, so long transitions yield to the host.

use indexmap::IndexSet;
use tokio::sync::watch;
use tracing::debug;

use super::runtime::{with_runtime, QueuedEffect};
use super::signal::Signal;
use crate::graph::{erase_comparator, NodeId};
use crate::scheduler::Scheduler;

/// State of the open transition.
pub(crate) struct Transition {
    /// Nodes holding tentative values.
    pub(crate) sources: IndexSet<NodeId>,
    /// Effects held back until commit.
    pub(crate) effects: Vec<QueuedEffect>,
    /// Outstanding asynchronous loads.
    pub(crate) promises: IndexSet<u64>,
    /// Nodes the transition dropped; disposed on commit.
    pub(crate) disposed: IndexSet<NodeId>,
    /// Nodes with work on the scheduler.
    pub(crate) queue: IndexSet<NodeId>,
    pub(crate) running: bool,
    pub(crate) done: watch::Sender<bool>,
}

impl Transition {
    fn new() -> Self {
        let (done, _) = watch::channel(false);
        Self {
            sources: IndexSet::new(),
            effects: Vec::new(),
            promises: IndexSet::new(),
            disposed: IndexSet::new(),
            queue: IndexSet::new(),
            running: false,
            done,
        }
    }
}

/// Completion handle for a transition.
#[derive(Debug, Clone)]
pub struct TransitionHandle {
    done: watch::Receiver<bool>,
}

impl TransitionHandle {
    /// Whether the transition has committed.
    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    /// Wait until the transition commits.
    pub async fn done(mut self) {
        // An error means the transition was dropped without committing.
        let _ = self.done.wait_for(|done| *done).await;
    }
}

/// Run `f` as part of the thread's transition, opening one if none exists.
///
/// Writes made by `f` are tentative until the transition commits. Calls
/// made while the transition is already running simply run `f` inside it.
pub fn start_transition(f: impl FnOnce()) -> TransitionHandle {
    with_runtime(|rt| {
        let (handle, already_running) = {
            let mut slot = rt.transition.borrow_mut();
            let transition = slot.get_or_insert_with(|| {
                debug!("transition opened");
                Transition::new()
            });
            let already_running = transition.running;
            transition.running = true;
            (
                TransitionHandle {
                    done: transition.done.subscribe(),
                },
                already_running,
            )
        };
        if already_running {
            f();
        } else {
            rt.run_updates(f, false);
        }
        handle
    })
}

/// Whether a transition is open and has not committed yet.
pub fn is_transition_pending() -> bool {
    with_runtime(|rt| rt.has_transition())
}

/// A signal that is `true` while a transition is suspended on outstanding
/// work.
pub fn transition_pending() -> Signal<bool> {
    with_runtime(|rt| {
        let id = match rt.pending_signal.get() {
            Some(id) => id,
            None => {
                let comparator = erase_comparator(|a: &bool, b: &bool| a == b);
                let id = rt.create_signal_node(std::rc::Rc::new(false), Some(comparator), false);
                rt.pending_signal.set(Some(id));
                id
            }
        };
        Signal::from_id(id)
    })
}

/// Route pure work queued inside transitions through `scheduler`.
pub fn enable_scheduling(scheduler: Scheduler) {
    with_runtime(|rt| *rt.scheduler.borrow_mut() = Some(scheduler));
}

/// Stop routing transition work through a scheduler.
pub fn disable_scheduling() {
    with_runtime(|rt| *rt.scheduler.borrow_mut() = None);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{create_root, Memo, Resource};

    #[test]
    fn transition_without_async_work_commits_immediately() {
        let (signal, double, root) = create_root(|root| {
            let signal = Signal::new(1);
            let double = Memo::new(move || signal.get() * 2);
            (signal, double, root)
        });
        let handle = start_transition(|| signal.set(5));
        assert!(handle.is_done());
        assert!(!is_transition_pending());
        assert_eq!(signal.get(), 5);
        assert_eq!(double.get(), 10);
        root.dispose();
    }

    #[test]
    fn writes_stay_tentative_until_loads_finish() {
        let (signal, double, resource, root) = create_root(|root| {
            let signal = Signal::new(1);
            let double = Memo::new(move || signal.get() * 2);
            let resource = Resource::<u32>::new();
            (signal, double, resource, root)
        });
        let pending = transition_pending();

        let mut load = None;
        let handle = start_transition(|| {
            signal.set(5);
            load = Some(resource.begin_load());
        });
        assert!(!handle.is_done());
        assert!(pending.get());
        assert_eq!(signal.get(), 1);
        assert_eq!(double.get(), 2);

        if let Some(load) = load {
            load.resolve(7);
        }
        assert!(handle.is_done());
        assert!(!pending.get());
        assert_eq!(signal.get(), 5);
        assert_eq!(double.get(), 10);
        assert_eq!(resource.latest(), Some(7));
        root.dispose();
    }
}
