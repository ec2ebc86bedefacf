//! Deferred Values
//!
//! [`create_deferred`] mirrors a source into a signal that only catches up
//! when the [`Scheduler`] gets to it, so expensive readers of the copy stay
//! off the urgent path. The copy is guaranteed to catch up once `timeout`
//! has elapsed even if the host is always busy.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use tracing::trace;

use super::memo::erase_compute;
use super::runtime::with_runtime;
use super::signal::{downcast, Signal};
use crate::error::Result;
use crate::graph::{NodeId, NodeKind, NodeState};
use crate::scheduler::{Scheduler, TaskHandle};

/// Create a lagging copy of `source`.
///
/// `timeout` of `None` uses the scheduler's default timeout.
///
/// # Errors
///
/// Fails if the first evaluation of `source` does not produce a value.
pub fn create_deferred<T>(
    scheduler: &Scheduler,
    source: impl FnMut() -> T + 'static,
    timeout: Option<Duration>,
) -> Result<Signal<T>>
where
    T: Clone + PartialEq + 'static,
{
    let mut source = source;
    let task: Rc<RefCell<Option<TaskHandle>>> = Rc::new(RefCell::new(None));
    let node_slot: Rc<Cell<Option<NodeId>>> = Rc::new(Cell::new(None));
    let deferred_slot: Rc<Cell<Option<Signal<T>>>> = Rc::new(Cell::new(None));

    let compute = {
        let scheduler = scheduler.clone();
        let node_slot = node_slot.clone();
        let deferred_slot = deferred_slot.clone();
        erase_compute(move |_: Option<&T>| {
            let idle = task.borrow().as_ref().map_or(true, |task| !task.is_pending());
            if idle {
                let node_slot = node_slot.clone();
                let deferred_slot = deferred_slot.clone();
                let handle = scheduler.schedule_with_timeout(
                    move |_| {
                        let (Some(node), Some(deferred)) = (node_slot.get(), deferred_slot.get())
                        else {
                            return;
                        };
                        let latest = with_runtime(|rt| rt.peek(node))
                            .and_then(|value| downcast::<T>(node, &value));
                        match latest.and_then(|value| deferred.try_set(value)) {
                            Ok(()) => {}
                            Err(err) => trace!(error = %err, "deferred value is gone"),
                        }
                    },
                    timeout,
                );
                *task.borrow_mut() = Some(handle);
            }
            source()
        })
    };

    let node = with_runtime(|rt| {
        let node = rt.create_computation(NodeKind::Computed, Some(compute), None, NodeState::Stale);
        rt.update_computation(node);
        node
    });
    node_slot.set(Some(node));

    let initial = with_runtime(|rt| rt.peek(node)).and_then(|value| downcast::<T>(node, &value))?;
    let deferred = Signal::new(initial);
    deferred_slot.set(Some(deferred));
    Ok(deferred)
}
