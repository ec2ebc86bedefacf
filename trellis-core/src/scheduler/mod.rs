//! Cooperative Task Scheduler
//!
//! A priority queue of callbacks drained in time slices so that long chains
//! of low-priority work never starve the host's own input and paint handling.
//!
//! # Algorithm
//!
//! 1. Each task gets `expiration_time = now + timeout` and is inserted into a
//!    queue kept sorted by expiration (binary search, FIFO among equal
//!    expirations).
//! 2. Scheduling into an idle scheduler asks the [`Host`] for a flush.
//! 3. A flush opens a time slice of `yield_interval` and runs tasks from the
//!    head of the queue. Before each task that has not yet expired it checks
//!    whether to yield; if so it stops and asks the host for another flush.
//! 4. Expired tasks always run and are told they missed their deadline.
//!
//! The scheduler does not depend on the reactive graph. Transitions and
//! deferred values hand it work, but any host code can use it directly.

mod host;
mod task;

pub use host::{Host, ManualHost, TokioHost};
pub use task::TaskHandle;

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::config::SchedulerConfig;
use task::Task;

struct SchedulerInner {
    host: Rc<dyn Host>,
    config: SchedulerConfig,
    queue: RefCell<VecDeque<Rc<Task>>>,
    next_id: Cell<u64>,
    /// A flush has been requested and has not started yet.
    callback_scheduled: Cell<bool>,
    /// The work loop is on the stack.
    performing_work: Cell<bool>,
    /// The host is expected to keep calling `flush`.
    flush_armed: Cell<bool>,
    slice_start: Cell<Duration>,
    deadline: Cell<Duration>,
}

/// Handle to a cooperative scheduler. Clones share the same queue.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<SchedulerInner>,
}

/// Resets `performing_work` even if a task unwinds.
struct WorkGuard<'a>(&'a SchedulerInner);

impl Drop for WorkGuard<'_> {
    fn drop(&mut self) {
        self.0.performing_work.set(false);
    }
}

impl Scheduler {
    /// Create a scheduler with the default configuration.
    pub fn new(host: impl Host + 'static) -> Self {
        Self::with_config(host, SchedulerConfig::default())
    }

    pub fn with_config(host: impl Host + 'static, config: SchedulerConfig) -> Self {
        Self {
            inner: Rc::new(SchedulerInner {
                host: Rc::new(host),
                config,
                queue: RefCell::new(VecDeque::new()),
                next_id: Cell::new(1),
                callback_scheduled: Cell::new(false),
                performing_work: Cell::new(false),
                flush_armed: Cell::new(false),
                slice_start: Cell::new(Duration::ZERO),
                deadline: Cell::new(Duration::ZERO),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Schedule a callback with the default (effectively unbounded) timeout.
    pub fn schedule(&self, callback: impl FnOnce(bool) + 'static) -> TaskHandle {
        self.schedule_with_timeout(callback, None)
    }

    /// Schedule a callback that must run within `timeout`.
    ///
    /// A missing or zero timeout means the default timeout.
    pub fn schedule_with_timeout(
        &self,
        callback: impl FnOnce(bool) + 'static,
        timeout: Option<Duration>,
    ) -> TaskHandle {
        let inner = &self.inner;
        let timeout = timeout
            .filter(|t| !t.is_zero())
            .unwrap_or_else(|| inner.config.default_timeout());

        let id = inner.next_id.get();
        inner.next_id.set(id + 1);

        let task = Rc::new(Task::new(id, Box::new(callback), inner.host.now(), timeout));
        trace!(task = id, expiration = ?task.expiration_time, "task scheduled");
        self.enqueue(Rc::clone(&task));

        if !inner.callback_scheduled.get() && !inner.performing_work.get() {
            inner.callback_scheduled.set(true);
            inner.flush_armed.set(true);
            inner.host.request_flush(self);
        }

        TaskHandle { task }
    }

    /// Cancel a task. Equivalent to [`TaskHandle::cancel`].
    pub fn cancel(&self, handle: &TaskHandle) {
        handle.cancel();
    }

    /// Number of queued slots, including cancelled ones not yet discarded.
    pub fn len(&self) -> usize {
        self.inner.queue.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.queue.borrow().is_empty()
    }

    /// Run one time slice. Called by the host after `request_flush`.
    ///
    /// Returns whether work remains; in that case another flush has already
    /// been requested. A panicking task re-arms the scheduler before the
    /// panic continues to the host.
    pub fn flush(&self) -> bool {
        let inner = &self.inner;
        if !inner.flush_armed.get() {
            return false;
        }

        let current_time = inner.host.now();
        inner.slice_start.set(current_time);
        inner.deadline.set(current_time + inner.config.yield_interval());

        match panic::catch_unwind(AssertUnwindSafe(|| self.flush_work(current_time))) {
            Ok(true) => {
                debug!(queued = self.len(), "scheduler yielding to host");
                inner.callback_scheduled.set(true);
                inner.host.request_flush(self);
                true
            }
            Ok(false) => {
                inner.flush_armed.set(false);
                false
            }
            Err(payload) => {
                inner.callback_scheduled.set(true);
                inner.host.request_flush(self);
                panic::resume_unwind(payload)
            }
        }
    }

    /// Whether the current time slice is used up.
    pub fn should_yield(&self) -> bool {
        let inner = &self.inner;
        let now = inner.host.now();
        if now < inner.deadline.get() {
            return false;
        }
        match inner.host.input_pending() {
            Some(pending) => {
                let elapsed = now.saturating_sub(inner.slice_start.get());
                pending || elapsed >= inner.config.max_yield_interval()
            }
            None => true,
        }
    }

    fn enqueue(&self, task: Rc<Task>) {
        let mut queue = self.inner.queue.borrow_mut();
        let index = queue.partition_point(|queued| queued.expiration_time <= task.expiration_time);
        queue.insert(index, task);
    }

    fn peek(&self) -> Option<Rc<Task>> {
        self.inner.queue.borrow().front().cloned()
    }

    fn flush_work(&self, initial_time: Duration) -> bool {
        self.inner.callback_scheduled.set(false);
        self.inner.performing_work.set(true);
        let _guard = WorkGuard(&self.inner);
        self.work_loop(initial_time)
    }

    fn work_loop(&self, initial_time: Duration) -> bool {
        let mut current_time = initial_time;

        while let Some(task) = self.peek() {
            if task.expiration_time > current_time && self.should_yield() {
                break;
            }

            match task.take_callback() {
                Some(callback) => {
                    let did_timeout = task.expiration_time <= current_time;
                    trace!(task = task.id, did_timeout, "running task");
                    callback(did_timeout);
                    current_time = self.inner.host.now();

                    // The callback may have queued something more urgent.
                    let mut queue = self.inner.queue.borrow_mut();
                    if queue.front().is_some_and(|head| Rc::ptr_eq(head, &task)) {
                        queue.pop_front();
                    }
                }
                None => {
                    self.inner.queue.borrow_mut().pop_front();
                }
            }
        }

        !self.inner.queue.borrow().is_empty()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("queued", &self.len())
            .field("config", &self.inner.config)
            .field("performing_work", &self.inner.performing_work.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn recorder() -> (Rc<RefCell<Vec<u32>>>, impl Fn(u32) -> Box<dyn FnOnce(bool)>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let log_clone = log.clone();
        let make = move |tag: u32| -> Box<dyn FnOnce(bool)> {
            let log = log_clone.clone();
            Box::new(move |_| log.borrow_mut().push(tag))
        };
        (log, make)
    }

    #[test]
    fn runs_in_expiration_order() {
        let host = ManualHost::new();
        let scheduler = Scheduler::new(host.clone());
        let (log, make) = recorder();

        scheduler.schedule_with_timeout(make(50), Some(ms(50)));
        scheduler.schedule_with_timeout(make(10), Some(ms(10)));
        scheduler.schedule_with_timeout(make(30), Some(ms(30)));

        assert!(host.flush_requested());
        host.run_until_idle(&scheduler);

        assert_eq!(*log.borrow(), vec![10, 30, 50]);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn cancelled_task_never_runs() {
        let host = ManualHost::new();
        let scheduler = Scheduler::new(host.clone());
        let (log, make) = recorder();

        scheduler.schedule_with_timeout(make(50), Some(ms(50)));
        scheduler.schedule_with_timeout(make(10), Some(ms(10)));
        let middle = scheduler.schedule_with_timeout(make(30), Some(ms(30)));

        scheduler.cancel(&middle);
        assert!(!middle.is_pending());
        // Cancellation leaves the slot in place.
        assert_eq!(scheduler.len(), 3);

        host.run_until_idle(&scheduler);
        assert_eq!(*log.borrow(), vec![10, 50]);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn equal_expirations_keep_fifo_order() {
        let host = ManualHost::new();
        let scheduler = Scheduler::new(host.clone());
        let (log, make) = recorder();

        for tag in 0..5 {
            scheduler.schedule_with_timeout(make(tag), Some(ms(20)));
        }
        host.run_until_idle(&scheduler);

        assert_eq!(*log.borrow(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn yields_when_slice_is_used_up() {
        let host = ManualHost::new();
        let scheduler = Scheduler::new(host.clone());
        let runs = Rc::new(Cell::new(0));

        for _ in 0..3 {
            let host = host.clone();
            let runs = runs.clone();
            scheduler.schedule(move |_| {
                runs.set(runs.get() + 1);
                host.advance(ms(3));
            });
        }

        // First slice: 0ms -> 3ms runs, 3ms -> 6ms runs, then the 5ms slice is spent.
        assert!(host.run_once(&scheduler));
        assert_eq!(runs.get(), 2);
        assert!(host.flush_requested());

        host.run_until_idle(&scheduler);
        assert_eq!(runs.get(), 3);
        assert!(!host.flush_requested());
    }

    #[test]
    fn no_second_flush_request_while_one_is_pending() {
        let host = ManualHost::new();
        let scheduler = Scheduler::new(host.clone());

        for _ in 0..3 {
            let host = host.clone();
            scheduler.schedule(move |_| host.advance(ms(3)));
        }
        assert_eq!(host.flush_requests(), 1);

        assert!(host.run_once(&scheduler));
        assert!(host.flush_requested());
        assert_eq!(host.flush_requests(), 2);

        scheduler.schedule(|_| {});
        assert_eq!(host.flush_requests(), 2);

        host.run_until_idle(&scheduler);
        assert!(scheduler.is_empty());
        scheduler.schedule(|_| {});
        assert_eq!(host.flush_requests(), 3);
    }

    #[test]
    fn input_pending_signal_extends_slice_until_ceiling() {
        let host = ManualHost::new();
        host.set_input_pending(Some(false));
        let scheduler = Scheduler::new(host.clone());
        let runs = Rc::new(Cell::new(0));

        for _ in 0..4 {
            let host = host.clone();
            let runs = runs.clone();
            scheduler.schedule(move |_| {
                runs.set(runs.get() + 1);
                host.advance(ms(100));
            });
        }

        // No input is pending, so the slice runs until the 300ms ceiling.
        host.run_once(&scheduler);
        assert_eq!(runs.get(), 3);

        host.set_input_pending(Some(true));
        host.run_until_idle(&scheduler);
        assert_eq!(runs.get(), 4);
    }

    #[test]
    fn expired_tasks_run_under_pressure() {
        let host = ManualHost::new();
        let scheduler = Scheduler::new(host.clone());
        let timed_out = Rc::new(RefCell::new(Vec::new()));

        {
            let host = host.clone();
            scheduler.schedule(move |_| host.advance(ms(10)));
        }
        {
            let timed_out = timed_out.clone();
            scheduler
                .schedule_with_timeout(move |late| timed_out.borrow_mut().push(late), Some(ms(10)));
        }

        // The urgent task is at the head; it runs on time.
        host.run_until_idle(&scheduler);
        assert_eq!(*timed_out.borrow(), vec![false]);

        {
            let timed_out = timed_out.clone();
            scheduler
                .schedule_with_timeout(move |late| timed_out.borrow_mut().push(late), Some(ms(1)));
        }
        host.advance(ms(5));
        host.run_until_idle(&scheduler);
        assert_eq!(*timed_out.borrow(), vec![false, true]);
    }

    #[test]
    fn panicking_task_rearms_and_keeps_queue() {
        let host = ManualHost::new();
        let scheduler = Scheduler::new(host.clone());
        let (log, make) = recorder();

        scheduler.schedule_with_timeout(|_| panic!("task failed"), Some(ms(1)));
        scheduler.schedule_with_timeout(make(2), Some(ms(2)));

        let result = panic::catch_unwind(AssertUnwindSafe(|| host.run_once(&scheduler)));
        assert!(result.is_err());
        assert!(host.flush_requested());

        host.run_until_idle(&scheduler);
        assert_eq!(*log.borrow(), vec![2]);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn callback_can_schedule_more_urgent_work() {
        let host = ManualHost::new();
        let scheduler = Scheduler::new(host.clone());
        let (log, make) = recorder();

        {
            let scheduler_clone = scheduler.clone();
            let urgent = make(1);
            let log = log.clone();
            scheduler.schedule_with_timeout(
                move |_| {
                    log.borrow_mut().push(0);
                    scheduler_clone.schedule_with_timeout(urgent, Some(ms(1)));
                },
                Some(ms(100)),
            );
        }
        scheduler.schedule_with_timeout(make(2), Some(ms(200)));

        host.run_until_idle(&scheduler);
        assert_eq!(*log.borrow(), vec![0, 1, 2]);
        assert!(scheduler.is_empty());
    }

    proptest! {
        #[test]
        fn execution_order_is_sorted_by_expiration(
            timeouts in proptest::collection::vec(1u64..500, 1..40)
        ) {
            let host = ManualHost::new();
            let scheduler = Scheduler::new(host.clone());
            let order = Rc::new(RefCell::new(Vec::new()));

            for (index, timeout) in timeouts.iter().enumerate() {
                let order = order.clone();
                let timeout = *timeout;
                scheduler.schedule_with_timeout(
                    move |_| order.borrow_mut().push((timeout, index)),
                    Some(ms(timeout)),
                );
            }
            host.run_until_idle(&scheduler);

            let mut expected: Vec<(u64, usize)> = timeouts.iter().copied().zip(0..).collect();
            expected.sort();
            prop_assert_eq!(order.borrow().clone(), expected);
        }
    }
}
