//! Scheduled tasks and their cancellable handles.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

pub(crate) type TaskCallback = Box<dyn FnOnce(bool)>;

/// A unit of deferred work.
///
/// The callback receives `true` when the task is executed after its
/// expiration time has already passed.
pub(crate) struct Task {
    pub(crate) id: u64,
    pub(crate) callback: RefCell<Option<TaskCallback>>,
    pub(crate) start_time: Duration,
    pub(crate) expiration_time: Duration,
}

impl Task {
    pub(crate) fn new(
        id: u64,
        callback: TaskCallback,
        start_time: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            id,
            callback: RefCell::new(Some(callback)),
            start_time,
            expiration_time: start_time.saturating_add(timeout),
        }
    }

    pub(crate) fn take_callback(&self) -> Option<TaskCallback> {
        self.callback.borrow_mut().take()
    }
}

/// Handle to a scheduled task.
///
/// Cancelling only clears the callback; the slot stays queued until the
/// scheduler reaches it and discards it.
#[derive(Clone)]
pub struct TaskHandle {
    pub(crate) task: Rc<Task>,
}

impl TaskHandle {
    /// Monotonically increasing task ID.
    pub fn id(&self) -> u64 {
        self.task.id
    }

    /// Host time at which the task was scheduled.
    pub fn start_time(&self) -> Duration {
        self.task.start_time
    }

    /// Host time after which the task runs even under time pressure.
    pub fn expiration_time(&self) -> Duration {
        self.task.expiration_time
    }

    /// Prevent the callback from running. O(1).
    pub fn cancel(&self) {
        self.task.callback.borrow_mut().take();
    }

    /// Whether the callback has neither run nor been cancelled.
    pub fn is_pending(&self) -> bool {
        self.task.callback.borrow().is_some()
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.task.id)
            .field("expiration_time", &self.task.expiration_time)
            .field("pending", &self.is_pending())
            .finish()
    }
}
