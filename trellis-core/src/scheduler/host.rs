//! Host integration for the scheduler.
//!
//! The scheduler never blocks or sleeps. It asks its [`Host`] for the time and
//! for a flush opportunity, and the host calls [`Scheduler::flush`] from its
//! own event loop when that opportunity arrives.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use super::Scheduler;

/// The event loop a [`Scheduler`] runs on.
pub trait Host {
    /// Monotonic time since an arbitrary origin.
    fn now(&self) -> Duration;

    /// Arrange for `scheduler.flush()` to be called on a later turn of the
    /// host loop. Called at most once per outstanding flush.
    fn request_flush(&self, scheduler: &Scheduler);

    /// Whether user input is waiting, if the host can tell.
    fn input_pending(&self) -> Option<bool> {
        None
    }
}

#[derive(Debug, Default)]
struct ManualHostInner {
    now: Cell<Duration>,
    flush_requested: Cell<bool>,
    flush_requests: Cell<usize>,
    input_pending: Cell<Option<bool>>,
}

/// A host driven by hand: the clock only moves when told to and flushes
/// happen when [`ManualHost::run_until_idle`] is called.
///
/// Useful for tests and for embedding the scheduler in a loop that is not
/// async.
#[derive(Debug, Clone, Default)]
pub struct ManualHost {
    inner: Rc<ManualHostInner>,
}

impl ManualHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.inner.now.set(self.inner.now.get() + by);
    }

    pub fn set_input_pending(&self, pending: Option<bool>) {
        self.inner.input_pending.set(pending);
    }

    /// Whether the scheduler is waiting for a flush.
    pub fn flush_requested(&self) -> bool {
        self.inner.flush_requested.get()
    }

    /// Total number of flush requests received.
    pub fn flush_requests(&self) -> usize {
        self.inner.flush_requests.get()
    }

    /// Serve flush requests until the scheduler stops asking for more.
    ///
    /// Returns the number of flushes performed.
    pub fn run_until_idle(&self, scheduler: &Scheduler) -> usize {
        let mut flushes = 0;
        while self.inner.flush_requested.replace(false) {
            scheduler.flush();
            flushes += 1;
        }
        flushes
    }

    /// Serve exactly one pending flush request, if any.
    pub fn run_once(&self, scheduler: &Scheduler) -> bool {
        if self.inner.flush_requested.replace(false) {
            scheduler.flush();
            true
        } else {
            false
        }
    }
}

impl Host for ManualHost {
    fn now(&self) -> Duration {
        self.inner.now.get()
    }

    fn request_flush(&self, _scheduler: &Scheduler) {
        self.inner.flush_requested.set(true);
        self.inner.flush_requests.set(self.inner.flush_requests.get() + 1);
    }

    fn input_pending(&self) -> Option<bool> {
        self.inner.input_pending.get()
    }
}

/// A host that flushes on the current tokio `LocalSet`.
///
/// Scheduling a task must happen inside `LocalSet::run_until` (or a task
/// spawned on it); `request_flush` panics otherwise.
#[derive(Debug, Clone)]
pub struct TokioHost {
    origin: tokio::time::Instant,
}

impl TokioHost {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for TokioHost {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn request_flush(&self, scheduler: &Scheduler) {
        let scheduler = scheduler.clone();
        tokio::task::spawn_local(async move {
            tokio::task::yield_now().await;
            scheduler.flush();
        });
    }
}
