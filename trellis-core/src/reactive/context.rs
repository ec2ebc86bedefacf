//! Reactive Context
//!
//! The reactive context tracks which owner is active and which computation
//! (if any) is listening for reads. Creating a primitive attaches it to the
//! current owner; reading a cell subscribes the current listener.
//!
//! # Implementation
//!
//! We use a thread-local stack. Running a computation pushes an entry with
//! the computation as both owner and listener; `untrack` pushes an entry with
//! the same owner and no listener. The entry is popped when the returned guard
//! is dropped, including during unwinding, so a panicking body never leaves a
//! stale listener behind.

use std::cell::RefCell;

use crate::graph::NodeId;

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<ContextEntry>> = const { RefCell::new(Vec::new()) };
}

/// An entry in the reactive context stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ContextEntry {
    owner: Option<NodeId>,
    listener: Option<NodeId>,
}

/// Guard that pops the context when dropped.
#[derive(Debug)]
pub struct ReactiveContext {
    entry: ContextEntry,
}

impl ReactiveContext {
    /// Enter a context with the given owner and listener.
    ///
    /// The context is automatically exited when the returned guard is dropped.
    #[must_use = "the context is exited when the guard is dropped"]
    pub fn enter(owner: Option<NodeId>, listener: Option<NodeId>) -> Self {
        let entry = ContextEntry { owner, listener };
        CONTEXT_STACK.with(|stack| stack.borrow_mut().push(entry));
        Self { entry }
    }

    /// Enter a context owned and observed by `node`.
    #[must_use = "the context is exited when the guard is dropped"]
    pub fn tracking(node: NodeId) -> Self {
        Self::enter(Some(node), Some(node))
    }

    /// Keep the current owner but stop tracking reads.
    #[must_use = "the context is exited when the guard is dropped"]
    pub fn untracked() -> Self {
        Self::enter(Self::current_owner(), None)
    }

    /// Check if a computation is currently listening for reads.
    pub fn is_tracking() -> bool {
        Self::current_listener().is_some()
    }

    pub fn current_owner() -> Option<NodeId> {
        CONTEXT_STACK.with(|stack| stack.borrow().last().and_then(|entry| entry.owner))
    }

    pub fn current_listener() -> Option<NodeId> {
        CONTEXT_STACK.with(|stack| stack.borrow().last().and_then(|entry| entry.listener))
    }
}

impl Drop for ReactiveContext {
    fn drop(&mut self) {
        CONTEXT_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();

            if !std::thread::panicking() {
                debug_assert_eq!(
                    popped,
                    Some(self.entry),
                    "ReactiveContext mismatch: expected {:?}, got {:?}",
                    self.entry,
                    popped
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_tracks_owner_and_listener() {
        let id = NodeId::new();

        assert!(!ReactiveContext::is_tracking());
        assert!(ReactiveContext::current_owner().is_none());

        {
            let _ctx = ReactiveContext::tracking(id);
            assert!(ReactiveContext::is_tracking());
            assert_eq!(ReactiveContext::current_owner(), Some(id));
            assert_eq!(ReactiveContext::current_listener(), Some(id));
        }

        // Context should be cleaned up after drop
        assert!(!ReactiveContext::is_tracking());
        assert!(ReactiveContext::current_owner().is_none());
    }

    #[test]
    fn untracked_keeps_owner() {
        let id = NodeId::new();
        let _ctx = ReactiveContext::tracking(id);

        {
            let _inner = ReactiveContext::untracked();
            assert_eq!(ReactiveContext::current_owner(), Some(id));
            assert!(ReactiveContext::current_listener().is_none());
        }

        assert_eq!(ReactiveContext::current_listener(), Some(id));
    }

    #[test]
    fn nested_contexts() {
        let id1 = NodeId::new();
        let id2 = NodeId::new();

        {
            let _ctx1 = ReactiveContext::tracking(id1);
            assert_eq!(ReactiveContext::current_listener(), Some(id1));

            {
                let _ctx2 = ReactiveContext::tracking(id2);
                assert_eq!(ReactiveContext::current_listener(), Some(id2));
            }

            // After inner context drops, outer should be current
            assert_eq!(ReactiveContext::current_listener(), Some(id1));
        }

        assert!(ReactiveContext::current_listener().is_none());
    }

    #[test]
    fn guard_pops_during_unwind() {
        let id = NodeId::new();
        let result = std::panic::catch_unwind(|| {
            let _ctx = ReactiveContext::tracking(id);
            panic!("body failed");
        });
        assert!(result.is_err());
        assert!(ReactiveContext::current_listener().is_none());
    }
}
