//! Keyed Selection
//!
//! A [`Selector`] answers "is this key the selected one?" for many readers
//! at once. When the selected key changes, only the readers of the old and
//! the new key are notified, instead of every reader of the source.

use std::collections::HashMap;
use std::cell::RefCell;
use std::fmt;
use std::hash::Hash;
use std::rc::Rc;

use indexmap::IndexSet;

use super::context::ReactiveContext;
use super::memo::erase_compute;
use super::owner::on_cleanup;
use super::runtime::with_runtime;
use crate::graph::{NodeId, NodeKind, NodeState};

type Subscriptions<K> = Rc<RefCell<HashMap<K, IndexSet<NodeId>>>>;

/// Tracks which key is selected and notifies per key.
pub struct Selector<K: 'static> {
    node: NodeId,
    subs: Subscriptions<K>,
}

impl<K> Selector<K>
where
    K: Clone + Eq + Hash + 'static,
{
    /// Create a selector over the key produced by `source`.
    pub fn new(source: impl FnMut() -> K + 'static) -> Self {
        let mut source = source;
        let subs: Subscriptions<K> = Rc::new(RefCell::new(HashMap::new()));
        let tracked = subs.clone();
        let compute = erase_compute(move |prev: Option<&K>| {
            let value = source();
            let changed: Vec<NodeId> = tracked
                .borrow()
                .iter()
                .filter(|(key, _)| (**key == value) != (prev == Some(*key)))
                .flat_map(|(_, listeners)| listeners.iter().copied())
                .collect();
            if !changed.is_empty() {
                with_runtime(|rt| rt.mark_stale(changed));
            }
            value
        });

        let node = with_runtime(|rt| {
            let node =
                rt.create_computation(NodeKind::Computed, Some(compute), None, NodeState::Stale);
            rt.update_computation(node);
            node
        });
        Self { node, subs }
    }

    /// Whether `key` is the selected key.
    ///
    /// The calling computation re-runs only when this answer may change.
    pub fn is_selected(&self, key: &K) -> bool {
        if let Some(listener) = ReactiveContext::current_listener() {
            self.subs
                .borrow_mut()
                .entry(key.clone())
                .or_default()
                .insert(listener);
            let subs = self.subs.clone();
            let key = key.clone();
            on_cleanup(move || {
                let mut subs = subs.borrow_mut();
                if let Some(listeners) = subs.get_mut(&key) {
                    listeners.swap_remove(&listener);
                    if listeners.is_empty() {
                        subs.remove(&key);
                    }
                }
            });
        }

        with_runtime(|rt| rt.peek(self.node))
            .ok()
            .is_some_and(|value| (&*value as &dyn std::any::Any).downcast_ref::<K>() == Some(key))
    }

    /// Number of distinct keys with subscribed readers.
    pub fn subscribed_keys(&self) -> usize {
        self.subs.borrow().len()
    }
}

impl<K> Clone for Selector<K> {
    fn clone(&self) -> Self {
        Self {
            node: self.node,
            subs: self.subs.clone(),
        }
    }
}

impl<K> fmt::Debug for Selector<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selector").field("node", &self.node).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{create_root, Effect, Signal};
    use std::cell::Cell;

    #[test]
    fn only_old_and_new_keys_rerun() {
        let runs: Rc<Vec<Cell<u32>>> = Rc::new((0..4).map(|_| Cell::new(0)).collect());
        let (selected, selector, root) = create_root({
            let runs = runs.clone();
            move |root| {
                let selected = Signal::new(0usize);
                let selector = Selector::new(move || selected.get());
                for row in 0..4 {
                    let selector = selector.clone();
                    let runs = runs.clone();
                    Effect::new_render(move || {
                        selector.is_selected(&row);
                        runs[row].set(runs[row].get() + 1);
                    });
                }
                (selected, selector, root)
            }
        });
        assert!(runs.iter().all(|r| r.get() == 1));
        assert_eq!(selector.subscribed_keys(), 4);

        selected.set(2);
        let counts: Vec<u32> = runs.iter().map(Cell::get).collect();
        assert_eq!(counts, vec![2, 1, 2, 1]);
        assert!(selector.is_selected(&2));
        assert!(!selector.is_selected(&0));
        root.dispose();
    }
}
