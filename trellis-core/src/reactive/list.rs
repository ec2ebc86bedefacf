//! List Mapping
//!
//! [`map_array`] and [`index_array`] turn a reactive list into a list of
//! mapped values, giving every entry its own root. An entry is created once
//! and disposed only when it leaves the list, so whatever the mapping
//! function builds (computations, cleanups, nested state) survives unrelated
//! changes to the list.
//!
//! Both return a computation body meant for a [`Memo`](super::Memo):
//!
//! ```rust,ignore
//! let rows = Memo::new(map_array(move || names.get(), |name, index| {
//!     format!("{}: {}", index.get(), name)
//! }));
//! ```
//!
//! Entries still alive are disposed when the owner that called the mapper
//! is cleaned up.

use std::cell::RefCell;
use std::collections::HashMap;
use std::hash::Hash;
use std::rc::Rc;

use tracing::trace;

use super::owner::{create_root, on_cleanup, RootDisposer};
use super::runtime::untrack;
use super::signal::Signal;

struct Entry<U, S> {
    value: U,
    disposer: RootDisposer,
    signal: S,
}

struct Mapped<T, U, S> {
    items: Vec<T>,
    entries: Vec<Entry<U, S>>,
}

impl<T, U, S> Default for Mapped<T, U, S> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            entries: Vec::new(),
        }
    }
}

type Shared<T, U, S> = Rc<RefCell<Mapped<T, U, S>>>;

fn dispose_on_cleanup<T: 'static, U: 'static, S: 'static>(state: &Shared<T, U, S>) {
    let state = state.clone();
    on_cleanup(move || {
        let entries = std::mem::take(&mut state.borrow_mut().entries);
        for entry in entries {
            entry.disposer.dispose();
        }
    });
}

/// Map a list by item identity.
///
/// Items are matched by equality between runs: an item that is still present
/// keeps its entry (moving it if needed and updating its index signal), an
/// item that disappeared has its entry disposed, and only new items are
/// passed to `map`.
pub fn map_array<T, U>(
    list: impl FnMut() -> Vec<T> + 'static,
    map: impl FnMut(&T, Signal<usize>) -> U + 'static,
) -> impl FnMut() -> Vec<U>
where
    T: Clone + Eq + Hash + 'static,
    U: Clone + 'static,
{
    let mut list = list;
    let mut map = map;
    let state: Shared<T, U, Signal<usize>> = Rc::new(RefCell::new(Mapped::default()));
    dispose_on_cleanup(&state);

    move || {
        let new_items = list();
        untrack(|| {
            let Mapped { items, entries } = std::mem::take(&mut *state.borrow_mut());
            let mut create = |j: usize, item: &T| {
                create_root(|disposer| {
                    let index = Signal::new(j);
                    Entry {
                        value: map(item, index),
                        disposer,
                        signal: index,
                    }
                })
            };

            let entries: Vec<Entry<U, Signal<usize>>> = if new_items.is_empty() {
                for entry in entries {
                    entry.disposer.dispose();
                }
                Vec::new()
            } else if entries.is_empty() {
                new_items.iter().enumerate().map(|(j, item)| create(j, item)).collect()
            } else {
                reconcile(&items, entries, &new_items, &mut create)
            };

            let values = entries.iter().map(|entry| entry.value.clone()).collect();
            *state.borrow_mut() = Mapped {
                items: new_items,
                entries,
            };
            values
        })
    }
}

/// Reuse the entries of `items` for `new_items`, skipping the common prefix
/// and suffix and matching the middle through an index of the new list.
fn reconcile<T, U>(
    items: &[T],
    entries: Vec<Entry<U, Signal<usize>>>,
    new_items: &[T],
    create: &mut impl FnMut(usize, &T) -> Entry<U, Signal<usize>>,
) -> Vec<Entry<U, Signal<usize>>>
where
    T: Eq + Hash,
{
    let len = items.len();
    let new_len = new_items.len();
    let mut old: Vec<Option<Entry<U, Signal<usize>>>> = entries.into_iter().map(Some).collect();
    let mut moved: Vec<Option<Entry<U, Signal<usize>>>> = (0..new_len).map(|_| None).collect();

    let mut start = 0;
    while start < len.min(new_len) && items[start] == new_items[start] {
        start += 1;
    }

    let (mut end, mut new_end) = (len, new_len);
    while end > start && new_end > start && items[end - 1] == new_items[new_end - 1] {
        end -= 1;
        new_end -= 1;
        moved[new_end] = old[end].take();
    }

    // For each item of the new middle, the first position it takes and the
    // next position holding an equal item.
    let mut positions: HashMap<&T, Option<usize>> = HashMap::new();
    let mut next_equal: Vec<Option<usize>> = vec![None; new_end];
    for j in (start..new_end).rev() {
        let item = &new_items[j];
        next_equal[j] = positions.get(item).copied().flatten();
        positions.insert(item, Some(j));
    }

    for i in start..end {
        let item = &items[i];
        match positions.get(item).copied().flatten() {
            Some(j) => {
                moved[j] = old[i].take();
                positions.insert(&new_items[j], next_equal[j]);
            }
            None => {
                if let Some(entry) = old[i].take() {
                    trace!(position = i, "list entry removed");
                    entry.disposer.dispose();
                }
            }
        }
    }

    let mut result: Vec<_> = old[..start].iter_mut().filter_map(Option::take).collect();
    for (j, slot) in moved.into_iter().enumerate().skip(start) {
        match slot {
            Some(entry) => {
                entry.signal.set(j);
                result.push(entry);
            }
            None => result.push(create(j, &new_items[j])),
        }
    }
    for entry in old.into_iter().flatten() {
        entry.disposer.dispose();
    }
    result
}

/// Map a list by position.
///
/// Each position gets one entry whose item is a signal. When the item at a
/// position changes, only that signal is written; `map` runs only for
/// positions past the previous length.
pub fn index_array<T, U>(
    list: impl FnMut() -> Vec<T> + 'static,
    map: impl FnMut(Signal<T>, usize) -> U + 'static,
) -> impl FnMut() -> Vec<U>
where
    T: Clone + PartialEq + 'static,
    U: Clone + 'static,
{
    let mut list = list;
    let mut map = map;
    let state: Shared<T, U, Signal<T>> = Rc::new(RefCell::new(Mapped::default()));
    dispose_on_cleanup(&state);

    move || {
        let new_items = list();
        untrack(|| {
            let Mapped { items, mut entries } = std::mem::take(&mut *state.borrow_mut());

            for (i, item) in new_items.iter().enumerate() {
                match entries.get(i) {
                    Some(entry) => {
                        if items.get(i) != Some(item) {
                            entry.signal.set(item.clone());
                        }
                    }
                    None => {
                        let entry = create_root(|disposer| {
                            let signal = Signal::new(item.clone());
                            Entry {
                                value: map(signal, i),
                                disposer,
                                signal,
                            }
                        });
                        entries.push(entry);
                    }
                }
            }
            let keep = new_items.len().min(entries.len());
            for entry in entries.drain(keep..) {
                entry.disposer.dispose();
            }

            let values = entries.iter().map(|entry| entry.value.clone()).collect();
            *state.borrow_mut() = Mapped {
                items: new_items,
                entries,
            };
            values
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{create_root, Memo};
    use std::cell::Cell;

    type Log = Rc<RefCell<Vec<String>>>;

    #[test]
    fn keyed_entries_survive_reorder() {
        let created: Log = Rc::new(RefCell::new(Vec::new()));
        let disposed: Log = Rc::new(RefCell::new(Vec::new()));
        let (names, rows, root) = create_root({
            let created = created.clone();
            let disposed = disposed.clone();
            move |root| {
                let names = Signal::new(vec!["a", "b", "c"]);
                let rows = Memo::new(map_array(
                    move || names.get(),
                    move |name: &&'static str, index| {
                        created.borrow_mut().push(name.to_string());
                        let disposed = disposed.clone();
                        let name = name.to_string();
                        let label = Memo::new({
                            let name = name.clone();
                            move || format!("{}{}", name, index.get())
                        });
                        on_cleanup(move || disposed.borrow_mut().push(name));
                        label
                    },
                ));
                (names, rows, root)
            }
        });
        let labels = |rows: &Memo<Vec<Memo<String>>>| {
            rows.get().iter().map(|label| label.get()).collect::<Vec<_>>()
        };
        assert_eq!(labels(&rows), vec!["a0", "b1", "c2"]);

        names.set(vec!["c", "a", "d", "b"]);
        assert_eq!(labels(&rows), vec!["c0", "a1", "d2", "b3"]);
        assert_eq!(*created.borrow(), vec!["a", "b", "c", "d"]);
        assert!(disposed.borrow().is_empty());

        names.set(vec!["a", "d"]);
        assert_eq!(labels(&rows), vec!["a0", "d1"]);
        disposed.borrow_mut().sort();
        assert_eq!(*disposed.borrow(), vec!["b", "c"]);

        names.set(Vec::new());
        assert!(rows.get().is_empty());
        assert_eq!(disposed.borrow().len(), 4);
        root.dispose();
    }

    #[test]
    fn duplicate_items_each_keep_an_entry() {
        let calls = Rc::new(Cell::new(0));
        let (items, rows, root) = create_root({
            let calls = calls.clone();
            move |root| {
                let items = Signal::new(vec![1, 1, 2]);
                let rows = Memo::new(map_array(
                    move || items.get(),
                    move |item: &i32, _| {
                        calls.set(calls.get() + 1);
                        *item * 10
                    },
                ));
                (items, rows, root)
            }
        });
        assert_eq!(rows.get(), vec![10, 10, 20]);

        items.set(vec![2, 1, 1]);
        assert_eq!(rows.get(), vec![20, 10, 10]);
        assert_eq!(calls.get(), 3);

        items.set(vec![2, 1, 1, 1]);
        assert_eq!(calls.get(), 4);
        root.dispose();
    }

    #[test]
    fn indexed_entries_update_in_place() {
        let calls = Rc::new(Cell::new(0));
        let (items, rows, root) = create_root({
            let calls = calls.clone();
            move |root| {
                let items = Signal::new(vec![1, 2]);
                let rows = Memo::new(index_array(
                    move || items.get(),
                    move |item: Signal<i32>, index| {
                        calls.set(calls.get() + 1);
                        Memo::new(move || item.get() + index as i32 * 100)
                    },
                ));
                (items, rows, root)
            }
        });
        let values = |rows: &Memo<Vec<Memo<i32>>>| {
            rows.get().iter().map(|row| row.get()).collect::<Vec<_>>()
        };
        assert_eq!(values(&rows), vec![1, 102]);

        items.set(vec![5, 2, 3]);
        assert_eq!(values(&rows), vec![5, 102, 203]);
        assert_eq!(calls.get(), 3);

        items.set(vec![7]);
        assert_eq!(values(&rows), vec![7]);
        assert_eq!(calls.get(), 3);
        root.dispose();
    }

    #[test]
    fn entries_are_disposed_with_the_owner() {
        let before = crate::reactive::node_count();
        create_root(|root| {
            let items = Signal::new(vec![1, 2, 3]);
            let rows = Memo::new(map_array(move || items.get(), |item: &i32, _| *item));
            assert_eq!(rows.get(), vec![1, 2, 3]);
            root.dispose();
        });
        assert_eq!(crate::reactive::node_count(), before);
    }
}
