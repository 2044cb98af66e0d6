//! Root-to-leaf traversal paths ([`CursorPos`]) and ordered iteration
//! ([`Cursor`]) over an immutable snapshot of a map's pages.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::comparator::Comparator;
use crate::error::Result;
use crate::page::Page;
use crate::store::MapStore;

/// A singly-linked, bottom-up trail of `(page, index)` frames recording a
/// root-to-leaf traversal.
///
/// `index` is the slot used at `page`: for a leaf it is the result of
/// [`Page::binary_search`] (possibly negative — no match); for an internal
/// page it is the child index that was descended into. `parent` links
/// toward the root, so walking `parent` from the returned (leaf-level) node
/// reconstructs the whole path.
///
/// Only valid for the traversal that built it. The mutation path
/// ([`crate::map::MVMap::operate`]) rewrites `page` in place as it rebuilds
/// the path bottom-up during copy-on-write.
pub struct CursorPos<K, V> {
    /// The page visited at this level.
    pub page: Arc<Page<K, V>>,
    /// Leaf: binary-search result (may be negative). Internal: child index
    /// that was descended into.
    pub index: i64,
    /// The next frame up toward the root, or `None` at the root.
    pub parent: Option<Box<CursorPos<K, V>>>,
}

impl<K, V> CursorPos<K, V> {
    /// Descends from `root` to the leaf that would hold `key`.
    ///
    /// At each internal node, `i = binary_search(key)`. This core resolves
    /// the child index as `-i - 1` when `i < 0` (the insertion point — the
    /// subtree whose keys are all less than the next separator) and `i + 1`
    /// when `i >= 0` (the key matched a separator exactly, so descend right,
    /// per the B+tree invariant that a separator is `<=` everything in its
    /// right subtree). See DESIGN.md for why this resolves an apparent
    /// off-by-one in the prose description of this step.
    pub fn traverse_down(
        root: Arc<Page<K, V>>,
        key: &K,
        cmp: &dyn Comparator<K>,
        store: &dyn MapStore<K, V>,
    ) -> Result<CursorPos<K, V>> {
        let mut page = root;
        let mut parent: Option<Box<CursorPos<K, V>>> = None;
        loop {
            if page.is_leaf() {
                let index = page.binary_search(key, cmp);
                return Ok(CursorPos {
                    page,
                    index,
                    parent,
                });
            }
            let i = page.binary_search(key, cmp);
            let child_index = child_index_for_search_result(i);
            let child = page.get_child_page(child_index, store)?;
            parent = Some(Box::new(CursorPos {
                page: page.clone(),
                index: child_index as i64,
                parent,
            }));
            page = child;
        }
    }

    /// Produces a path to the rightmost leaf, with `index =
    /// -(key_count + 1)` (the insertion point past the last key) — used by
    /// the append-buffer fast path to locate where new entries land.
    pub fn rightmost(
        root: Arc<Page<K, V>>,
        store: &dyn MapStore<K, V>,
    ) -> Result<CursorPos<K, V>> {
        let mut page = root;
        let mut parent: Option<Box<CursorPos<K, V>>> = None;
        loop {
            if page.is_leaf() {
                let index = -(page.key_count() as i64 + 1);
                return Ok(CursorPos {
                    page,
                    index,
                    parent,
                });
            }
            let child_index = page.key_count();
            let child = page.get_child_page(child_index, store)?;
            parent = Some(Box::new(CursorPos {
                page: page.clone(),
                index: child_index as i64,
                parent,
            }));
            page = child;
        }
    }
}

fn child_index_for_search_result(i: i64) -> usize {
    if i < 0 {
        (-i - 1) as usize
    } else {
        (i + 1) as usize
    }
}

struct Frame<K, V> {
    page: Arc<Page<K, V>>,
    child_index: i64,
}

/// An ordered, lazy iterator over `(K, V)` pairs in a snapshot of a map.
///
/// Constructed from a single `Arc<Page<K, V>>` root observed at construction
/// time — concurrent writers publish new root pages without mutating this
/// one, so a `Cursor` yields exactly the pairs present when it was built,
/// regardless of later mutation. Optionally carries a snapshot of a
/// single-writer map's append buffer, merged in past the tree's own entries
/// (the buffer only ever holds keys greater than everything in the tree).
pub struct Cursor<K, V> {
    cmp: Arc<dyn Comparator<K>>,
    lower: Option<K>,
    upper: Option<K>,
    reverse: bool,
    // Root-to-leaf depth stays tiny even for huge trees (keys_per_page
    // defaults to 48, so eight levels covers far more entries than any
    // realistic map holds) — inline storage avoids a heap allocation per
    // cursor for the common case.
    stack: SmallVec<[Frame<K, V>; 8]>,
    leaf: Option<(Arc<Page<K, V>>, i64)>,
    tree_done: bool,
    // Append-buffer entries in bounds, stored so `Vec::pop` yields them in
    // the order this cursor's direction needs next (see `new_with_buffer`).
    buffer_queue: Vec<(K, V)>,
}

impl<K: Clone, V: Clone> Cursor<K, V> {
    /// Builds a cursor over `root`, bounded by `lower`/`upper` (both
    /// inclusive when present), walking forward or in `reverse`.
    pub fn new(
        root: Arc<Page<K, V>>,
        cmp: Arc<dyn Comparator<K>>,
        lower: Option<K>,
        upper: Option<K>,
        reverse: bool,
    ) -> Self {
        Self::new_with_buffer(root, cmp, lower, upper, reverse, &[], &[])
    }

    /// Builds a cursor over `root`, additionally merging in `buffer_keys`/
    /// `buffer_values` (a single-writer map's pending append buffer, always
    /// sorted ascending and greater than every key in `root`).
    pub fn new_with_buffer(
        root: Arc<Page<K, V>>,
        cmp: Arc<dyn Comparator<K>>,
        lower: Option<K>,
        upper: Option<K>,
        reverse: bool,
        buffer_keys: &[K],
        buffer_values: &[V],
    ) -> Self {
        let in_bounds = |k: &K, lower: &Option<K>, upper: &Option<K>| {
            use std::cmp::Ordering;
            if let Some(lo) = lower {
                if cmp.compare(k, lo) == Ordering::Less {
                    return false;
                }
            }
            if let Some(hi) = upper {
                if cmp.compare(k, hi) == Ordering::Greater {
                    return false;
                }
            }
            true
        };
        let mut filtered: Vec<(K, V)> = buffer_keys
            .iter()
            .cloned()
            .zip(buffer_values.iter().cloned())
            .filter(|(k, _)| in_bounds(k, &lower, &upper))
            .collect();
        // `filtered` is ascending. Reverse mode consumes buffer entries
        // first (they're the largest keys overall), descending via `pop`,
        // so the ascending vec is exactly right as-is. Forward mode
        // consumes them last, ascending via `pop`, so flip it.
        if !reverse {
            filtered.reverse();
        }
        let mut cursor = Cursor {
            cmp,
            lower,
            upper,
            reverse,
            stack: SmallVec::new(),
            leaf: None,
            tree_done: false,
            buffer_queue: filtered,
        };
        let bound = if reverse {
            cursor.upper.clone()
        } else {
            cursor.lower.clone()
        };
        cursor.descend_to_start(root, bound.as_ref());
        cursor
    }

    fn step(&self) -> i64 {
        if self.reverse {
            -1
        } else {
            1
        }
    }

    fn descend_to_start(&mut self, root: Arc<Page<K, V>>, bound: Option<&K>) {
        let mut page = root;
        loop {
            if page.is_leaf() {
                let slot = match bound {
                    Some(k) => {
                        let i = page.binary_search(k, self.cmp.as_ref());
                        if i >= 0 {
                            i
                        } else if self.reverse {
                            (-i - 1) - 1
                        } else {
                            -i - 1
                        }
                    }
                    None if self.reverse => page.key_count() as i64 - 1,
                    None => 0,
                };
                self.leaf = Some((page, slot));
                return;
            }
            let child_index = match bound {
                Some(k) => child_index_for_search_result(page.binary_search(k, self.cmp.as_ref())),
                None if self.reverse => page.key_count(),
                None => 0,
            };
            let child = match &*page {
                Page::Internal(internal) => internal.children[child_index].clone(),
                Page::Leaf(_) => unreachable!(),
            };
            self.stack.push(Frame {
                page: page.clone(),
                child_index: child_index as i64,
            });
            page = child;
        }
    }

    fn descend_extreme(&mut self, mut page: Arc<Page<K, V>>) {
        loop {
            if page.is_leaf() {
                let slot = if self.reverse {
                    page.key_count() as i64 - 1
                } else {
                    0
                };
                self.leaf = Some((page, slot));
                return;
            }
            let child_index = if self.reverse {
                page.key_count()
            } else {
                0
            };
            let child = match &*page {
                Page::Internal(internal) => internal.children[child_index].clone(),
                Page::Leaf(_) => unreachable!(),
            };
            self.stack.push(Frame {
                page: page.clone(),
                child_index: child_index as i64,
            });
            page = child;
        }
    }

    fn advance_leaf(&mut self) -> bool {
        let step = self.step();
        loop {
            let Some(frame) = self.stack.pop() else {
                self.leaf = None;
                return false;
            };
            let next_child = frame.child_index + step;
            let children_len = frame.page.key_count() as i64 + 1;
            if next_child < 0 || next_child >= children_len {
                continue;
            }
            self.stack.push(Frame {
                page: frame.page.clone(),
                child_index: next_child,
            });
            let child = match &*frame.page {
                Page::Internal(internal) => internal.children[next_child as usize].clone(),
                Page::Leaf(_) => unreachable!(),
            };
            self.descend_extreme(child);
            return true;
        }
    }

    fn out_of_stop_bound(&self, key: &K) -> bool {
        use std::cmp::Ordering;
        if self.reverse {
            if let Some(lo) = &self.lower {
                return self.cmp.compare(key, lo) == Ordering::Less;
            }
        } else if let Some(hi) = &self.upper {
            return self.cmp.compare(key, hi) == Ordering::Greater;
        }
        false
    }

    fn next_tree(&mut self) -> Option<(K, V)> {
        if self.tree_done {
            return None;
        }
        loop {
            let Some((page, slot)) = &self.leaf else {
                self.tree_done = true;
                return None;
            };
            let key_count = page.key_count() as i64;
            if *slot < 0 || *slot >= key_count {
                if !self.advance_leaf() {
                    self.tree_done = true;
                    return None;
                }
                continue;
            }
            let key = page.key(*slot as usize).clone();
            if self.out_of_stop_bound(&key) {
                self.tree_done = true;
                self.leaf = None;
                return None;
            }
            let value = page.value(*slot as usize).clone();
            let step = self.step();
            let (page, slot) = self.leaf.as_mut().unwrap();
            let _ = page;
            *slot += step;
            return Some((key, value));
        }
    }

    /// Advances the cursor and returns the next `(key, value)` pair, if any.
    ///
    /// Reverse cursors drain the (larger) buffered entries before
    /// descending into the tree; forward cursors exhaust the tree first.
    pub fn next(&mut self) -> Option<(K, V)> {
        if self.reverse {
            self.buffer_queue.pop().or_else(|| self.next_tree())
        } else {
            self.next_tree().or_else(|| self.buffer_queue.pop())
        }
    }
}

impl<K: Clone, V: Clone> Iterator for Cursor<K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        Cursor::next(self)
    }
}
