//! Copy-on-write B+tree pages.
//!
//! A [`Page`] is an immutable node once published into a [`RootReference`].
//! Mutation only ever happens on a freshly [`Page::copy`]-ed page still held
//! privately by a writer on the CoW path. Pages are purely in-memory object
//! graphs here — on-disk layout and serialization are out of scope for this
//! core and left to a [`crate::store::MapStore`] collaborator.
//!
//! [`RootReference`]: crate::root_reference::RootReference

use std::sync::Arc;

use crate::comparator::Comparator;
use crate::error::{MvError, Result};

/// Identifier of the map a page belongs to.
pub type MapId = u32;

/// On-disk position of a page. `0` means the page has never been saved.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct PagePos(pub u64);

impl PagePos {
    /// The sentinel position for a page that only exists in memory.
    pub const UNSAVED: PagePos = PagePos(0);

    /// Returns whether this page has ever been written to the backing store.
    pub fn is_saved(self) -> bool {
        self.0 != 0
    }
}

/// Attributes common to both leaf and internal pages.
#[derive(Clone, Debug)]
pub struct PageMeta {
    /// Map this page belongs to.
    pub map_id: MapId,
    /// Disk position, or [`PagePos::UNSAVED`] if never saved.
    pub pos: PagePos,
    /// Estimated heap footprint in bytes, kept as a running total rather
    /// than recomputed by a tree walk.
    pub memory: u32,
    /// Whether this page (and, recursively, its children) is fully loaded.
    pub complete: bool,
}

impl PageMeta {
    pub(crate) fn fresh(map_id: MapId) -> Self {
        Self {
            map_id,
            pos: PagePos::UNSAVED,
            memory: 0,
            complete: true,
        }
    }
}

/// A leaf node: parallel arrays of keys and values.
#[derive(Clone)]
pub struct LeafPage<K, V> {
    /// Shared attributes.
    pub meta: PageMeta,
    /// Strictly ascending keys.
    pub keys: Vec<K>,
    /// Values, `values[i]` corresponds to `keys[i]`.
    pub values: Vec<V>,
}

/// An internal node: keys, child subtrees, and per-child leaf-entry counts.
#[derive(Clone)]
pub struct InternalPage<K, V> {
    /// Shared attributes.
    pub meta: PageMeta,
    /// Separator keys; `child_count() == keys.len() + 1`.
    pub keys: Vec<K>,
    /// Child subtrees.
    pub children: Vec<Arc<Page<K, V>>>,
    /// `counts[i]` caches `children[i]`'s total leaf-entry count.
    pub counts: Vec<u64>,
}

/// A copy-on-write B+tree node.
pub enum Page<K, V> {
    /// Leaf node holding the actual entries.
    Leaf(LeafPage<K, V>),
    /// Internal node holding separator keys and child subtrees.
    Internal(InternalPage<K, V>),
}

impl<K: Clone, V: Clone> Page<K, V> {
    /// Builds a fresh, empty leaf page (the initial root of an empty map).
    pub fn empty_leaf(map_id: MapId) -> Self {
        Page::Leaf(LeafPage {
            meta: PageMeta::fresh(map_id),
            keys: Vec::new(),
            values: Vec::new(),
        })
    }

    /// Whether this is a leaf.
    pub fn is_leaf(&self) -> bool {
        matches!(self, Page::Leaf(_))
    }

    /// Shared metadata accessor.
    pub fn meta(&self) -> &PageMeta {
        match self {
            Page::Leaf(l) => &l.meta,
            Page::Internal(i) => &i.meta,
        }
    }

    /// Mutable metadata accessor. Only legal on a privately-owned (copied)
    /// page — published pages are never mutated.
    pub fn meta_mut(&mut self) -> &mut PageMeta {
        match self {
            Page::Leaf(l) => &mut l.meta,
            Page::Internal(i) => &mut i.meta,
        }
    }

    /// Number of keys stored directly in this page.
    pub fn key_count(&self) -> usize {
        match self {
            Page::Leaf(l) => l.keys.len(),
            Page::Internal(i) => i.keys.len(),
        }
    }

    /// Number of entries in the subtree rooted at this page.
    pub fn total_count(&self) -> u64 {
        match self {
            Page::Leaf(l) => l.keys.len() as u64,
            Page::Internal(i) => i.counts.iter().sum(),
        }
    }

    /// Returns the key at `i`. Panics on out-of-range `i`, as callers are
    /// always expected to have validated the index via [`Page::binary_search`]
    /// or a count-derived bound first.
    pub fn key(&self, i: usize) -> &K {
        match self {
            Page::Leaf(l) => &l.keys[i],
            Page::Internal(i_) => &i_.keys[i],
        }
    }

    /// Returns the value at leaf slot `i`.
    pub fn value(&self, i: usize) -> &V {
        match self {
            Page::Leaf(l) => &l.values[i],
            Page::Internal(_) => panic!("value() called on an internal page"),
        }
    }

    /// Binary search for `key` among this page's keys.
    ///
    /// Returns the matching index if found, else `-(insertion_point + 1)`
    /// where `insertion_point` is the first index whose key is greater than
    /// `key`.
    pub fn binary_search(&self, key: &K, cmp: &dyn Comparator<K>) -> i64 {
        let keys: &[K] = match self {
            Page::Leaf(l) => &l.keys,
            Page::Internal(i) => &i.keys,
        };
        binary_search_slice(keys, key, cmp)
    }

    /// Resolves child `i` of an internal page.
    ///
    /// Pages built by this core are always fully resident (on-disk paging
    /// is out of scope here); the `store` parameter exists so a
    /// future embedder that evicts children can route through
    /// [`crate::store::MapStore::read_page`] without changing this
    /// signature.
    pub fn get_child_page(
        &self,
        i: usize,
        _store: &dyn crate::store::MapStore<K, V>,
    ) -> Result<Arc<Page<K, V>>> {
        match self {
            Page::Internal(internal) => internal
                .children
                .get(i)
                .cloned()
                .ok_or_else(|| MvError::Invalid("child index out of range".into())),
            Page::Leaf(_) => Err(MvError::Invalid("get_child_page on a leaf page".into())),
        }
    }

    /// Shallow copy with fresh backing arrays, so the caller may mutate
    /// without affecting the published original.
    pub fn copy(&self) -> Self {
        match self {
            Page::Leaf(l) => Page::Leaf(LeafPage {
                meta: PageMeta {
                    pos: PagePos::UNSAVED,
                    ..l.meta.clone()
                },
                keys: l.keys.clone(),
                values: l.values.clone(),
            }),
            Page::Internal(i) => Page::Internal(InternalPage {
                meta: PageMeta {
                    pos: PagePos::UNSAVED,
                    ..i.meta.clone()
                },
                keys: i.keys.clone(),
                children: i.children.clone(),
                counts: i.counts.clone(),
            }),
        }
    }

    /// Splits the page at `at`, keeping `[0, at)` in `self` and returning a
    /// new page covering `[at, n)`.
    ///
    /// For a leaf, the pivot key `keys[at]` stays in the right page and is
    /// also returned so the caller can insert it as a separator above. For
    /// an internal node, the pivot key is removed from *both* resulting
    /// pages and handed up to the caller as the new separator.
    pub fn split(&mut self, at: usize) -> (K, Self) {
        match self {
            Page::Leaf(l) => {
                let right_keys = l.keys.split_off(at);
                let right_values = l.values.split_off(at);
                let pivot = right_keys[0].clone();
                let right = Page::Leaf(LeafPage {
                    meta: PageMeta::fresh(l.meta.map_id),
                    keys: right_keys,
                    values: right_values,
                });
                (pivot, right)
            }
            Page::Internal(i) => {
                let pivot = i.keys[at].clone();
                let right_keys = i.keys.split_off(at + 1);
                i.keys.truncate(at);
                let right_children = i.children.split_off(at + 1);
                let right_counts = i.counts.split_off(at + 1);
                let right = Page::Internal(InternalPage {
                    meta: PageMeta::fresh(i.meta.map_id),
                    keys: right_keys,
                    children: right_children,
                    counts: right_counts,
                });
                (pivot, right)
            }
        }
    }

    /// Inserts `(key, value)` at slot `i` in a leaf page, shifting later
    /// entries right. Only legal on a privately-owned page.
    pub fn insert_leaf(&mut self, i: usize, key: K, value: V) {
        match self {
            Page::Leaf(l) => {
                l.keys.insert(i, key);
                l.values.insert(i, value);
            }
            Page::Internal(_) => panic!("insert_leaf on an internal page"),
        }
    }

    /// Sets the value at leaf slot `i` (used for in-place PUT of an
    /// existing key).
    pub fn set_value(&mut self, i: usize, value: V) {
        match self {
            Page::Leaf(l) => l.values[i] = value,
            Page::Internal(_) => panic!("set_value on an internal page"),
        }
    }

    /// Removes the entry at leaf slot `i`.
    pub fn remove_leaf(&mut self, i: usize) {
        match self {
            Page::Leaf(l) => {
                l.keys.remove(i);
                l.values.remove(i);
            }
            Page::Internal(_) => panic!("remove_leaf on an internal page"),
        }
    }

    /// Inserts separator `key` at slot `i` and `child` at slot `i + 1`,
    /// shifting later keys/children/counts right. Used after a child split:
    /// `i` is the index of the child that split, `key` is the pivot that
    /// comes up, and `child` is the new right sibling.
    pub fn insert_node(&mut self, i: usize, key: K, child: Arc<Page<K, V>>, count: u64) {
        match self {
            Page::Internal(internal) => {
                internal.keys.insert(i, key);
                internal.children.insert(i + 1, child);
                internal.counts.insert(i + 1, count);
            }
            Page::Leaf(_) => panic!("insert_node on a leaf page"),
        }
    }

    /// Replaces `children[i]` (and its cached count) in an internal page.
    pub fn set_child(&mut self, i: usize, child: Arc<Page<K, V>>, count: u64) {
        match self {
            Page::Internal(internal) => {
                internal.children[i] = child;
                internal.counts[i] = count;
            }
            Page::Leaf(_) => panic!("set_child on a leaf page"),
        }
    }

    /// Drops child `i` (and its cached count) along with whichever adjacent
    /// separator key bounded it, used when a remove empties that child's
    /// subtree entirely and it must be collapsed out of its parent.
    pub fn remove_child(&mut self, i: usize) {
        match self {
            Page::Internal(internal) => {
                internal.children.remove(i);
                internal.counts.remove(i);
                if i == 0 {
                    if !internal.keys.is_empty() {
                        internal.keys.remove(0);
                    }
                } else {
                    internal.keys.remove(i - 1);
                }
            }
            Page::Leaf(_) => panic!("remove_child on a leaf page"),
        }
    }

    /// Appends `count` sorted entries from the append buffer onto a leaf
    /// (the append-buffer flush fast path).
    ///
    /// Precondition: `keys_buf[0]` is strictly greater than the leaf's
    /// current last key — the caller (the append path) maintains ordered
    /// appends and never calls this otherwise.
    pub fn expand(&mut self, count: usize, keys_buf: &[K], values_buf: &[V]) {
        match self {
            Page::Leaf(l) => {
                l.keys.extend_from_slice(&keys_buf[..count]);
                l.values.extend_from_slice(&values_buf[..count]);
            }
            Page::Internal(_) => panic!("expand on an internal page"),
        }
    }

    /// Returns the keys/values memory estimate for this page alone (not
    /// recursive), used to keep [`PageMeta::memory`] updated incrementally.
    pub fn memory_estimate(&self, key_cost: usize, value_cost: usize) -> u32 {
        const BASE: usize = 48;
        let n = match self {
            Page::Leaf(l) => l.keys.len() * (key_cost + value_cost),
            Page::Internal(i) => i.keys.len() * key_cost + i.children.len() * 16,
        };
        (BASE + n) as u32
    }
}

/// Performs the [`Page::binary_search`] contract over a plain key slice.
pub fn binary_search_slice<K>(keys: &[K], key: &K, cmp: &dyn Comparator<K>) -> i64 {
    let mut low: i64 = 0;
    let mut high: i64 = keys.len() as i64 - 1;
    while low <= high {
        let mid = (low + high) >> 1;
        match cmp.compare(&keys[mid as usize], key) {
            std::cmp::Ordering::Less => low = mid + 1,
            std::cmp::Ordering::Greater => high = mid - 1,
            std::cmp::Ordering::Equal => return mid,
        }
    }
    -(low + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::natural_order;

    fn leaf(keys: Vec<i32>, values: Vec<i32>) -> Page<i32, i32> {
        Page::Leaf(LeafPage {
            meta: PageMeta::fresh(1),
            keys,
            values,
        })
    }

    #[test]
    fn binary_search_found_and_missing() {
        let cmp = natural_order::<i32>();
        let p = leaf(vec![1, 3, 5, 7], vec![10, 30, 50, 70]);
        assert_eq!(p.binary_search(&5, &cmp), 2);
        assert_eq!(p.binary_search(&4, &cmp), -3); // insertion point 2 -> -(2+1)
        assert_eq!(p.binary_search(&0, &cmp), -1);
        assert_eq!(p.binary_search(&8, &cmp), -5);
    }

    #[test]
    fn copy_is_independent() {
        let mut p = leaf(vec![1, 2], vec![10, 20]);
        let copy = p.copy();
        p.insert_leaf(2, 3, 30);
        assert_eq!(p.key_count(), 3);
        assert_eq!(copy.key_count(), 2);
    }

    #[test]
    fn leaf_split_keeps_pivot_in_right() {
        let mut p = leaf(vec![1, 2, 3, 4, 5], vec![1, 2, 3, 4, 5]);
        let (pivot, right) = p.split(2);
        assert_eq!(pivot, 3);
        assert_eq!(p.key_count(), 2);
        assert_eq!(right.key(0), &3);
        assert_eq!(right.key_count(), 3);
    }

    #[test]
    fn internal_split_removes_pivot_from_both_sides() {
        let children: Vec<Arc<Page<i32, i32>>> = (0..5)
            .map(|i| Arc::new(leaf(vec![i], vec![i])))
            .collect();
        let mut p = Page::Internal(InternalPage {
            meta: PageMeta::fresh(1),
            keys: vec![10, 20, 30, 40],
            children,
            counts: vec![1, 1, 1, 1, 1],
        });
        let (pivot, right) = p.split(2);
        assert_eq!(pivot, 30);
        assert_eq!(p.key_count(), 2);
        assert_eq!(right.key_count(), 1);
    }
}
