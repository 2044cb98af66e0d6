//! The versioned, atomically-published state of a single map.
//!
//! A [`RootReference`] is an immutable snapshot: a root page, the version it
//! was committed as, a link to the previous version, and the bookkeeping for
//! this map's reentrant logical lock. Readers only ever clone the `Arc` out
//! of [`RootCell`] and walk it — they never block on a writer.
//!
//! The natural design here is a lock-free atomically-swapped root cell
//! (an `AtomicReference<RootReference>` with `compareAndSet`), but safe Rust
//! has no portable lock-free `AtomicArc`, so [`RootCell`] realizes the same
//! contract with a `Mutex<Arc<RootReference<K, V>>>` whose critical section
//! is kept to a single pointer swap — functionally equivalent to a CAS loop
//! under contention, and readers (`current`) never wait on it. See
//! DESIGN.md for the full writeup of this deviation.

use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::page::Page;

/// An immutable, versioned snapshot of a map's root and lock state.
///
/// `previous` chains back through every version still reachable by an open
/// snapshot; [`prune_previous`] cuts that chain once the store reports an
/// older `oldest_version_to_keep`.
pub struct RootReference<K, V> {
    /// Root page as of `version`.
    pub root: Arc<Page<K, V>>,
    /// The version this snapshot was committed as.
    pub version: u64,
    /// Link to the state immediately before this one, or `None` if this is
    /// the oldest version still retained.
    pub previous: Option<Arc<RootReference<K, V>>>,
    /// Number of times a write has successfully published a new root.
    pub update_counter: u64,
    /// Number of times a write has *attempted* to acquire the lock
    /// (including attempts that lost the race and retried).
    pub update_attempt_counter: u64,
    /// Reentrant hold depth of the logical lock. `0` means unlocked.
    pub hold_count: u32,
    /// The thread currently holding the lock, if `hold_count > 0`.
    pub owner_id: Option<ThreadId>,
    /// Entries buffered by the single-writer append fast path that have not
    /// yet been folded into `root`.
    pub append_counter: u32,
}

impl<K, V> Clone for RootReference<K, V> {
    fn clone(&self) -> Self {
        RootReference {
            root: self.root.clone(),
            version: self.version,
            previous: self.previous.clone(),
            update_counter: self.update_counter,
            update_attempt_counter: self.update_attempt_counter,
            hold_count: self.hold_count,
            owner_id: self.owner_id,
            append_counter: self.append_counter,
        }
    }
}

impl<K, V> RootReference<K, V> {
    fn initial(root: Arc<Page<K, V>>, version: u64) -> Self {
        RootReference {
            root,
            version,
            previous: None,
            update_counter: 0,
            update_attempt_counter: 0,
            hold_count: 0,
            owner_id: None,
            append_counter: 0,
        }
    }

    /// Whether any thread currently holds the logical lock.
    pub fn is_locked(&self) -> bool {
        self.hold_count > 0
    }
}

/// Owns the single published `RootReference` for a map and the reentrant
/// logical lock over it.
pub struct RootCell<K, V> {
    cell: Mutex<Arc<RootReference<K, V>>>,
    condvar: Condvar,
}

impl<K, V> RootCell<K, V> {
    /// Builds a cell seeded with an empty root at version `version`.
    pub fn new(root: Arc<Page<K, V>>, version: u64) -> Self {
        RootCell {
            cell: Mutex::new(Arc::new(RootReference::initial(root, version))),
            condvar: Condvar::new(),
        }
    }

    /// Returns the currently published state. Never blocks.
    pub fn current(&self) -> Arc<RootReference<K, V>> {
        self.cell.lock().clone()
    }

    /// Overwrites the published state unconditionally (used only to install
    /// a rolled-back version via `rollback_to`, which is not subject to the
    /// normal CAS race since it runs under the map's external exclusivity
    /// contract — see [`crate::map::MVMap::rollback_to`]).
    pub fn force_set(&self, next: Arc<RootReference<K, V>>) {
        *self.cell.lock() = next;
        self.condvar.notify_all();
    }

    /// Attempts to acquire the reentrant logical lock for the calling
    /// thread. Returns the post-lock state on success (with `hold_count`
    /// incremented and `owner_id` set), or `None` if another thread already
    /// holds it.
    pub fn try_lock(&self) -> Option<Arc<RootReference<K, V>>> {
        let mut guard = self.cell.lock();
        let cur = guard.clone();
        let this_thread = thread::current().id();
        let can_lock = cur.hold_count == 0 || cur.owner_id == Some(this_thread);
        if !can_lock {
            return None;
        }
        let mut next = (*cur).clone();
        next.hold_count = cur.hold_count + 1;
        next.owner_id = Some(this_thread);
        next.update_attempt_counter = cur.update_attempt_counter + 1;
        if next.hold_count == 1 {
            tracing::trace!(target: "mvmap::lock", version = cur.version, "root lock acquired");
        }
        let next = Arc::new(next);
        *guard = next.clone();
        Some(next)
    }

    /// Releases one level of the lock.
    ///
    /// When the hold count reaches zero and `new_root` is `Some`, this is
    /// the outermost unlock of a successful write: it publishes a new
    /// version chained to `base`, the state observed before the lock was
    /// first taken. When `new_root` is `None` the attempt is abandoned
    /// (aborted or repeated) and the lock is simply released with no new
    /// version.
    pub fn unlock(&self, base: &Arc<RootReference<K, V>>, new_root: Option<Arc<Page<K, V>>>) {
        let mut guard = self.cell.lock();
        let cur = guard.clone();
        let mut next = (*cur).clone();
        next.hold_count = cur.hold_count.saturating_sub(1);
        if next.hold_count == 0 {
            next.owner_id = None;
            if let Some(root) = new_root {
                next.root = root;
                next.version = base.version + 1;
                next.update_counter = base.update_counter + 1;
                next.append_counter = 0;
                next.previous = Some(base.clone());
                tracing::trace!(target: "mvmap::version", version = next.version, "published new root version");
            }
        }
        *guard = Arc::new(next);
        drop(guard);
        self.condvar.notify_all();
    }

    /// Publishes a new root without going through the lock/unlock dance —
    /// used by the single-writer append fast path, which already has
    /// exclusive access by construction and bypasses the CAS retry loop
    /// entirely.
    pub fn publish_append(&self, root: Arc<Page<K, V>>, append_counter: u32) {
        let mut guard = self.cell.lock();
        let cur = guard.clone();
        let next = RootReference {
            root,
            version: cur.version,
            previous: cur.previous.clone(),
            update_counter: cur.update_counter,
            update_attempt_counter: cur.update_attempt_counter,
            hold_count: cur.hold_count,
            owner_id: cur.owner_id,
            append_counter,
        };
        *guard = Arc::new(next);
    }

    /// Blocks the calling thread (bounded by `timeout_ms`) until the lock is
    /// free, without taking it. Used by the backoff ladder in
    /// [`crate::map::MVMap::operate`] once busy-retry and `yield_now` have
    /// both failed to observe progress.
    pub fn wait_unlocked(&self, timeout_ms: u64) {
        let mut guard = self.cell.lock();
        if guard.hold_count == 0 {
            return;
        }
        tracing::debug!(target: "mvmap::lock", version = guard.version, "blocking on contended root lock");
        self.condvar
            .wait_for(&mut guard, Duration::from_millis(timeout_ms));
    }

    /// Installs `v` as this cell's current version without publishing a new
    /// root — used when the owning store commits a single version across
    /// every map it hosts, rather than each map bumping its own version via
    /// `unlock`'s CAS-publish path.
    pub fn set_write_version(&self, v: u64) {
        let mut guard = self.cell.lock();
        let cur = guard.clone();
        if cur.version == v {
            return;
        }
        let mut next = (*cur).clone();
        next.version = v;
        tracing::trace!(target: "mvmap::version", version = v, "write version installed explicitly");
        *guard = Arc::new(next);
    }

    /// Drops the `previous` chain past `oldest_version_to_keep`, bounding
    /// the memory held by retained snapshots.
    pub fn prune_previous(&self, oldest_version_to_keep: u64) {
        let mut guard = self.cell.lock();
        let cur = guard.clone();
        if let Some(pruned) = prune_chain(&cur, oldest_version_to_keep) {
            *guard = pruned;
        }
    }
}

/// Rebuilds `head`'s `previous` chain, cutting it off at the first version
/// older than `oldest_version_to_keep`. Returns `None` if nothing needed
/// pruning (already short enough).
fn prune_chain<K, V>(
    head: &Arc<RootReference<K, V>>,
    oldest_version_to_keep: u64,
) -> Option<Arc<RootReference<K, V>>> {
    let mut chain: Vec<&RootReference<K, V>> = Vec::new();
    let mut node = Some(head.as_ref());
    let mut needs_cut = false;
    while let Some(n) = node {
        chain.push(n);
        if n.version < oldest_version_to_keep && n.previous.is_some() {
            needs_cut = true;
            break;
        }
        node = n.previous.as_deref();
    }
    if !needs_cut {
        return None;
    }
    let mut rebuilt: Option<Arc<RootReference<K, V>>> = None;
    for n in chain.into_iter().rev() {
        let previous = if n.version < oldest_version_to_keep {
            None
        } else {
            rebuilt.clone()
        };
        rebuilt = Some(Arc::new(RootReference {
            root: n.root.clone(),
            version: n.version,
            previous,
            update_counter: n.update_counter,
            update_attempt_counter: n.update_attempt_counter,
            hold_count: n.hold_count,
            owner_id: n.owner_id,
            append_counter: n.append_counter,
        }));
    }
    rebuilt
}

/// The retry backoff ladder shared by every `operate()` attempt: busy-spin
/// a few times, then `yield_now`, then a short scaled sleep. The caller is
/// expected to fall through to [`RootCell::wait_unlocked`] once `attempt`
/// exceeds the ladder's range.
pub fn backoff(attempt: u32) {
    if attempt < 4 {
        std::hint::spin_loop();
    } else if attempt < 16 {
        thread::yield_now();
    } else {
        let millis = (attempt - 16).min(5) as u64;
        thread::sleep(Duration::from_micros(200 * millis.max(1)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::Page;

    fn empty_root() -> Arc<Page<i32, i32>> {
        Arc::new(Page::empty_leaf(1))
    }

    #[test]
    fn lock_unlock_round_trip_bumps_version() {
        let cell = RootCell::new(empty_root(), 0);
        let base = cell.current();
        let locked = cell.try_lock().unwrap();
        assert_eq!(locked.hold_count, 1);
        cell.unlock(&base, Some(empty_root()));
        let after = cell.current();
        assert_eq!(after.version, 1);
        assert_eq!(after.hold_count, 0);
        assert!(after.previous.is_some());
    }

    #[test]
    fn same_thread_relock_is_reentrant() {
        let cell = RootCell::new(empty_root(), 0);
        let first = cell.try_lock().unwrap();
        assert_eq!(first.hold_count, 1);
        let second = cell.try_lock().unwrap();
        assert_eq!(second.hold_count, 2);
    }

    #[test]
    fn second_thread_cannot_lock_while_held() {
        let cell = Arc::new(RootCell::new(empty_root(), 0));
        let _locked = cell.try_lock().unwrap();
        let other = cell.clone();
        let failed = std::thread::spawn(move || other.try_lock().is_none())
            .join()
            .unwrap();
        assert!(failed);
    }

    #[test]
    fn abort_releases_lock_without_new_version() {
        let cell = RootCell::new(empty_root(), 0);
        let base = cell.current();
        let _locked = cell.try_lock().unwrap();
        cell.unlock(&base, None);
        let after = cell.current();
        assert_eq!(after.version, 0);
        assert_eq!(after.hold_count, 0);
    }

    #[test]
    fn prune_cuts_chain_below_oldest_to_keep() {
        let cell = RootCell::new(empty_root(), 0);
        for _ in 0..5 {
            let base = cell.current();
            let _ = cell.try_lock().unwrap();
            cell.unlock(&base, Some(empty_root()));
        }
        assert_eq!(cell.current().version, 5);
        cell.prune_previous(4);
        let mut node = cell.current();
        let mut depth = 0;
        loop {
            depth += 1;
            let next = node.previous.clone();
            match next {
                Some(n) => node = n,
                None => break,
            }
        }
        assert_eq!(depth, 2); // versions 4 and 5 only
    }

    #[test]
    fn set_write_version_installs_version_without_new_root() {
        let cell = RootCell::new(empty_root(), 0);
        let base = cell.current();
        cell.set_write_version(42);
        let after = cell.current();
        assert_eq!(after.version, 42);
        assert!(Arc::ptr_eq(&after.root, &base.root));
    }

    #[test]
    fn set_write_version_is_a_no_op_at_the_same_version() {
        let cell = RootCell::new(empty_root(), 7);
        let base = cell.current();
        cell.set_write_version(7);
        let after = cell.current();
        assert!(Arc::ptr_eq(&base, &after));
    }

    #[test]
    fn wait_unlocked_returns_immediately_when_not_held() {
        let cell = RootCell::new(empty_root(), 0);
        // No writer holds the lock, so this must not block for the full timeout.
        let start = std::time::Instant::now();
        cell.wait_unlocked(500);
        assert!(start.elapsed() < Duration::from_millis(500));
    }
}
