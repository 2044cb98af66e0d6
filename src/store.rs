//! The external collaborator boundary: everything the map core needs from
//! its host (persistence, version bookkeeping, paging policy) without
//! depending on a concrete storage engine.
//!
//! An object-safe trait with sensible defaulted methods, so a minimal
//! embedder only has to implement the handful that matter to it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::StoreConfig;
use crate::error::{MvError, Result};
use crate::page::{MapId, Page, PagePos};

/// Proof that a reader is still using a given version's snapshot.
///
/// Returned by [`MapStore::register_version_usage`]; the holder calls
/// [`MapStore::deregister_version_usage`] with the same version when the
/// snapshot is no longer needed. Deliberately not a `Drop` guard: the
/// version frequently outlives the borrow that obtained it (e.g. a `Cursor`
/// returned to a caller), so lifetime-tying it to the token would force an
/// awkward self-referential struct.
#[derive(Clone, Copy, Debug)]
pub struct VersionUsageToken {
    version: u64,
}

impl VersionUsageToken {
    /// The version this token pins.
    pub fn version(&self) -> u64 {
        self.version
    }
}

/// Everything an [`crate::map::MVMap`] needs from its host.
///
/// All methods default to a reasonable behavior for a non-persistent,
/// single-map embedder; a real multi-map store overrides `read_page`,
/// `map_name`, `deregister_map_root`, and the version-usage pair to
/// coordinate reclamation across all maps it hosts.
pub trait MapStore<K, V>: Send + Sync {
    /// Loads a page that this core has evicted from memory. This core never
    /// evicts pages itself, so a default implementation that always errors
    /// is correct for any embedder that doesn't page children out
    /// independently.
    fn read_page(&self, map_id: MapId, pos: PagePos) -> Result<Arc<Page<K, V>>> {
        let _ = (map_id, pos);
        Err(MvError::Corruption(
            "read_page: this store does not evict pages".into(),
        ))
    }

    /// Adjusts the running tally of memory used by pages not yet persisted.
    /// `delta` may be negative (a page was saved or dropped).
    fn register_unsaved_memory(&self, delta: i64) {
        let _ = delta;
    }

    /// Whether accumulated unsaved memory has crossed a threshold that
    /// should trigger a background save.
    fn is_save_needed(&self) -> bool {
        false
    }

    /// Persists pending changes and returns the version the write commits
    /// as. A non-persistent store simply advances its version counter.
    fn commit(&self) -> Result<u64> {
        Ok(self.current_version())
    }

    /// Target number of keys per page before a split is considered.
    fn keys_per_page(&self) -> usize {
        48
    }

    /// Target maximum serialized page size in bytes, used to trigger an
    /// early split even under `keys_per_page`.
    fn max_page_size(&self) -> usize {
        16 * 1024
    }

    /// Busy/yield attempts `operate()` makes before falling back to a
    /// bounded condvar wait.
    fn spin_attempts_before_wait(&self) -> u32 {
        32
    }

    /// How long a contended writer blocks on the condvar per backoff round.
    fn wait_timeout_ms(&self) -> u64 {
        5
    }

    /// The version a new write would commit as.
    fn current_version(&self) -> u64;

    /// The oldest version any open snapshot or in-flight reader still
    /// references; versions older than this may have their `previous`
    /// chain pruned.
    fn oldest_version_to_keep(&self) -> u64 {
        0
    }

    /// Human-readable name of the given map, for diagnostics.
    fn map_name(&self, map_id: MapId) -> Option<String> {
        let _ = map_id;
        None
    }

    /// Called when a map is closed or removed, so the store can drop its
    /// reference to that map's root chain.
    fn deregister_map_root(&self, map_id: MapId) {
        let _ = map_id;
    }

    /// Pins `version` so its `previous` chain is not pruned, returning a
    /// token the caller releases via [`MapStore::deregister_version_usage`].
    fn register_version_usage(&self, version: u64) -> VersionUsageToken {
        VersionUsageToken { version }
    }

    /// Releases a pin obtained from [`MapStore::register_version_usage`].
    fn deregister_version_usage(&self, version: u64) {
        let _ = version;
    }

    /// Hook run before a write attempt begins; lets the store veto writes
    /// (e.g. the store is closing) before any page is touched.
    fn before_write(&self) -> Result<()> {
        Ok(())
    }

    /// Whether this store persists pages to durable storage at all.
    fn is_persistent(&self) -> bool {
        false
    }
}

/// A minimal, non-persistent [`MapStore`] used for standalone testing and
/// for embedders that only need the in-memory CoW semantics (no durability).
///
/// Holds no pages itself — `read_page` is never called since this core
/// keeps every page resident — and exists to give [`crate::map::MVMap`] a
/// version counter, unsaved-memory accounting, and version-usage tracking.
pub struct InMemoryStore {
    name: String,
    current_version: AtomicU64,
    oldest_version_to_keep: AtomicU64,
    unsaved_memory: AtomicI64,
    save_threshold: i64,
    keys_per_page: AtomicU64,
    spin_attempts_before_wait: u32,
    wait_timeout_ms: u64,
    version_usage: Mutex<HashMap<u64, u32>>,
}

impl InMemoryStore {
    /// Builds a store seeded at version 0, named for diagnostics, using
    /// [`StoreConfig::balanced`].
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_config(name, StoreConfig::balanced())
    }

    /// Builds a store with a non-default page fanout, for tests that need
    /// to force splits with a small number of entries.
    pub fn with_keys_per_page(name: impl Into<String>, keys_per_page: usize) -> Arc<Self> {
        let store = Self::new(name);
        store
            .keys_per_page
            .store(keys_per_page as u64, Ordering::Release);
        store
    }

    /// Builds a store from an explicit [`StoreConfig`] preset.
    pub fn with_config(name: impl Into<String>, config: StoreConfig) -> Arc<Self> {
        Arc::new(InMemoryStore {
            name: name.into(),
            current_version: AtomicU64::new(0),
            oldest_version_to_keep: AtomicU64::new(0),
            unsaved_memory: AtomicI64::new(0),
            save_threshold: config.save_threshold_bytes,
            keys_per_page: AtomicU64::new(config.keys_per_page as u64),
            spin_attempts_before_wait: config.spin_attempts_before_wait,
            wait_timeout_ms: config.wait_timeout_ms,
            version_usage: Mutex::new(HashMap::new()),
        })
    }

    /// Recomputes `oldest_version_to_keep` as the minimum pinned version
    /// still registered, or the current version if none are pinned.
    fn recompute_oldest(&self, usage: &HashMap<u64, u32>) {
        let oldest = usage
            .keys()
            .copied()
            .min()
            .unwrap_or_else(|| self.current_version.load(Ordering::Acquire));
        self.oldest_version_to_keep.store(oldest, Ordering::Release);
    }
}

impl<K, V> MapStore<K, V> for InMemoryStore {
    fn register_unsaved_memory(&self, delta: i64) {
        self.unsaved_memory.fetch_add(delta, Ordering::AcqRel);
    }

    fn is_save_needed(&self) -> bool {
        self.unsaved_memory.load(Ordering::Acquire) >= self.save_threshold
    }

    fn commit(&self) -> Result<u64> {
        self.unsaved_memory.store(0, Ordering::Release);
        let version = self.current_version.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!(target: "mvmap::store", store = %self.name, version, "committed store version advance");
        Ok(version)
    }

    fn keys_per_page(&self) -> usize {
        self.keys_per_page.load(Ordering::Acquire) as usize
    }

    fn spin_attempts_before_wait(&self) -> u32 {
        self.spin_attempts_before_wait
    }

    fn wait_timeout_ms(&self) -> u64 {
        self.wait_timeout_ms
    }

    fn current_version(&self) -> u64 {
        self.current_version.load(Ordering::Acquire)
    }

    fn oldest_version_to_keep(&self) -> u64 {
        self.oldest_version_to_keep.load(Ordering::Acquire)
    }

    fn map_name(&self, _map_id: MapId) -> Option<String> {
        Some(self.name.clone())
    }

    fn register_version_usage(&self, version: u64) -> VersionUsageToken {
        let mut usage = self.version_usage.lock();
        *usage.entry(version).or_insert(0) += 1;
        VersionUsageToken { version }
    }

    fn deregister_version_usage(&self, version: u64) {
        let mut usage = self.version_usage.lock();
        if let Some(count) = usage.get_mut(&version) {
            *count -= 1;
            if *count == 0 {
                usage.remove(&version);
            }
        }
        self.recompute_oldest(&usage);
    }

    fn is_persistent(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_advances_version_and_resets_unsaved_memory() {
        let store = InMemoryStore::new("t");
        MapStore::<i32, i32>::register_unsaved_memory(&*store, 100);
        assert!(MapStore::<i32, i32>::is_save_needed(&*store) == false);
        let v = MapStore::<i32, i32>::commit(&*store).unwrap();
        assert_eq!(v, 1);
        assert_eq!(MapStore::<i32, i32>::current_version(&*store), 1);
    }

    #[test]
    fn version_usage_tracks_oldest_pinned() {
        let store = InMemoryStore::new("t");
        MapStore::<i32, i32>::commit(&*store).unwrap();
        MapStore::<i32, i32>::commit(&*store).unwrap();
        let tok1 = MapStore::<i32, i32>::register_version_usage(&*store, 1);
        let _tok2 = MapStore::<i32, i32>::register_version_usage(&*store, 2);
        MapStore::<i32, i32>::deregister_version_usage(&*store, tok1.version());
        assert_eq!(MapStore::<i32, i32>::oldest_version_to_keep(&*store), 2);
    }

    #[test]
    fn presets_drive_distinct_backoff_knobs() {
        let balanced = InMemoryStore::with_config("b", StoreConfig::balanced());
        let production = InMemoryStore::with_config("p", StoreConfig::production());
        let benchmark = InMemoryStore::with_config("k", StoreConfig::benchmark());
        assert_eq!(MapStore::<i32, i32>::spin_attempts_before_wait(&*balanced), 32);
        assert_eq!(MapStore::<i32, i32>::wait_timeout_ms(&*balanced), 5);
        assert_eq!(MapStore::<i32, i32>::spin_attempts_before_wait(&*production), 48);
        assert_eq!(MapStore::<i32, i32>::wait_timeout_ms(&*production), 10);
        assert_eq!(MapStore::<i32, i32>::spin_attempts_before_wait(&*benchmark), 4);
        assert_eq!(MapStore::<i32, i32>::wait_timeout_ms(&*benchmark), 1);
    }

    #[test]
    fn trait_defaults_apply_when_a_store_does_not_override_them() {
        struct Bare;
        impl MapStore<i32, i32> for Bare {
            fn current_version(&self) -> u64 {
                0
            }
        }
        assert_eq!(MapStore::<i32, i32>::spin_attempts_before_wait(&Bare), 32);
        assert_eq!(MapStore::<i32, i32>::wait_timeout_ms(&Bare), 5);
    }
}
