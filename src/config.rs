//! Tunable sizing and retry knobs: a plain struct of named constants with a
//! handful of presets, rather than scattering magic numbers across the
//! engine.

/// Per-store page sizing and backoff tuning, handed to an
/// [`crate::store::InMemoryStore`] (or any other [`crate::store::MapStore`])
/// at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    /// Target entries per page before a split is considered.
    pub keys_per_page: usize,
    /// Target maximum serialized page size in bytes, a secondary split
    /// trigger alongside `keys_per_page`.
    pub max_page_size: usize,
    /// Bytes of unsaved page memory that accumulate before
    /// [`crate::store::MapStore::is_save_needed`] reports pressure.
    pub save_threshold_bytes: i64,
    /// Busy/yield attempts `operate()` makes before falling back to a
    /// bounded condvar wait.
    pub spin_attempts_before_wait: u32,
    /// How long a contended writer blocks on the condvar per backoff round.
    pub wait_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::balanced()
    }
}

impl StoreConfig {
    /// Conservative defaults: small pages, short waits. Good for
    /// interactive workloads with many small maps.
    pub fn balanced() -> Self {
        StoreConfig {
            keys_per_page: 48,
            max_page_size: 16 * 1024,
            save_threshold_bytes: 4 * 1024 * 1024,
            spin_attempts_before_wait: 32,
            wait_timeout_ms: 5,
        }
    }

    /// Larger pages and a longer save threshold, trading per-operation
    /// latency for fewer, bigger splits — favors throughput over
    /// interactive latency.
    pub fn production() -> Self {
        StoreConfig {
            keys_per_page: 96,
            max_page_size: 64 * 1024,
            save_threshold_bytes: 32 * 1024 * 1024,
            spin_attempts_before_wait: 48,
            wait_timeout_ms: 10,
        }
    }

    /// Tiny pages and no backoff patience, for tests and benchmarks that
    /// want to force splits and contention deterministically with few
    /// entries.
    pub fn benchmark() -> Self {
        StoreConfig {
            keys_per_page: 4,
            max_page_size: 1024,
            save_threshold_bytes: 0,
            spin_attempts_before_wait: 4,
            wait_timeout_ms: 1,
        }
    }
}

/// Per-map construction parameters: the property bag a store passes when
/// opening a map (`store`, `id`, `createVersion`, `singleWriter`, optional
/// `type`).
#[derive(Debug, Clone)]
pub struct MapConfig {
    /// Initial version the map opens at (typically the store's current
    /// version).
    pub initial_version: u64,
    /// Enables the single-writer append fast path.
    pub single_writer: bool,
    /// Optional map-type tag; only `"mvmap"` (or absent, defaulting to it)
    /// is recognized by this core. Anything else is rejected with
    /// [`crate::error::MvError::IncompatibleMapType`] — this core only ever
    /// builds one kind of map, but the builder still validates the tag so a
    /// store multiplexing other map types can route construction requests
    /// through a single entry point without this core silently accepting a
    /// type it doesn't know how to open.
    pub map_type: Option<String>,
}

impl Default for MapConfig {
    fn default() -> Self {
        MapConfig {
            initial_version: 0,
            single_writer: false,
            map_type: None,
        }
    }
}

/// The only map type this core knows how to open.
pub const MVMAP_TYPE: &str = "mvmap";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn benchmark_preset_has_tiny_fanout() {
        assert_eq!(StoreConfig::benchmark().keys_per_page, 4);
    }

    #[test]
    fn default_map_config_has_no_type_tag() {
        assert_eq!(MapConfig::default().map_type, None);
    }
}
