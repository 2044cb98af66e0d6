//! # mvmap - a persistent, multi-version concurrent ordered map core
//!
//! `mvmap` implements the copy-on-write B+tree engine behind a single named
//! map ("MVMap") inside a larger multiplexing store ("MVStore"). A store
//! holds many maps; each map gives ordered iteration, point/range lookups,
//! ranked access, and atomic update primitives, with snapshot reads and
//! rollback to prior versions.
//!
//! ## Quick start
//!
//! ```rust
//! use mvmap::{InMemoryStore, MapBuilder};
//!
//! let store = InMemoryStore::new("example");
//! let map = MapBuilder::<String, String>::new_ordered().open(store, 1, 0).unwrap();
//!
//! map.put("a".to_string(), "1".to_string()).unwrap();
//! assert_eq!(map.get(&"a".to_string()), Some("1".to_string()));
//! ```
//!
//! ## Architecture
//!
//! - [`page`]: immutable copy-on-write B+tree nodes (leaf and internal).
//! - [`cursor`]: root-to-leaf traversal path and ordered iteration.
//! - [`root_reference`]: the atomically-published, versioned map state.
//! - [`decision`]: pluggable strategies consulted during `operate`.
//! - [`map`]: the engine — `MVMap::operate`, `append`, snapshots, rollback.
//! - [`store`]: the external collaborator boundary (`MapStore`) and a
//!   minimal in-memory implementation for embedding and tests.
//! - [`config`]: sizing/backoff presets (`StoreConfig`) and the
//!   map-construction property bag (`MapConfig`).

pub mod comparator;
pub mod config;
pub mod cursor;
pub mod decision;
pub mod error;
pub mod logging;
pub mod map;
pub mod page;
pub mod root_reference;
pub mod store;

pub use comparator::{natural_order, Comparator, FnComparator};
pub use config::{MapConfig, StoreConfig};
pub use cursor::Cursor;
pub use decision::{Decision, DecisionMaker};
pub use error::{MvError, Result};
pub use map::{MapBuilder, MapStats, MVMap};
pub use page::{MapId, Page, PagePos};
pub use root_reference::RootReference;
pub use store::{InMemoryStore, MapStore, VersionUsageToken};
