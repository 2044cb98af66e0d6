use std::io;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MvError>;

/// Errors surfaced by the map core.
///
/// Propagation policy: the core never swallows an error. CAS failures and
/// lock contention are retried internally and never surface here; only
/// terminal, caller-visible conditions do.
#[derive(Debug, Error)]
pub enum MvError {
    /// A write was attempted after the map was closed.
    #[error("map '{0}' is closed")]
    MapClosed(String),
    /// A write was attempted on a read-only map (e.g. a version snapshot).
    #[error("map '{0}' is read-only")]
    ReadOnly(String),
    /// `open_version` requested a version outside the retained chain.
    #[error("version {requested} is unavailable (oldest retained is {oldest_retained})")]
    UnknownVersion {
        /// Version requested by the caller.
        requested: u64,
        /// Oldest version the map still retains a `previous` link for.
        oldest_retained: u64,
    },
    /// `put` was called with no value.
    #[error("put requires a value")]
    NullValue,
    /// The map builder was asked to open an unknown map type.
    #[error("incompatible map type: {0}")]
    IncompatibleMapType(String),
    /// A `MapStore` collaborator returned data that violates a core invariant.
    #[error("corruption detected: {0}")]
    Corruption(String),
    /// An invalid argument was supplied to an operation.
    #[error("invalid argument: {0}")]
    Invalid(String),
    /// A `MapStore` collaborator's own internal lock was poisoned.
    #[error("store lock poisoned")]
    LockPoisoned,
    /// I/O error forwarded verbatim from a `MapStore::read_page` implementation.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Locks a `std::sync::Mutex`, turning poisoning into a `Corruption`-flavored
/// error instead of a panic. This core's own reentrant lock never uses a
/// poisoning mutex (see [`crate::root_reference`]); this exists for
/// `MapStore` implementations that do.
pub fn acquire_lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| {
        error!("store lock poisoned - fatal error");
        MvError::LockPoisoned
    })
}
