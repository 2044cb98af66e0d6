//! Optional `tracing` subscriber wiring for embedders that want the core's
//! `trace!`/`debug!` instrumentation without building their own subscriber.

use crate::error::{MvError, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Installs a global `tracing` subscriber filtered by `level` (an
/// `EnvFilter` directive string, e.g. `"mvmap=debug"`).
pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(level)
                .map_err(|e| MvError::Invalid(format!("invalid log level: {e}")))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| MvError::Invalid("logging already initialized".into()))
}
