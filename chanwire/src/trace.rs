//! Logging for the protocol engine.
//!
//! Enable with `--features tracing`. Without the feature every macro here
//! expands to nothing, so reactor and transport hot paths carry no logging
//! cost in production builds.

/// Installs a `tracing` subscriber that writes to stderr.
///
/// The filter comes from `RUST_LOG`, defaulting to `chanwire=debug`. Call
/// once at process start (the repeater binary does) or from a test helper.
/// Does nothing if the `tracing` feature is not enabled.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chanwire=debug"));

    // A second init (several test binaries in one process) is not an error.
    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(false)
                .with_line_number(false)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .try_init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, info, trace, warn};

/// Swallows the arguments of a disabled log call. Only usable in statement
/// position: `Err(e) => { debug!(...); }`, never `Err(e) => debug!(...)`.
#[cfg(not(feature = "tracing"))]
macro_rules! disabled {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use {
    disabled as debug, disabled as error, disabled as info, disabled as trace, disabled as warn,
};
