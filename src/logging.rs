//! Tracing initialization.
//!
//! The log level is controlled by the `RUST_LOG` environment variable and
//! defaults to `info`:
//!
//! ```bash
//! RUST_LOG=debug ravel 8080
//! ```

use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber. Call once, before the server starts.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
