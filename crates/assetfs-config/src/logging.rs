//! Logging initialization.
//!
//! All components log through `tracing`; the binary initializes one
//! subscriber here. `RUST_LOG` takes precedence over the configured
//! level so ad-hoc debugging never requires a config edit.

use tracing_subscriber::EnvFilter;

/// Initialize logging with the configured level. Call once at startup.
pub fn init(level: &str) {
    let filter = match level {
        "error" | "warn" | "info" | "debug" => level,
        _ => "info",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
