//! Logging utilities with tagstream segment prefixes.
//!
//! Provides consistent logging setup across tagstream binaries.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing with tagstream defaults.
///
/// Sets up tracing-subscriber with:
/// - Environment filter (RUST_LOG)
/// - Compact format suitable for terminal output
pub fn init() {
    init_with_filter("info");
}

/// Initialize tracing with a custom default filter.
///
/// `RUST_LOG` wins over `default_filter` when set. Logs go to stderr so that
/// stdout stays free for result output.
pub fn init_with_filter(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .try_init();
}

/// tagstream segment prefixes for logging.
pub mod prefix {
    /// Capture/render context
    pub const CAPTURE: &str = "◉";
    /// Detection context (worker)
    pub const DETECT: &str = "⌖";
    /// Native binding resolution
    pub const BIND: &str = "⋈";
    /// Graceful startup prefix
    pub const OPEN: &str = "✿";
    /// Graceful shutdown prefix
    pub const CLOSE: &str = "❀";
}
