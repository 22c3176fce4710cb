//! Log level selection
//!
//! Diagnostics go through the `log` facade. The platform installs the
//! logger backend (UART, memory ring, ...); this module only picks the
//! maximum level from the build features.

use log::LevelFilter;

/// Log level selected by the `debug` / `verbose` features
pub const fn default_level() -> LevelFilter {
    if cfg!(feature = "verbose") {
        LevelFilter::Trace
    } else if cfg!(feature = "debug") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

/// Apply the maximum log level
pub fn init(level: LevelFilter) {
    log::set_max_level(level);
    log::debug!("log level set to {}", level);
}
