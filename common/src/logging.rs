//! Thin wrapper around `env_logger` so both binaries initialize logging identically,
//! honoring the configured level instead of whatever `RUST_LOG` happens to be set to.

use crate::config::Settings;

/// Initializes the global logger at `settings.log_level`, falling back to `info` if the
/// configured string doesn't parse as a log level filter.
pub fn init(settings: &Settings) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(settings.log_level.parse().unwrap_or(log::LevelFilter::Info));
    let _ = builder.try_init();
}
