//! Logging initialization for the command-line binary

use env_logger::Builder;
use log::LevelFilter;

/// Initialize the `env_logger` backend with the given default level; the
/// `RUST_LOG` environment variable still takes precedence.
pub fn initialize_logger(filter: LevelFilter) {
    Builder::new()
        .filter_level(filter)
        .parse_default_env()
        .format_target(false)
        .format_timestamp(None)
        .init();
}
