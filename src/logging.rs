//! Logger initialization for the command-line frontend

use std::io::Write;

use env_logger::{Builder, Env};
use log::LevelFilter;

/// Initialize the logger with the given default level, overridable via
/// the `SKETCHFLASH_LOG` environment variable.
pub fn initialize_logger(filter: LevelFilter) {
    Builder::from_env(Env::default().filter_or("SKETCHFLASH_LOG", filter.as_str()))
        .format(|f, record| writeln!(f, "[{}] {}", record.level(), record.args()))
        .init();
}
