//! Logging setup for the `frametrace` target.
//!
//! The engine logs through the `log` facade: debug for skips and restarts,
//! info for bytecode, graphs and guards, warn for graph breaks and cache limits,
//! error for conversion failures. [`init_logging`] installs an `env_logger`
//! once per process; `RUST_LOG` still overrides the configured level.

use std::sync::Once;

use crate::config::LogLevel;

static INIT: Once = Once::new();

/// Installs the process logger at `level`. Later calls are no-ops.
pub fn init_logging(level: LogLevel) {
    INIT.call_once(|| {
        env_logger::Builder::new()
            .filter_module("frametrace", level.to_filter())
            .parse_env(env_logger::Env::default())
            .format_timestamp(None)
            .try_init()
            .ok();
    });
}
