//! Logging configuration for tracejit
//!
//! Library code emits `tracing` events; the `log` feature of `tracing`
//! forwards them to whatever `log` sink is installed. This module installs an
//! `env_logger` sink.
//!
//! # Usage
//!
//! ```rust,ignore
//! use compiler::logging;
//!
//! // Warn level
//! logging::init();
//!
//! // From RUST_LOG
//! logging::init_from_env();
//!
//! // From a `-v` count on the command line
//! logging::init_with_level(logging::level_for_verbosity(2));
//! ```
//!
//! # Log Levels
//!
//! - `warn!` - a guard branch or bridge could not be built
//! - `info!` - compile outcomes (loop installed, bridge attached)
//! - `debug!` - optimizer decisions, rejections, guard failure thresholds
//! - `trace!` - per-operation detail (folding, forwarding, virtual forcing)
//!
//! Filter by module with `RUST_LOG`:
//!
//! ```bash
//! RUST_LOG=compiler::optimizer=debug tracejit opt loop.trace
//! RUST_LOG=compiler::compile=info,compiler::codegen=trace tracejit run loop.trace
//! ```

use env_logger::Builder;
use log::LevelFilter;
use std::io::Write;
use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize logging at Warn level. Only the first call has an effect.
pub fn init() {
    init_with_level(LevelFilter::Warn);
}

/// Initialize logging with a specific level. Only the first call has an effect.
pub fn init_with_level(level: LevelFilter) {
    INIT.call_once(|| {
        Builder::new()
            .filter_level(level)
            .format(|buf, record| {
                writeln!(
                    buf,
                    "[{:5}] {} - {}",
                    record.level(),
                    record.module_path().unwrap_or("tracejit"),
                    record.args()
                )
            })
            .init();
    });
}

/// Initialize logging from `RUST_LOG`, defaulting to Warn.
pub fn init_from_env() {
    INIT.call_once(|| {
        Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    });
}

/// Level for a repeated `-v` flag: none is Warn, each one more step down
pub fn level_for_verbosity(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Initialize logging for tests; output is captured by the test harness.
///
/// ```rust,ignore
/// #[test]
/// fn test_something() {
///     compiler::logging::init_test();
/// }
/// ```
pub fn init_test() {
    // try_init() doesn't panic if already initialized
    let _ = env_logger::builder()
        .filter_level(LevelFilter::Warn)
        .is_test(true)
        .try_init();
}

/// Whether `init`, `init_with_level` or `init_from_env` ran
pub fn is_initialized() -> bool {
    INIT.is_completed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_test();
        init_test();
    }

    #[test]
    fn test_tracing_events_reach_the_log_sink() {
        init_test();
        tracing::warn!("warn from tracing");
        tracing::debug!("debug from tracing");
        log::info!("info from log");
    }

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(level_for_verbosity(0), LevelFilter::Warn);
        assert_eq!(level_for_verbosity(2), LevelFilter::Debug);
        assert_eq!(level_for_verbosity(9), LevelFilter::Trace);
    }
}
