//! Structured logging setup.
//!
//! The crate itself only emits `tracing` events. Applications that do not install their
//! own subscriber can call [`init_logging`] with the `[logging]` section of the config.

use tracing::info;

use crate::config::LoggingConfig;

/// Installs a global fmt subscriber (plain or JSON) at the configured level.
///
/// Returns `false` if a global subscriber was already installed; the existing one is kept.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let builder = tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_target(true)
        .with_thread_names(true);

    let installed = if config.json_format {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    };

    if installed {
        info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    }
    installed
}

/// Test-writer subscriber for unit and integration tests. Safe to call repeatedly.
pub fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init()
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_second_init_is_noop() {
        init_test_logging();
        assert!(!init_logging(&LoggingConfig::default()));
    }
}
