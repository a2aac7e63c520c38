//! Tracing subscriber setup driven by [`LoggingConfig`].
//!
//! The library itself only emits `tracing` events; binaries (the consumer)
//! call [`init_logging`] once at startup. `RUST_LOG` takes precedence over the
//! configured level when present.

use crate::config::LoggingConfig;
use crate::error::{ScroogeError, ScroogeResult};
use tracing_subscriber::EnvFilter;

/// Build the event filter for `config`, letting `RUST_LOG` override it.
pub fn build_filter(config: &LoggingConfig) -> EnvFilter {
    let level: tracing::Level = config.level.into();
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> ScroogeResult<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(build_filter(config))
        .with_target(config.include_targets)
        .with_thread_names(true);

    let installed = match (config.json_format, config.include_timestamps) {
        (true, true) => builder.json().try_init(),
        (true, false) => builder.json().without_time().try_init(),
        (false, true) => builder.with_ansi(config.colored).try_init(),
        (false, false) => builder.with_ansi(config.colored).without_time().try_init(),
    };

    installed.map_err(|e| ScroogeError::config(format!("failed to install logger: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_filter_follows_level() {
        // Only meaningful when RUST_LOG is unset.
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LoggingConfig {
            level: LogLevel::Warn,
            ..Default::default()
        };
        assert_eq!(build_filter(&config).to_string(), "warn");
    }

    #[test]
    fn test_second_init_is_an_error() {
        let config = LoggingConfig {
            colored: false,
            ..Default::default()
        };
        let _ = init_logging(&config);
        assert!(init_logging(&config).is_err());
    }
}
