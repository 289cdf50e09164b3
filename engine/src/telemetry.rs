//! Telemetry and Observability
//!
//! Handles setting up `tracing-subscriber` for structured logging.
//! Level resolution: an explicit `--log` flag wins over `RUST_LOG`, which
//! wins over the configured `log_level`.
//!
//! In debug builds: pretty-printed terminal output.
//! In release builds: JSON structured output with spans.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter directives for a level
fn directives(level: &str) -> String {
    format!("{level},foreman_engine={level}")
}

/// Resolve the active filter. A level passed on the command line overrides
/// `RUST_LOG`; without one the environment is consulted before the config.
fn resolve_filter(cli_level: Option<&str>, config_level: &str) -> EnvFilter {
    match cli_level {
        Some(level) => EnvFilter::new(directives(level)),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(directives(config_level))),
    }
}

/// Initialize the tracing subscriber
pub fn init_telemetry(cli_level: Option<&str>, config_level: &str) {
    let env_filter = resolve_filter(cli_level, config_level);

    #[cfg(debug_assertions)]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty().with_target(false))
            .try_init()
            .ok();
    }

    #[cfg(not(debug_assertions))]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_current_span(true))
            .try_init()
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directives_cover_the_crate() {
        assert_eq!(directives("debug"), "debug,foreman_engine=debug");
    }

    #[test]
    fn test_cli_level_beats_configured_level() {
        let filter = resolve_filter(Some("trace"), "info");
        assert!(filter.to_string().contains("foreman_engine=trace"));
    }
}
