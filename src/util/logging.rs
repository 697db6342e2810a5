//! Logging initialization and configuration.

use crate::config::LogFormat;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the logging system.
///
/// `RUST_LOG` takes precedence over `level` when set.
///
/// # Arguments
///
/// * `level` - Log level filter (e.g., "info", "debug")
/// * `format` - Log output format (json or pretty)
pub fn init_logging(level: &str, format: &LogFormat) {
    let filter = build_filter(level);

    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => {
            registry
                .with(fmt::layer().json().with_thread_names(true))
                .init();
        }
        LogFormat::Pretty => {
            registry
                .with(fmt::layer().with_target(false).with_thread_names(true))
                .init();
        }
    }
}

/// Resolve the effective filter, falling back to `level` scoped to this crate.
fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,tcplb={}", level)))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Note: Can only init logging once per process, so we don't test init_logging directly
    #[test]
    fn test_filter_scopes_level_to_crate() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let filter = build_filter("debug");
        let rendered = filter.to_string();
        assert!(rendered.contains("tcplb=debug"));
        assert!(rendered.contains("warn"));
    }
}
