//! Shared logging utilities for consistent tracing across the harness and
//! the servers it launches

use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::types::InstanceId;

/// Which binary is initialising tracing; selects the per-crate filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    /// The fixture harness (library or CLI)
    Fixture,
    /// The stand-in control-plane server
    StubServer,
}

fn level_filter(component: Component, base_level: &str) -> String {
    match component {
        Component::Fixture => {
            format!("fixture={base_level},shared={base_level},stubserver={base_level},reqwest=warn,hyper=warn")
        }
        Component::StubServer => {
            format!("stubserver={base_level},shared={base_level},tower=warn,hyper=warn,axum={base_level}")
        }
    }
}

/// Map a numeric verbosity (the `--v` flag) onto a tracing level name
pub fn verbosity_to_level(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 | 2 => "info",
        3 | 4 => "debug",
        _ => "trace",
    }
}

/// Initialize tracing subscriber for a binary
///
/// `RUST_LOG` wins over the computed filter when set.
pub fn init_tracing(component: Component, log_level: Option<&str>) {
    use tracing_subscriber::{EnvFilter, fmt};

    let base_level = log_level.unwrap_or("info");
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_filter(component, base_level)));

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Initialize tracing for tests; safe to call from every test
pub fn init_test_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_filter(Component::Fixture, "debug")));

    let _ = fmt()
        .with_env_filter(env_filter)
        .with_test_writer()
        .with_target(true)
        .try_init();
}

/// Get formatted timestamp for consistent logging
pub fn format_timestamp() -> String {
    let now: DateTime<Utc> = Utc::now();
    now.format("%H:%M:%S%.3f").to_string()
}

/// Macro for instance-aware info logging
#[macro_export]
macro_rules! instance_info {
    ($instance:expr, $($arg:tt)*) => {
        tracing::info!(
            instance = %$instance,
            timestamp = $crate::logging::format_timestamp(),
            $($arg)*
        );
    };
}

/// Macro for instance-aware warning logging
#[macro_export]
macro_rules! instance_warn {
    ($instance:expr, $($arg:tt)*) => {
        tracing::warn!(
            instance = %$instance,
            timestamp = $crate::logging::format_timestamp(),
            $($arg)*
        );
    };
}

/// Macro for instance-aware error logging
#[macro_export]
macro_rules! instance_error {
    ($instance:expr, $($arg:tt)*) => {
        tracing::error!(
            instance = %$instance,
            timestamp = $crate::logging::format_timestamp(),
            $($arg)*
        );
    };
}

/// Macro for instance-aware debug logging
#[macro_export]
macro_rules! instance_debug {
    ($instance:expr, $($arg:tt)*) => {
        tracing::debug!(
            instance = %$instance,
            timestamp = $crate::logging::format_timestamp(),
            $($arg)*
        );
    };
}

/// Contextual logging helper for startup messages
pub fn log_startup(instance: &InstanceId, details: &str) {
    info!(
        instance = %instance,
        timestamp = format_timestamp(),
        "🚀 Starting {}",
        details
    );
}

/// Contextual logging helper for shutdown messages
pub fn log_shutdown(instance: &InstanceId, reason: &str) {
    info!(
        instance = %instance,
        timestamp = format_timestamp(),
        "🛑 Shutting down: {}",
        reason
    );
}

/// Contextual logging helper for error conditions
pub fn log_error(instance: &InstanceId, context: &str, error: &dyn std::fmt::Display) {
    error!(
        instance = %instance,
        timestamp = format_timestamp(),
        error = %error,
        "❌ {} failed: {}",
        context,
        error
    );
}

/// Contextual logging helper for success conditions
pub fn log_success(instance: &InstanceId, message: &str) {
    info!(
        instance = %instance,
        timestamp = format_timestamp(),
        "✅ {}",
        message
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_mapping() {
        assert_eq!(verbosity_to_level(0), "warn");
        assert_eq!(verbosity_to_level(2), "info");
        assert_eq!(verbosity_to_level(4), "debug");
        assert_eq!(verbosity_to_level(9), "trace");
    }

    #[test]
    fn test_level_filter_names_component_crates() {
        let fixture = level_filter(Component::Fixture, "debug");
        assert!(fixture.starts_with("fixture=debug"));
        assert!(fixture.contains("shared=debug"));

        let server = level_filter(Component::StubServer, "info");
        assert!(server.starts_with("stubserver=info"));
    }

    #[test]
    fn test_format_timestamp_shape() {
        let ts = format_timestamp();
        // HH:MM:SS.mmm
        assert_eq!(ts.len(), 12);
        assert_eq!(&ts[2..3], ":");
    }
}
