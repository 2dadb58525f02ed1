//! Fixture-specific error types

use std::path::PathBuf;
use std::time::Duration;

use shared::{InstanceId, SharedError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FixtureError {
    #[error("Invalid configuration for {instance}: {reason}")]
    InvalidConfig { instance: String, reason: String },

    #[error("Instance {instance} configured more than once")]
    DuplicateInstance { instance: InstanceId },

    #[error("Could not bind to a port: {source}")]
    PortAllocation {
        #[source]
        source: std::io::Error,
    },

    #[error("Port allocator kept returning already-issued ports after {attempts} attempts")]
    PortsExhausted { attempts: usize },

    #[error("File system operation failed: {operation} on {path}: {source}")]
    FileSystem {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to start {instance} ({command}): {source}")]
    LaunchFailed {
        instance: InstanceId,
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Instance {instance} requested in-process execution but no in-process entry point is configured")]
    InProcessUnavailable { instance: InstanceId },

    #[error("Instance {instance} requested external execution but no external runner is configured")]
    ExternalUnavailable { instance: InstanceId },

    #[error("Instance {instance} cannot run as an external process: graceful group shutdown needs a unix platform")]
    ExternalUnsupported { instance: InstanceId },

    #[error("Invalid arguments for {instance}: {reason}")]
    InvalidArguments { instance: InstanceId, reason: String },

    #[error("Instance {instance} was launched twice")]
    AlreadyLaunched { instance: InstanceId },

    #[error("Server {instance} was shut down before its config was ready")]
    ShutDownBeforeReady { instance: InstanceId },

    #[error("Failed to load client config {path}: {last_error}")]
    ConfigLoadFailed { path: PathBuf, last_error: String },

    #[error("Failed to load client config {path}: timed out after {timeout:?}")]
    ConfigLoadTimeout { path: PathBuf, timeout: Duration },

    #[error("programmer error: {accessor} called on {instance} before its client config was loaded\n{backtrace}")]
    ConfigNotLoaded {
        instance: InstanceId,
        accessor: &'static str,
        backtrace: String,
    },

    #[error("Server {instance} was cancelled before it became ready")]
    Cancelled { instance: InstanceId },

    #[error("`{instance}` failed: {status} logs:\n{logs}")]
    UnexpectedExit {
        instance: InstanceId,
        status: String,
        logs: String,
    },

    #[error("Health check {path} on {instance} returned {status}")]
    HealthCheckFailed {
        instance: InstanceId,
        path: String,
        status: u16,
    },

    #[error("Invalid CA bundle {path}: {source}")]
    InvalidCertificate {
        path: PathBuf,
        #[source]
        source: reqwest::Error,
    },

    #[error("Instance {instance}: {source}")]
    InstanceFailed {
        instance: InstanceId,
        #[source]
        source: Box<FixtureError>,
    },

    #[error("Fixture setup failed: one or more servers did not become ready:\n{}", failures.join("\n"))]
    StartupFailed { failures: Vec<String> },

    #[error("No kind registered for artifact of type {type_name}")]
    ArtifactKindUnknown { type_name: &'static str },

    #[error("Error fetching artifact: {message}")]
    ArtifactProducer { message: String },

    #[error("Test scope '{scope}' failed:\n{}", failures.join("\n"))]
    TestFailed { scope: String, failures: Vec<String> },

    #[error("Shared component error: {0}")]
    Shared(#[from] SharedError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl FixtureError {
    pub fn file_system(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FixtureError::FileSystem {
            operation,
            path: path.into(),
            source,
        }
    }

    pub fn invalid_config(instance: impl Into<String>, reason: impl Into<String>) -> Self {
        FixtureError::InvalidConfig {
            instance: instance.into(),
            reason: reason.into(),
        }
    }

    /// Attach the instance identity, unless the error already names it
    pub fn for_instance(self, instance: &InstanceId) -> Self {
        match self {
            err @ FixtureError::InstanceFailed { .. } => err,
            other => FixtureError::InstanceFailed {
                instance: instance.clone(),
                source: Box::new(other),
            },
        }
    }

    /// Instance this error refers to, when it carries one
    pub fn instance(&self) -> Option<&InstanceId> {
        match self {
            FixtureError::InstanceFailed { instance, .. }
            | FixtureError::DuplicateInstance { instance }
            | FixtureError::LaunchFailed { instance, .. }
            | FixtureError::InProcessUnavailable { instance }
            | FixtureError::ExternalUnavailable { instance }
            | FixtureError::ExternalUnsupported { instance }
            | FixtureError::InvalidArguments { instance, .. }
            | FixtureError::AlreadyLaunched { instance }
            | FixtureError::ShutDownBeforeReady { instance }
            | FixtureError::ConfigNotLoaded { instance, .. }
            | FixtureError::Cancelled { instance }
            | FixtureError::UnexpectedExit { instance, .. }
            | FixtureError::HealthCheckFailed { instance, .. } => Some(instance),
            _ => None,
        }
    }

    /// Innermost error, skipping `InstanceFailed` wrappers
    pub fn root(&self) -> &FixtureError {
        match self {
            FixtureError::InstanceFailed { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type FixtureResult<T> = Result<T, FixtureError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_instance_wraps_once() {
        let a = InstanceId::new("a").unwrap();
        let err = FixtureError::ConfigLoadTimeout {
            path: PathBuf::from("/x"),
            timeout: Duration::from_secs(1),
        }
        .for_instance(&a)
        .for_instance(&InstanceId::new("b").unwrap());

        assert_eq!(err.instance(), Some(&a));
        assert!(matches!(err.root(), FixtureError::ConfigLoadTimeout { .. }));
        assert!(err.to_string().starts_with("Instance a:"));
    }

    #[test]
    fn test_startup_failed_lists_every_failure() {
        let err = FixtureError::StartupFailed {
            failures: vec!["one".into(), "two".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("one\ntwo"));
    }
}
