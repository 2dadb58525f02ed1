//! Shared error types for the fixture workspace

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SharedError {
    #[error("Failed to read client config {path}: {source}")]
    ClientConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse client config {path}: {source}")]
    ClientConfigParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Failed to serialize client config: {0}")]
    ClientConfigSerialize(#[from] serde_yaml::Error),

    #[error("Context '{name}' not found in client config")]
    ContextNotFound { name: String },

    #[error("Cluster '{name}' referenced by context '{context}' not found")]
    ClusterNotFound { name: String, context: String },

    #[error("User '{name}' referenced by context '{context}' not found")]
    UserNotFound { name: String, context: String },

    #[error("Invalid instance name: '{input}'")]
    InvalidInstanceName { input: String },
}

pub type SharedResult<T> = Result<T, SharedError>;
