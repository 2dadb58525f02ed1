//! Stub-server error types

use std::path::PathBuf;

use shared::SharedError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StubServerError {
    #[error("Failed to bind {listener} listener on port {port}: {source}")]
    Bind {
        listener: &'static str,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("File system operation failed: {operation} on {path}: {source}")]
    FileSystem {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Client CA file {path} is not readable: {source}")]
    ClientCa {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Store was shut down before the server finished flushing")]
    StoreClosed,

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("HTTP server error: {0}")]
    Serve(#[source] std::io::Error),

    #[error("Exiting with code {code} as requested")]
    InducedExit { code: i32 },

    #[error("Shared component error: {0}")]
    Shared(#[from] SharedError),
}

impl StubServerError {
    pub fn file_system(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StubServerError::FileSystem {
            operation,
            path: path.into(),
            source,
        }
    }
}

pub type StubServerResult<T> = Result<T, StubServerError>;
