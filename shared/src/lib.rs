//! Shared types for the control-plane test fixture
//!
//! Contains only what both sides of the harness boundary need: the instance
//! identifier, the client-configuration file the server writes and the
//! harness reads, and the logging setup used by every binary.

pub mod client_config;
pub mod errors;
pub mod logging;
pub mod types;

pub use client_config::{
    AuthInfo, Cluster, ClientConfig, ClientTarget, Context, NamedAuthInfo, NamedCluster, NamedContext,
    BASE_CONTEXT, SHARD_BASE_CONTEXT,
};
pub use errors::*;
pub use types::*;
