//! Test fixture for control-plane servers
//!
//! Launches one or more server instances (as child processes or in-process
//! tasks), waits until each has written its client configuration and passes
//! a health probe, and tears everything down when the test scope finishes.
//!
//! ```no_run
//! # async fn demo() -> fixture::FixtureResult<()> {
//! use fixture::{Config, FixtureOrchestrator, TestScope};
//!
//! let scope = TestScope::new("two_servers");
//! let fixture = FixtureOrchestrator::new(scope.clone())
//!     .start(vec![
//!         Config::builder("a").scratch_dirs("/tmp/art", "/tmp/data").build()?,
//!         Config::builder("b").scratch_dirs("/tmp/art", "/tmp/data").build()?,
//!     ])
//!     .await?;
//! let target = fixture["a"].base_config()?;
//! # let _ = target;
//! scope.finish().await
//! # }
//! ```

pub mod artifacts;
pub mod config;
pub mod error;
pub mod health;
pub mod loader;
pub mod log_filter;
pub mod options;
pub mod orchestrator;
pub mod ports;
pub mod runner;
pub mod scope;
pub mod server;

pub use artifacts::{ArtifactCollector, GroupVersionKind, ObjectMeta, Resource, Scheme};
pub use config::{Config, ConfigBuilder};
pub use error::{FixtureError, FixtureResult};
pub use health::{EndpointMonitor, HealthProber};
pub use loader::ConfigLoader;
pub use log_filter::{LogFilter, filter_logs};
pub use options::{FixtureEnv, FixtureTimings, RunOptions};
pub use orchestrator::{Fixture, FixtureOrchestrator};
pub use ports::{PortAllocator, ReservedPort};
pub use runner::{
    DoneGuard, DoneSignal, ExternalRunner, InProcessEntry, InProcessRunner, InProcessServer, LaunchRequest,
    PortRole, RunnerKind, ServerCommand, ServerRunner,
};
pub use scope::TestScope;
pub use server::{InstanceState, LoadedConfig, ServerHandle, StateKind};
