//! Launch strategies for orchestrated servers
//!
//! Two strategies share one contract: [`ServerRunner::launch`] starts the
//! server and returns at once with a [`DoneSignal`] that completes when the
//! server has fully stopped. Readiness is polled separately.

pub mod external;
pub mod in_process;
pub mod output;

mod tests;

use std::path::PathBuf;

use async_trait::async_trait;
use shared::InstanceId;
use tokio_util::sync::CancellationToken;

use crate::error::FixtureResult;
use crate::scope::TestScope;

pub use external::{ExternalRunner, ServerCommand};
pub use in_process::{InProcessEntry, InProcessRunner, InProcessServer};

/// Listener a launch strategy needs a port for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortRole {
    /// The server's own secure API listener
    Secure,
    /// Embedded store client listener
    StoreClient,
    /// Embedded store peer listener
    StorePeer,
}

impl PortRole {
    /// Flag the server accepts for this port
    pub fn flag(&self) -> &'static str {
        match self {
            PortRole::Secure => "--secure-port",
            PortRole::StoreClient => "--store-client-port",
            PortRole::StorePeer => "--store-peer-port",
        }
    }
}

/// Port set most servers need
pub const DEFAULT_PORT_ROLES: &[PortRole] = &[PortRole::Secure, PortRole::StoreClient, PortRole::StorePeer];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerKind {
    External,
    InProcess,
}

/// Everything a strategy needs to start one server
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub instance: InstanceId,
    pub data_dir: PathBuf,
    pub args: Vec<String>,
    /// Cancelled to ask the server to stop
    pub lifecycle: CancellationToken,
    /// Receives unexpected-exit and panic reports
    pub scope: TestScope,
    pub stream_logs: bool,
}

/// Strategy abstraction for starting a server
#[mockall::automock]
#[async_trait]
pub trait ServerRunner: Send + Sync {
    fn kind(&self) -> RunnerKind;

    /// Ports the launched server must be given, in flag order
    fn port_roles(&self) -> &'static [PortRole];

    /// Start the server and return without waiting for readiness
    async fn launch(&self, request: LaunchRequest) -> FixtureResult<DoneSignal>;
}

/// Waitable signal that a server has fully stopped
#[derive(Debug, Clone)]
pub struct DoneSignal {
    token: CancellationToken,
}

impl DoneSignal {
    /// A signal and the guard that completes it
    pub fn pair() -> (DoneSignal, DoneGuard) {
        let token = CancellationToken::new();
        (
            DoneSignal { token: token.clone() },
            DoneGuard { token },
        )
    }

    /// Already-complete signal, for servers that never started
    pub fn completed() -> DoneSignal {
        let (signal, guard) = DoneSignal::pair();
        guard.complete();
        signal
    }

    pub async fn wait(&self) {
        self.token.cancelled().await
    }

    pub fn is_done(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Completes its [`DoneSignal`] exactly once, at the latest when dropped
///
/// Supervisors hold the guard for the whole supervision so a panic still
/// completes the signal during unwinding.
#[derive(Debug)]
pub struct DoneGuard {
    token: CancellationToken,
}

impl DoneGuard {
    pub fn complete(self) {
        drop(self)
    }
}

impl Drop for DoneGuard {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
