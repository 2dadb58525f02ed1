//! In-process launch strategy
//!
//! The server's entry point runs as a task on the test's own runtime. It is
//! handed two tokens: `shutdown`, the instance lifecycle, and
//! `store_shutdown`, which is only cancelled after the entry point returned
//! so the server can keep flushing to its store while it shuts down.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use shared::{InstanceId, instance_debug, instance_warn};
use tokio_util::sync::CancellationToken;

use crate::error::{FixtureError, FixtureResult};
use crate::scope::panic_message;

use super::{DEFAULT_PORT_ROLES, DoneSignal, LaunchRequest, PortRole, RunnerKind, ServerRunner};

/// What an in-process entry point receives
#[derive(Debug, Clone)]
pub struct InProcessServer {
    pub instance: InstanceId,
    pub data_dir: PathBuf,
    pub args: Vec<String>,
    /// Cancelled when the fixture asks the server to stop
    pub shutdown: CancellationToken,
    /// Cancelled once `run` has returned
    pub store_shutdown: CancellationToken,
}

/// Server entry point callable within the test process
#[async_trait]
pub trait InProcessEntry: Send + Sync {
    /// Reject bad arguments before anything is started
    fn validate_args(&self, _args: &[String]) -> anyhow::Result<()> {
        Ok(())
    }

    /// Run until `server.shutdown` is cancelled
    async fn run(&self, server: InProcessServer) -> anyhow::Result<()>;
}

/// Runs an [`InProcessEntry`] on the current runtime
#[derive(Clone)]
pub struct InProcessRunner {
    entry: Arc<dyn InProcessEntry>,
    port_roles: &'static [PortRole],
}

impl std::fmt::Debug for InProcessRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessRunner")
            .field("port_roles", &self.port_roles)
            .finish_non_exhaustive()
    }
}

impl InProcessRunner {
    pub fn new(entry: Arc<dyn InProcessEntry>) -> Self {
        Self {
            entry,
            port_roles: DEFAULT_PORT_ROLES,
        }
    }

    pub fn with_port_roles(mut self, roles: &'static [PortRole]) -> Self {
        self.port_roles = roles;
        self
    }
}

#[async_trait]
impl ServerRunner for InProcessRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::InProcess
    }

    fn port_roles(&self) -> &'static [PortRole] {
        self.port_roles
    }

    async fn launch(&self, request: LaunchRequest) -> FixtureResult<DoneSignal> {
        self.entry
            .validate_args(&request.args)
            .map_err(|e| FixtureError::InvalidArguments {
                instance: request.instance.clone(),
                reason: format!("{e:#}"),
            })?;

        tokio::fs::create_dir_all(&request.data_dir)
            .await
            .map_err(|e| FixtureError::file_system("create data directory", &request.data_dir, e))?;

        let LaunchRequest {
            instance,
            data_dir,
            args,
            lifecycle,
            scope,
            ..
        } = request;

        let store_shutdown = CancellationToken::new();
        let server = InProcessServer {
            instance: instance.clone(),
            data_dir,
            args,
            shutdown: lifecycle.clone(),
            store_shutdown: store_shutdown.clone(),
        };

        let (signal, guard) = DoneSignal::pair();
        let entry = self.entry.clone();
        instance_debug!(instance, "🧵 Starting in-process server");

        tokio::spawn(async move {
            let result = tokio::spawn(async move { entry.run(server).await }).await;
            store_shutdown.cancel();

            match result {
                Ok(Ok(())) if lifecycle.is_cancelled() => {
                    instance_debug!(instance, "🏁 In-process server stopped");
                }
                Ok(Ok(())) => {
                    instance_warn!(instance, "⚠️ In-process server returned before shutdown was requested");
                }
                Ok(Err(e)) if lifecycle.is_cancelled() => {
                    instance_debug!(instance, "In-process server stopped with error after shutdown: {:#}", e);
                }
                Ok(Err(e)) => {
                    scope.report_error(format!("`{instance}` failed: {e:#}"));
                }
                Err(join) if join.is_panic() => {
                    scope.report_error(format!(
                        "`{instance}` panicked: {}",
                        panic_message(join.into_panic())
                    ));
                }
                Err(join) => {
                    scope.report_error(format!("`{instance}` task was aborted: {join}"));
                }
            }
            guard.complete();
        });

        Ok(signal)
    }
}
