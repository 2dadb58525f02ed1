//! Per-instance runtime handle
//!
//! A [`ServerHandle`] owns one orchestrated server: its identity, the final
//! argument list, its directories and ports, and a tagged lifecycle state.
//! The loaded client configuration lives inside the state, so it can only be
//! reached once loading succeeded.

use std::backtrace::Backtrace;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Instant;

use parking_lot::Mutex;
use shared::logging::{log_shutdown, log_success};
use shared::{BASE_CONTEXT, ClientConfig, ClientTarget, InstanceId, SHARD_BASE_CONTEXT, instance_debug};
use tokio_util::sync::CancellationToken;

use crate::artifacts::{ArtifactCollector, Resource};
use crate::error::{FixtureError, FixtureResult};
use crate::runner::{DoneSignal, PortRole, RunnerKind};
use crate::scope::TestScope;

/// Client configuration file written by the server, relative to its data dir
pub const CLIENT_CONFIG_FILE: &str = "admin.kubeconfig";

/// File name expected inside the client-CA directory
pub const CLIENT_CA_FILE: &str = "client-ca.crt";

/// A successfully loaded client configuration and where it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedConfig {
    pub config: ClientConfig,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceState {
    NotStarted,
    Launching,
    Running(LoadedConfig),
    /// Keeps the config if the server got far enough to write one
    Cancelled(Option<LoadedConfig>),
}

/// State tag without the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    NotStarted,
    Launching,
    Running,
    Cancelled,
}

impl InstanceState {
    pub fn kind(&self) -> StateKind {
        match self {
            InstanceState::NotStarted => StateKind::NotStarted,
            InstanceState::Launching => StateKind::Launching,
            InstanceState::Running(_) => StateKind::Running,
            InstanceState::Cancelled(_) => StateKind::Cancelled,
        }
    }

    fn loaded(&self) -> Option<&LoadedConfig> {
        match self {
            InstanceState::Running(loaded) => Some(loaded),
            InstanceState::Cancelled(loaded) => loaded.as_ref(),
            _ => None,
        }
    }
}

/// Values the orchestrator fixes before the handle exists
#[derive(Debug, Clone)]
pub(crate) struct HandleParts {
    pub name: InstanceId,
    pub args: Vec<String>,
    pub data_dir: PathBuf,
    pub artifact_dir: PathBuf,
    pub client_ca_dir: Option<PathBuf>,
    pub ports: Vec<(PortRole, u16)>,
    pub kind: RunnerKind,
    pub lifecycle: CancellationToken,
}

#[derive(Debug)]
pub struct ServerHandle {
    name: InstanceId,
    args: Vec<String>,
    data_dir: PathBuf,
    artifact_dir: PathBuf,
    client_ca_dir: Option<PathBuf>,
    ports: Vec<(PortRole, u16)>,
    kind: RunnerKind,
    lifecycle: CancellationToken,
    state: Mutex<InstanceState>,
    done: Mutex<Option<DoneSignal>>,
    scope: TestScope,
    artifacts: ArtifactCollector,
}

impl ServerHandle {
    pub(crate) fn new(parts: HandleParts, scope: TestScope, artifacts: ArtifactCollector) -> Self {
        Self {
            name: parts.name,
            args: parts.args,
            data_dir: parts.data_dir,
            artifact_dir: parts.artifact_dir,
            client_ca_dir: parts.client_ca_dir,
            ports: parts.ports,
            kind: parts.kind,
            lifecycle: parts.lifecycle,
            state: Mutex::new(InstanceState::NotStarted),
            done: Mutex::new(None),
            scope,
            artifacts,
        }
    }

    pub fn name(&self) -> &InstanceId {
        &self.name
    }

    /// Full argument list passed to the server
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// This instance's private data directory
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// This instance's private artifact directory
    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    pub fn client_ca_dir(&self) -> Option<&Path> {
        self.client_ca_dir.as_deref()
    }

    /// Directory where the server keeps its own CA material
    pub fn ca_directory(&self) -> &Path {
        &self.data_dir
    }

    pub fn kubeconfig_path(&self) -> PathBuf {
        self.data_dir.join(CLIENT_CONFIG_FILE)
    }

    pub fn ports(&self) -> &[(PortRole, u16)] {
        &self.ports
    }

    pub fn port(&self, role: PortRole) -> Option<u16> {
        self.ports.iter().find(|(r, _)| *r == role).map(|(_, p)| *p)
    }

    pub fn kind(&self) -> RunnerKind {
        self.kind
    }

    pub fn state_kind(&self) -> StateKind {
        self.state.lock().kind()
    }

    /// True once shutdown was requested on the handle or through its lifecycle
    pub fn cancelled(&self) -> bool {
        matches!(*self.state.lock(), InstanceState::Cancelled(_)) || self.lifecycle.is_cancelled()
    }

    /// Token observed by this instance's supervisor
    pub fn lifecycle(&self) -> &CancellationToken {
        &self.lifecycle
    }

    /// Copy of the loaded client configuration
    pub fn raw_config(&self) -> FixtureResult<ClientConfig> {
        self.with_loaded("raw_config", |loaded| Ok(loaded.config.clone()))
    }

    /// Target for the `base` context, identified by the test's name
    pub fn base_config(&self) -> FixtureResult<ClientTarget> {
        self.context_target("base_config", BASE_CONTEXT)
    }

    /// Target for the root shard's `shard-base` context
    pub fn shard_base_config(&self) -> FixtureResult<ClientTarget> {
        self.context_target("shard_base_config", SHARD_BASE_CONTEXT)
    }

    fn context_target(&self, accessor: &'static str, context: &str) -> FixtureResult<ClientTarget> {
        let target = self.with_loaded(accessor, |loaded| Ok(loaded.config.target(context)?))?;
        Ok(target.with_user_agent(self.scope.name()))
    }

    fn with_loaded<T>(
        &self,
        accessor: &'static str,
        f: impl FnOnce(&LoadedConfig) -> FixtureResult<T>,
    ) -> FixtureResult<T> {
        let state = self.state.lock();
        match state.loaded() {
            Some(loaded) => f(loaded),
            None => Err(FixtureError::ConfigNotLoaded {
                instance: self.name.clone(),
                accessor,
                backtrace: Backtrace::force_capture().to_string(),
            }),
        }
    }

    /// NotStarted -> Launching
    pub(crate) fn begin_launch(&self) -> FixtureResult<()> {
        let mut state = self.state.lock();
        match *state {
            InstanceState::NotStarted => {
                *state = InstanceState::Launching;
                Ok(())
            }
            _ => Err(FixtureError::AlreadyLaunched {
                instance: self.name.clone(),
            }),
        }
    }

    pub(crate) fn attach_done(&self, done: DoneSignal) {
        *self.done.lock() = Some(done);
    }

    /// Launching -> Running; loses to a concurrent cancel
    pub(crate) fn mark_loaded(&self, loaded: LoadedConfig) -> FixtureResult<()> {
        let mut state = self.state.lock();
        match *state {
            InstanceState::Cancelled(_) => Err(FixtureError::ShutDownBeforeReady {
                instance: self.name.clone(),
            }),
            _ => {
                instance_debug!(self.name, "📥 Loaded client config from {}", loaded.path.display());
                *state = InstanceState::Running(loaded);
                Ok(())
            }
        }
    }

    /// Mark cancelled and signal the server; true on the first call only
    pub(crate) fn request_shutdown(&self) -> bool {
        let first = {
            let mut state = self.state.lock();
            let previous = std::mem::replace(&mut *state, InstanceState::NotStarted);
            match previous {
                InstanceState::Cancelled(loaded) => {
                    *state = InstanceState::Cancelled(loaded);
                    false
                }
                InstanceState::Running(loaded) => {
                    *state = InstanceState::Cancelled(Some(loaded));
                    true
                }
                InstanceState::NotStarted | InstanceState::Launching => {
                    *state = InstanceState::Cancelled(None);
                    true
                }
            }
        };
        if first {
            log_shutdown(&self.name, "cancel requested");
            self.lifecycle.cancel();
        }
        first
    }

    /// Wait until the server has fully stopped
    ///
    /// Returns at once if it was never launched.
    pub async fn wait_done(&self) {
        let done = self.done.lock().clone();
        if let Some(done) = done {
            let start = Instant::now();
            done.wait().await;
            instance_debug!(self.name, "🏁 Stopped after {:?}", start.elapsed());
        }
    }

    /// Ask the server to stop and wait for it; safe to call repeatedly
    pub async fn cancel(&self) {
        self.request_shutdown();
        self.wait_done().await;
    }

    pub(crate) fn mark_ready(&self) {
        log_success(&self.name, "Server is ready");
    }

    /// Snapshot a resource into this instance's artifact directory at test end
    pub fn artifact<R, F, Fut>(&self, producer: F)
    where
        R: Resource + Send,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        self.artifacts.register(&self.scope, self.artifact_dir.clone(), producer);
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        // A dropped handle must not leave its server running
        self.lifecycle.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn handle(name: &str) -> ServerHandle {
        let parts = HandleParts {
            name: InstanceId::new(name).unwrap(),
            args: vec!["--v=4".into()],
            data_dir: PathBuf::from("/data").join(name),
            artifact_dir: PathBuf::from("/artifacts").join(name),
            client_ca_dir: None,
            ports: vec![(PortRole::Secure, 6443), (PortRole::StoreClient, 2379)],
            kind: RunnerKind::External,
            lifecycle: CancellationToken::new(),
        };
        ServerHandle::new(parts, TestScope::new("handle-test"), ArtifactCollector::default())
    }

    fn loaded() -> LoadedConfig {
        LoadedConfig {
            config: ClientConfig::for_server("http://127.0.0.1:6443", "t"),
            path: PathBuf::from("/data/a/admin.kubeconfig"),
        }
    }

    #[test]
    fn test_paths_and_ports() {
        let h = handle("a");
        assert_eq!(h.kubeconfig_path(), PathBuf::from("/data/a/admin.kubeconfig"));
        assert_eq!(h.ca_directory(), Path::new("/data/a"));
        assert_eq!(h.port(PortRole::StoreClient), Some(2379));
        assert_eq!(h.port(PortRole::StorePeer), None);
    }

    #[test]
    fn test_config_accessors_fail_loudly_before_load() {
        let h = handle("a");
        h.begin_launch().unwrap();

        assert_matches!(
            h.raw_config(),
            Err(FixtureError::ConfigNotLoaded { accessor: "raw_config", ref backtrace, .. }) if !backtrace.is_empty()
        );
        assert_matches!(h.base_config(), Err(FixtureError::ConfigNotLoaded { .. }));
    }

    #[test]
    fn test_targets_carry_scope_name_as_user_agent() {
        let h = handle("a");
        h.begin_launch().unwrap();
        h.mark_loaded(loaded()).unwrap();

        let shard = h.shard_base_config().unwrap();
        assert_eq!(shard.server, "http://127.0.0.1:6443");
        assert_eq!(shard.user_agent.as_deref(), Some("handle-test"));
        assert_eq!(h.state_kind(), StateKind::Running);
    }

    #[test]
    fn test_launch_only_once() {
        let h = handle("a");
        h.begin_launch().unwrap();
        assert_matches!(h.begin_launch(), Err(FixtureError::AlreadyLaunched { .. }));
    }

    #[test]
    fn test_load_after_cancel_is_rejected() {
        let h = handle("a");
        h.begin_launch().unwrap();
        assert!(h.request_shutdown());

        assert_matches!(h.mark_loaded(loaded()), Err(FixtureError::ShutDownBeforeReady { .. }));
        assert_eq!(h.state_kind(), StateKind::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_twice_is_idempotent_and_keeps_config() {
        // Arrange
        let h = handle("a");
        h.begin_launch().unwrap();
        let (done, guard) = DoneSignal::pair();
        h.attach_done(done);
        h.mark_loaded(loaded()).unwrap();
        let lifecycle = h.lifecycle().clone();
        tokio::spawn(async move {
            lifecycle.cancelled().await;
            guard.complete();
        });

        // Act
        h.cancel().await;
        h.cancel().await;

        // Assert
        assert!(h.cancelled());
        assert!(!h.request_shutdown());
        assert!(h.raw_config().is_ok(), "config stays reachable after cancel");
    }
}
