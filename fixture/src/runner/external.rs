//! External-process launch strategy
//!
//! The server runs as a child process in its own process group, so the
//! termination signal reaches the server even when it was started through a
//! `cargo run` or debugger wrapper. Shutdown is always SIGTERM to the group
//! followed by an unbounded wait for the natural exit.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use shared::{InstanceId, instance_debug, instance_error, instance_info, instance_warn};
use tokio::process::{Child, Command};

use crate::error::{FixtureError, FixtureResult};
use crate::log_filter::filter_logs;
use crate::options::{BINARIES_DIR_ENV, FixtureEnv};

use super::output::{OutputCapture, configure_child_stdio};
use super::{DEFAULT_PORT_ROLES, DoneGuard, DoneSignal, LaunchRequest, PortRole, RunnerKind, ServerRunner};

/// Default server executable name
pub const DEFAULT_SERVER_BINARY: &str = "stubserver";

/// Persisted log file, relative to the data directory
pub const SERVER_LOG_FILE: &str = "server.log";

/// How long to keep draining output pipes after the child exited
const OUTPUT_GRACE: Duration = Duration::from_secs(5);

/// Resolved program plus the arguments that precede the server's own
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCommand {
    pub program: PathBuf,
    pub prefix_args: Vec<String>,
}

impl ServerCommand {
    fn direct(program: PathBuf) -> Self {
        Self {
            program,
            prefix_args: Vec::new(),
        }
    }

    /// Full command line for logging
    pub fn display_with(&self, args: &[String]) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.prefix_args.iter().cloned())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// A bare program name is looked up on `PATH`
    pub fn is_bare_name(&self) -> bool {
        self.program.components().count() == 1 && !self.program.is_absolute()
    }
}

/// Launches the server binary as a separate OS process
#[derive(Debug, Clone)]
pub struct ExternalRunner {
    binary_name: String,
    binary_override: Option<PathBuf>,
    repo_root: Option<PathBuf>,
    working_dir: Option<PathBuf>,
    env: FixtureEnv,
    port_roles: &'static [PortRole],
}

impl Default for ExternalRunner {
    fn default() -> Self {
        Self::new(DEFAULT_SERVER_BINARY)
    }
}

impl ExternalRunner {
    /// Runner for the named binary, with launch mode taken from the environment
    pub fn new(binary_name: impl Into<String>) -> Self {
        Self {
            binary_name: binary_name.into(),
            binary_override: None,
            repo_root: default_repo_root(),
            working_dir: None,
            env: FixtureEnv::from_env(),
            port_roles: DEFAULT_PORT_ROLES,
        }
    }

    /// Run this exact executable, bypassing every other resolution rule
    pub fn with_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.binary_override = Some(path.into());
        self
    }

    pub fn with_env(mut self, env: FixtureEnv) -> Self {
        self.env = env;
        self
    }

    pub fn with_repo_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.repo_root = Some(root.into());
        self
    }

    /// Directory used to decide whether we run inside the repository
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_port_roles(mut self, roles: &'static [PortRole]) -> Self {
        self.port_roles = roles;
        self
    }

    fn in_repo(&self) -> bool {
        let Some(repo) = &self.repo_root else {
            return false;
        };
        let cwd = match &self.working_dir {
            Some(dir) => dir.clone(),
            None => match std::env::current_dir() {
                Ok(dir) => dir,
                Err(_) => return false,
            },
        };
        cwd.starts_with(repo)
    }

    /// Resolve how to start the server for one instance
    ///
    /// Precedence: explicit binary, the debugger wrapper, the binaries
    /// directory from the environment, then the repository build output,
    /// then a bare name on `PATH`. Inside the repository, without a binaries
    /// directory and unless disabled, the server is started through
    /// `cargo run` so tests always exercise the current sources.
    pub fn resolve_command(&self, data_dir: &Path) -> ServerCommand {
        if let Some(binary) = &self.binary_override {
            return self.maybe_debug(binary.clone(), data_dir);
        }

        let in_repo = self.in_repo();
        let binary = match (&self.env.binaries_dir, &self.repo_root) {
            (Some(dir), _) => dir.join(&self.binary_name),
            (None, Some(repo)) if in_repo => repo.join("target").join("debug").join(&self.binary_name),
            _ => PathBuf::from(&self.binary_name),
        };

        if self.env.run_debugger {
            return self.maybe_debug(binary, data_dir);
        }

        match &self.repo_root {
            Some(repo) if in_repo && !self.env.no_cargo_run && self.env.binaries_dir.is_none() => ServerCommand {
                program: PathBuf::from("cargo"),
                prefix_args: vec![
                    "run".to_string(),
                    "--quiet".to_string(),
                    "--manifest-path".to_string(),
                    repo.join("Cargo.toml").display().to_string(),
                    "--bin".to_string(),
                    self.binary_name.clone(),
                    "--".to_string(),
                ],
            },
            _ => ServerCommand::direct(binary),
        }
    }

    fn maybe_debug(&self, binary: PathBuf, data_dir: &Path) -> ServerCommand {
        if !self.env.run_debugger {
            return ServerCommand::direct(binary);
        }
        let gdb_log = data_dir.join("gdb.log");
        ServerCommand {
            program: PathBuf::from("rust-gdb"),
            prefix_args: vec![
                "--batch".to_string(),
                "-ex".to_string(),
                format!("set logging file {}", gdb_log.display()),
                "-ex".to_string(),
                "set logging enabled on".to_string(),
                "-ex".to_string(),
                "run".to_string(),
                "-ex".to_string(),
                "bt".to_string(),
                "--args".to_string(),
                binary.display().to_string(),
            ],
        }
    }
}

/// Workspace root this crate was built from
fn default_repo_root() -> Option<PathBuf> {
    Path::new(env!("CARGO_MANIFEST_DIR")).parent().map(Path::to_path_buf)
}

#[async_trait]
impl ServerRunner for ExternalRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::External
    }

    fn port_roles(&self) -> &'static [PortRole] {
        self.port_roles
    }

    async fn launch(&self, request: LaunchRequest) -> FixtureResult<DoneSignal> {
        ensure_group_shutdown(&request.instance)?;
        tokio::fs::create_dir_all(&request.data_dir)
            .await
            .map_err(|e| FixtureError::file_system("create data directory", &request.data_dir, e))?;

        let command = self.resolve_command(&request.data_dir);
        let command_line = command.display_with(&request.args);
        instance_info!(request.instance, "🚀 Running: {}", command_line);

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.prefix_args).args(&request.args);
        #[cfg(unix)]
        cmd.process_group(0);
        configure_child_stdio(&mut cmd);

        let mut child = cmd.spawn().map_err(|source| {
            if command.is_bare_name() && self.env.binaries_dir.is_none() {
                instance_warn!(
                    request.instance,
                    "💡 Consider setting {} to a directory containing the {} binary",
                    BINARIES_DIR_ENV,
                    self.binary_name
                );
            }
            FixtureError::LaunchFailed {
                instance: request.instance.clone(),
                command: command_line.clone(),
                source,
            }
        })?;

        let log_path = request.data_dir.join(SERVER_LOG_FILE);
        let capture = match OutputCapture::start(&mut child, &request.instance, &log_path, request.stream_logs).await {
            Ok(capture) => capture,
            Err(e) => {
                // Not supervised yet; stop it the same way teardown would
                terminate_group(&mut child, &request.instance);
                let _ = child.wait().await;
                return Err(e);
            }
        };

        let (signal, guard) = DoneSignal::pair();
        tokio::spawn(supervise(child, capture, request, guard));
        Ok(signal)
    }
}

/// Wait for the child to exit, terminating it when the lifecycle is cancelled
async fn supervise(mut child: Child, capture: OutputCapture, request: LaunchRequest, guard: DoneGuard) {
    let LaunchRequest {
        instance,
        lifecycle,
        scope,
        ..
    } = request;

    let status = tokio::select! {
        status = child.wait() => status,
        _ = lifecycle.cancelled() => {
            instance_debug!(instance, "📤 Sending SIGTERM to process group");
            terminate_group(&mut child, &instance);
            child.wait().await
        }
    };
    let cancelled = lifecycle.is_cancelled();
    let logs = capture.finish(OUTPUT_GRACE).await;

    match status {
        Ok(status) if status.success() => {
            instance_info!(instance, "🏁 Server exited cleanly");
        }
        Ok(status) if cancelled => {
            instance_debug!(instance, "🏁 Server exited after shutdown request: {}", status);
        }
        Ok(status) => {
            let err = FixtureError::UnexpectedExit {
                instance: instance.clone(),
                status: status.to_string(),
                logs: filter_logs(&logs),
            };
            scope.report_error(err.to_string());
        }
        Err(e) if cancelled => {
            instance_debug!(instance, "Wait failed after shutdown request: {}", e);
        }
        Err(e) => {
            instance_error!(instance, "❌ Failed to wait for server: {}", e);
            scope.report_error(format!("`{instance}` failed: could not wait for exit: {e}"));
        }
    }

    guard.complete();
}

#[cfg(unix)]
fn terminate_group(child: &mut Child, instance: &InstanceId) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        // Already reaped
        return;
    };
    match killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => {}
        Err(nix::errno::Errno::ESRCH) => {
            instance_debug!(instance, "Process group {} already gone", pid);
        }
        Err(e) => {
            instance_error!(instance, "❌ Failed to signal process group {}: {}", pid, e);
        }
    }
}

#[cfg(not(unix))]
fn terminate_group(_child: &mut Child, instance: &InstanceId) {
    instance_warn!(instance, "⚠️ Graceful termination unsupported on this platform");
}

/// Servers are only ever stopped with a group SIGTERM, never killed
pub(crate) fn ensure_group_shutdown(instance: &InstanceId) -> FixtureResult<()> {
    if cfg!(unix) {
        Ok(())
    } else {
        Err(FixtureError::ExternalUnsupported {
            instance: instance.clone(),
        })
    }
}
