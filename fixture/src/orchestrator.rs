//! Fixture orchestration
//!
//! [`FixtureOrchestrator::start`] turns a list of [`Config`]s into a running
//! [`Fixture`]:
//! - allocate each instance's ports and build its argument list
//! - launch every instance through its strategy
//! - wait, fail-fast, until every instance loaded its config and passed a
//!   health probe
//! - register teardown on the test scope
//!
//! Any failure unwinds all launched instances before `start` returns.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::pin::pin;
use std::sync::{Arc, Weak};
use std::time::Instant;

use shared::{InstanceId, instance_info, instance_warn};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::artifacts::{ArtifactCollector, Scheme};
use crate::config::Config;
use crate::error::{FixtureError, FixtureResult};
use crate::health::{EndpointMonitor, HealthProber, LIVEZ, READYZ};
use crate::loader::ConfigLoader;
use crate::options::{FixtureEnv, FixtureTimings, RunOptions};
use crate::ports::PortAllocator;
use crate::runner::{
    ExternalRunner, InProcessEntry, InProcessRunner, LaunchRequest, PortRole, RunnerKind, ServerRunner,
};
use crate::scope::TestScope;
use crate::server::{CLIENT_CA_FILE, CLIENT_CONFIG_FILE, HandleParts, ServerHandle};

/// Running instances keyed by name
pub type Fixture = HashMap<InstanceId, Arc<ServerHandle>>;

/// Store write-ahead-log size handed to every server, in bytes
pub const STORE_WAL_SIZE_BYTES: u64 = 5 * 1000;

/// Verbosity handed to every server
pub const SERVER_VERBOSITY: u8 = 4;

pub const AUDIT_LOG_FILE: &str = "audit.log";

pub struct FixtureOrchestrator {
    scope: TestScope,
    external: Option<Arc<dyn ServerRunner>>,
    in_process: Option<Arc<dyn ServerRunner>>,
    env: FixtureEnv,
    timings: FixtureTimings,
    ports: PortAllocator,
    artifacts: ArtifactCollector,
}

struct Planned {
    config: Config,
    runner: Arc<dyn ServerRunner>,
    options: RunOptions,
}

impl FixtureOrchestrator {
    /// Orchestrator using the default external runner and no in-process entry
    pub fn new(scope: TestScope) -> Self {
        let env = FixtureEnv::from_env();
        Self {
            scope,
            external: Some(Arc::new(ExternalRunner::default().with_env(env.clone()))),
            in_process: None,
            env,
            timings: FixtureTimings::default(),
            ports: PortAllocator::new(),
            artifacts: ArtifactCollector::default(),
        }
    }

    pub fn with_external<R: ServerRunner + 'static>(mut self, runner: R) -> Self {
        self.external = Some(Arc::new(runner));
        self
    }

    /// Serve in-process instances through this entry point
    pub fn with_in_process(mut self, entry: Arc<dyn InProcessEntry>) -> Self {
        self.in_process = Some(Arc::new(InProcessRunner::new(entry)));
        self
    }

    pub fn with_in_process_runner<R: ServerRunner + 'static>(mut self, runner: R) -> Self {
        self.in_process = Some(Arc::new(runner));
        self
    }

    /// Environment switches; defaults to the process environment
    pub fn with_env(mut self, env: FixtureEnv) -> Self {
        self.env = env;
        self
    }

    pub fn with_timings(mut self, timings: FixtureTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn with_schemes(mut self, primary: Scheme, secondary: Scheme) -> Self {
        self.artifacts = ArtifactCollector::new(primary, secondary);
        self
    }

    pub fn scope(&self) -> &TestScope {
        &self.scope
    }

    /// Start every configured instance and wait until all are ready
    pub async fn start(&self, configs: Vec<Config>) -> FixtureResult<Fixture> {
        self.start_with(&CancellationToken::new(), configs).await
    }

    /// Like [`start`](Self::start), bounded by `ctx`
    pub async fn start_with(&self, ctx: &CancellationToken, configs: Vec<Config>) -> FixtureResult<Fixture> {
        let started = Instant::now();
        let failures_before = self.scope.failure_count();
        let planned = self.plan(configs)?;

        info!("🚀 Starting {} server(s)...", planned.len());
        let handles = self.launch_all(ctx, planned).await?;

        let group = ctx.child_token();
        let probers = match self.wait_until_ready(&group, &handles).await {
            Ok(probers) => probers,
            Err(e) => {
                shutdown_all(&handles, &self.timings).await;
                return Err(e);
            }
        };

        for (handle, prober) in handles.iter().zip(&probers) {
            self.snapshot_metrics(handle, prober, "startup").await;
        }

        let failures = self.scope.failures();
        if failures.len() > failures_before {
            shutdown_all(&handles, &self.timings).await;
            return Err(FixtureError::StartupFailed {
                failures: failures[failures_before..].to_vec(),
            });
        }

        for (handle, prober) in handles.iter().zip(&probers) {
            if handle.kind() == RunnerKind::External {
                EndpointMonitor::spawn(
                    prober.clone(),
                    &[LIVEZ, READYZ],
                    self.timings.monitor_interval,
                    handle.lifecycle().clone(),
                    self.scope.clone(),
                );
            }
        }

        self.register_teardown(handles.clone(), probers);
        info!("✅ Started {} server(s) after {:?}", handles.len(), started.elapsed());

        Ok(handles.into_iter().map(|h| (h.name().clone(), h)).collect())
    }

    /// Validate configs and pick a strategy for each
    fn plan(&self, configs: Vec<Config>) -> FixtureResult<Vec<Planned>> {
        let mut seen = HashSet::new();
        let mut planned = Vec::with_capacity(configs.len());
        for config in configs {
            let name = config.name().clone();
            if config.artifact_dir().as_os_str().is_empty() {
                return Err(FixtureError::invalid_config(name.as_str(), "artifact directory is required"));
            }
            if config.data_dir().as_os_str().is_empty() {
                return Err(FixtureError::invalid_config(name.as_str(), "data directory is required"));
            }
            if !seen.insert(name.clone()) {
                return Err(FixtureError::DuplicateInstance { instance: name });
            }

            let options = RunOptions::resolve(&self.env, &config);
            let runner = if options.run_in_process {
                self.in_process
                    .clone()
                    .ok_or(FixtureError::InProcessUnavailable { instance: name })?
            } else {
                self.external
                    .clone()
                    .ok_or(FixtureError::ExternalUnavailable { instance: name })?
            };
            planned.push(Planned {
                config,
                runner,
                options,
            });
        }
        Ok(planned)
    }

    /// Launch instances one by one; on failure stop the ones already running
    async fn launch_all(
        &self,
        ctx: &CancellationToken,
        planned: Vec<Planned>,
    ) -> FixtureResult<Vec<Arc<ServerHandle>>> {
        let mut handles: Vec<Arc<ServerHandle>> = Vec::with_capacity(planned.len());
        for plan in planned {
            let name = plan.config.name().clone();
            match self.launch_one(ctx, plan, &mut handles).await {
                Ok(()) => {}
                Err(e) => {
                    shutdown_all(&handles, &self.timings).await;
                    return Err(e.for_instance(&name));
                }
            }
        }
        Ok(handles)
    }

    async fn launch_one(
        &self,
        ctx: &CancellationToken,
        plan: Planned,
        handles: &mut Vec<Arc<ServerHandle>>,
    ) -> FixtureResult<()> {
        let Planned {
            config,
            runner,
            options,
        } = plan;
        let name = config.name().clone();

        let roles = runner.port_roles();
        let ports: Vec<(PortRole, u16)> = roles
            .iter()
            .copied()
            .zip(self.ports.allocate_many(roles.len())?)
            .collect();

        let data_dir = config.data_dir().join(name.as_str());
        let artifact_dir = config.artifact_dir().join(name.as_str());
        tokio::fs::create_dir_all(&artifact_dir)
            .await
            .map_err(|e| FixtureError::file_system("create artifact directory", &artifact_dir, e))?;

        let args = server_args(&data_dir, &artifact_dir, &ports, config.client_ca_dir(), config.args());
        let lifecycle = match (runner.kind(), config.in_process_context()) {
            (RunnerKind::InProcess, Some(parent)) => parent.child_token(),
            _ => ctx.child_token(),
        };

        let handle = Arc::new(ServerHandle::new(
            HandleParts {
                name: name.clone(),
                args: args.clone(),
                data_dir: data_dir.clone(),
                artifact_dir,
                client_ca_dir: config.client_ca_dir().map(Path::to_path_buf),
                ports,
                kind: runner.kind(),
                lifecycle: lifecycle.clone(),
            },
            self.scope.clone(),
            self.artifacts.clone(),
        ));
        handle.begin_launch()?;
        tokio::spawn(follow_top_level(ctx.clone(), Arc::downgrade(&handle)));
        // Tracked before launching so a failed launch is unwound too
        handles.push(handle.clone());

        let done = runner
            .launch(LaunchRequest {
                instance: name,
                data_dir,
                args,
                lifecycle,
                scope: self.scope.clone(),
                stream_logs: options.stream_logs,
            })
            .await?;
        handle.attach_done(done);
        Ok(())
    }

    /// Fail-fast readiness group; returns one prober per handle, in order
    async fn wait_until_ready(
        &self,
        group: &CancellationToken,
        handles: &[Arc<ServerHandle>],
    ) -> FixtureResult<Vec<HealthProber>> {
        let loader = ConfigLoader::from_timings(&self.timings);
        let interval = self.timings.readiness_interval;

        let mut set = JoinSet::new();
        for (index, handle) in handles.iter().enumerate() {
            let handle = handle.clone();
            let group = group.clone();
            set.spawn(async move {
                let ready = async {
                    loader.load(&group, &handle).await?;
                    let target = handle.shard_base_config()?;
                    let prober = HealthProber::new(handle.name(), target).await?;
                    prober.wait_for_ready(&group, interval).await?;
                    handle.mark_ready();
                    Ok::<_, FixtureError>(prober)
                };
                ready
                    .await
                    .map(|prober| (index, prober))
                    .map_err(|e| e.for_instance(handle.name()))
            });
        }

        let mut probers: Vec<Option<HealthProber>> = vec![None; handles.len()];
        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            let outcome = joined.map_err(FixtureError::from).and_then(|r| r);
            match outcome {
                Ok((index, prober)) => probers[index] = Some(prober),
                Err(e) => {
                    if first_error.is_none() {
                        warn!("❌ Readiness failed, cancelling the remaining servers: {}", e);
                        group.cancel();
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        probers
            .into_iter()
            .zip(handles)
            .map(|(prober, handle)| {
                prober.ok_or_else(|| FixtureError::Cancelled {
                    instance: handle.name().clone(),
                })
            })
            .collect()
    }

    async fn snapshot_metrics(&self, handle: &ServerHandle, prober: &HealthProber, label: &str) {
        scrape_with_timeout(handle, prober, label, &self.timings, &self.scope).await
    }

    /// Teardown: metrics from each live instance, then stop everything
    fn register_teardown(&self, handles: Vec<Arc<ServerHandle>>, probers: Vec<HealthProber>) {
        let scope = self.scope.clone();
        let timings = self.timings.clone();
        self.scope.on_cleanup(move || async move {
            info!("🛑 Stopping {} server(s)...", handles.len());
            for (handle, prober) in handles.iter().zip(&probers) {
                if !handle.cancelled() {
                    scrape_with_timeout(handle, prober, "teardown", &timings, &scope).await;
                }
            }
            shutdown_all(&handles, &timings).await;
        });
    }
}

async fn scrape_with_timeout(
    handle: &ServerHandle,
    prober: &HealthProber,
    label: &str,
    timings: &FixtureTimings,
    scope: &TestScope,
) {
    let scrape = prober.scrape_metrics(handle.artifact_dir(), label);
    match tokio::time::timeout(timings.metrics_timeout, scrape).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => scope.report_error(format!("gathering {label} metrics from {} failed: {e}", handle.name())),
        Err(_) => scope.report_error(format!(
            "gathering {label} metrics from {} timed out after {:?}",
            handle.name(),
            timings.metrics_timeout
        )),
    }
}

/// Turn a top-level cancel into a shutdown request for one instance
///
/// Ends on its own once the instance's lifecycle is cancelled.
async fn follow_top_level(ctx: CancellationToken, handle: Weak<ServerHandle>) {
    let Some(lifecycle) = handle.upgrade().map(|h| h.lifecycle().clone()) else {
        return;
    };
    tokio::select! {
        biased;
        _ = ctx.cancelled() => {
            if let Some(handle) = handle.upgrade() {
                handle.request_shutdown();
            }
        }
        _ = lifecycle.cancelled() => {}
    }
}

/// Signal every handle at once, then wait for each in turn
///
/// Waits are unbounded; slow ones are logged.
pub(crate) async fn shutdown_all(handles: &[Arc<ServerHandle>], timings: &FixtureTimings) {
    for handle in handles {
        handle.request_shutdown();
    }
    for handle in handles {
        let mut wait = pin!(handle.wait_done());
        if tokio::time::timeout(timings.slow_shutdown_warning, &mut wait).await.is_err() {
            instance_warn!(
                handle.name(),
                "🐢 Still waiting for shutdown after {:?}",
                timings.slow_shutdown_warning
            );
            wait.await;
        }
        instance_info!(handle.name(), "🏁 Server stopped");
    }
}

/// Argument list for one server: generated flags first, caller's extras last
pub fn server_args(
    data_dir: &Path,
    artifact_dir: &Path,
    ports: &[(PortRole, u16)],
    client_ca_dir: Option<&Path>,
    extra: &[String],
) -> Vec<String> {
    let mut args = vec!["--root-directory".to_string(), data_dir.display().to_string()];
    args.extend(ports.iter().map(|(role, port)| format!("{}={}", role.flag(), port)));
    args.push(format!("--store-wal-size-bytes={STORE_WAL_SIZE_BYTES}"));
    args.push(format!("--kubeconfig-path={}", data_dir.join(CLIENT_CONFIG_FILE).display()));
    args.push("--audit-log-path".to_string());
    args.push(artifact_dir.join(AUDIT_LOG_FILE).display().to_string());
    args.push(format!("--v={SERVER_VERBOSITY}"));
    if let Some(dir) = client_ca_dir {
        args.push(format!("--client-ca-file={}", dir.join(CLIENT_CA_FILE).display()));
    }
    args.extend(extra.iter().cloned());
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_server_args_layout() {
        let args = server_args(
            Path::new("/data/a"),
            Path::new("/art/a"),
            &[(PortRole::Secure, 1), (PortRole::StoreClient, 2), (PortRole::StorePeer, 3)],
            Some(Path::new("/ca")),
            &["--feature=x".to_string()],
        );

        assert_eq!(
            args,
            [
                "--root-directory",
                "/data/a",
                "--secure-port=1",
                "--store-client-port=2",
                "--store-peer-port=3",
                "--store-wal-size-bytes=5000",
                "--kubeconfig-path=/data/a/admin.kubeconfig",
                "--audit-log-path",
                "/art/a/audit.log",
                "--v=4",
                "--client-ca-file=/ca/client-ca.crt",
                "--feature=x",
            ]
        );
    }

    #[test]
    fn test_server_args_only_declared_ports() {
        let args = server_args(
            &PathBuf::from("/d"),
            &PathBuf::from("/a"),
            &[(PortRole::Secure, 7)],
            None,
            &[],
        );
        assert!(args.contains(&"--secure-port=7".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--store-client-port")));
        assert!(!args.iter().any(|a| a.starts_with("--client-ca-file")));
    }
}
