//! Helpers for driving the stub server through the fixture

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fixture::{Config, ExternalRunner, FixtureEnv, FixtureOrchestrator, FixtureTimings, TestScope};
use stubserver::StubServerEntry;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);

pub fn timings() -> FixtureTimings {
    FixtureTimings::default()
        .with_config_poll_interval(Duration::from_millis(20))
        .with_config_timeout(Duration::from_secs(20))
        .with_readiness_interval(Duration::from_millis(20))
        .with_monitor_interval(Duration::from_millis(100))
        .with_metrics_timeout(Duration::from_secs(5))
}

/// Orchestrator running the built `stubserver` binary for external instances
pub fn orchestrator(scope: &TestScope) -> FixtureOrchestrator {
    shared::logging::init_test_tracing();
    let runner = ExternalRunner::new("stubserver")
        .with_env(FixtureEnv::default())
        .with_binary(env!("CARGO_BIN_EXE_stubserver"));
    FixtureOrchestrator::new(scope.clone())
        .with_env(FixtureEnv::default())
        .with_timings(timings())
        .with_external(runner)
        .with_in_process(Arc::new(StubServerEntry))
}

pub fn config(name: &str, root: &Path, extra: &[&str]) -> Config {
    Config::builder(name)
        .scratch_dirs(root.join("artifacts"), root.join("data"))
        .args(extra.iter().map(|a| a.to_string()))
        .build()
        .unwrap()
}

/// Running and not yet a zombie waiting for a reaper
pub fn process_alive(pid: i32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if kill(Pid::from_raw(pid), None).is_err() {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => !stat.rsplit_once(')').is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
        Err(_) => true,
    }
}
