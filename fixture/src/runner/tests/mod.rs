//! Runner tests
//!
//! External-process tests drive `/bin/sh` so they need no server binary.

#[cfg(all(test, unix))]
mod external_process;

#[cfg(test)]
pub mod common {
    use std::path::Path;
    use std::time::Duration;

    use shared::InstanceId;
    use tokio_util::sync::CancellationToken;

    use crate::runner::LaunchRequest;
    use crate::scope::TestScope;

    /// Upper bound for anything that should finish promptly
    pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn launch_request(name: &str, data_dir: &Path, args: &[&str], scope: &TestScope) -> LaunchRequest {
        LaunchRequest {
            instance: InstanceId::new(name).unwrap(),
            data_dir: data_dir.to_path_buf(),
            args: args.iter().map(|a| a.to_string()).collect(),
            lifecycle: CancellationToken::new(),
            scope: scope.clone(),
            stream_logs: false,
        }
    }

    /// Running and not yet a zombie waiting for a reaper
    #[cfg(unix)]
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
}
