//! Environment-driven launch mode and timing knobs

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::Config;

pub const BINARIES_DIR_ENV: &str = "FIXTURE_BINARIES_DIR";
pub const RUN_DEBUGGER_ENV: &str = "FIXTURE_RUN_DEBUGGER";
pub const NO_CARGO_RUN_ENV: &str = "FIXTURE_NO_CARGO_RUN";
pub const IN_PROCESS_ENV: &str = "FIXTURE_IN_PROCESS";
pub const LOG_TO_CONSOLE_ENV: &str = "FIXTURE_LOG_TO_CONSOLE";

/// Launch-mode switches read from the process environment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixtureEnv {
    pub binaries_dir: Option<PathBuf>,
    pub run_debugger: bool,
    pub no_cargo_run: bool,
    pub in_process: bool,
    pub log_to_console: bool,
}

impl FixtureEnv {
    pub fn from_env() -> Self {
        Self {
            binaries_dir: env::var_os(BINARIES_DIR_ENV)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            run_debugger: flag(RUN_DEBUGGER_ENV),
            no_cargo_run: flag(NO_CARGO_RUN_ENV),
            in_process: flag(IN_PROCESS_ENV),
            log_to_console: flag(LOG_TO_CONSOLE_ENV),
        }
    }
}

fn flag(name: &str) -> bool {
    env::var(name).map(|v| parse_flag(&v)).unwrap_or(false)
}

/// `1`, `true` and `yes` (any case) enable a flag
pub fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

/// Launch options resolved for one instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub run_in_process: bool,
    pub stream_logs: bool,
}

impl RunOptions {
    /// Either the environment or the config can turn a mode on
    pub fn resolve(env: &FixtureEnv, config: &Config) -> Self {
        Self {
            run_in_process: env.in_process || config.run_in_process(),
            stream_logs: env.log_to_console || config.log_to_console(),
        }
    }
}

/// Poll intervals and bounds used during bring-up, monitoring and teardown
#[derive(Debug, Clone)]
pub struct FixtureTimings {
    pub config_poll_interval: Duration,
    pub config_timeout: Duration,
    pub readiness_interval: Duration,
    pub monitor_interval: Duration,
    /// Shutdown waits longer than this are logged, never aborted
    pub slow_shutdown_warning: Duration,
    pub metrics_timeout: Duration,
}

impl Default for FixtureTimings {
    fn default() -> Self {
        Self {
            config_poll_interval: Duration::from_millis(100),
            config_timeout: Duration::from_secs(120),
            readiness_interval: Duration::from_millis(100),
            monitor_interval: Duration::from_secs(1),
            slow_shutdown_warning: Duration::from_secs(30),
            metrics_timeout: Duration::from_secs(30),
        }
    }
}

impl FixtureTimings {
    pub fn with_config_timeout(mut self, timeout: Duration) -> Self {
        self.config_timeout = timeout;
        self
    }

    pub fn with_config_poll_interval(mut self, interval: Duration) -> Self {
        self.config_poll_interval = interval;
        self
    }

    pub fn with_readiness_interval(mut self, interval: Duration) -> Self {
        self.readiness_interval = interval;
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    pub fn with_slow_shutdown_warning(mut self, threshold: Duration) -> Self {
        self.slow_shutdown_warning = threshold;
        self
    }

    pub fn with_metrics_timeout(mut self, timeout: Duration) -> Self {
        self.metrics_timeout = timeout;
        self
    }
}
