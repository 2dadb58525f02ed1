//! Command-line surface of the stub server
//!
//! The first group of flags is what the fixture passes to every server. The
//! second group makes the stub misbehave on purpose for harness tests.

use std::path::PathBuf;

use clap::Parser;

use crate::error::{StubServerError, StubServerResult};

#[derive(Parser, Debug, Clone)]
#[command(name = "stubserver")]
#[command(about = "Minimal control-plane server for exercising the test fixture")]
pub struct Args {
    /// Directory for all server state
    #[arg(long)]
    pub root_directory: PathBuf,

    /// Port for the HTTP API
    #[arg(long)]
    pub secure_port: u16,

    /// Embedded store client port
    #[arg(long)]
    pub store_client_port: Option<u16>,

    /// Embedded store peer port
    #[arg(long)]
    pub store_peer_port: Option<u16>,

    /// Store write-ahead-log size in bytes
    #[arg(long, default_value_t = 0)]
    pub store_wal_size_bytes: u64,

    /// Where to write the admin client config; defaults under the root directory
    #[arg(long)]
    pub kubeconfig_path: Option<PathBuf>,

    /// Append one line per request here
    #[arg(long)]
    pub audit_log_path: Option<PathBuf>,

    /// Log verbosity
    #[arg(long, default_value_t = 2)]
    pub v: u8,

    /// CA bundle for client certificates
    #[arg(long)]
    pub client_ca_file: Option<PathBuf>,

    /// Delay before writing the client config
    #[arg(long, default_value_t = 0)]
    pub config_delay_ms: u64,

    /// Answer this many /healthz requests with 503 first
    #[arg(long, default_value_t = 0)]
    pub healthz_failures: u32,

    /// Abort the process before the client config is written
    #[arg(long)]
    pub abort_before_config: bool,

    /// Exit with `--exit-code` this long after becoming ready
    #[arg(long)]
    pub exit_after_ready_ms: Option<u64>,

    #[arg(long, default_value_t = 1)]
    pub exit_code: i32,

    /// Log a line the fixture treats as noise
    #[arg(long)]
    pub emit_noisy_line: bool,

    /// Start a long-running child process and record its pid
    #[arg(long)]
    pub spawn_child: bool,
}

impl Args {
    /// Parse a server argument list (without the program name)
    pub fn from_server_args(args: &[String]) -> StubServerResult<Self> {
        Args::try_parse_from(std::iter::once("stubserver".to_string()).chain(args.iter().cloned()))
            .map_err(|e| StubServerError::InvalidArguments(e.to_string()))
    }

    pub fn kubeconfig_path(&self) -> PathBuf {
        self.kubeconfig_path
            .clone()
            .unwrap_or_else(|| self.root_directory.join("admin.kubeconfig"))
    }

    /// Knobs that act on the whole OS process
    pub fn process_only_knobs(&self) -> Vec<&'static str> {
        let mut knobs = Vec::new();
        if self.abort_before_config {
            knobs.push("--abort-before-config");
        }
        if self.spawn_child {
            knobs.push("--spawn-child");
        }
        knobs
    }
}
