//! Fixture CLI
//!
//! Starts a set of servers the same way tests do, prints where to reach
//! them and keeps them running until Ctrl+C:
//! - one instance per `--instance`
//! - scratch directories default to a fresh temp directory
//! - teardown (metrics, SIGTERM, wait) runs on exit

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use shared::logging::{Component, init_tracing};
use uuid::Uuid;

use fixture::{Config, ExternalRunner, FixtureOrchestrator, FixtureTimings, TestScope};

#[derive(Parser, Debug)]
#[command(name = "fixture")]
#[command(about = "Run control-plane servers as a local test fixture")]
struct Args {
    /// Instance names to start
    #[arg(long = "instance", default_value = "main")]
    instances: Vec<String>,

    /// Directory for artifacts (audit logs, metrics, snapshots)
    #[arg(long)]
    artifact_dir: Option<PathBuf>,

    /// Directory for server state
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Server executable to run instead of the resolved default
    #[arg(long)]
    binary: Option<PathBuf>,

    /// Extra argument passed to every server (repeatable)
    #[arg(long = "server-arg", allow_hyphen_values = true)]
    server_args: Vec<String>,

    /// Seconds to wait for each server's client config
    #[arg(long, default_value = "120")]
    config_timeout_secs: u64,

    /// Mirror server output to the console
    #[arg(long)]
    log_to_console: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    init_tracing(Component::Fixture, Some(&args.log_level));

    let scratch = std::env::temp_dir().join(format!("fixture-{}", Uuid::new_v4()));
    let artifact_dir = args.artifact_dir.clone().unwrap_or_else(|| scratch.join("artifacts"));
    let data_dir = args.data_dir.clone().unwrap_or_else(|| scratch.join("data"));

    tracing::info!("🧪 Starting fixture with {} instance(s)", args.instances.len());
    tracing::info!("📁 Artifacts: {}", artifact_dir.display());
    tracing::info!("📁 Data: {}", data_dir.display());

    let configs = args
        .instances
        .iter()
        .map(|name| {
            Config::builder(name.as_str())
                .scratch_dirs(&artifact_dir, &data_dir)
                .args(args.server_args.iter().cloned())
                .log_to_console(args.log_to_console)
                .build()
        })
        .collect::<Result<Vec<_>, _>>()?;

    let scope = TestScope::new("fixture-cli");
    let mut orchestrator = FixtureOrchestrator::new(scope.clone())
        .with_timings(FixtureTimings::default().with_config_timeout(Duration::from_secs(args.config_timeout_secs)));
    if let Some(binary) = &args.binary {
        orchestrator = orchestrator.with_external(ExternalRunner::default().with_binary(binary));
    }

    let fixture = match orchestrator.start(configs).await {
        Ok(fixture) => fixture,
        Err(e) => {
            tracing::error!("❌ Fixture failed to start: {}", e);
            scope.finish().await.ok();
            return Err(e.into());
        }
    };

    let mut names: Vec<_> = fixture.keys().collect();
    names.sort();
    for name in names {
        let handle = &fixture[name];
        tracing::info!(
            "✅ {} ready, client config at {}",
            name,
            handle.kubeconfig_path().display()
        );
    }

    tracing::info!("Press Ctrl+C to stop all servers");
    tokio::signal::ctrl_c().await?;

    tracing::info!("🛑 Tearing down fixture");
    drop(fixture);
    scope.finish().await?;

    tracing::info!("🏁 Fixture stopped");
    Ok(())
}
