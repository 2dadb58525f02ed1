//! Stub server binary
//!
//! Runs [`StubServer`] as its own process. SIGTERM or Ctrl+C starts a
//! graceful shutdown; the store is closed after the HTTP server has stopped.

use clap::Parser;
use shared::logging::{Component, init_tracing, log_error, log_shutdown, verbosity_to_level};
use tokio_util::sync::CancellationToken;

use stubserver::{Args, StubServer, StubServerError};

const CHILD_PID_FILE: &str = "child.pid";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(Component::StubServer, Some(verbosity_to_level(args.v)));

    let server = StubServer::from_args(args.clone())?;
    let instance = server.state().instance.clone();

    if args.abort_before_config {
        tracing::error!("💥 Aborting before writing the client config");
        std::process::abort();
    }

    if args.spawn_child {
        std::fs::create_dir_all(&args.root_directory)?;
        let child = tokio::process::Command::new("sleep").arg("300").spawn()?;
        let pid = child.id().unwrap_or_default();
        std::fs::write(args.root_directory.join(CHILD_PID_FILE), pid.to_string())?;
        tracing::info!("👶 Spawned child process {}", pid);
    }

    let shutdown = CancellationToken::new();
    let store_shutdown = CancellationToken::new();

    let signal_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            shutdown.cancel();
        })
    };

    let result = server.run(shutdown, store_shutdown.clone()).await;
    store_shutdown.cancel();
    signal_task.abort();

    match result {
        Ok(()) => {
            log_shutdown(&instance, "stopped");
            Ok(())
        }
        Err(StubServerError::InducedExit { code }) => {
            log_shutdown(&instance, &format!("exiting with code {code}"));
            std::process::exit(code);
        }
        Err(e) => {
            log_error(&instance, "Stub server", &e);
            Err(e.into())
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = term.recv() => tracing::info!("📡 Received SIGTERM"),
                _ = tokio::signal::ctrl_c() => tracing::info!("📡 Received Ctrl+C"),
            }
        }
        Err(e) => {
            tracing::warn!("⚠️ Cannot install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
