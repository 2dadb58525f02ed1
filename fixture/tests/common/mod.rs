//! Shared helpers for fixture integration tests
//!
//! `FakeServer` is a tiny in-process server honouring the launch flags: it
//! serves the health and metrics endpoints on `--secure-port` and writes its
//! client config to `--kubeconfig-path`.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use fixture::{FixtureEnv, FixtureTimings, InProcessEntry, InProcessServer};
use shared::ClientConfig;
use tokio_util::sync::CancellationToken;

pub struct TestFixtures;

impl TestFixtures {
    pub const TOKEN: &'static str = "test-token";

    /// Timings short enough for tests
    pub fn fast_timings() -> FixtureTimings {
        FixtureTimings::default()
            .with_config_poll_interval(Duration::from_millis(20))
            .with_config_timeout(Duration::from_secs(20))
            .with_readiness_interval(Duration::from_millis(20))
            .with_monitor_interval(Duration::from_millis(50))
            .with_metrics_timeout(Duration::from_secs(5))
    }

    /// Environment with every switch off
    pub fn quiet_env() -> FixtureEnv {
        FixtureEnv::default()
    }
}

/// Value of `--flag=value` or `--flag value`
pub fn flag_value(args: &[String], flag: &str) -> Option<String> {
    let prefix = format!("{flag}=");
    args.iter().enumerate().find_map(|(i, arg)| {
        if let Some(v) = arg.strip_prefix(&prefix) {
            Some(v.to_string())
        } else if arg == flag {
            args.get(i + 1).cloned()
        } else {
            None
        }
    })
}

/// Health server reachable over plain HTTP; /healthz fails `failures` times
pub async fn serve_health(
    listener: tokio::net::TcpListener,
    failures: usize,
    hits: Arc<AtomicUsize>,
    shutdown: CancellationToken,
) {
    let app = Router::new()
        .route(
            "/healthz",
            get(move || {
                let hits = hits.clone();
                async move {
                    if hits.fetch_add(1, Ordering::SeqCst) < failures {
                        StatusCode::SERVICE_UNAVAILABLE
                    } else {
                        StatusCode::OK
                    }
                }
            }),
        )
        .route("/livez", get(|| async { StatusCode::OK }))
        .route("/readyz", get(|| async { StatusCode::OK }))
        .route("/metrics", get(|| async { "fake_requests_total 1\n" }));
    let _ = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;
}

/// Health server whose /metrics always fails
pub async fn serve_broken_metrics(listener: tokio::net::TcpListener, shutdown: CancellationToken) {
    let app = Router::new()
        .route("/healthz", get(|| async { StatusCode::OK }))
        .route("/metrics", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }));
    let _ = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;
}

/// Write a client config pointing at `port`
pub fn write_client_config(path: &Path, port: u16) {
    ClientConfig::for_server(format!("http://127.0.0.1:{port}"), TestFixtures::TOKEN)
        .write_atomic(path)
        .unwrap();
}

/// In-process server used by orchestrator tests
#[derive(Default)]
pub struct FakeServer {
    pub healthz_failures: usize,
    /// Instances that never write their client config
    pub silent: HashSet<String>,
    pub healthz_hits: Arc<AtomicUsize>,
    pub seen_args: Arc<parking_lot::Mutex<Vec<Vec<String>>>>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_healthz_failures(mut self, failures: usize) -> Self {
        self.healthz_failures = failures;
        self
    }

    pub fn silent(mut self, instance: &str) -> Self {
        self.silent.insert(instance.to_string());
        self
    }
}

#[async_trait]
impl InProcessEntry for FakeServer {
    fn validate_args(&self, args: &[String]) -> anyhow::Result<()> {
        anyhow::ensure!(flag_value(args, "--secure-port").is_some(), "missing --secure-port");
        anyhow::ensure!(flag_value(args, "--kubeconfig-path").is_some(), "missing --kubeconfig-path");
        Ok(())
    }

    async fn run(&self, server: InProcessServer) -> anyhow::Result<()> {
        self.seen_args.lock().push(server.args.clone());

        let port: u16 = flag_value(&server.args, "--secure-port")
            .ok_or_else(|| anyhow::anyhow!("missing --secure-port"))?
            .parse()?;
        let kubeconfig = PathBuf::from(
            flag_value(&server.args, "--kubeconfig-path").ok_or_else(|| anyhow::anyhow!("missing --kubeconfig-path"))?,
        );

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
        if !self.silent.contains(server.instance.as_str()) {
            write_client_config(&kubeconfig, port);
        }

        serve_health(listener, self.healthz_failures, self.healthz_hits.clone(), server.shutdown.clone()).await;
        Ok(())
    }
}
