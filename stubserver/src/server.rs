//! Stub control-plane server
//!
//! Serves the health, readiness and metrics endpoints the fixture probes and
//! writes the admin client config once it is listening. The process-level
//! knobs live in `main.rs`; everything here also runs in-process.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::logging::{log_shutdown, log_startup, log_success};
use shared::{ClientConfig, InstanceId, instance_info, instance_warn};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::args::Args;
use crate::error::{StubServerError, StubServerResult};
use crate::store::Store;

/// Log line the fixture filters out of failure reports
pub const NOISY_LINE: &str = "grpc: addrConn.createTransport failed to connect to {127.0.0.1:0}; reconnecting";

/// Per-server state shared with the request handlers
#[derive(Debug)]
pub struct ServerState {
    pub instance: InstanceId,
    pub token: String,
    pub started_at: DateTime<Utc>,
    started: Instant,
    healthz_failures_left: AtomicU32,
    requests: AtomicU64,
    wal_size_bytes: u64,
    audit_log: Option<PathBuf>,
}

impl ServerState {
    fn new(instance: InstanceId, args: &Args) -> Self {
        Self {
            instance,
            token: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            started: Instant::now(),
            healthz_failures_left: AtomicU32::new(args.healthz_failures),
            requests: AtomicU64::new(0),
            wal_size_bytes: args.store_wal_size_bytes,
            audit_log: args.audit_log_path.clone(),
        }
    }

    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| token == self.token)
    }
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub instance: String,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub requests: u64,
}

pub struct StubServer {
    args: Args,
    state: Arc<ServerState>,
}

impl StubServer {
    pub fn new(instance: InstanceId, args: Args) -> Self {
        let state = Arc::new(ServerState::new(instance, &args));
        Self { args, state }
    }

    /// Instance name taken from the last component of the root directory
    pub fn from_args(args: Args) -> StubServerResult<Self> {
        let name = args
            .root_directory
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "stubserver".to_string());
        Ok(Self::new(InstanceId::new(name)?, args))
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    pub fn build_router(&self) -> Router {
        let state = self.state.clone();
        let api = Router::new().route("/status", get(status_handler));

        Router::new()
            .route("/healthz", get(healthz_handler))
            .route("/livez", get(ok_handler))
            .route("/readyz", get(ok_handler))
            .route("/metrics", get(metrics_handler))
            .merge(api.clone())
            .nest("/clusters/root", api)
            .layer(middleware::from_fn_with_state(state.clone(), audit))
            .with_state(state)
    }

    /// Serve until `shutdown` is cancelled, then flush the store.
    ///
    /// The store stays usable until `store_shutdown` is cancelled, which the
    /// caller does after this returns.
    pub async fn run(&self, shutdown: CancellationToken, store_shutdown: CancellationToken) -> StubServerResult<()> {
        let args = &self.args;
        let instance = &self.state.instance;
        log_startup(instance, &format!("stub server on port {}", args.secure_port));

        let root = &args.root_directory;
        tokio::fs::create_dir_all(root)
            .await
            .map_err(|e| StubServerError::file_system("create root directory", root, e))?;
        if let Some(audit) = &args.audit_log_path {
            if let Some(parent) = audit.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StubServerError::file_system("create audit directory", parent, e))?;
            }
        }
        if let Some(ca) = &args.client_ca_file {
            tokio::fs::metadata(ca).await.map_err(|source| StubServerError::ClientCa {
                path: ca.clone(),
                source,
            })?;
        }

        let store_ports: Vec<(&'static str, u16)> = [("store client", args.store_client_port), ("store peer", args.store_peer_port)]
            .into_iter()
            .filter_map(|(name, port)| port.map(|p| (name, p)))
            .collect();
        let store = Store::open(instance, root, &store_ports, args.store_wal_size_bytes, store_shutdown).await?;

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", args.secure_port))
            .await
            .map_err(|source| StubServerError::Bind {
                listener: "secure",
                port: args.secure_port,
                source,
            })?;

        if args.emit_noisy_line {
            instance_warn!(instance, "{}", NOISY_LINE);
        }

        if args.config_delay_ms > 0 {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    log_shutdown(instance, "cancelled before client config was written");
                    return Ok(());
                }
                _ = tokio::time::sleep(Duration::from_millis(args.config_delay_ms)) => {}
            }
        }
        self.write_client_config()?;
        log_success(instance, "client config written, serving");

        let stop = shutdown.child_token();
        let exit_timer = args.exit_after_ready_ms.map(|ms| {
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                stop.cancel();
            })
        });

        let served = axum::serve(listener, self.build_router())
            .with_graceful_shutdown(stop.clone().cancelled_owned())
            .await
            .map_err(StubServerError::Serve);
        if let Some(timer) = exit_timer {
            timer.abort();
        }
        served?;

        let induced = stop.is_cancelled() && !shutdown.is_cancelled();
        log_shutdown(instance, if induced { "exit requested" } else { "shutdown requested" });

        let marker = store.flush().await?;
        instance_info!(instance, "💾 Store flushed to {}", marker.display());

        if induced {
            return Err(StubServerError::InducedExit { code: args.exit_code });
        }
        Ok(())
    }

    fn write_client_config(&self) -> StubServerResult<()> {
        let path = self.args.kubeconfig_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StubServerError::file_system("create client config directory", parent, e))?;
        }
        let server = format!("http://127.0.0.1:{}", self.args.secure_port);
        ClientConfig::for_server(server, self.state.token.clone()).write_atomic(&path)?;
        Ok(())
    }
}

async fn audit(State(state): State<Arc<ServerState>>, request: Request, next: Next) -> Response {
    state.requests.fetch_add(1, Ordering::Relaxed);
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let response = next.run(request).await;

    if let Some(audit_log) = &state.audit_log {
        let line = format!(
            "{} {} {} {}\n",
            Utc::now().to_rfc3339(),
            method,
            path,
            response.status().as_u16()
        );
        let written = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(audit_log)
                .await?;
            file.write_all(line.as_bytes()).await
        }
        .await;
        if let Err(e) = written {
            instance_warn!(state.instance, "⚠️ Audit write to {} failed: {}", audit_log.display(), e);
        }
    }
    response
}

async fn healthz_handler(State(state): State<Arc<ServerState>>) -> StatusCode {
    let failing = state
        .healthz_failures_left
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok();
    if failing {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

async fn ok_handler() -> &'static str {
    "ok"
}

/// Prometheus text format; requires the admin token
async fn metrics_handler(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    if !state.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let body = format!(
        "# HELP stub_requests_total Requests served.\n\
         # TYPE stub_requests_total counter\n\
         stub_requests_total{{instance=\"{instance}\"}} {requests}\n\
         # HELP stub_uptime_seconds Seconds since start.\n\
         # TYPE stub_uptime_seconds gauge\n\
         stub_uptime_seconds{{instance=\"{instance}\"}} {uptime:.3}\n\
         # HELP stub_store_wal_size_bytes Configured WAL size.\n\
         # TYPE stub_store_wal_size_bytes gauge\n\
         stub_store_wal_size_bytes{{instance=\"{instance}\"}} {wal}\n",
        instance = state.instance,
        requests = state.request_count(),
        uptime = state.started.elapsed().as_secs_f64(),
        wal = state.wal_size_bytes,
    );
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response()
}

async fn status_handler(State(state): State<Arc<ServerState>>) -> Json<StatusReport> {
    Json(StatusReport {
        instance: state.instance.to_string(),
        started_at: state.started_at,
        uptime_seconds: state.started.elapsed().as_secs(),
        requests: state.request_count(),
    })
}
