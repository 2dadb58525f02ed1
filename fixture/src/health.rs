//! Readiness probing, steady-state endpoint monitoring and metrics scraping
//!
//! Every check succeeds only on exactly HTTP 200.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::StatusCode;
use shared::{ClientTarget, InstanceId, instance_debug, instance_info};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{FixtureError, FixtureResult};
use crate::scope::TestScope;

pub const HEALTHZ: &str = "/healthz";
pub const LIVEZ: &str = "/livez";
pub const READYZ: &str = "/readyz";
pub const METRICS: &str = "/metrics";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client bound to one server endpoint
#[derive(Debug, Clone)]
pub struct HealthProber {
    instance: InstanceId,
    target: ClientTarget,
    client: reqwest::Client,
}

impl HealthProber {
    /// Build a client honoring the target's token, CA bundle and TLS flags
    pub async fn new(instance: &InstanceId, target: ClientTarget) -> FixtureResult<Self> {
        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);

        if let Some(user_agent) = &target.user_agent {
            builder = builder.user_agent(user_agent.as_str());
        }

        if let Some(token) = &target.token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| FixtureError::invalid_config(instance.as_str(), "token is not a valid header value"))?;
            value.set_sensitive(true);
            let mut headers = HeaderMap::new();
            headers.insert(AUTHORIZATION, value);
            builder = builder.default_headers(headers);
        }

        if let Some(ca) = &target.certificate_authority {
            let pem = tokio::fs::read(ca)
                .await
                .map_err(|e| FixtureError::file_system("read CA bundle", ca, e))?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|source| FixtureError::InvalidCertificate {
                path: ca.clone(),
                source,
            })?;
            builder = builder.add_root_certificate(cert);
        }

        if target.insecure_skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        Ok(Self {
            instance: instance.clone(),
            target,
            client: builder.build()?,
        })
    }

    pub fn target(&self) -> &ClientTarget {
        &self.target
    }

    /// Status code for one GET
    pub async fn probe(&self, path: &str) -> FixtureResult<StatusCode> {
        let response = self.client.get(self.target.url(path)).send().await?;
        Ok(response.status())
    }

    /// Poll `/healthz` until it answers 200
    ///
    /// Connection failures and other statuses are retried; only `ctx`
    /// bounds the wait.
    pub async fn wait_for_ready(&self, ctx: &CancellationToken, interval: Duration) -> FixtureResult<()> {
        instance_info!(self.instance, "⏳ Waiting for readiness of {}", self.target.server);
        let cancelled = || FixtureError::Cancelled {
            instance: self.instance.clone(),
        };
        loop {
            let probed = tokio::select! {
                _ = ctx.cancelled() => return Err(cancelled()),
                probed = self.probe(HEALTHZ) => probed,
            };
            match probed {
                Ok(StatusCode::OK) => return Ok(()),
                Ok(status) => instance_debug!(self.instance, "{} returned {}", HEALTHZ, status),
                Err(e) => instance_debug!(self.instance, "{} not reachable yet: {}", HEALTHZ, e),
            }
            tokio::select! {
                _ = ctx.cancelled() => return Err(cancelled()),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// GET `/metrics` and write the body to `<artifact_dir>/metrics-<label>.txt`
    pub async fn scrape_metrics(&self, artifact_dir: &Path, label: &str) -> FixtureResult<PathBuf> {
        let response = self.client.get(self.target.url(METRICS)).send().await?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(FixtureError::HealthCheckFailed {
                instance: self.instance.clone(),
                path: METRICS.to_string(),
                status: status.as_u16(),
            });
        }
        let body = response.text().await?;

        tokio::fs::create_dir_all(artifact_dir)
            .await
            .map_err(|e| FixtureError::file_system("create artifact directory", artifact_dir, e))?;
        let file = artifact_dir.join(format!("metrics-{label}.txt"));
        tokio::fs::write(&file, body)
            .await
            .map_err(|e| FixtureError::file_system("write metrics", &file, e))?;
        instance_debug!(self.instance, "📊 Wrote {}", file.display());
        Ok(file)
    }
}

/// Background checker for an externally launched server
pub struct EndpointMonitor;

impl EndpointMonitor {
    /// Probe each path every `interval` until `lifecycle` is cancelled
    ///
    /// Failures observed after cancellation are expected and ignored.
    pub fn spawn(
        prober: HealthProber,
        paths: &[&'static str],
        interval: Duration,
        lifecycle: CancellationToken,
        scope: TestScope,
    ) -> JoinHandle<()> {
        let paths = paths.to_vec();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = lifecycle.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                for path in &paths {
                    let failure = match prober.probe(path).await {
                        Ok(StatusCode::OK) => None,
                        Ok(status) => Some(
                            FixtureError::HealthCheckFailed {
                                instance: prober.instance.clone(),
                                path: path.to_string(),
                                status: status.as_u16(),
                            }
                            .to_string(),
                        ),
                        Err(e) => Some(format!("Health check {path} on {} failed: {e}", prober.instance)),
                    };
                    if let Some(message) = failure {
                        if lifecycle.is_cancelled() {
                            return;
                        }
                        scope.report_error(message);
                    }
                }
            }
            instance_debug!(prober.instance, "🩺 Endpoint monitor stopped");
        })
    }
}
