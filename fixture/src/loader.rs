//! Polls for the client configuration a starting server writes

use std::path::Path;
use std::time::Duration;

use shared::{BASE_CONTEXT, ClientConfig, InstanceId, instance_debug};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{FixtureError, FixtureResult};
use crate::options::FixtureTimings;
use crate::server::{LoadedConfig, ServerHandle};

#[derive(Debug, Clone, Copy)]
pub struct ConfigLoader {
    interval: Duration,
    timeout: Duration,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::from_timings(&FixtureTimings::default())
    }
}

impl ConfigLoader {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    pub fn from_timings(timings: &FixtureTimings) -> Self {
        Self::new(timings.config_poll_interval, timings.config_timeout)
    }

    /// Load the handle's client config and move it to `Running`
    pub async fn load(&self, ctx: &CancellationToken, handle: &ServerHandle) -> FixtureResult<()> {
        let path = handle.kubeconfig_path();
        let config = self.load_path(handle.name(), ctx, &path, || handle.cancelled()).await?;
        handle.mark_loaded(LoadedConfig { config, path })
    }

    /// Poll `path` until it holds a usable config
    ///
    /// A missing file means "not written yet" and is retried silently.
    /// Any other failure is remembered and reported if the deadline passes.
    pub async fn load_path(
        &self,
        instance: &InstanceId,
        ctx: &CancellationToken,
        path: &Path,
        is_cancelled: impl Fn() -> bool,
    ) -> FixtureResult<ClientConfig> {
        let deadline = Instant::now() + self.timeout;
        let mut last_error: Option<String> = None;

        loop {
            if ctx.is_cancelled() || is_cancelled() {
                return Err(FixtureError::ShutDownBeforeReady {
                    instance: instance.clone(),
                });
            }

            match tokio::fs::read_to_string(path).await {
                Ok(contents) => match parse_usable(path, &contents) {
                    Ok(config) => return Ok(config),
                    Err(e) => last_error = Some(e.to_string()),
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => last_error = Some(e.to_string()),
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let pause = self.interval.min(deadline - now);
            tokio::select! {
                _ = ctx.cancelled() => {
                    return Err(FixtureError::ShutDownBeforeReady { instance: instance.clone() });
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }

        instance_debug!(instance, "⏰ Gave up waiting for {}", path.display());
        match last_error {
            Some(last_error) => Err(FixtureError::ConfigLoadFailed {
                path: path.to_path_buf(),
                last_error,
            }),
            None => Err(FixtureError::ConfigLoadTimeout {
                path: path.to_path_buf(),
                timeout: self.timeout,
            }),
        }
    }
}

/// Parse and check the `base` context resolves
fn parse_usable(path: &Path, contents: &str) -> FixtureResult<ClientConfig> {
    let config = ClientConfig::parse(path, contents)?;
    config.target(BASE_CONTEXT)?;
    Ok(config)
}
