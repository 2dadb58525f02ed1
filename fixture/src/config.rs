//! Per-instance launch configuration
//!
//! A [`Config`] is built once per desired server instance and handed to the
//! orchestrator, which never mutates it afterwards.

use std::path::{Path, PathBuf};

use shared::InstanceId;
use tokio_util::sync::CancellationToken;

use crate::error::{FixtureError, FixtureResult};

/// Immutable launch request for one server instance
#[derive(Debug, Clone)]
pub struct Config {
    name: InstanceId,
    args: Vec<String>,
    artifact_dir: PathBuf,
    data_dir: PathBuf,
    client_ca_dir: Option<PathBuf>,
    log_to_console: bool,
    run_in_process: bool,
    in_process_context: Option<CancellationToken>,
}

impl Config {
    pub fn builder(name: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder::new(name)
    }

    pub fn name(&self) -> &InstanceId {
        &self.name
    }

    /// Extra arguments, appended after the generated ones
    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn client_ca_dir(&self) -> Option<&Path> {
        self.client_ca_dir.as_deref()
    }

    pub fn log_to_console(&self) -> bool {
        self.log_to_console
    }

    pub fn run_in_process(&self) -> bool {
        self.run_in_process
    }

    /// Parent context for in-process runs; the orchestrator derives the
    /// instance lifecycle from it when present.
    pub fn in_process_context(&self) -> Option<&CancellationToken> {
        self.in_process_context.as_ref()
    }
}

/// Builder for [`Config`]
#[derive(Debug)]
pub struct ConfigBuilder {
    name: String,
    args: Vec<String>,
    artifact_dir: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    client_ca_dir: Option<PathBuf>,
    log_to_console: bool,
    run_in_process: bool,
    in_process_context: Option<CancellationToken>,
}

impl ConfigBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            artifact_dir: None,
            data_dir: None,
            client_ca_dir: None,
            log_to_console: false,
            run_in_process: false,
            in_process_context: None,
        }
    }

    /// Artifact and data directories; both are required
    pub fn scratch_dirs(mut self, artifact_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        self.artifact_dir = Some(artifact_dir.into());
        self.data_dir = Some(data_dir.into());
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Directory holding `client-ca.crt`
    pub fn client_ca(mut self, dir: impl Into<PathBuf>) -> Self {
        self.client_ca_dir = Some(dir.into());
        self
    }

    pub fn log_to_console(mut self, enabled: bool) -> Self {
        self.log_to_console = enabled;
        self
    }

    pub fn run_in_process(mut self) -> Self {
        self.run_in_process = true;
        self
    }

    /// Run in process with the given token as the parent lifecycle
    pub fn run_in_process_with(mut self, parent: CancellationToken) -> Self {
        self.run_in_process = true;
        self.in_process_context = Some(parent);
        self
    }

    pub fn build(self) -> FixtureResult<Config> {
        let name = InstanceId::new(self.name)?;

        let artifact_dir = self
            .artifact_dir
            .filter(|d| !d.as_os_str().is_empty())
            .ok_or_else(|| FixtureError::invalid_config(name.as_str(), "artifact directory is required"))?;
        let data_dir = self
            .data_dir
            .filter(|d| !d.as_os_str().is_empty())
            .ok_or_else(|| FixtureError::invalid_config(name.as_str(), "data directory is required"))?;

        Ok(Config {
            name,
            args: self.args,
            artifact_dir,
            data_dir,
            client_ca_dir: self.client_ca_dir,
            log_to_console: self.log_to_console,
            run_in_process: self.run_in_process,
            in_process_context: self.in_process_context,
        })
    }
}
