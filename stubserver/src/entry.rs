//! In-process entry point for the fixture

use async_trait::async_trait;
use fixture::{InProcessEntry, InProcessServer};

use crate::args::Args;
use crate::server::StubServer;

/// Runs [`StubServer`] on the caller's runtime
#[derive(Debug, Default, Clone, Copy)]
pub struct StubServerEntry;

#[async_trait]
impl InProcessEntry for StubServerEntry {
    fn validate_args(&self, args: &[String]) -> anyhow::Result<()> {
        let parsed = Args::from_server_args(args)?;
        let knobs = parsed.process_only_knobs();
        anyhow::ensure!(knobs.is_empty(), "{} only work in a separate process", knobs.join(", "));
        Ok(())
    }

    async fn run(&self, server: InProcessServer) -> anyhow::Result<()> {
        let args = Args::from_server_args(&server.args)?;
        let stub = StubServer::new(server.instance, args);
        stub.run(server.shutdown, server.store_shutdown).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn test_validate_accepts_fixture_args() {
        let args = strings(&["--root-directory", "/tmp/a", "--secure-port=1234", "--v=4"]);
        assert!(StubServerEntry.validate_args(&args).is_ok());
    }

    #[test]
    fn test_validate_rejects_process_knobs() {
        let args = strings(&["--root-directory", "/tmp/a", "--secure-port=1234", "--spawn-child"]);
        let err = StubServerEntry.validate_args(&args).unwrap_err();
        assert!(err.to_string().contains("--spawn-child"));
    }

    #[test]
    fn test_validate_rejects_unparseable_args() {
        assert!(StubServerEntry.validate_args(&strings(&["--secure-port=x"])).is_err());
    }
}
