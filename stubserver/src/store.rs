//! Embedded store stand-in
//!
//! Holds the store client and peer ports open so port collisions between
//! instances surface as bind errors, and records a flush marker on shutdown.
//! The store outlives the HTTP server: it only goes away once its own token is
//! cancelled.

use std::path::{Path, PathBuf};

use shared::{InstanceId, instance_debug};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::error::{StubServerError, StubServerResult};

pub const STORE_DIR: &str = "store";
pub const FLUSH_MARKER: &str = "flushed";

#[derive(Debug)]
pub struct Store {
    dir: PathBuf,
    wal_size_bytes: u64,
    shutdown: CancellationToken,
}

impl Store {
    /// Create the store directory and start listening on the given ports
    pub async fn open(
        instance: &InstanceId,
        root: &Path,
        ports: &[(&'static str, u16)],
        wal_size_bytes: u64,
        shutdown: CancellationToken,
    ) -> StubServerResult<Self> {
        let dir = root.join(STORE_DIR);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StubServerError::file_system("create store directory", &dir, e))?;

        for &(listener_name, port) in ports {
            let listener = TcpListener::bind(("127.0.0.1", port))
                .await
                .map_err(|source| StubServerError::Bind {
                    listener: listener_name,
                    port,
                    source,
                })?;
            instance_debug!(instance, "💾 Store {} listening on {}", listener_name, port);
            tokio::spawn(accept_until(listener, shutdown.clone()));
        }

        Ok(Self {
            dir,
            wal_size_bytes,
            shutdown,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn wal_size_bytes(&self) -> u64 {
        self.wal_size_bytes
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Persist the flush marker; fails once the store has been shut down
    pub async fn flush(&self) -> StubServerResult<PathBuf> {
        if self.is_closed() {
            return Err(StubServerError::StoreClosed);
        }
        let marker = self.dir.join(FLUSH_MARKER);
        let contents = format!("{}\n", chrono::Utc::now().to_rfc3339());
        tokio::fs::write(&marker, contents)
            .await
            .map_err(|e| StubServerError::file_system("write flush marker", &marker, e))?;
        Ok(marker)
    }
}

async fn accept_until(listener: TcpListener, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                // Peers only need the port to be open
                if accepted.is_err() {
                    break;
                }
            }
        }
    }
}
