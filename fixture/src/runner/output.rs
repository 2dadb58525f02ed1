//! Capture of child process stdout/stderr
//!
//! Both pipes are drained into one writer task, which:
//! - appends every line to the persisted log file
//! - keeps a bounded in-memory tail for failure messages
//! - mirrors lines to tracing when console streaming is on

use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use shared::{InstanceId, instance_debug, instance_warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{FixtureError, FixtureResult};

/// Lines kept in memory per instance
pub const TAIL_CAPACITY: usize = 2000;

/// Tracing target for mirrored server output
pub const SERVER_OUTPUT_TARGET: &str = "fixture::server_output";

/// Pipe stdout/stderr so the harness can capture them
pub fn configure_child_stdio(cmd: &mut tokio::process::Command) {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped()).stdin(Stdio::null());
}

/// Rolling buffer of the most recent output lines
#[derive(Debug, Clone)]
pub struct LogTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl LogTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(256)))),
            capacity,
        }
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn contents(&self) -> String {
        let lines = self.lines.lock();
        let mut out = String::new();
        for line in lines.iter() {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

/// Running capture for one child process
pub struct OutputCapture {
    tail: LogTail,
    writer: JoinHandle<()>,
}

impl OutputCapture {
    /// Take the child's pipes and start draining them
    pub async fn start(
        child: &mut Child,
        instance: &InstanceId,
        log_path: &Path,
        stream_logs: bool,
    ) -> FixtureResult<OutputCapture> {
        let file = tokio::fs::File::create(log_path)
            .await
            .map_err(|e| FixtureError::file_system("create log file", log_path, e))?;

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, tx.clone());
        }
        drop(tx);

        let tail = LogTail::new(TAIL_CAPACITY);
        let writer = tokio::spawn(write_lines(rx, file, tail.clone(), instance.clone(), stream_logs));

        Ok(OutputCapture { tail, writer })
    }

    /// Wait for the pipes to close and return the captured tail
    ///
    /// A grandchild holding the pipes open must not block the caller
    /// forever, so the wait is bounded; the tail is returned either way.
    pub async fn finish(self, grace: Duration) -> String {
        if tokio::time::timeout(grace, self.writer).await.is_err() {
            tracing::debug!("Output pipes still open after {:?}; using partial log", grace);
        }
        self.tail.contents()
    }
}

fn spawn_line_reader<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

async fn write_lines(
    mut rx: mpsc::UnboundedReceiver<String>,
    mut file: tokio::fs::File,
    tail: LogTail,
    instance: InstanceId,
    stream_logs: bool,
) {
    let mut file_ok = true;
    while let Some(line) = rx.recv().await {
        if file_ok {
            let written = async {
                file.write_all(line.as_bytes()).await?;
                file.write_all(b"\n").await
            }
            .await;
            if let Err(e) = written {
                instance_warn!(instance, "⚠️ Failed to write server log: {}", e);
                file_ok = false;
            }
        }
        if stream_logs {
            tracing::info!(target: SERVER_OUTPUT_TARGET, instance = %instance, "{}", line);
        }
        tail.push(line);
    }
    let _ = file.flush().await;
    instance_debug!(instance, "📄 Output capture closed");
}
