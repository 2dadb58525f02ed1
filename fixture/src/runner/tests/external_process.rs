//! External runner lifecycle against real child processes

use std::time::Duration;

use assert_matches::assert_matches;
use tokio::time::timeout;

use super::common::{TEST_TIMEOUT, launch_request, process_alive};
use crate::error::FixtureError;
use crate::options::FixtureEnv;
use crate::runner::{ExternalRunner, ServerRunner};
use crate::scope::TestScope;

fn sh_runner() -> ExternalRunner {
    ExternalRunner::new("sh").with_env(FixtureEnv::default()).with_binary("/bin/sh")
}

/// Non-zero exit without a shutdown request fails the test with filtered logs
#[tokio::test]
async fn test_unexpected_exit_is_reported_with_filtered_logs() {
    // Arrange
    let dir = tempfile::tempdir().unwrap();
    let scope = TestScope::new("unexpected-exit");
    let script = "echo hello; echo 'grpc: addrConn.createTransport failed to connect to x'; exit 3";
    let request = launch_request("a", dir.path(), &["-c", script], &scope);

    // Act
    let done = sh_runner().launch(request).await.unwrap();
    timeout(TEST_TIMEOUT, done.wait()).await.unwrap();

    // Assert
    let failures = scope.failures();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].starts_with("`a` failed:"));
    assert!(failures[0].contains("hello"));
    assert!(!failures[0].contains("grpc"));

    let persisted = std::fs::read_to_string(dir.path().join("server.log")).unwrap();
    assert!(persisted.contains("grpc: addrConn"), "log file is never filtered");
}

/// An exit caused by our own shutdown request is not a failure
#[tokio::test]
async fn test_exit_after_cancel_is_not_reported() {
    let dir = tempfile::tempdir().unwrap();
    let scope = TestScope::new("cancelled");
    let request = launch_request("a", dir.path(), &["-c", "sleep 30"], &scope);
    let lifecycle = request.lifecycle.clone();

    let done = sh_runner().launch(request).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!done.is_done());

    lifecycle.cancel();
    timeout(TEST_TIMEOUT, done.wait()).await.unwrap();

    assert!(!scope.failed(), "unexpected failures: {:?}", scope.failures());
}

/// SIGTERM reaches every process in the server's group
#[tokio::test]
async fn test_termination_reaches_whole_process_group() {
    // Arrange
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("child.pid");
    let script = format!("sleep 30 & echo $! > {}; wait", pid_file.display());
    let scope = TestScope::new("group");
    let request = launch_request("a", dir.path(), &["-c", &script], &scope);
    let lifecycle = request.lifecycle.clone();
    let done = sh_runner().launch(request).await.unwrap();

    let child_pid = timeout(TEST_TIMEOUT, async {
        loop {
            if let Ok(pid) = std::fs::read_to_string(&pid_file) {
                if let Ok(pid) = pid.trim().parse::<i32>() {
                    return pid;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    // Act
    lifecycle.cancel();
    timeout(TEST_TIMEOUT, done.wait()).await.unwrap();

    // Assert
    let gone = timeout(TEST_TIMEOUT, async {
        while process_alive(child_pid) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(gone.is_ok(), "grandchild {child_pid} survived group termination");
    assert!(!scope.failed());
}

#[tokio::test]
async fn test_missing_binary_is_a_launch_error() {
    let dir = tempfile::tempdir().unwrap();
    let scope = TestScope::new("missing");
    let request = launch_request("a", dir.path(), &[], &scope);

    let result = ExternalRunner::new("definitely-not-a-real-server-binary")
        .with_env(FixtureEnv::default())
        .with_working_dir("/")
        .launch(request)
        .await;

    assert_matches!(result, Err(FixtureError::LaunchFailed { ref instance, .. }) if instance.as_str() == "a");
}
