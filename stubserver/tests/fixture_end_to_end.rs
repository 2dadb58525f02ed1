//! The fixture driving real stub servers, as separate processes and in-process
#![cfg(unix)]

mod common;

use std::collections::HashSet;
use std::time::Duration;

use assert_matches::assert_matches;
use common::{TEST_TIMEOUT, config, orchestrator, process_alive, timings};
use fixture::{Config, FixtureError, PortRole, StateKind, TestScope};
use tokio::time::timeout;

#[tokio::test]
async fn test_two_external_servers_become_ready() {
    // Arrange
    let dir = tempfile::tempdir().unwrap();
    let scope = TestScope::new("two_external");

    // Act
    let fixture = orchestrator(&scope)
        .start(vec![config("a", dir.path(), &[]), config("b", dir.path(), &[])])
        .await
        .unwrap();

    // Assert
    let ports: HashSet<u16> = fixture.values().flat_map(|h| h.ports().iter().map(|(_, p)| *p)).collect();
    assert_eq!(ports.len(), 6);
    for handle in fixture.values() {
        assert_eq!(handle.state_kind(), StateKind::Running);
        let target = handle.shard_base_config().unwrap();
        let status = reqwest::get(target.url("/healthz")).await.unwrap().status();
        assert_eq!(status, reqwest::StatusCode::OK);
        assert!(handle.kubeconfig_path().exists());
    }

    let handles: Vec<_> = fixture.values().cloned().collect();
    drop(fixture);
    timeout(TEST_TIMEOUT, scope.finish()).await.unwrap().unwrap();

    for handle in handles {
        assert!(handle.data_dir().join("store").join("flushed").exists());
        assert!(handle.data_dir().join("server.log").exists());
        let audit = std::fs::read_to_string(handle.artifact_dir().join("audit.log")).unwrap();
        assert!(audit.contains("/healthz"));
        let metrics = std::fs::read_to_string(handle.artifact_dir().join("metrics-startup.txt")).unwrap();
        assert!(metrics.contains("stub_requests_total"));
    }
}

/// In-process servers keep their store open until the entry point returns
#[tokio::test]
async fn test_in_process_server_flushes_store_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let scope = TestScope::new("in_process");
    let in_process = Config::builder("main")
        .scratch_dirs(dir.path().join("artifacts"), dir.path().join("data"))
        .arg("--healthz-failures=3")
        .run_in_process()
        .build()
        .unwrap();

    let fixture = orchestrator(&scope).start(vec![in_process]).await.unwrap();
    let handle = fixture["main"].clone();
    assert!(handle.port(PortRole::StorePeer).is_some());
    drop(fixture);
    timeout(TEST_TIMEOUT, scope.finish()).await.unwrap().unwrap();

    assert!(handle.data_dir().join("store").join("flushed").exists());
    assert!(!scope.failed());
}

/// A server that dies before writing its config fails startup by name
#[tokio::test]
async fn test_abort_before_config_fails_startup() {
    // Arrange
    let dir = tempfile::tempdir().unwrap();
    let scope = TestScope::new("abort");
    let orchestrator = orchestrator(&scope).with_timings(timings().with_config_timeout(Duration::from_secs(2)));

    // Act
    let result = orchestrator
        .start(vec![
            config("a", dir.path(), &[]),
            config("b", dir.path(), &["--abort-before-config"]),
        ])
        .await;

    // Assert
    let err = result.unwrap_err();
    assert_eq!(err.instance().map(|i| i.as_str()), Some("b"));
    assert_matches!(err.root(), FixtureError::ConfigLoadTimeout { .. });
    let failures = scope.failures();
    assert!(failures.iter().any(|f| f.starts_with("`b` failed:")), "{failures:?}");
    assert!(timeout(TEST_TIMEOUT, scope.finish()).await.unwrap().is_err());
}

/// Exiting on its own is a failure; exiting because we asked is not
#[tokio::test]
async fn test_unrequested_exit_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let scope = TestScope::new("exit_after_ready");

    let fixture = orchestrator(&scope)
        .start(vec![config(
            "a",
            dir.path(),
            &["--exit-after-ready-ms=1500", "--exit-code=7", "--emit-noisy-line"],
        )])
        .await
        .unwrap();
    let handle = fixture["a"].clone();
    timeout(TEST_TIMEOUT, handle.wait_done()).await.unwrap();

    let failures = scope.failures();
    assert!(
        failures.iter().any(|f| f.starts_with("`a` failed:") && f.contains('7')),
        "{failures:?}"
    );
    assert!(failures.iter().all(|f| !f.contains("addrConn.createTransport")));
    let log = std::fs::read_to_string(handle.data_dir().join("server.log")).unwrap();
    assert!(log.contains("addrConn.createTransport"));

    drop(fixture);
    assert!(timeout(TEST_TIMEOUT, scope.finish()).await.unwrap().is_err());
}

/// Children of the server die with it
#[tokio::test]
async fn test_teardown_terminates_server_children() {
    // Arrange
    let dir = tempfile::tempdir().unwrap();
    let scope = TestScope::new("children");
    let fixture = orchestrator(&scope)
        .start(vec![config("a", dir.path(), &["--spawn-child"])])
        .await
        .unwrap();
    let pid_file = fixture["a"].data_dir().join("child.pid");
    let child_pid: i32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
    assert!(process_alive(child_pid));

    // Act
    drop(fixture);
    timeout(TEST_TIMEOUT, scope.finish()).await.unwrap().unwrap();

    // Assert
    let gone = timeout(TEST_TIMEOUT, async {
        while process_alive(child_pid) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(gone.is_ok(), "child {child_pid} outlived the server");
}

#[tokio::test]
async fn test_cancel_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let scope = TestScope::new("double_cancel");
    let fixture = orchestrator(&scope).start(vec![config("a", dir.path(), &[])]).await.unwrap();
    let handle = fixture["a"].clone();

    timeout(TEST_TIMEOUT, handle.cancel()).await.unwrap();
    timeout(TEST_TIMEOUT, handle.cancel()).await.unwrap();

    assert_eq!(handle.state_kind(), StateKind::Cancelled);
    assert!(handle.base_config().is_ok());
    drop(fixture);
    timeout(TEST_TIMEOUT, scope.finish()).await.unwrap().unwrap();
    assert!(!scope.failed());
}
