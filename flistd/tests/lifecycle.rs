//! Integration tests for the container lifecycle over the control socket.
//!
//! Every test starts its own daemon on a temporary socket, so tests are
//! parallel-safe and need no privileges.

mod common;

use common::{TestDaemon, expect_ok};
use flistd::error::ErrorKind;
use flistd::protocol::{Request, Response};
use flistd::services::registry::Status;

fn error_kind(response: &Response) -> Option<ErrorKind> {
    match response {
        Response::Error { kind, .. } => Some(*kind),
        Response::Ok { .. } => None,
    }
}

/// Test: the documented example - run c1, see it in ps, rm it, gone.
#[tokio::test]
async fn test_run_ps_rm_scenario() {
    let daemon = TestDaemon::start().await;

    let raw = br#"{"command":"run","metaURL":"zdb://hub.grid.tf:9900/x.flist","entrypoint":"/bin/sh","containerName":"c1","mountpoint":""}"#;
    let line = daemon.send_raw(raw).await;
    let response: Response = serde_json::from_str(line.trim()).unwrap();
    let created = expect_ok(response);
    assert_eq!(created[0].id, "c1");
    assert_eq!(created[0].status, Status::Running);

    let listed = daemon.ps().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, "c1");
    assert_eq!(listed[0].status, Status::Running);
    assert_eq!(listed[0].meta_url, "zdb://hub.grid.tf:9900/x.flist");

    let line = daemon
        .send_raw(br#"{"command":"rm","containerName":"c1"}"#)
        .await;
    let response: Response = serde_json::from_str(line.trim()).unwrap();
    expect_ok(response);

    assert!(daemon.ps().await.is_empty());
    assert_eq!(daemon.mounter.mounted_count(), 0);
}

/// Test: containers created on earlier connections are visible to later ones.
#[tokio::test]
async fn test_registry_shared_across_connections() {
    let daemon = TestDaemon::start().await;

    for name in ["alpha", "beta", "gamma"] {
        expect_ok(daemon.run(name).await);
    }

    let ids: Vec<_> = daemon.ps().await.into_iter().map(|c| c.id).collect();
    assert_eq!(ids, vec!["alpha", "beta", "gamma"]);
}

/// Test: stop on a new connection unmounts a container another connection ran.
#[tokio::test]
async fn test_run_then_stop() {
    let daemon = TestDaemon::start().await;

    let created = expect_ok(daemon.run("c1").await);
    let path = std::path::PathBuf::from(&created[0].path);
    assert_eq!(path, daemon.containers_dir().join("c1"));
    assert!(daemon.mounter.is_mounted(&path));

    let stopped = expect_ok(daemon.send(&Request::stop("c1")).await);
    assert_eq!(stopped[0].status, Status::Stopped);
    assert!(!daemon.mounter.is_mounted(&path));

    let listed = daemon.ps().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, Status::Stopped);
}

/// Test: stop then rm removes the container from ps.
#[tokio::test]
async fn test_stop_then_rm() {
    let daemon = TestDaemon::start().await;

    expect_ok(daemon.run("c1").await);
    expect_ok(daemon.run("c2").await);
    expect_ok(daemon.send(&Request::stop("c1")).await);
    expect_ok(daemon.send(&Request::rm("c1")).await);

    let ids: Vec<_> = daemon.ps().await.into_iter().map(|c| c.id).collect();
    assert_eq!(ids, vec!["c2"]);
}

/// Test: rm still removes the entry when the mount directory cannot be cleaned up.
#[tokio::test]
async fn test_rm_with_failed_cleanup() {
    let daemon = TestDaemon::start().await;

    expect_ok(daemon.run("c1").await);
    expect_ok(daemon.send(&Request::stop("c1")).await);
    std::fs::write(daemon.containers_dir().join("c1").join("leftover"), b"x").unwrap();

    let response = daemon.send(&Request::rm("c1")).await;
    assert_eq!(error_kind(&response), Some(ErrorKind::CleanupFailed));
    assert!(daemon.ps().await.is_empty());
}

/// Test: unknown names are NotFound and change nothing.
#[tokio::test]
async fn test_unknown_container() {
    let daemon = TestDaemon::start().await;
    expect_ok(daemon.run("c1").await);

    for request in [Request::stop("ghost"), Request::rm("ghost"), Request::ps("ghost")] {
        let response = daemon.send(&request).await;
        assert_eq!(error_kind(&response), Some(ErrorKind::NotFound));
    }

    let listed = daemon.ps().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, Status::Running);
}

/// Test: ps with a name returns just that container.
#[tokio::test]
async fn test_ps_single_container() {
    let daemon = TestDaemon::start().await;
    expect_ok(daemon.run("c1").await);
    expect_ok(daemon.run("c2").await);

    let listed = expect_ok(daemon.send(&Request::ps("c2")).await);
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, "c2");
}

/// Test: concurrent runs with distinct names all succeed.
#[tokio::test]
async fn test_concurrent_runs_distinct_names() {
    let daemon = std::sync::Arc::new(TestDaemon::start().await);

    let mut handles = Vec::new();
    for i in 0..10 {
        let daemon = daemon.clone();
        handles.push(tokio::spawn(async move {
            daemon.run(&format!("c{i}")).await
        }));
    }

    for handle in handles {
        expect_ok(handle.await.unwrap());
    }
    assert_eq!(daemon.ps().await.len(), 10);
}

/// Test: concurrent runs with the same name - exactly one wins.
#[tokio::test]
async fn test_concurrent_runs_same_name() {
    let daemon = std::sync::Arc::new(TestDaemon::start().await);

    let mut handles = Vec::new();
    for _ in 0..5 {
        let daemon = daemon.clone();
        handles.push(tokio::spawn(async move { daemon.run("shared").await }));
    }

    let mut succeeded = 0;
    for handle in handles {
        let response = handle.await.unwrap();
        match error_kind(&response) {
            None => succeeded += 1,
            Some(kind) => assert_eq!(kind, ErrorKind::DuplicateId),
        }
    }

    assert_eq!(succeeded, 1);
    assert_eq!(daemon.ps().await.len(), 1);
}

/// Test: runs without a name get distinct generated ids.
#[tokio::test]
async fn test_generated_ids() {
    let daemon = TestDaemon::start().await;

    let first = expect_ok(daemon.run("").await);
    let second = expect_ok(daemon.run("").await);
    assert_ne!(first[0].id, second[0].id);
    assert_eq!(daemon.ps().await.len(), 2);
}

/// Test: a failed mount reports MountFailed and registers nothing.
#[tokio::test]
async fn test_mount_failure() {
    let daemon = TestDaemon::start().await;
    daemon.mounter.fail_mounts(true);

    let response = daemon.run("c1").await;
    assert_eq!(error_kind(&response), Some(ErrorKind::MountFailed));
    assert!(daemon.ps().await.is_empty());
}

/// Test: a malformed message closes only its own connection.
#[tokio::test]
async fn test_daemon_survives_bad_input() {
    let daemon = TestDaemon::start().await;

    let line = daemon.send_raw(b"this is not json").await;
    let response: Response = serde_json::from_str(line.trim()).unwrap();
    assert_eq!(error_kind(&response), Some(ErrorKind::DecodeError));

    // Truncated message followed by EOF
    let line = daemon.send_raw(br#"{"command":"run","metaURL":"#).await;
    let response: Response = serde_json::from_str(line.trim()).unwrap();
    assert_eq!(error_kind(&response), Some(ErrorKind::DecodeError));

    // Empty connection
    let line = daemon.send_raw(b"").await;
    let response: Response = serde_json::from_str(line.trim()).unwrap();
    assert_eq!(error_kind(&response), Some(ErrorKind::DecodeError));

    expect_ok(daemon.run("after").await);
    assert_eq!(daemon.ps().await.len(), 1);
}

/// Test: a missing metaURL is rejected before anything is reserved.
#[tokio::test]
async fn test_run_requires_meta_url() {
    let daemon = TestDaemon::start().await;

    let response = daemon.send(&Request::run("", "/bin/sh", "c1", "")).await;
    assert_eq!(error_kind(&response), Some(ErrorKind::InvalidRequest));
    assert!(daemon.ps().await.is_empty());
}

/// Test: a stale socket file is replaced and the socket is removed on shutdown.
#[tokio::test]
async fn test_socket_file_lifecycle() {
    let daemon = TestDaemon::start().await;
    assert!(daemon.socket.exists());

    let (socket, dir) = daemon.shutdown().await;
    assert!(!socket.exists());

    // A leftover regular file at the socket path does not block binding.
    std::fs::write(&socket, b"stale").unwrap();
    let registry = flistd::services::registry::Registry::spawn();
    let service = flistd::services::container::ContainerService::new(
        registry,
        common::FakeMounter::default(),
        common::FakeLauncher::default(),
        dir.path().join("containers"),
        dir.path().join("tmp"),
    );
    let server =
        flistd::server::Server::bind(&socket, service, std::time::Duration::from_secs(1)).unwrap();
    assert!(socket.exists());
    drop(server);
    assert!(!socket.exists());
}
