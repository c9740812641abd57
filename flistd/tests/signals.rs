//! SIGUSR1 forced-unmount test.
//!
//! Lives in its own test binary since the signal is process-wide.

mod common;

use common::{TestDaemon, expect_ok};
use flistd::protocol::Request;
use flistd::services::registry::Status;
use flistd::utils::signals::spawn_unmount_handler;
use nix::sys::signal::{Signal, raise};
use std::time::Duration;

#[tokio::test]
async fn test_sigusr1_unmounts_running_containers() {
    let daemon = TestDaemon::start().await;
    let _handler = spawn_unmount_handler(daemon.service.clone()).unwrap();

    expect_ok(daemon.run("c1").await);
    expect_ok(daemon.run("c2").await);
    expect_ok(daemon.run("c3").await);
    expect_ok(daemon.send(&Request::stop("c3")).await);
    assert_eq!(daemon.mounter.mounted_count(), 2);

    raise(Signal::SIGUSR1).unwrap();

    let stopped = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let containers = daemon.ps().await;
            if containers.iter().all(|c| c.status == Status::Stopped) {
                return containers;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("containers were not stopped after SIGUSR1");

    assert_eq!(stopped.len(), 3);
    assert_eq!(daemon.mounter.mounted_count(), 0);

    // Stopped containers can still be removed afterwards.
    expect_ok(daemon.send(&Request::rm("c1")).await);
    assert_eq!(daemon.ps().await.len(), 2);
}
