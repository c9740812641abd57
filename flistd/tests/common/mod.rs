//! Test helpers for flistd integration tests.
//!
//! Runs a real `Server` on a temporary socket, backed by the in-memory
//! mounter and launcher from `flistd::test_util`.

#![allow(dead_code)]

use flistd::client;
use flistd::protocol::{ContainerInfo, Request, Response};
use flistd::server::Server;
use flistd::services::container::ContainerService;
use flistd::services::registry::Registry;
pub use flistd::test_util::{FakeLauncher, FakeMounter};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;

/// Simulated mount latency, wide enough for concurrent requests to overlap.
const MOUNT_DELAY: Duration = Duration::from_millis(20);

/// A daemon serving on a socket inside a temporary directory.
pub struct TestDaemon {
    pub socket: PathBuf,
    pub mounter: FakeMounter,
    pub service: ContainerService<FakeMounter, FakeLauncher>,
    task: JoinHandle<()>,
    dir: TempDir,
}

impl TestDaemon {
    pub async fn start() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let socket = dir.path().join("run").join("flist.sock");
        let mounter = FakeMounter::with_delay(MOUNT_DELAY);

        let service = ContainerService::new(
            Registry::spawn(),
            mounter.clone(),
            FakeLauncher::default(),
            dir.path().join("containers"),
            dir.path().join("tmp"),
        );

        let server = Server::bind(&socket, service.clone(), Duration::from_secs(2))
            .expect("Failed to bind socket");
        let task = tokio::spawn(async move {
            let _ = server.serve().await;
        });

        Self {
            socket,
            mounter,
            service,
            task,
            dir,
        }
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.dir.path().join("containers")
    }

    pub async fn send(&self, request: &Request) -> Response {
        client::send(&self.socket, request)
            .await
            .expect("Request failed")
    }

    /// Write raw bytes, close the write half and return whatever comes back.
    pub async fn send_raw(&self, raw: &[u8]) -> String {
        let mut stream = UnixStream::connect(&self.socket)
            .await
            .expect("Failed to connect");
        stream.write_all(raw).await.expect("Failed to write");
        stream.shutdown().await.expect("Failed to shut down write half");

        let mut line = String::new();
        BufReader::new(stream)
            .read_line(&mut line)
            .await
            .expect("Failed to read response");
        line
    }

    /// Run a container with the example flist.
    pub async fn run(&self, name: &str) -> Response {
        self.send(&Request::run(
            "zdb://hub.grid.tf:9900/x.flist",
            "/bin/sh",
            name,
            "",
        ))
        .await
    }

    /// `ps` for all containers; panics on an error response.
    pub async fn ps(&self) -> Vec<ContainerInfo> {
        match self.send(&Request::ps("")).await {
            Response::Ok { containers } => containers,
            other => panic!("ps failed: {other:?}"),
        }
    }

    /// Stop serving; dropping the server removes the socket file.
    ///
    /// Returns the socket path and the still-alive temp directory.
    pub async fn shutdown(self) -> (PathBuf, TempDir) {
        self.task.abort();
        let _ = self.task.await;
        (self.socket, self.dir)
    }
}

/// Unwrap an ok response.
pub fn expect_ok(response: Response) -> Vec<ContainerInfo> {
    match response {
        Response::Ok { containers } => containers,
        other => panic!("expected ok, got {other:?}"),
    }
}
