//! flistd - flist mount and container lifecycle daemon.
//!
//! Accepts one JSON command per connection on a Unix socket, mounts flists
//! through `g8ufs`, launches an entrypoint inside the mount and keeps track
//! of the resulting containers.
//!
//! ## Architecture
//!
//! - **Server**: binds the socket and spawns one worker per connection
//! - **Worker**: decodes one request and dispatches run/stop/rm/ps
//! - **Container Service**: lifecycle operations shared by all workers
//! - **Registry**: single task owning every container entry
//! - **Signals**: `SIGUSR1` force-unmounts running containers

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;
pub mod services;
pub mod utils;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

use crate::server::Server;
use crate::services::container::ContainerService;
use crate::services::registry::Registry;
use crate::utils::launch::ChrootLauncher;
use crate::utils::mount::G8ufsMounter;
use crate::utils::signals;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

/// Default control socket.
pub const SOCKET_PATH: &str = "/tmp/flist.sock";

/// Configuration for the daemon.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unix socket clients connect to.
    pub socket_path: PathBuf,
    /// Local cache for content blocks fetched from the store.
    pub store_dir: PathBuf,
    /// Default parent directory for container mounts.
    pub containers_dir: PathBuf,
    /// Parent of per-container backend (unpack) directories.
    pub tmp_dir: PathBuf,
    /// Remote block store flists are resolved against.
    pub storage_url: String,
    /// Path to the g8ufs binary.
    pub g8ufs_path: PathBuf,
    /// How long a client may take to send its request.
    pub request_timeout: Duration,
    /// How long to wait for g8ufs to bring a mount up.
    pub mount_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(SOCKET_PATH),
            store_dir: PathBuf::from("/var/lib/flist/store"),
            containers_dir: PathBuf::from("/var/lib/flist/containers"),
            tmp_dir: PathBuf::from("/var/lib/flist/tmp"),
            storage_url: "zdb://hub.grid.tf:9900".to_string(),
            g8ufs_path: PathBuf::from("g8ufs"),
            request_timeout: Duration::from_secs(30),
            mount_timeout: Duration::from_secs(60),
        }
    }
}

/// Run the daemon until SIGINT/SIGTERM.
///
/// Returns an error if the socket cannot be bound or accepting fails.
pub async fn run_daemon(config: Config) -> anyhow::Result<()> {
    for dir in [&config.store_dir, &config.containers_dir, &config.tmp_dir] {
        tokio::fs::create_dir_all(dir).await?;
    }

    let registry = Registry::spawn();
    let mounter = G8ufsMounter::new(
        config.g8ufs_path.clone(),
        config.storage_url.clone(),
        config.store_dir.clone(),
        config.mount_timeout,
    );
    let service = ContainerService::new(
        registry,
        mounter,
        ChrootLauncher::new(),
        config.containers_dir.clone(),
        config.tmp_dir.clone(),
    );
    info!("Container service initialized");

    signals::spawn_unmount_handler(service.clone())?;

    let server = Server::bind(&config.socket_path, service.clone(), config.request_timeout)?;
    info!(socket = %server.socket_path().display(), "flistd ready");

    let shutdown = signals::shutdown_signal()?;
    let result = server.serve_with_shutdown(shutdown).await;
    if let Err(e) = &result {
        error!(error = %e, "Accept loop failed");
    }

    // Socket file goes away with the server.
    drop(server);

    let stopped = service.stop_all().await;
    info!(stopped, "Unmounted running containers");

    result?;
    Ok(())
}
