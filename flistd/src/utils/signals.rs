//! Signal handling for flistd.
//!
//! - `SIGUSR1` force-unmounts every running container and marks it stopped
//! - `SIGINT` / `SIGTERM` end the accept loop for a clean shutdown

use crate::services::container::ContainerService;
use crate::utils::launch::Launcher;
use crate::utils::mount::Mounter;
use std::future::Future;
use std::io;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tracing::info;

/// Install the `SIGUSR1` listener.
///
/// There is one listener for the whole daemon, so nothing needs to be
/// deregistered when individual containers stop or are removed.
pub fn spawn_unmount_handler<M, L>(service: ContainerService<M, L>) -> io::Result<JoinHandle<()>>
where
    M: Mounter,
    L: Launcher,
{
    let mut usr1 = signal(SignalKind::user_defined1())?;

    Ok(tokio::spawn(async move {
        while usr1.recv().await.is_some() {
            info!("Received SIGUSR1, unmounting running containers");
            let stopped = service.stop_all().await;
            info!(stopped, "Forced unmount finished");
        }
    }))
}

/// Install the `SIGINT`/`SIGTERM` handlers.
///
/// The returned future resolves once either signal arrives.
pub fn shutdown_signal() -> io::Result<impl Future<Output = ()>> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    Ok(async move {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    })
}
